//! In-process clamd double for tests: one command per connection, INSTREAM
//! length-prefix framing, EICAR marker detection.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Signature fragment the double treats as infected.
pub(crate) const EICAR_MARKER: &[u8] = b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE";

/// Full EICAR test body for end-to-end cases.
pub(crate) const EICAR_BODY: &[u8] =
    br#"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"#;

/// Behavior switches for the double.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FakeClamdOptions {
    /// Answer RELOAD with an error instead of RELOADING.
    pub fail_reload: bool,
}

/// Spawns a well-behaved double and returns its `tcp://` URL.
pub(crate) async fn spawn_fake_clamd() -> String {
    spawn_fake_clamd_with(FakeClamdOptions::default()).await
}

/// Spawns a double with the given behavior switches.
pub(crate) async fn spawn_fake_clamd_with(options: FakeClamdOptions) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut command = Vec::new();
                let mut byte = [0u8; 1];
                while let Ok(1) = socket.read(&mut byte).await {
                    if byte[0] == 0 {
                        break;
                    }
                    command.push(byte[0]);
                }
                match command.as_slice() {
                    b"zPING" => {
                        let _ = socket.write_all(b"PONG\0").await;
                    }
                    b"zVERSION" => {
                        let _ = socket.write_all(b"ClamAV 1.3.1/27282\0").await;
                    }
                    b"zRELOAD" => {
                        let reply: &[u8] = if options.fail_reload {
                            b"RELOAD failed. ERROR\0"
                        } else {
                            b"RELOADING\0"
                        };
                        let _ = socket.write_all(reply).await;
                    }
                    b"zINSTREAM" => {
                        let mut body = Vec::new();
                        loop {
                            let mut len_buf = [0u8; 4];
                            if socket.read_exact(&mut len_buf).await.is_err() {
                                return;
                            }
                            let len = u32::from_be_bytes(len_buf) as usize;
                            if len == 0 {
                                break;
                            }
                            let mut chunk = vec![0u8; len];
                            if socket.read_exact(&mut chunk).await.is_err() {
                                return;
                            }
                            body.extend_from_slice(&chunk);
                        }
                        let infected = body
                            .windows(EICAR_MARKER.len())
                            .any(|w| w == EICAR_MARKER);
                        let reply: &[u8] = if infected {
                            b"stream: Eicar-Test-Signature FOUND\0"
                        } else {
                            b"stream: OK\0"
                        };
                        let _ = socket.write_all(reply).await;
                    }
                    _ => {
                        let _ = socket.write_all(b"UNKNOWN COMMAND\0").await;
                    }
                }
            });
        }
    });
    format!("tcp://{addr}")
}
