//! ClamAV daemon client.
//!
//! Speaks the clamd line protocol over TCP or a Unix socket: `INSTREAM`
//! with length-prefixed chunk framing for scanning, plus `PING`, `VERSION`
//! and `RELOAD` for health and database management. Commands use the
//! null-terminated `z` form, and clamd closes the connection after each
//! reply, so every command opens a fresh socket. One INSTREAM session is
//! exclusive to its connection; it is not re-entrant.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::core::{ScanError, Verdict};

/// Largest single INSTREAM frame sent to clamd.
pub const INSTREAM_FRAME_MAX: usize = 1024 * 1024;

trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

type IoStream = Box<dyn AsyncIo>;

/// Parsed clamd endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClamdEndpoint {
    /// `tcp://host:port`.
    Tcp(String),
    /// `unix:///path/to/clamd.sock`.
    Unix(PathBuf),
}

impl ClamdEndpoint {
    /// Parses a clamd connection URL.
    pub fn parse(url: &str) -> Result<Self, ScanError> {
        if let Some(rest) = url.strip_prefix("tcp://") {
            if rest.is_empty() {
                return Err(ScanError::configuration(format!("empty clamd host in '{url}'")));
            }
            let addr = if rest.contains(':') {
                rest.to_string()
            } else {
                format!("{rest}:3310")
            };
            Ok(Self::Tcp(addr))
        } else if let Some(path) = url.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ScanError::configuration(format!("empty clamd path in '{url}'")));
            }
            Ok(Self::Unix(PathBuf::from(path)))
        } else {
            Err(ScanError::configuration(format!(
                "clamd url '{url}' must be tcp://host:port or unix:///path"
            )))
        }
    }
}

/// Client for one clamd daemon.
#[derive(Clone)]
pub struct ClamdClient {
    endpoint: ClamdEndpoint,
    url: String,
    io_timeout: Duration,
}

impl ClamdClient {
    /// Creates a client for the given connection URL.
    pub fn new(url: &str) -> Result<Self, ScanError> {
        Ok(Self {
            endpoint: ClamdEndpoint::parse(url)?,
            url: url.to_string(),
            io_timeout: Duration::from_secs(30),
        })
    }

    /// Overrides the per-operation I/O timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// The configured connection URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<IoStream, ScanError> {
        let connect = async {
            match &self.endpoint {
                ClamdEndpoint::Tcp(addr) => {
                    let stream = TcpStream::connect(addr).await?;
                    Ok::<IoStream, std::io::Error>(Box::new(stream))
                }
                ClamdEndpoint::Unix(path) => {
                    #[cfg(unix)]
                    {
                        let stream = UnixStream::connect(path).await?;
                        Ok::<IoStream, std::io::Error>(Box::new(stream))
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = path;
                        Err(std::io::Error::new(
                            std::io::ErrorKind::Unsupported,
                            "unix sockets are not available on this platform",
                        ))
                    }
                }
            }
        };
        tokio::time::timeout(self.io_timeout, connect)
            .await
            .map_err(|_| ScanError::timeout("clamd connect", self.io_timeout))?
            .map_err(|e| ScanError::engine_connection(&self.url, e.to_string()))
    }

    async fn command(&self, command: &[u8]) -> Result<String, ScanError> {
        let mut io = self.connect().await?;
        let exchange = async {
            io.write_all(command).await?;
            let mut reply = Vec::new();
            io.read_to_end(&mut reply).await?;
            Ok::<Vec<u8>, std::io::Error>(reply)
        };
        let reply = tokio::time::timeout(self.io_timeout, exchange)
            .await
            .map_err(|_| ScanError::timeout("clamd command", self.io_timeout))?
            .map_err(|e| ScanError::engine_connection(&self.url, e.to_string()))?;
        Ok(String::from_utf8_lossy(&reply)
            .trim_end_matches('\0')
            .trim()
            .to_string())
    }

    /// Health probe; errors unless clamd answers `PONG`.
    pub async fn ping(&self) -> Result<(), ScanError> {
        let reply = self.command(b"zPING\0").await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(ScanError::engine_protocol(format!(
                "unexpected PING reply '{reply}'"
            )))
        }
    }

    /// Returns the engine and database version line.
    pub async fn version(&self) -> Result<String, ScanError> {
        self.command(b"zVERSION\0").await
    }

    /// Asks clamd to reload its signature databases, then polls `PING`
    /// until the engine answers again or the budget expires. Reload success
    /// is never assumed without a verified PING.
    pub async fn reload(&self, budget: Duration) -> Result<(), ScanError> {
        let reply = self.command(b"zRELOAD\0").await?;
        if !reply.contains("RELOADING") {
            return Err(ScanError::engine_protocol(format!(
                "unexpected RELOAD reply '{reply}'"
            )));
        }

        let started = Instant::now();
        loop {
            if self.ping().await.is_ok() {
                return Ok(());
            }
            if started.elapsed() >= budget {
                return Err(ScanError::timeout("engine reload", started.elapsed()));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Opens a streaming scan session.
    pub async fn begin_instream(&self) -> Result<InstreamSession, ScanError> {
        let mut io = self.connect().await?;
        let write = async { io.write_all(b"zINSTREAM\0").await };
        tokio::time::timeout(self.io_timeout, write)
            .await
            .map_err(|_| ScanError::timeout("clamd INSTREAM open", self.io_timeout))?
            .map_err(|e| ScanError::engine_connection(&self.url, e.to_string()))?;
        Ok(InstreamSession {
            io,
            url: self.url.clone(),
            io_timeout: self.io_timeout,
        })
    }
}

/// One in-flight INSTREAM scan.
pub struct InstreamSession {
    io: IoStream,
    url: String,
    io_timeout: Duration,
}

impl InstreamSession {
    /// Sends one chunk of body data, splitting anything over the frame cap.
    pub async fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), ScanError> {
        for frame in chunk.chunks(INSTREAM_FRAME_MAX) {
            let write = async {
                self.io.write_all(&(frame.len() as u32).to_be_bytes()).await?;
                self.io.write_all(frame).await
            };
            tokio::time::timeout(self.io_timeout, write)
                .await
                .map_err(|_| ScanError::timeout("clamd chunk write", self.io_timeout))?
                .map_err(|e| ScanError::engine_connection(&self.url, e.to_string()))?;
        }
        Ok(())
    }

    /// Sends the zero-length terminator and reads the single-line verdict.
    pub async fn finish(mut self) -> Result<Verdict, ScanError> {
        let exchange = async {
            self.io.write_all(&0u32.to_be_bytes()).await?;
            let mut reply = Vec::new();
            self.io.read_to_end(&mut reply).await?;
            Ok::<Vec<u8>, std::io::Error>(reply)
        };
        let reply = tokio::time::timeout(self.io_timeout, exchange)
            .await
            .map_err(|_| ScanError::timeout("clamd verdict read", self.io_timeout))?
            .map_err(|e| ScanError::engine_connection(&self.url, e.to_string()))?;

        let line = String::from_utf8_lossy(&reply);
        let line = line.trim_end_matches('\0').trim();
        if line.is_empty() {
            return Err(ScanError::engine_protocol("empty INSTREAM reply"));
        }
        Ok(Verdict::from_clamd_reply(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::testsupport::spawn_fake_clamd;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            ClamdEndpoint::parse("tcp://10.0.0.5:3310").unwrap(),
            ClamdEndpoint::Tcp("10.0.0.5:3310".to_string())
        );
        assert_eq!(
            ClamdEndpoint::parse("tcp://clamd").unwrap(),
            ClamdEndpoint::Tcp("clamd:3310".to_string())
        );
        assert_eq!(
            ClamdEndpoint::parse("unix:///run/clamd.sock").unwrap(),
            ClamdEndpoint::Unix(PathBuf::from("/run/clamd.sock"))
        );
        assert!(ClamdEndpoint::parse("http://x").is_err());
        assert!(ClamdEndpoint::parse("tcp://").is_err());
    }

    #[tokio::test]
    async fn test_ping_and_version() {
        let url = spawn_fake_clamd().await;
        let client = ClamdClient::new(&url).unwrap();
        client.ping().await.unwrap();
        assert!(client.version().await.unwrap().starts_with("ClamAV"));
    }

    #[tokio::test]
    async fn test_instream_clean() {
        let url = spawn_fake_clamd().await;
        let client = ClamdClient::new(&url).unwrap();

        let mut session = client.begin_instream().await.unwrap();
        session.send_chunk(b"hello ").await.unwrap();
        session.send_chunk(b"world").await.unwrap();
        assert!(session.finish().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_instream_detects_eicar() {
        let url = spawn_fake_clamd().await;
        let client = ClamdClient::new(&url).unwrap();

        let mut session = client.begin_instream().await.unwrap();
        session
            .send_chunk(br#"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"#)
            .await
            .unwrap();
        let verdict = session.finish().await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Infected {
                virus: "Eicar-Test-Signature".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_reload_verifies_with_ping() {
        let url = spawn_fake_clamd().await;
        let client = ClamdClient::new(&url).unwrap();
        client.reload(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_recoverable() {
        let client = ClamdClient::new("tcp://127.0.0.1:1")
            .unwrap()
            .with_io_timeout(Duration::from_millis(200));
        let err = client.ping().await.unwrap_err();
        assert!(err.is_recoverable());
    }
}
