//! ICAP front end (RFC 3507 subset).
//!
//! Handles OPTIONS, REQMOD and RESPMOD with preview support. The
//! encapsulated HTTP body arrives in chunked transfer coding; chunks are
//! fed straight into the same `ScanSession` the gRPC front end uses. A
//! clean verdict answers `204 No Modifications` (clients advertise
//! `Allow: 204`); a block answers `200 OK` with an encapsulated HTTP
//! error response. Connections are closed after one transaction.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::core::{Priority, ScanError};
use crate::producer::session::{ProducerContext, RequestMeta, ScanSession, SessionOutcome};

/// Default preview size advertised on OPTIONS.
const DEFAULT_PREVIEW_SIZE: usize = 4096;

/// Service tag for ISTag headers.
const ISTAG: &str = "\"scangate-1\"";

/// The ICAP listener.
pub struct IcapServer {
    ctx: Arc<ProducerContext>,
    preview_size: usize,
}

impl IcapServer {
    /// Creates the server over the shared producer context.
    pub fn new(ctx: Arc<ProducerContext>) -> Self {
        Self {
            ctx,
            preview_size: DEFAULT_PREVIEW_SIZE,
        }
    }

    /// Overrides the preview size advertised to clients.
    pub fn with_preview_size(mut self, preview_size: usize) -> Self {
        self.preview_size = preview_size;
        self
    }

    /// Binds and serves forever.
    pub async fn serve(self, port: u16) -> Result<(), ScanError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!(port, "ICAP server listening");
        self.serve_with_listener(listener).await
    }

    /// Serves on an already-bound listener.
    pub async fn serve_with_listener(self, listener: TcpListener) -> Result<(), ScanError> {
        loop {
            let (socket, peer) = listener.accept().await?;
            let ctx = self.ctx.clone();
            let preview_size = self.preview_size;
            tokio::spawn(async move {
                if let Err(e) = handle_transaction(ctx, socket, preview_size).await {
                    tracing::debug!(%peer, error = %e, "ICAP transaction failed");
                }
            });
        }
    }
}

async fn handle_transaction(
    ctx: Arc<ProducerContext>,
    socket: TcpStream,
    preview_size: usize,
) -> Result<(), ScanError> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let head_raw = read_head(&mut reader).await?;
    let head = parse_icap_head(&head_raw)?;

    match head.method.as_str() {
        "OPTIONS" => {
            let response = format!(
                "ICAP/1.0 200 OK\r\n\
                 Methods: REQMOD, RESPMOD\r\n\
                 Service: scangate\r\n\
                 ISTag: {ISTAG}\r\n\
                 Preview: {preview_size}\r\n\
                 Allow: 204\r\n\
                 Encapsulated: null-body=0\r\n\r\n"
            );
            write_half.write_all(response.as_bytes()).await?;
            Ok(())
        }
        "REQMOD" | "RESPMOD" => {
            process_mod(ctx, head, &mut reader, &mut write_half).await
        }
        other => {
            let response = format!(
                "ICAP/1.0 405 Method Not Allowed\r\n\
                 ISTag: {ISTAG}\r\n\
                 Encapsulated: null-body=0\r\n\r\n"
            );
            write_half.write_all(response.as_bytes()).await?;
            Err(ScanError::protocol(format!("ICAP method '{other}'")))
        }
    }
}

async fn process_mod(
    ctx: Arc<ProducerContext>,
    head: IcapHead,
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
) -> Result<(), ScanError> {
    let encapsulated = head
        .headers
        .get("encapsulated")
        .ok_or_else(|| ScanError::protocol("missing Encapsulated header"))?;
    let segments = parse_encapsulated(encapsulated)?;

    // Sized header blocks precede the (chunked) body. Offsets are relative
    // to the start of the encapsulated section, so deltas give lengths.
    let mut embedded_request: Option<HttpHead> = None;
    for (index, (name, offset)) in segments.iter().enumerate() {
        if name.ends_with("-body") {
            break;
        }
        let end = segments
            .get(index + 1)
            .map(|(_, next)| *next)
            .ok_or_else(|| ScanError::protocol("header segment without body marker"))?;
        let mut block = vec![0u8; end - offset];
        reader.read_exact(&mut block).await?;
        if name == "req-hdr" {
            embedded_request = Some(parse_http_request_head(&block)?);
        }
    }

    let has_body = segments
        .last()
        .map(|(name, _)| name != "null-body")
        .unwrap_or(false);

    let meta = embedded_request
        .map(|http| http.into_meta())
        .unwrap_or_default();

    let mut session = ScanSession::new(ctx);
    session.begin(meta).await?;

    let outcome = if !has_body {
        session.finish().await
    } else {
        pump_body(&mut session, &head, reader, writer).await
    };

    match outcome {
        Ok(SessionOutcome::Admitted { scan_result, .. }) => {
            let response = format!(
                "ICAP/1.0 204 No Modifications\r\n\
                 ISTag: {ISTAG}\r\n\
                 X-Scan-Result: {scan_result}\r\n\
                 Encapsulated: null-body=0\r\n\r\n"
            );
            writer.write_all(response.as_bytes()).await?;
            Ok(())
        }
        Ok(SessionOutcome::Blocked {
            status,
            virus,
            message,
        }) => {
            write_block_response(writer, status, virus.as_deref(), &message).await
        }
        Err(e) => {
            session.abort().await;
            match e {
                ScanError::BodyTooLarge { .. } => {
                    write_block_response(writer, 413, None, "body exceeds scan cap").await
                }
                other => {
                    let response = format!(
                        "ICAP/1.0 500 Server Error\r\n\
                         ISTag: {ISTAG}\r\n\
                         Encapsulated: null-body=0\r\n\r\n"
                    );
                    writer.write_all(response.as_bytes()).await?;
                    Err(other)
                }
            }
        }
    }
}

/// Drains the chunked body into the session, honoring preview handshakes.
async fn pump_body(
    session: &mut ScanSession,
    head: &IcapHead,
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
) -> Result<SessionOutcome, ScanError> {
    let has_preview = head.headers.contains_key("preview");
    let mut preview_continued = false;

    loop {
        match read_chunk(reader).await? {
            Chunk::Data(data) => session.push_body(&data).await?,
            Chunk::End { ieof } => {
                if has_preview && !preview_continued && !ieof {
                    // Preview exhausted without EOF; ask for the rest.
                    writer.write_all(b"ICAP/1.0 100 Continue\r\n\r\n").await?;
                    preview_continued = true;
                    continue;
                }
                break;
            }
        }
    }
    session.finish().await
}

async fn write_block_response(
    writer: &mut OwnedWriteHalf,
    status: u16,
    virus: Option<&str>,
    message: &str,
) -> Result<(), ScanError> {
    let reason = match status {
        406 => "Not Acceptable",
        413 => "Payload Too Large",
        503 => "Service Unavailable",
        _ => "Blocked",
    };
    let mut http_head = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain\r\n\
         X-Virus-Infected: true\r\n"
    );
    if let Some(name) = virus {
        http_head.push_str(&format!("X-Virus-Name: {name}\r\n"));
    }
    http_head.push_str("\r\n");

    let body = format!("{message}\r\n");
    let chunked_body = format!("{:x}\r\n{body}\r\n0\r\n\r\n", body.len());

    let response = format!(
        "ICAP/1.0 200 OK\r\n\
         ISTag: {ISTAG}\r\n\
         Encapsulated: res-hdr=0, res-body={}\r\n\r\n{http_head}{chunked_body}",
        http_head.len()
    );
    writer.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Reads up to and including the blank line terminating a head section.
async fn read_head<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<String, ScanError> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ScanError::protocol("connection closed mid-head"));
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
        head.push_str(&line);
    }
    Ok(head)
}

enum Chunk {
    Data(Vec<u8>),
    End { ieof: bool },
}

async fn read_chunk<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<Chunk, ScanError> {
    let mut size_line = String::new();
    if reader.read_line(&mut size_line).await? == 0 {
        return Err(ScanError::protocol("connection closed mid-chunk"));
    }
    let size_line = size_line.trim();
    let (size_hex, extension) = match size_line.split_once(';') {
        Some((size, ext)) => (size.trim(), ext.trim()),
        None => (size_line, ""),
    };
    let size = usize::from_str_radix(size_hex, 16)
        .map_err(|_| ScanError::protocol(format!("bad chunk size '{size_line}'")))?;

    if size == 0 {
        // Chunk terminator: consume the trailing CRLF.
        let mut trailer = String::new();
        reader.read_line(&mut trailer).await?;
        return Ok(Chunk::End {
            ieof: extension.contains("ieof"),
        });
    }

    let mut data = vec![0u8; size];
    reader.read_exact(&mut data).await?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    Ok(Chunk::Data(data))
}

struct IcapHead {
    method: String,
    headers: HashMap<String, String>,
}

fn parse_icap_head(raw: &str) -> Result<IcapHead, ScanError> {
    let mut lines = raw.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| ScanError::protocol("empty ICAP head"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ScanError::protocol("missing ICAP method"))?
        .to_ascii_uppercase();
    let _uri = parts
        .next()
        .ok_or_else(|| ScanError::protocol("missing ICAP uri"))?;
    match parts.next() {
        Some(version) if version.starts_with("ICAP/") => {}
        _ => return Err(ScanError::protocol("missing ICAP version")),
    }

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| ScanError::protocol(format!("bad ICAP header '{line}'")))?;
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Ok(IcapHead { method, headers })
}

/// Parses the Encapsulated header into ordered `(segment, offset)` pairs.
fn parse_encapsulated(value: &str) -> Result<Vec<(String, usize)>, ScanError> {
    let mut segments = Vec::new();
    for entry in value.split(',') {
        let (name, offset) = entry
            .trim()
            .split_once('=')
            .ok_or_else(|| ScanError::protocol(format!("bad Encapsulated entry '{entry}'")))?;
        let offset = offset
            .trim()
            .parse::<usize>()
            .map_err(|_| ScanError::protocol(format!("bad Encapsulated offset '{entry}'")))?;
        segments.push((name.trim().to_ascii_lowercase(), offset));
    }
    if segments.is_empty() {
        return Err(ScanError::protocol("empty Encapsulated header"));
    }
    Ok(segments)
}

struct HttpHead {
    method: String,
    uri: String,
    headers: HashMap<String, String>,
}

impl HttpHead {
    fn into_meta(self) -> RequestMeta {
        let priority = match self.headers.get("x-priority") {
            Some(value) if value.eq_ignore_ascii_case("high") => Priority::High,
            _ => Priority::Normal,
        };
        let uri = if self.uri.contains("://") {
            self.uri
        } else {
            match self.headers.get("host") {
                Some(host) => format!("http://{host}{}", self.uri),
                None => self.uri,
            }
        };
        RequestMeta {
            method: self.method,
            uri,
            priority,
            route_disabled: false,
        }
    }
}

fn parse_http_request_head(raw: &[u8]) -> Result<HttpHead, ScanError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| ScanError::protocol(format!("non-utf8 http head: {e}")))?;
    let mut lines = text.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| ScanError::protocol("empty http head"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ScanError::protocol("missing http method"))?
        .to_ascii_uppercase();
    let uri = parts
        .next()
        .ok_or_else(|| ScanError::protocol("missing http uri"))?
        .to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(HttpHead {
        method,
        uri,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachePolicyConfig, IntelligentCache};
    use crate::core::{KeySpace, ScanMetrics, Verdict, VerdictRecord};
    use crate::metrics::Metrics;
    use crate::queue::TaskQueue;
    use crate::store::MemoryStore;
    use crate::transport::TransportConfig;
    use std::time::Duration;

    #[test]
    fn test_parse_encapsulated() {
        let segments = parse_encapsulated("req-hdr=0, req-body=137").unwrap();
        assert_eq!(
            segments,
            vec![("req-hdr".to_string(), 0), ("req-body".to_string(), 137)]
        );

        let segments = parse_encapsulated("req-hdr=0, null-body=92").unwrap();
        assert_eq!(segments[1].0, "null-body");

        assert!(parse_encapsulated("req-hdr").is_err());
    }

    #[test]
    fn test_parse_icap_head() {
        let head = parse_icap_head(
            "REQMOD icap://gw/scan ICAP/1.0\r\nHost: gw\r\nPreview: 1024\r\nEncapsulated: req-hdr=0, req-body=10\r\n",
        )
        .unwrap();
        assert_eq!(head.method, "REQMOD");
        assert_eq!(head.headers.get("preview").map(String::as_str), Some("1024"));

        assert!(parse_icap_head("GARBAGE\r\n").is_err());
    }

    #[test]
    fn test_parse_http_request_head() {
        let head = parse_http_request_head(
            b"POST /upload HTTP/1.1\r\nHost: files.example.com\r\nX-Priority: high\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.method, "POST");
        let meta = head.into_meta();
        assert_eq!(meta.uri, "http://files.example.com/upload");
        assert_eq!(meta.priority, Priority::High);
    }

    #[tokio::test]
    async fn test_read_chunked_body() {
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&wire[..]);

        let Chunk::Data(first) = read_chunk(&mut reader).await.unwrap() else {
            panic!("expected data");
        };
        assert_eq!(first, b"hello");
        let Chunk::Data(second) = read_chunk(&mut reader).await.unwrap() else {
            panic!("expected data");
        };
        assert_eq!(second, b" world");
        let Chunk::End { ieof } = read_chunk(&mut reader).await.unwrap() else {
            panic!("expected end");
        };
        assert!(!ieof);
    }

    #[tokio::test]
    async fn test_read_chunk_ieof() {
        let wire = b"0; ieof\r\n\r\n";
        let mut reader = BufReader::new(&wire[..]);
        let Chunk::End { ieof } = read_chunk(&mut reader).await.unwrap() else {
            panic!("expected end");
        };
        assert!(ieof);
    }

    fn context(store: Arc<MemoryStore>) -> Arc<ProducerContext> {
        let keys = KeySpace::new("");
        Arc::new(ProducerContext {
            store: store.clone(),
            queue: TaskQueue::new(store.clone(), keys.clone()),
            transport: TransportConfig {
                shared_dir: None,
                ..TransportConfig::default()
            },
            cache: IntelligentCache::new(store, keys.clone(), CachePolicyConfig::default()),
            metrics: Arc::new(Metrics::new().unwrap()),
            keys,
            processing_timeout: Duration::from_millis(500),
            failure_mode_allow: true,
            max_body_bytes: 1 << 30,
            block_status: 406,
        })
    }

    /// Answers queued tasks with a fixed verdict.
    fn spawn_responder(ctx: Arc<ProducerContext>, verdict: Verdict) {
        tokio::spawn(async move {
            if let Ok(Some(popped)) = ctx.queue.pop(Duration::from_secs(2)).await {
                let header = popped.header().unwrap();
                let record =
                    VerdictRecord::new(&verdict, None, ScanMetrics::default());
                let _ = ctx.queue.publish_result(&header.task_id, &record).await;
            }
        });
    }

    async fn roundtrip(ctx: Arc<ProducerContext>, request: &[u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(IcapServer::new(ctx).serve_with_listener(listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn test_options_advertises_methods() {
        let ctx = context(Arc::new(MemoryStore::new()));
        let response = roundtrip(
            ctx,
            b"OPTIONS icap://gw/scan ICAP/1.0\r\nHost: gw\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("ICAP/1.0 200 OK"));
        assert!(response.contains("Methods: REQMOD, RESPMOD"));
        assert!(response.contains("Preview: 4096"));
    }

    #[tokio::test]
    async fn test_reqmod_clean_gets_204() {
        let ctx = context(Arc::new(MemoryStore::new()));
        spawn_responder(ctx.clone(), Verdict::Clean);

        let http_head = "POST /upload HTTP/1.1\r\nHost: files.example.com\r\n\r\n";
        let request = format!(
            "REQMOD icap://gw/scan ICAP/1.0\r\n\
             Host: gw\r\n\
             Allow: 204\r\n\
             Encapsulated: req-hdr=0, req-body={}\r\n\r\n\
             {http_head}b\r\nhello world\r\n0\r\n\r\n",
            http_head.len()
        );

        let response = roundtrip(ctx, request.as_bytes()).await;
        assert!(response.starts_with("ICAP/1.0 204 No Modifications"));
        assert!(response.contains("X-Scan-Result: clean"));
    }

    #[tokio::test]
    async fn test_reqmod_infected_gets_encapsulated_block() {
        let ctx = context(Arc::new(MemoryStore::new()));
        spawn_responder(
            ctx.clone(),
            Verdict::Infected {
                virus: "Eicar-Test-Signature".to_string(),
            },
        );

        let http_head = "POST /upload HTTP/1.1\r\nHost: files.example.com\r\n\r\n";
        let request = format!(
            "REQMOD icap://gw/scan ICAP/1.0\r\n\
             Host: gw\r\n\
             Encapsulated: req-hdr=0, req-body={}\r\n\r\n\
             {http_head}7\r\npayload\r\n0\r\n\r\n",
            http_head.len()
        );

        let response = roundtrip(ctx, request.as_bytes()).await;
        assert!(response.starts_with("ICAP/1.0 200 OK"));
        assert!(response.contains("HTTP/1.1 406 Not Acceptable"));
        assert!(response.contains("X-Virus-Infected: true"));
        assert!(response.contains("X-Virus-Name: Eicar-Test-Signature"));
    }

    #[tokio::test]
    async fn test_preview_handshake() {
        let ctx = context(Arc::new(MemoryStore::new()));
        spawn_responder(ctx.clone(), Verdict::Clean);

        let http_head = "POST /big HTTP/1.1\r\nHost: files.example.com\r\n\r\n";
        let request_head = format!(
            "REQMOD icap://gw/scan ICAP/1.0\r\n\
             Host: gw\r\n\
             Allow: 204\r\n\
             Preview: 4\r\n\
             Encapsulated: req-hdr=0, req-body={}\r\n\r\n\
             {http_head}4\r\nhead\r\n0\r\n\r\n",
            http_head.len()
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(IcapServer::new(ctx).serve_with_listener(listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request_head.as_bytes()).await.unwrap();

        // The server must ask for the rest of the body.
        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        let interim = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(interim.starts_with("ICAP/1.0 100 Continue"));

        client
            .write_all(b"5\r\n tail\r\n0\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("ICAP/1.0 204"));
    }
}
