//! End-to-end pipeline tests: a real ext_proc gRPC server and client, the
//! in-memory state store, a worker pool, and a fake clamd listener.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};

use envoy_types::pb::envoy::config::core::v3::{HeaderMap, HeaderValue};
use envoy_types::pb::envoy::service::ext_proc::v3::{
    external_processor_client::ExternalProcessorClient, processing_request,
    processing_response, HttpBody, HttpHeaders, ProcessingRequest, ProcessingResponse,
};

use scangate::cache::{CachePolicyConfig, IntelligentCache};
use scangate::consumer::{ClamdClient, WorkerContext, WorkerPool};
use scangate::core::{KeySpace, Priority};
use scangate::metrics::Metrics;
use scangate::producer::{ExtProcService, ProducerContext};
use scangate::queue::TaskQueue;
use scangate::retry::RetryConfig;
use scangate::store::{MemoryStore, StateStore};
use scangate::transport::TransportConfig;

const EICAR_BODY: &[u8] =
    br#"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"#;

async fn spawn_fake_clamd() -> String {
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
                        let marker = b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE";
                        let infected = body.windows(marker.len()).any(|w| w == marker);
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

struct Pipeline {
    store: Arc<MemoryStore>,
    ctx: Arc<ProducerContext>,
    pool: Option<WorkerPool>,
    grpc_endpoint: String,
}

async fn start_pipeline(with_workers: bool, processing_timeout: Duration) -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    let keys = KeySpace::new("");
    let metrics = Arc::new(Metrics::new().unwrap());
    let queue = TaskQueue::new(store.clone(), keys.clone());
    let transport = TransportConfig {
        shared_dir: None,
        chunk_timeout: Duration::from_millis(20),
        idle_limit: Duration::from_millis(500),
        ..TransportConfig::default()
    };

    let ctx = Arc::new(ProducerContext {
        store: store.clone(),
        queue: queue.clone(),
        transport: transport.clone(),
        cache: IntelligentCache::new(
            store.clone(),
            keys.clone(),
            CachePolicyConfig::default(),
        ),
        metrics: metrics.clone(),
        keys,
        processing_timeout,
        failure_mode_allow: true,
        max_body_bytes: 1 << 30,
        block_status: 406,
    });

    let pool = if with_workers {
        let clamd_url = spawn_fake_clamd().await;
        Some(WorkerPool::spawn(
            2,
            WorkerContext {
                store: store.clone(),
                queue,
                transport,
                engine: ClamdClient::new(&clamd_url).unwrap(),
                metrics,
                retry: RetryConfig::default(),
            },
        ))
    } else {
        None
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = ExtProcService::new(ctx.clone()).into_server();
    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );

    Pipeline {
        store,
        ctx,
        pool,
        grpc_endpoint: format!("http://{addr}"),
    }
}

fn header(key: &str, value: &str) -> HeaderValue {
    HeaderValue {
        key: key.to_string(),
        value: value.to_string(),
        ..Default::default()
    }
}

fn request_headers(method: &str, uri_path: &str, extra: Vec<HeaderValue>) -> ProcessingRequest {
    let mut headers = vec![
        header(":method", method),
        header(":scheme", "https"),
        header(":authority", "upstream.example.com"),
        header(":path", uri_path),
    ];
    headers.extend(extra);
    ProcessingRequest {
        request: Some(processing_request::Request::RequestHeaders(HttpHeaders {
            headers: Some(HeaderMap {
                headers,
                ..Default::default()
            }),
            end_of_stream: false,
            ..Default::default()
        })),
        ..Default::default()
    }
}

fn request_body(data: &[u8], end_of_stream: bool) -> ProcessingRequest {
    ProcessingRequest {
        request: Some(processing_request::Request::RequestBody(HttpBody {
            body: data.to_vec(),
            end_of_stream,
        })),
        ..Default::default()
    }
}

struct ExtProcConversation {
    tx: mpsc::Sender<ProcessingRequest>,
    inbound: tonic::Streaming<ProcessingResponse>,
}

impl ExtProcConversation {
    async fn open(endpoint: &str) -> Self {
        let channel = tonic::transport::Channel::from_shared(endpoint.to_string())
            .unwrap()
            .connect()
            .await
            .unwrap();
        let mut client = ExternalProcessorClient::new(channel);
        let (tx, rx) = mpsc::channel(8);
        let response = client.process(ReceiverStream::new(rx)).await.unwrap();
        Self {
            tx,
            inbound: response.into_inner(),
        }
    }

    async fn exchange(&mut self, message: ProcessingRequest) -> ProcessingResponse {
        self.tx.send(message).await.unwrap();
        self.inbound.message().await.unwrap().unwrap()
    }
}

fn scan_result_header(response: &ProcessingResponse) -> Option<String> {
    let common = match response.response.as_ref()? {
        processing_response::Response::RequestBody(body) => body.response.as_ref()?,
        processing_response::Response::RequestHeaders(headers) => headers.response.as_ref()?,
        _ => return None,
    };
    common
        .header_mutation
        .as_ref()?
        .set_headers
        .iter()
        .filter_map(|option| option.header.as_ref())
        .find(|h| h.key == "x-scan-result")
        .map(|h| String::from_utf8_lossy(&h.raw_value).into_owned())
}

#[tokio::test]
async fn test_clean_small_upload_admitted() {
    let pipeline = start_pipeline(true, Duration::from_secs(5)).await;
    let mut conversation = ExtProcConversation::open(&pipeline.grpc_endpoint).await;

    let headers_response = conversation
        .exchange(request_headers("POST", "/upload", vec![]))
        .await;
    assert!(matches!(
        headers_response.response,
        Some(processing_response::Response::RequestHeaders(_))
    ));

    let body_response = conversation
        .exchange(request_body(b"hello world", true))
        .await;
    assert_eq!(
        scan_result_header(&body_response).as_deref(),
        Some("clean")
    );

    if let Some(pool) = pipeline.pool {
        pool.shutdown(Duration::from_secs(2)).await;
    }
}

#[tokio::test]
async fn test_eicar_upload_blocked_with_406() {
    let pipeline = start_pipeline(true, Duration::from_secs(5)).await;
    let mut conversation = ExtProcConversation::open(&pipeline.grpc_endpoint).await;

    conversation
        .exchange(request_headers("POST", "/upload", vec![]))
        .await;
    let body_response = conversation.exchange(request_body(EICAR_BODY, true)).await;

    let Some(processing_response::Response::ImmediateResponse(immediate)) =
        body_response.response
    else {
        panic!("expected immediate response, got {body_response:?}");
    };
    assert_eq!(immediate.status.unwrap().code, 406);
    let header_keys: Vec<String> = immediate
        .headers
        .unwrap()
        .set_headers
        .iter()
        .filter_map(|option| option.header.as_ref())
        .map(|h| h.key.clone())
        .collect();
    assert!(header_keys.contains(&"x-virus-infected".to_string()));
    assert!(header_keys.contains(&"x-virus-name".to_string()));

    // No verified chunk list survives an infected verdict.
    assert!(pipeline.store.scan_keys("chunks:*:verified").await.unwrap().is_empty());

    if let Some(pool) = pipeline.pool {
        pool.shutdown(Duration::from_secs(2)).await;
    }
}

#[tokio::test]
async fn test_timeout_allow_without_workers() {
    let pipeline = start_pipeline(false, Duration::from_millis(200)).await;
    let mut conversation = ExtProcConversation::open(&pipeline.grpc_endpoint).await;

    conversation
        .exchange(request_headers("POST", "/upload", vec![]))
        .await;
    let body_response = conversation.exchange(request_body(b"some body", true)).await;
    assert_eq!(
        scan_result_header(&body_response).as_deref(),
        Some("timeout-allow")
    );
}

#[tokio::test]
async fn test_priority_header_routes_to_priority_queue() {
    // No workers: the queues stay inspectable.
    let pipeline = start_pipeline(false, Duration::from_millis(100)).await;
    let mut conversation = ExtProcConversation::open(&pipeline.grpc_endpoint).await;

    conversation
        .exchange(request_headers(
            "POST",
            "/urgent",
            vec![header("x-priority", "high")],
        ))
        .await;
    let _ = conversation.exchange(request_body(b"urgent body", true)).await;

    // Nothing pops tasks in this pipeline, so the element must still sit
    // on the priority list and the normal list must never have seen it.
    assert_eq!(pipeline.ctx.queue.depth(Priority::High).await.unwrap(), 1);
    assert_eq!(pipeline.ctx.queue.depth(Priority::Normal).await.unwrap(), 0);
}

#[tokio::test]
async fn test_route_disabled_never_enqueues() {
    let pipeline = start_pipeline(false, Duration::from_millis(100)).await;
    let mut conversation = ExtProcConversation::open(&pipeline.grpc_endpoint).await;

    conversation
        .exchange(request_headers(
            "POST",
            "/internal",
            vec![header("x-scan-disabled", "true")],
        ))
        .await;
    let body_response = conversation.exchange(request_body(b"body", true)).await;
    assert_eq!(
        scan_result_header(&body_response).as_deref(),
        Some("bypass")
    );

    assert_eq!(pipeline.ctx.queue.depth(Priority::High).await.unwrap(), 0);
    assert_eq!(pipeline.ctx.queue.depth(Priority::Normal).await.unwrap(), 0);
}

#[tokio::test]
async fn test_cache_hit_on_second_get() {
    let pipeline = start_pipeline(true, Duration::from_secs(5)).await;

    // First GET: body-less request, header phase carries end_of_stream.
    let mut conversation = ExtProcConversation::open(&pipeline.grpc_endpoint).await;
    let mut first_headers = request_headers("GET", "/artifact.tgz", vec![]);
    if let Some(processing_request::Request::RequestHeaders(ref mut headers)) =
        first_headers.request
    {
        headers.end_of_stream = true;
    }
    let first = conversation.exchange(first_headers.clone()).await;
    assert_eq!(scan_result_header(&first).as_deref(), Some("clean"));

    // Second GET: served from the verdict cache without a new scan task.
    let mut conversation = ExtProcConversation::open(&pipeline.grpc_endpoint).await;
    let second = conversation.exchange(first_headers).await;
    assert_eq!(scan_result_header(&second).as_deref(), Some("bypass"));

    if let Some(pool) = pipeline.pool {
        pool.shutdown(Duration::from_secs(2)).await;
    }
}
