//! Envoy external-processor front end.
//!
//! Implements the ext_proc bidirectional stream: headers and body chunks
//! arrive as `ProcessingRequest` messages, each answered with a continue
//! or an `ImmediateResponse` block. Request and response phases each run
//! their own `ScanSession`, so both uploads and downloads are inspected.
//! When the proxy drops the stream mid-transaction the driver aborts the
//! session, freeing queued results and chunk lists immediately.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use envoy_types::pb::envoy::config::core::v3::{HeaderMap, HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::r#type::v3::HttpStatus;
use envoy_types::pb::envoy::service::ext_proc::v3::{
    external_processor_server::{ExternalProcessor, ExternalProcessorServer},
    processing_request, processing_response, BodyResponse, CommonResponse, HeaderMutation,
    HeadersResponse, HttpBody, HttpHeaders, ImmediateResponse, ProcessingRequest,
    ProcessingResponse, TrailersResponse,
};

use crate::core::{Priority, ScanError};
use crate::producer::session::{
    ProducerContext, RequestMeta, ScanSession, SessionOutcome,
};

/// Header carrying the per-route scanning opt-out.
const DISABLE_HEADER: &str = "x-scan-disabled";

/// The gRPC service wrapper.
pub struct ExtProcService {
    ctx: Arc<ProducerContext>,
}

impl ExtProcService {
    /// Creates the service over the shared producer context.
    pub fn new(ctx: Arc<ProducerContext>) -> Self {
        Self { ctx }
    }

    /// Wraps the service for `tonic::transport::Server::add_service`.
    pub fn into_server(self) -> ExternalProcessorServer<Self> {
        ExternalProcessorServer::new(self)
    }
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
    type ProcessStream = ReceiverStream<Result<ProcessingResponse, Status>>;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let ctx = self.ctx.clone();
        tokio::spawn(drive_stream(ctx, inbound, tx));
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Runs one proxied transaction to completion or disconnect.
async fn drive_stream(
    ctx: Arc<ProducerContext>,
    mut inbound: Streaming<ProcessingRequest>,
    tx: mpsc::Sender<Result<ProcessingResponse, Status>>,
) {
    let mut driver = StreamDriver::new(ctx);
    let clean_end = loop {
        match inbound.message().await {
            Ok(Some(message)) => {
                let response = driver.handle(message).await;
                if tx.send(Ok(response)).await.is_err() {
                    break false;
                }
            }
            Ok(None) => break true,
            Err(status) => {
                tracing::debug!(error = %status, "ext_proc stream error");
                break false;
            }
        }
    };
    driver.teardown(clean_end).await;
}

struct StreamDriver {
    ctx: Arc<ProducerContext>,
    request_meta: RequestMeta,
    session: Option<ScanSession>,
    is_request_phase: bool,
}

impl StreamDriver {
    fn new(ctx: Arc<ProducerContext>) -> Self {
        Self {
            ctx,
            request_meta: RequestMeta::default(),
            session: None,
            is_request_phase: true,
        }
    }

    async fn handle(&mut self, message: ProcessingRequest) -> ProcessingResponse {
        match message.request {
            Some(processing_request::Request::RequestHeaders(headers)) => {
                self.is_request_phase = true;
                self.request_meta = meta_from_headers(&headers);
                self.begin_session(self.request_meta.clone(), headers.end_of_stream)
                    .await
            }
            Some(processing_request::Request::RequestBody(body)) => {
                self.handle_body(body).await
            }
            Some(processing_request::Request::ResponseHeaders(headers)) => {
                self.is_request_phase = false;
                // The response phase inherits the request identity; the
                // interesting input is the downloaded body.
                let meta = self.request_meta.clone();
                self.begin_session(meta, headers.end_of_stream).await
            }
            Some(processing_request::Request::ResponseBody(body)) => {
                self.handle_body(body).await
            }
            Some(processing_request::Request::RequestTrailers(_)) => trailers_continue(true),
            Some(processing_request::Request::ResponseTrailers(_)) => trailers_continue(false),
            _ => continue_response(self.is_request_phase, Phase::Headers, None),
        }
    }

    async fn begin_session(
        &mut self,
        meta: RequestMeta,
        end_of_stream: bool,
    ) -> ProcessingResponse {
        let mut session = ScanSession::new(self.ctx.clone());
        if let Err(e) = session.begin(meta).await {
            tracing::warn!(error = %e, "session begin failed, relaying");
            return continue_response(self.is_request_phase, Phase::Headers, None);
        }

        if end_of_stream {
            // Body-less message: the whole decision happens at the header.
            let outcome = session.finish().await;
            return self.conclude(outcome, Phase::Headers);
        }

        self.session = Some(session);
        continue_response(self.is_request_phase, Phase::Headers, None)
    }

    async fn handle_body(&mut self, body: HttpBody) -> ProcessingResponse {
        let Some(session) = self.session.as_mut() else {
            return continue_response(self.is_request_phase, Phase::Body, None);
        };

        if let Err(e) = session.push_body(&body.body).await {
            self.session = None;
            return self.error_response(e);
        }

        if body.end_of_stream {
            let outcome = match self.session.as_mut() {
                Some(session) => session.finish().await,
                None => return continue_response(self.is_request_phase, Phase::Body, None),
            };
            self.session = None;
            return self.conclude(outcome, Phase::Body);
        }

        continue_response(self.is_request_phase, Phase::Body, None)
    }

    fn conclude(
        &mut self,
        outcome: Result<SessionOutcome, ScanError>,
        phase: Phase,
    ) -> ProcessingResponse {
        match outcome {
            Ok(SessionOutcome::Admitted {
                scan_result,
                tat_ms,
            }) => {
                let mut mutation = vec![header_option("x-scan-result", scan_result)];
                if let Some(tat) = tat_ms {
                    mutation.push(header_option("x-scan-tat-ms", &tat.to_string()));
                }
                continue_response(self.is_request_phase, phase, Some(mutation))
            }
            Ok(SessionOutcome::Blocked {
                status,
                virus,
                message,
            }) => immediate_block(status, virus.as_deref(), &message),
            Err(e) => self.error_response(e),
        }
    }

    fn error_response(&self, error: ScanError) -> ProcessingResponse {
        match error {
            ScanError::BodyTooLarge { size, cap } => immediate_block(
                413,
                None,
                &format!("body of {size} bytes exceeds scan cap of {cap} bytes"),
            ),
            other => {
                tracing::warn!(error = %other, "session error");
                if self.ctx.failure_mode_allow {
                    continue_response(
                        self.is_request_phase,
                        Phase::Body,
                        Some(vec![header_option("x-scan-result", "error-allow")]),
                    )
                } else {
                    immediate_block(503, None, "scan unavailable")
                }
            }
        }
    }

    async fn teardown(mut self, clean_end: bool) {
        if let Some(mut session) = self.session.take() {
            if !clean_end {
                tracing::debug!("proxy disconnected mid-transaction, aborting session");
            }
            session.abort().await;
        }
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Headers,
    Body,
}

fn continue_response(
    is_request_phase: bool,
    phase: Phase,
    set_headers: Option<Vec<HeaderValueOption>>,
) -> ProcessingResponse {
    let common = CommonResponse {
        header_mutation: set_headers.map(|set_headers| HeaderMutation {
            set_headers,
            ..Default::default()
        }),
        ..Default::default()
    };
    let response = match (phase, is_request_phase) {
        (Phase::Headers, true) => {
            processing_response::Response::RequestHeaders(HeadersResponse {
                response: Some(common),
            })
        }
        (Phase::Headers, false) => {
            processing_response::Response::ResponseHeaders(HeadersResponse {
                response: Some(common),
            })
        }
        (Phase::Body, true) => processing_response::Response::RequestBody(BodyResponse {
            response: Some(common),
        }),
        (Phase::Body, false) => processing_response::Response::ResponseBody(BodyResponse {
            response: Some(common),
        }),
    };
    ProcessingResponse {
        response: Some(response),
        ..Default::default()
    }
}

fn trailers_continue(is_request_phase: bool) -> ProcessingResponse {
    let trailers = TrailersResponse::default();
    let response = if is_request_phase {
        processing_response::Response::RequestTrailers(trailers)
    } else {
        processing_response::Response::ResponseTrailers(trailers)
    };
    ProcessingResponse {
        response: Some(response),
        ..Default::default()
    }
}

fn immediate_block(status: u16, virus: Option<&str>, message: &str) -> ProcessingResponse {
    let mut set_headers = vec![header_option("x-virus-infected", "true")];
    if let Some(name) = virus {
        set_headers.push(header_option("x-virus-name", name));
    }
    ProcessingResponse {
        response: Some(processing_response::Response::ImmediateResponse(
            ImmediateResponse {
                status: Some(HttpStatus {
                    code: status as i32,
                }),
                headers: Some(HeaderMutation {
                    set_headers,
                    ..Default::default()
                }),
                body: message.to_string().into(),
                details: message.to_string(),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}

fn header_option(key: &str, value: &str) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: key.to_string(),
            raw_value: value.as_bytes().to_vec(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn header_text(header: &HeaderValue) -> String {
    if !header.raw_value.is_empty() {
        String::from_utf8_lossy(&header.raw_value).into_owned()
    } else {
        header.value.clone()
    }
}

fn header_map(headers: &Option<HeaderMap>) -> HashMap<String, String> {
    headers
        .as_ref()
        .map(|map| {
            map.headers
                .iter()
                .map(|h| (h.key.to_ascii_lowercase(), header_text(h)))
                .collect()
        })
        .unwrap_or_default()
}

fn meta_from_headers(http: &HttpHeaders) -> RequestMeta {
    let map = header_map(&http.headers);

    let method = map
        .get(":method")
        .cloned()
        .unwrap_or_else(|| "GET".to_string())
        .to_ascii_uppercase();
    let path = map.get(":path").cloned().unwrap_or_else(|| "/".to_string());
    let uri = if path.contains("://") {
        path
    } else {
        let scheme = map.get(":scheme").cloned().unwrap_or_else(|| "https".to_string());
        match map.get(":authority") {
            Some(authority) => format!("{scheme}://{authority}{path}"),
            None => path,
        }
    };

    let priority = match map.get("x-priority") {
        Some(value) if value.eq_ignore_ascii_case("high") => Priority::High,
        _ => Priority::Normal,
    };
    let route_disabled = matches!(
        map.get(DISABLE_HEADER),
        Some(value) if value.eq_ignore_ascii_case("true") || value == "1"
    );

    RequestMeta {
        method,
        uri,
        priority,
        route_disabled,
    }
}
