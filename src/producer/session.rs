//! Per-transaction scan session.
//!
//! One `ScanSession` drives one proxied HTTP transaction through the
//! pipeline: decide bypass, buffer the body, spill to a streaming or
//! shared-disk transport when it grows past the threshold, enqueue, wait
//! for the verdict, and map the outcome to admit or block. Both protocol
//! front ends (ext_proc and ICAP) feed the same machine, so policy lives
//! here and nowhere else.

use std::sync::Arc;
use std::time::Instant;

use crate::cache::{HostClass, IntelligentCache};
use crate::core::{
    KeySpace, Priority, ScanError, TaskHeader, TaskMode, VerdictRecord, VerdictStatus,
};
use crate::metrics::Metrics;
use crate::queue::TaskQueue;
use crate::store::SharedStore;
use crate::transport::{DataProvider, TransportConfig};

/// Prefix of the body captured for the cache fingerprint.
const PREFIX_CAPTURE: usize = 4096;

/// Methods whose verdicts may be cached.
const CACHEABLE_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS"];

/// Everything a session needs, wired once at startup.
pub struct ProducerContext {
    /// State store handle.
    pub store: SharedStore,
    /// Task and result queues.
    pub queue: TaskQueue,
    /// Transport selection parameters.
    pub transport: TransportConfig,
    /// Bypass/priority policy and verdict cache.
    pub cache: IntelligentCache,
    /// Metrics registry.
    pub metrics: Arc<Metrics>,
    /// Key space for cleanup of abandoned tasks.
    pub keys: KeySpace,
    /// Verdict wait budget.
    pub processing_timeout: std::time::Duration,
    /// Admit on timeout or engine error.
    pub failure_mode_allow: bool,
    /// Absolute body cap; beyond it the request is rejected outright.
    pub max_body_bytes: u64,
    /// HTTP status used for infected blocks.
    pub block_status: u16,
}

/// Request metadata extracted by a protocol front end.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// HTTP method.
    pub method: String,
    /// Full or origin-form request URI.
    pub uri: String,
    /// Priority requested via `X-Priority: high`.
    pub priority: Priority,
    /// Per-route opt-out carried by the proxy.
    pub route_disabled: bool,
}

/// Terminal decision for one transaction.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Let the traffic through.
    Admitted {
        /// Value for the `X-Scan-Result` header.
        scan_result: &'static str,
        /// Verdict turn-around, when a scan actually ran.
        tat_ms: Option<u64>,
    },
    /// Stop the traffic.
    Blocked {
        /// HTTP status for the immediate response.
        status: u16,
        /// Detected signature name, if this was an infection block.
        virus: Option<String>,
        /// Human-readable body for the response.
        message: String,
    },
}

enum State {
    Deciding,
    Relay {
        reason: &'static str,
    },
    Buffering {
        buf: Vec<u8>,
    },
    Spilling {
        header: TaskHeader,
        provider: Box<dyn DataProvider>,
        enqueued: bool,
    },
    Done,
}

/// The per-transaction state machine.
pub struct ScanSession {
    ctx: Arc<ProducerContext>,
    state: State,
    meta: RequestMeta,
    priority: Priority,
    prefix: Vec<u8>,
    body_seen: u64,
    ingest_started: Instant,
    pending_task: Option<String>,
}

impl ScanSession {
    /// Creates a session awaiting request headers.
    pub fn new(ctx: Arc<ProducerContext>) -> Self {
        Self {
            ctx,
            state: State::Deciding,
            meta: RequestMeta::default(),
            priority: Priority::Normal,
            prefix: Vec::new(),
            body_seen: 0,
            ingest_started: Instant::now(),
            pending_task: None,
        }
    }

    /// Consumes the request headers and decides bypass vs. scan.
    pub async fn begin(&mut self, meta: RequestMeta) -> Result<(), ScanError> {
        self.ingest_started = Instant::now();
        self.priority = self
            .ctx
            .cache
            .effective_priority(&meta.uri, meta.priority);

        if meta.route_disabled {
            self.ctx.metrics.observe_bypass("route_disabled");
            self.state = State::Relay {
                reason: "bypass",
            };
            self.meta = meta;
            return Ok(());
        }

        match self.ctx.cache.classify(&meta.uri) {
            HostClass::Bypass => {
                self.ctx.metrics.observe_bypass("host_policy");
                self.state = State::Relay {
                    reason: "bypass",
                };
                self.meta = meta;
                return Ok(());
            }
            HostClass::Trusted { category } => {
                if meta.priority == Priority::High {
                    tracing::debug!(
                        category,
                        uri = %meta.uri,
                        "trusted registry, scanning at normal priority"
                    );
                }
            }
            HostClass::Unclassified => {}
        }

        // Body-less safe methods can ride a memoized clean verdict.
        if CACHEABLE_METHODS.contains(&meta.method.as_str())
            && self.ctx.cache.lookup_clean(&meta.uri, &[]).await?
        {
            self.ctx.metrics.observe_bypass("cache_hit");
            self.state = State::Relay {
                reason: "bypass",
            };
            self.meta = meta;
            return Ok(());
        }

        self.meta = meta;
        self.state = State::Buffering { buf: Vec::new() };
        Ok(())
    }

    /// Whether this transaction already short-circuited to relay.
    pub fn is_relaying(&self) -> bool {
        matches!(self.state, State::Relay { .. })
    }

    /// Feeds one chunk of request body into the machine.
    pub async fn push_body(&mut self, data: &[u8]) -> Result<(), ScanError> {
        if matches!(self.state, State::Relay { .. } | State::Done) {
            return Ok(());
        }

        self.body_seen += data.len() as u64;
        if self.body_seen > self.ctx.max_body_bytes {
            self.state = State::Done;
            return Err(ScanError::BodyTooLarge {
                size: self.body_seen,
                cap: self.ctx.max_body_bytes,
            });
        }

        if self.prefix.len() < PREFIX_CAPTURE {
            let take = (PREFIX_CAPTURE - self.prefix.len()).min(data.len());
            self.prefix.extend_from_slice(&data[..take]);
        }

        match &mut self.state {
            State::Buffering { buf } => {
                buf.extend_from_slice(data);
                if (buf.len() as u64) > self.ctx.transport.spill_threshold {
                    let drained = std::mem::take(buf);
                    self.spill(drained).await?;
                }
                Ok(())
            }
            State::Spilling { provider, .. } => provider.push_chunk(data).await,
            _ => Ok(()),
        }
    }

    /// Transitions BUFFERING → SPILL once the threshold is crossed.
    async fn spill(&mut self, buffered: Vec<u8>) -> Result<(), ScanError> {
        // The final size is unknown here, so the choice is between the
        // streaming list and the shared volume.
        let mode = if self.ctx.transport.shared_dir.is_some() {
            TaskMode::Path
        } else {
            TaskMode::Stream
        };

        let task_id = uuid::Uuid::new_v4().to_string();
        let mut provider = self.ctx.transport.provider_for_task(
            mode,
            self.ctx.store.clone(),
            &self.ctx.keys,
            &task_id,
        )?;
        let header = TaskHeader {
            task_id,
            mode,
            push_time_ns: crate::core::now_ns(),
            content_ref: provider.content_ref(),
        };
        provider.push_chunk(&buffered).await?;

        // A streaming spill enqueues immediately so the consumer scans
        // chunks while the proxy is still uploading (follower scan). A
        // shared-disk spill waits for the complete file.
        let enqueued = if mode == TaskMode::Stream {
            self.ctx.queue.enqueue(&header, self.priority).await?;
            self.pending_task = Some(header.task_id.clone());
            true
        } else {
            false
        };

        self.state = State::Spilling {
            header,
            provider,
            enqueued,
        };
        Ok(())
    }

    /// Ends the body, runs the scan wait, and produces the decision.
    pub async fn finish(&mut self) -> Result<SessionOutcome, ScanError> {
        match std::mem::replace(&mut self.state, State::Done) {
            State::Relay { reason } => Ok(SessionOutcome::Admitted {
                scan_result: reason,
                tat_ms: None,
            }),
            State::Deciding | State::Done => Ok(SessionOutcome::Admitted {
                scan_result: "bypass",
                tat_ms: None,
            }),
            State::Buffering { buf } => {
                let mode = self.ctx.transport.select_mode(Some(buf.len() as u64));
                // The buffer never exceeds the spill threshold, so only the
                // in-memory transports are reachable here.
                let mode = if mode == TaskMode::Path {
                    TaskMode::Stream
                } else {
                    mode
                };
                let task_id = uuid::Uuid::new_v4().to_string();
                let mut provider = self.ctx.transport.provider_for_task(
                    mode,
                    self.ctx.store.clone(),
                    &self.ctx.keys,
                    &task_id,
                )?;
                let header = TaskHeader {
                    task_id,
                    mode,
                    push_time_ns: crate::core::now_ns(),
                    content_ref: provider.content_ref(),
                };
                if !buf.is_empty() {
                    provider.push_chunk(&buf).await?;
                }
                provider.finalize_push().await?;

                self.record_ingest();
                self.ctx.queue.enqueue(&header, self.priority).await?;
                self.pending_task = Some(header.task_id.clone());
                self.await_verdict(&header.task_id).await
            }
            State::Spilling {
                header,
                mut provider,
                enqueued,
            } => {
                provider.finalize_push().await?;
                self.record_ingest();
                if !enqueued {
                    self.ctx.queue.enqueue(&header, self.priority).await?;
                    self.pending_task = Some(header.task_id.clone());
                }
                self.await_verdict(&header.task_id).await
            }
        }
    }

    fn record_ingest(&self) {
        self.ctx
            .metrics
            .observe_ingest(self.ingest_started.elapsed().as_millis() as u64);
    }

    async fn await_verdict(&mut self, task_id: &str) -> Result<SessionOutcome, ScanError> {
        let result = self
            .ctx
            .queue
            .await_result(task_id, self.ctx.processing_timeout)
            .await?;
        self.pending_task = None;

        match result {
            Some(record) => Ok(self.apply_verdict(record).await),
            None => {
                tracing::warn!(task_id, "verdict wait timed out");
                if self.ctx.failure_mode_allow {
                    self.ctx.metrics.observe_timeout("allow");
                    Ok(SessionOutcome::Admitted {
                        scan_result: "timeout-allow",
                        tat_ms: None,
                    })
                } else {
                    self.ctx.metrics.observe_timeout("block");
                    Ok(SessionOutcome::Blocked {
                        status: 503,
                        virus: None,
                        message: "scan verdict unavailable".to_string(),
                    })
                }
            }
        }
    }

    async fn apply_verdict(&self, record: VerdictRecord) -> SessionOutcome {
        match record.status {
            VerdictStatus::Clean => {
                if CACHEABLE_METHODS.contains(&self.meta.method.as_str()) {
                    self.ctx.cache.store_clean(&self.meta.uri, &self.prefix).await;
                }
                SessionOutcome::Admitted {
                    scan_result: "clean",
                    tat_ms: Some(record.metrics.total_tat_ms),
                }
            }
            VerdictStatus::Infected => {
                let virus = record.virus.unwrap_or_else(|| "unknown".to_string());
                tracing::warn!(
                    uri = %self.meta.uri,
                    method = %self.meta.method,
                    virus = %virus,
                    "blocking infected request"
                );
                SessionOutcome::Blocked {
                    status: self.ctx.block_status,
                    message: format!("virus detected: {virus}"),
                    virus: Some(virus),
                }
            }
            VerdictStatus::Error => {
                let detail = record.detail.unwrap_or_else(|| "scan error".to_string());
                tracing::warn!(detail = %detail, "scan reported error");
                if self.ctx.failure_mode_allow {
                    SessionOutcome::Admitted {
                        scan_result: "error-allow",
                        tat_ms: None,
                    }
                } else {
                    SessionOutcome::Blocked {
                        status: 503,
                        virus: None,
                        message: format!("scan failed: {detail}"),
                    }
                }
            }
        }
    }

    /// Cleanup after a proxy disconnect: free the data plane and any
    /// pending result so nothing waits out its full TTL.
    pub async fn abort(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Done);
        if let State::Spilling {
            header,
            mut provider,
            ..
        } = state
        {
            if let Err(e) = provider.finalize(false, false).await {
                tracing::debug!(error = %e, "abort cleanup: provider");
            }
            if header.mode == TaskMode::Stream {
                if let Err(e) = self.ctx.store.del(&[header.content_ref.as_str()]).await {
                    tracing::debug!(error = %e, "abort cleanup: chunk list");
                }
            }
        }
        if let Some(task_id) = self.pending_task.take() {
            if let Err(e) = self.ctx.queue.discard_result(&task_id).await {
                tracing::debug!(error = %e, "abort cleanup: result key");
            }
        }
    }
}
