//! The queue-driven scan worker.
//!
//! Each worker owns at most one task at a time: pop, materialize the body
//! provider, pump chunks into an INSTREAM session, publish the verdict,
//! record metrics. Workers share nothing but the store handle and the
//! metrics registry. On shutdown the pool drains in-flight tasks within a
//! bounded window and publishes `ERROR` for anything it had to abandon.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::consumer::engine::ClamdClient;
use crate::core::{ScanError, ScanMetrics, TaskHeader, Verdict, VerdictRecord};
use crate::metrics::Metrics;
use crate::queue::{PoppedTask, TaskQueue};
use crate::retry::{retry_transient, RetryConfig};
use crate::store::SharedStore;
use crate::transport::{DataProvider, TransportConfig};

/// BRPOP timeout per loop iteration; bounds shutdown latency.
const POP_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared dependencies handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    /// State store handle.
    pub store: SharedStore,
    /// Task and result queues.
    pub queue: TaskQueue,
    /// Transport parameters for body reconstruction.
    pub transport: TransportConfig,
    /// Engine client.
    pub engine: ClamdClient,
    /// Metrics registry.
    pub metrics: Arc<Metrics>,
    /// Retry policy for transient engine/store failures.
    pub retry: RetryConfig,
}

struct Worker {
    ctx: WorkerContext,
    inflight: Arc<Mutex<Option<String>>>,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                popped = self.ctx.queue.pop(POP_TIMEOUT) => match popped {
                    Ok(Some(task)) => self.process(task).await,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "queue pop failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
    }

    async fn process(&self, task: PoppedTask) {
        let header = match task.header() {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed task");
                // The element is already popped; if the id is readable the
                // waiting producer still gets a definitive answer.
                if let Some(task_id) = task.task_id_hint() {
                    self.publish_error(&task_id, &format!("{e}")).await;
                }
                return;
            }
        };

        *self.inflight.lock().await = Some(header.task_id.clone());

        let mut provider = match self
            .ctx
            .transport
            .provider_for_header(&header, self.ctx.store.clone())
        {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!(task_id = %header.task_id, error = %e, "no provider for task");
                self.publish_error(&header.task_id, &format!("{e}")).await;
                *self.inflight.lock().await = None;
                return;
            }
        };

        let scan_started = Instant::now();
        let outcome = self.scan(provider.as_mut()).await;
        let scan_ms = scan_started.elapsed().as_millis() as u64;
        let total_tat_ms = header.age_ms();

        match outcome {
            Ok(verdict) => {
                let is_virus = verdict.is_infected();
                // The verified mirror must be released (or retained) before
                // the result becomes visible.
                if let Err(e) = provider.finalize(true, is_virus).await {
                    tracing::warn!(task_id = %header.task_id, error = %e, "provider finalize failed");
                }

                let data_key = verdict.is_clean().then(|| provider.data_key()).flatten();
                let record = VerdictRecord::new(
                    &verdict,
                    data_key,
                    ScanMetrics {
                        scan_ms,
                        total_tat_ms,
                    },
                );
                if let Err(e) = self.ctx.queue.publish_result(&header.task_id, &record).await {
                    tracing::error!(task_id = %header.task_id, error = %e, "result publish failed");
                }

                self.ctx
                    .metrics
                    .observe_task(verdict.as_label(), task.priority, total_tat_ms);
                tracing::info!(
                    task_id = %header.task_id,
                    verdict = verdict.as_label(),
                    scan_ms,
                    total_tat_ms,
                    queue = task.priority.queue_name(),
                    "scan done"
                );
            }
            Err(e) => {
                if let Err(cleanup) = provider.finalize(false, false).await {
                    tracing::warn!(task_id = %header.task_id, error = %cleanup, "provider cleanup failed");
                }
                tracing::warn!(task_id = %header.task_id, error = %e, "scan failed");
                self.publish_error(&header.task_id, &format!("{e}")).await;
                self.ctx
                    .metrics
                    .observe_task("ERROR", task.priority, total_tat_ms);
            }
        }

        *self.inflight.lock().await = None;
    }

    async fn scan(&self, provider: &mut dyn DataProvider) -> Result<Verdict, ScanError> {
        // Connection setup is the flaky part; the pump itself is not
        // retriable because STREAM chunks are consumed as they move.
        let engine = self.ctx.engine.clone();
        let mut session =
            retry_transient(&self.ctx.retry, "clamd connect", || engine.begin_instream())
                .await?;

        while let Some(chunk) = provider.next_chunk().await? {
            session.send_chunk(&chunk).await?;
        }
        session.finish().await
    }

    async fn publish_error(&self, task_id: &str, detail: &str) {
        let record = VerdictRecord::new(
            &Verdict::Error {
                detail: detail.to_string(),
            },
            None,
            ScanMetrics::default(),
        );
        if let Err(e) = self.ctx.queue.publish_result(task_id, &record).await {
            tracing::error!(task_id, error = %e, "error result publish failed");
        }
    }
}

/// A fixed pool of scan workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    inflight: Vec<Arc<Mutex<Option<String>>>>,
    shutdown_tx: watch::Sender<bool>,
    queue: TaskQueue,
}

impl WorkerPool {
    /// Spawns `count` workers over the shared context.
    pub fn spawn(count: usize, ctx: WorkerContext) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = ctx.queue.clone();
        let mut handles = Vec::with_capacity(count);
        let mut inflight = Vec::with_capacity(count);

        for index in 0..count {
            let slot = Arc::new(Mutex::new(None));
            let worker = Worker {
                ctx: ctx.clone(),
                inflight: slot.clone(),
            };
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                tracing::debug!(worker = index, "worker started");
                worker.run(rx).await;
                tracing::debug!(worker = index, "worker stopped");
            }));
            inflight.push(slot);
        }

        Self {
            handles,
            inflight,
            shutdown_tx,
            queue,
        }
    }

    /// Signals shutdown and waits up to `drain` for in-flight tasks.
    /// Tasks still running after the window get an `ERROR` result so their
    /// producers are not left waiting for the full verdict timeout.
    pub async fn shutdown(self, drain: Duration) {
        let _ = self.shutdown_tx.send(true);

        let all_done = futures::future::join_all(self.handles);
        if tokio::time::timeout(drain, all_done).await.is_err() {
            tracing::warn!("drain window expired with tasks in flight");
            for slot in &self.inflight {
                if let Some(task_id) = slot.lock().await.clone() {
                    let record = VerdictRecord::new(
                        &Verdict::Error {
                            detail: "worker shut down mid-scan".to_string(),
                        },
                        None,
                        ScanMetrics::default(),
                    );
                    if let Err(e) = self.queue.publish_result(&task_id, &record).await {
                        tracing::error!(task_id = %task_id, error = %e, "abandon publish failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::testsupport::{spawn_fake_clamd, EICAR_BODY};
    use crate::core::{KeySpace, Priority, TaskMode, VerdictStatus};
    use crate::store::{MemoryStore, StateStore};
    use crate::transport::StreamProvider;

    async fn context(store: Arc<MemoryStore>) -> WorkerContext {
        let url = spawn_fake_clamd().await;
        WorkerContext {
            store: store.clone(),
            queue: TaskQueue::new(store, KeySpace::new("")),
            transport: TransportConfig {
                chunk_timeout: Duration::from_millis(20),
                idle_limit: Duration::from_millis(500),
                ..TransportConfig::default()
            },
            engine: ClamdClient::new(&url).unwrap(),
            metrics: Arc::new(Metrics::new().unwrap()),
            retry: RetryConfig::new().with_initial_delay(Duration::from_millis(1)),
        }
    }

    async fn push_stream_task(
        store: Arc<MemoryStore>,
        ctx: &WorkerContext,
        body: &[u8],
        priority: Priority,
    ) -> TaskHeader {
        let header = TaskHeader::new(TaskMode::Stream, "");
        let chunks_key = format!("chunks:{}", header.task_id);
        let header = TaskHeader {
            content_ref: chunks_key.clone(),
            ..header
        };
        let mut provider = StreamProvider::new(
            store,
            chunks_key,
            Duration::from_millis(20),
            Duration::from_millis(500),
        );
        provider.push_chunk(body).await.unwrap();
        provider.finalize_push().await.unwrap();
        ctx.queue.enqueue(&header, priority).await.unwrap();
        header
    }

    #[tokio::test]
    async fn test_clean_stream_task_end_to_end() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        let header =
            push_stream_task(store.clone(), &ctx, b"hello world", Priority::Normal).await;

        let pool = WorkerPool::spawn(1, ctx.clone());
        let record = ctx
            .queue
            .await_result(&header.task_id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        pool.shutdown(Duration::from_secs(2)).await;

        assert_eq!(record.status, VerdictStatus::Clean);
        assert_eq!(
            record.data_key.as_deref(),
            Some(format!("chunks:{}:verified", header.task_id).as_str())
        );
        // Body identity: verified chunks reassemble the original body.
        let verified = store
            .lrange_all(&format!("chunks:{}:verified", header.task_id))
            .await
            .unwrap();
        let assembled: Vec<u8> = verified.concat();
        assert_eq!(assembled, b"hello world");
    }

    #[tokio::test]
    async fn test_infected_task_drops_verified_chunks() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        let header =
            push_stream_task(store.clone(), &ctx, EICAR_BODY, Priority::Normal).await;

        let pool = WorkerPool::spawn(1, ctx.clone());
        let record = ctx
            .queue
            .await_result(&header.task_id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        pool.shutdown(Duration::from_secs(2)).await;

        assert_eq!(record.status, VerdictStatus::Infected);
        assert_eq!(record.virus.as_deref(), Some("Eicar-Test-Signature"));
        assert_eq!(record.data_key, None);
        assert!(
            !store
                .exists(&format!("chunks:{}:verified", header.task_id))
                .await
        );
    }

    #[tokio::test]
    async fn test_priority_task_scanned_first() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;

        // Normal task enqueued before the priority task.
        let normal =
            push_stream_task(store.clone(), &ctx, b"normal body", Priority::Normal).await;
        let high = push_stream_task(store.clone(), &ctx, b"high body", Priority::High).await;

        let pool = WorkerPool::spawn(1, ctx.clone());

        let high_result = ctx
            .queue
            .await_result(&high.task_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(high_result.is_some());

        // With a single worker and strict preemption, the normal task's
        // verdict can only land after the priority one.
        let normal_result = ctx
            .queue
            .await_result(&normal.task_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(normal_result.is_some());
        pool.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_malformed_header_yields_error_result() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        store
            .lpush("scan_normal", b"task-9|NONSENSE|abc")
            .await
            .unwrap();

        let pool = WorkerPool::spawn(1, ctx.clone());
        let record = ctx
            .queue
            .await_result("task-9", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        pool.shutdown(Duration::from_secs(2)).await;

        assert_eq!(record.status, VerdictStatus::Error);
    }

    #[tokio::test]
    async fn test_inline_zero_length_body_is_clean() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;

        let header = TaskHeader::new(TaskMode::Inline, "inline:empty-task");
        store.set_ex("inline:empty-task", b"", Duration::from_secs(60)).await.unwrap();
        ctx.queue.enqueue(&header, Priority::Normal).await.unwrap();

        let pool = WorkerPool::spawn(1, ctx.clone());
        let record = ctx
            .queue
            .await_result(&header.task_id, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        pool.shutdown(Duration::from_secs(2)).await;

        assert_eq!(record.status, VerdictStatus::Clean);
    }
}
