//! Prometheus instruments for the scan pipeline.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::core::Priority;
use crate::queue::TaskQueue;

/// Sampling interval for the queue-depth gauge.
const QUEUE_DEPTH_INTERVAL: Duration = Duration::from_secs(10);

/// All instruments exposed on `/metrics`.
pub struct Metrics {
    registry: Registry,
    /// Turn-around time for priority tasks, milliseconds.
    priority_tat_ms: Histogram,
    /// Turn-around time for normal tasks, milliseconds.
    normal_tat_ms: Histogram,
    /// Producer-side ingest duration, milliseconds.
    ingest_tat_ms: Histogram,
    /// Completed tasks by verdict and priority.
    tasks_total: IntCounterVec,
    /// Verdict waits that expired, by applied outcome.
    timeouts_total: IntCounterVec,
    /// Requests that skipped scanning, by reason.
    bypass_total: IntCounterVec,
    /// Engine database epoch currently loaded on this node.
    reload_epoch: IntGauge,
    /// Sampled queue depths.
    queue_depth: IntGaugeVec,
}

impl Metrics {
    /// Creates and registers every instrument.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let ms_buckets = prometheus::exponential_buckets(5.0, 2.0, 14)?;

        let priority_tat_ms = Histogram::with_opts(
            HistogramOpts::new(
                "virusscan_priority_tat_ms",
                "Enqueue-to-verdict turn-around for priority tasks, milliseconds",
            )
            .buckets(ms_buckets.clone()),
        )?;
        let normal_tat_ms = Histogram::with_opts(
            HistogramOpts::new(
                "virusscan_normal_tat_ms",
                "Enqueue-to-verdict turn-around for normal tasks, milliseconds",
            )
            .buckets(ms_buckets.clone()),
        )?;
        let ingest_tat_ms = Histogram::with_opts(
            HistogramOpts::new(
                "virusscan_ingest_tat_ms",
                "Producer-side body ingest duration in milliseconds",
            )
            .buckets(ms_buckets),
        )?;
        let tasks_total = IntCounterVec::new(
            Opts::new("virusscan_tasks_total", "Completed scan tasks"),
            &["verdict", "priority"],
        )?;
        let timeouts_total = IntCounterVec::new(
            Opts::new(
                "virusscan_timeouts_total",
                "Verdict waits that hit the processing timeout",
            ),
            &["verdict"],
        )?;
        let bypass_total = IntCounterVec::new(
            Opts::new("virusscan_bypass_total", "Requests that skipped scanning"),
            &["reason"],
        )?;
        let reload_epoch = IntGauge::new(
            "virusscan_reload_epoch",
            "Engine database epoch loaded on this node",
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("virusscan_queue_depth", "Sampled task queue depth"),
            &["queue"],
        )?;

        registry.register(Box::new(priority_tat_ms.clone()))?;
        registry.register(Box::new(normal_tat_ms.clone()))?;
        registry.register(Box::new(ingest_tat_ms.clone()))?;
        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(timeouts_total.clone()))?;
        registry.register(Box::new(bypass_total.clone()))?;
        registry.register(Box::new(reload_epoch.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            priority_tat_ms,
            normal_tat_ms,
            ingest_tat_ms,
            tasks_total,
            timeouts_total,
            bypass_total,
            reload_epoch,
            queue_depth,
        })
    }

    /// Records a completed task with its turn-around time.
    pub fn observe_task(&self, verdict: &str, priority: Priority, tat_ms: u64) {
        self.tasks_total
            .with_label_values(&[verdict, priority.as_label()])
            .inc();
        match priority {
            Priority::High => self.priority_tat_ms.observe(tat_ms as f64),
            Priority::Normal => self.normal_tat_ms.observe(tat_ms as f64),
        }
    }

    /// Records producer ingest duration.
    pub fn observe_ingest(&self, ingest_ms: u64) {
        self.ingest_tat_ms.observe(ingest_ms as f64);
    }

    /// Records a verdict-wait timeout and the outcome applied.
    pub fn observe_timeout(&self, outcome: &str) {
        self.timeouts_total.with_label_values(&[outcome]).inc();
    }

    /// Records a bypassed request.
    pub fn observe_bypass(&self, reason: &str) {
        self.bypass_total.with_label_values(&[reason]).inc();
    }

    /// Publishes the engine epoch loaded on this node.
    pub fn set_reload_epoch(&self, epoch: u64) {
        self.reload_epoch.set(epoch as i64);
    }

    /// Publishes a sampled queue depth.
    pub fn set_queue_depth(&self, priority: Priority, depth: i64) {
        self.queue_depth
            .with_label_values(&[priority.queue_name()])
            .set(depth);
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Periodically samples both queue depths into the gauge.
pub fn spawn_queue_depth_sampler(
    queue: TaskQueue,
    metrics: Arc<Metrics>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(QUEUE_DEPTH_INTERVAL);
        loop {
            interval.tick().await;
            for priority in [Priority::High, Priority::Normal] {
                match queue.depth(priority).await {
                    Ok(depth) => metrics.set_queue_depth(priority, depth),
                    Err(e) => {
                        tracing::debug!(error = %e, "queue depth sample failed");
                    }
                }
            }
        }
    })
}
