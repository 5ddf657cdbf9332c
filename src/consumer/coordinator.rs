//! Cluster coordination for virus-database reloads.
//!
//! Every consumer runs one coordinator task. It refreshes this node's
//! heartbeat (value = loaded engine epoch, written only after a verified
//! PING) and watches `clamav:target_epoch`. When the target moves, nodes
//! take turns through a `SET NX PX` lock: at most one node reloads at any
//! instant, a watchdog keeps the lock alive while clamd is busy, and the
//! lock is released with a compare-and-delete so an expired holder cannot
//! delete its successor's lock. A sole surviving node first requests surge
//! capacity and waits for a peer, degrading to a serialized solo reload
//! when no autoscaler answers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::consumer::engine::ClamdClient;
use crate::core::{KeySpace, ScanError};
use crate::http::EngineHealth;
use crate::metrics::Metrics;
use crate::store::SharedStore;

/// Timing knobs for the update protocol.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// This node's identity in heartbeat and lock values.
    pub node_id: String,
    /// Protocol poll cadence.
    pub poll_interval: Duration,
    /// Heartbeat refresh cadence.
    pub heartbeat_interval: Duration,
    /// Heartbeat key TTL.
    pub heartbeat_ttl: Duration,
    /// Update lock TTL; the watchdog renews it while reloading.
    pub lock_ttl: Duration,
    /// Watchdog renewal cadence.
    pub watchdog_interval: Duration,
    /// Budget for one engine reload.
    pub reload_timeout: Duration,
    /// TTL on the surge request key.
    pub surge_ttl: Duration,
    /// How long a lone node waits for surge capacity before reloading solo.
    pub surge_wait: Duration,
}

impl CoordinatorConfig {
    /// Production defaults for a node id.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(120),
            watchdog_interval: Duration::from_secs(30),
            reload_timeout: Duration::from_secs(120),
            surge_ttl: Duration::from_secs(300),
            surge_wait: Duration::from_secs(300),
        }
    }
}

/// The per-node update coordinator.
pub struct Coordinator {
    store: SharedStore,
    keys: KeySpace,
    engine: ClamdClient,
    metrics: Arc<Metrics>,
    engine_health: Arc<EngineHealth>,
    config: CoordinatorConfig,
    current_epoch: u64,
    last_heartbeat: Option<Instant>,
    surge_requested_at: Option<Instant>,
}

impl Coordinator {
    /// Creates a coordinator starting at epoch 0.
    pub fn new(
        store: SharedStore,
        keys: KeySpace,
        engine: ClamdClient,
        metrics: Arc<Metrics>,
        engine_health: Arc<EngineHealth>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            keys,
            engine,
            metrics,
            engine_health,
            config,
            current_epoch: 0,
            last_heartbeat: None,
            surge_requested_at: None,
        }
    }

    /// Epoch currently loaded on this node.
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    /// Runs the protocol until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "coordinator tick failed");
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }

    /// One protocol step: heartbeat, then the update check.
    pub async fn tick(&mut self) -> Result<(), ScanError> {
        self.refresh_heartbeat().await?;
        self.handle_update().await
    }

    async fn refresh_heartbeat(&mut self) -> Result<(), ScanError> {
        let due = match self.last_heartbeat {
            Some(at) => at.elapsed() >= self.config.heartbeat_interval,
            None => true,
        };
        if !due {
            return Ok(());
        }

        // The heartbeat asserts a live engine; never write it unless clamd
        // just answered.
        if let Err(e) = self.engine.ping().await {
            tracing::warn!(error = %e, "engine ping failed, withholding heartbeat");
            return Ok(());
        }
        self.engine_health.record_ok();

        self.store
            .set_ex(
                &self.keys.heartbeat(&self.config.node_id),
                self.current_epoch.to_string().as_bytes(),
                self.config.heartbeat_ttl,
            )
            .await?;
        self.last_heartbeat = Some(Instant::now());
        self.metrics.set_reload_epoch(self.current_epoch);
        Ok(())
    }

    async fn handle_update(&mut self) -> Result<(), ScanError> {
        let Some(target) = self.read_target_epoch().await? else {
            return Ok(());
        };
        if target <= self.current_epoch {
            self.surge_requested_at = None;
            return Ok(());
        }

        // A lone node must not take the engine down without backup capacity.
        if self.live_node_count().await? <= 1 {
            let waited = match self.surge_requested_at {
                Some(at) => at.elapsed(),
                None => {
                    self.surge_requested_at = Some(Instant::now());
                    self.store
                        .set_ex(&self.keys.scaling_request(), b"1", self.config.surge_ttl)
                        .await?;
                    tracing::info!(target, "sole node: surge requested, deferring reload");
                    return Ok(());
                }
            };
            if waited < self.config.surge_wait {
                return Ok(());
            }
            // No autoscaler answered; degrade to a serialized solo reload.
            tracing::warn!(target, "surge wait expired, reloading without backup");
        }

        let lock_key = self.keys.update_lock();
        let acquired = self
            .store
            .set_nx_px(
                &lock_key,
                self.config.node_id.as_bytes(),
                self.config.lock_ttl,
            )
            .await?;
        if !acquired {
            tracing::debug!(target, "update lock held elsewhere, backing off");
            return Ok(());
        }
        tracing::info!(target, "update lock acquired, reloading engine");

        let reload_result = self.reload_with_watchdog(&lock_key).await;

        match reload_result {
            Ok(()) => {
                self.current_epoch = target;
                self.store
                    .set_ex(
                        &self.keys.heartbeat(&self.config.node_id),
                        target.to_string().as_bytes(),
                        self.config.heartbeat_ttl,
                    )
                    .await?;
                self.last_heartbeat = Some(Instant::now());
                self.metrics.set_reload_epoch(target);
                self.surge_requested_at = None;
                tracing::info!(epoch = target, "engine reload complete");
            }
            Err(e) => {
                // The cluster stays on the old epoch for this node; the
                // epoch gauge diverging from the target is the alert.
                tracing::error!(error = %e, target, "engine reload failed");
                self.store
                    .set_ex(
                        &self.keys.node_status(&self.config.node_id),
                        format!("ERROR: {e}").as_bytes(),
                        self.config.heartbeat_ttl,
                    )
                    .await?;
            }
        }

        self.store
            .del_if_equals(&lock_key, self.config.node_id.as_bytes())
            .await?;

        if self.all_nodes_at(target).await? {
            self.store.del(&[&self.keys.scaling_request()]).await?;
            tracing::info!(epoch = target, "cluster converged, surge request cleared");
        }
        Ok(())
    }

    async fn reload_with_watchdog(&self, lock_key: &str) -> Result<(), ScanError> {
        let reload = self.engine.reload(self.config.reload_timeout);
        tokio::pin!(reload);

        let mut watchdog = tokio::time::interval(self.config.watchdog_interval);
        watchdog.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                result = &mut reload => return result,
                _ = watchdog.tick() => {
                    if let Err(e) = self.store.pexpire(lock_key, self.config.lock_ttl).await {
                        tracing::warn!(error = %e, "lock watchdog extension failed");
                    }
                }
            }
        }
    }

    async fn read_target_epoch(&self) -> Result<Option<u64>, ScanError> {
        let raw = self.store.get(&self.keys.target_epoch()).await?;
        Ok(raw.and_then(|bytes| {
            String::from_utf8(bytes)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
        }))
    }

    async fn live_node_count(&self) -> Result<usize, ScanError> {
        // Heartbeat keys expire on their own, so a key scan is an accepted
        // coarse view of membership.
        Ok(self
            .store
            .scan_keys(&self.keys.heartbeat_pattern())
            .await?
            .len())
    }

    async fn all_nodes_at(&self, epoch: u64) -> Result<bool, ScanError> {
        for key in self.store.scan_keys(&self.keys.heartbeat_pattern()).await? {
            let at_epoch = self
                .store
                .get(&key)
                .await?
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(|node_epoch| node_epoch >= epoch)
                .unwrap_or(false);
            if !at_epoch {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Operator entry point: bump (or set) the cluster target epoch.
pub async fn set_target_epoch(
    store: &SharedStore,
    keys: &KeySpace,
    epoch: Option<u64>,
) -> Result<u64, ScanError> {
    let new_epoch = match epoch {
        Some(explicit) => explicit,
        None => {
            let current = store
                .get(&keys.target_epoch())
                .await?
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(0);
            current + 1
        }
    };
    store
        .set(&keys.target_epoch(), new_epoch.to_string().as_bytes())
        .await?;
    Ok(new_epoch)
}
