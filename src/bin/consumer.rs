//! scangate-consumer: the queue-driven ClamAV scan worker.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scangate::config::{exit_codes, ConsumerCli, ConsumerCommand, ConsumerConfig};
use scangate::consumer::{
    set_target_epoch, ClamdClient, Coordinator, CoordinatorConfig, WorkerContext, WorkerPool,
};
use scangate::core::ScanError;
use scangate::http::{self, EngineHealth, ObservabilityState};
use scangate::metrics::{spawn_queue_depth_sampler, Metrics};
use scangate::queue::TaskQueue;
use scangate::retry::RetryConfig;
use scangate::store::{RedisStore, SharedStore};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = ConsumerCli::parse();
    let result = match cli.command {
        Some(ConsumerCommand::SetTargetEpoch { epoch }) => {
            bump_target_epoch(&cli.config, epoch).await
        }
        None => run(cli.config).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "consumer failed");
            match e {
                ScanError::Configuration { .. } => exit_codes::CONFIG_ERROR,
                ScanError::Store { .. } | ScanError::EngineConnection { .. } => {
                    exit_codes::DEPENDENCY_UNREACHABLE
                }
                _ => exit_codes::CONFIG_ERROR,
            }
        }
    };
    ExitCode::from(code as u8)
}

async fn bump_target_epoch(
    config: &ConsumerConfig,
    epoch: Option<u64>,
) -> Result<i32, ScanError> {
    let store: SharedStore = Arc::new(RedisStore::connect(&config.redis.url()).await?);
    let keys = config.redis.key_space();
    let new_epoch = set_target_epoch(&store, &keys, epoch).await?;
    tracing::info!(
        epoch = new_epoch,
        "target epoch set; nodes will reload sequentially"
    );
    Ok(exit_codes::OK)
}

async fn run(config: ConsumerConfig) -> Result<i32, ScanError> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = %config.node_id,
        "starting scangate consumer"
    );

    let store: SharedStore = Arc::new(RedisStore::connect(&config.redis.url()).await?);
    store.ping().await?;

    let engine = ClamdClient::new(&config.clamd_url)?;
    engine.ping().await?;
    match engine.version().await {
        Ok(version) => tracing::info!(%version, "engine connected"),
        Err(e) => tracing::warn!(error = %e, "engine VERSION probe failed"),
    }

    let keys = config.redis.key_space();
    let metrics = Arc::new(
        Metrics::new().map_err(|e| ScanError::configuration(e.to_string()))?,
    );
    let queue = TaskQueue::new(store.clone(), keys.clone());
    let engine_health = Arc::new(EngineHealth::new());
    engine_health.record_ok();

    tokio::spawn(http::serve(
        ObservabilityState {
            store: store.clone(),
            metrics: metrics.clone(),
            engine_health: Some(engine_health.clone()),
        },
        config.observability_port,
    ));
    spawn_queue_depth_sampler(queue.clone(), metrics.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let coordinator = Coordinator::new(
        store.clone(),
        keys,
        engine.clone(),
        metrics.clone(),
        engine_health,
        CoordinatorConfig {
            reload_timeout: config.reload_timeout(),
            ..CoordinatorConfig::new(config.node_id.clone())
        },
    );
    let coordinator_handle = tokio::spawn(coordinator.run(shutdown_rx));

    let workers = config.effective_workers();
    tracing::info!(workers, "starting worker pool");
    let pool = WorkerPool::spawn(
        workers,
        WorkerContext {
            store,
            queue,
            transport: config.transport(),
            engine,
            metrics,
            retry: RetryConfig::default(),
        },
    );

    let interrupted = shutdown_signal().await;
    tracing::info!(interrupted, "shutting down, draining in-flight scans");

    let _ = shutdown_tx.send(true);
    pool.shutdown(config.drain_timeout()).await;
    coordinator_handle.abort();

    tracing::info!("consumer shut down");
    if interrupted {
        Ok(exit_codes::SIGINT)
    } else {
        Ok(exit_codes::OK)
    }
}

/// Waits for SIGINT or SIGTERM; returns `true` for SIGINT.
async fn shutdown_signal() -> bool {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler install failed");
                let _ = tokio::signal::ctrl_c().await;
                return true;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => true,
            _ = sigterm.recv() => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        true
    }
}
