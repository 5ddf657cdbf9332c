//! scangate-producer: the proxy-facing inspection front end.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scangate::cache::IntelligentCache;
use scangate::config::{exit_codes, ProducerConfig};
use scangate::core::ScanError;
use scangate::http::{self, ObservabilityState};
use scangate::metrics::{spawn_queue_depth_sampler, Metrics};
use scangate::producer::{ExtProcService, IcapServer, ProducerContext};
use scangate::queue::TaskQueue;
use scangate::store::{RedisStore, SharedStore};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ProducerConfig::parse();
    let code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "producer failed");
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

async fn run(config: ProducerConfig) -> Result<i32, ScanError> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting scangate producer");

    let store: SharedStore =
        Arc::new(RedisStore::connect(&config.redis.url()).await?);
    store.ping().await?;

    let keys = config.redis.key_space();
    let metrics = Arc::new(
        Metrics::new().map_err(|e| ScanError::configuration(e.to_string()))?,
    );
    let queue = TaskQueue::new(store.clone(), keys.clone());
    let cache = IntelligentCache::new(store.clone(), keys.clone(), config.cache_policy());

    let ctx = Arc::new(ProducerContext {
        store: store.clone(),
        queue: queue.clone(),
        transport: config.transport(),
        cache,
        metrics: metrics.clone(),
        keys,
        processing_timeout: config.processing_timeout(),
        failure_mode_allow: config.failure_mode_allow,
        max_body_bytes: config.max_body_bytes,
        block_status: config.block_status,
    });

    tokio::spawn(http::serve(
        ObservabilityState {
            store,
            metrics: metrics.clone(),
            engine_health: None,
        },
        config.observability_port,
    ));
    spawn_queue_depth_sampler(queue, metrics);

    if let Some(icap_port) = config.icap_port {
        let icap = IcapServer::new(ctx.clone()).with_preview_size(config.icap_preview_size);
        tokio::spawn(async move {
            if let Err(e) = icap.serve(icap_port).await {
                tracing::error!(error = %e, "ICAP server exited");
            }
        });
    }

    let addr = format!("0.0.0.0:{}", config.port)
        .parse()
        .map_err(|e| ScanError::configuration(format!("bad listen address: {e}")))?;
    tracing::info!(%addr, "ext_proc server listening");

    let (sigint_tx, mut sigint_rx) = tokio::sync::watch::channel(false);
    let server = tonic::transport::Server::builder()
        .add_service(ExtProcService::new(ctx).into_server())
        .serve_with_shutdown(addr, async move {
            let interrupted = shutdown_signal().await;
            let _ = sigint_tx.send(interrupted);
        });

    server
        .await
        .map_err(|e| ScanError::configuration(format!("grpc server: {e}")))?;

    tracing::info!("producer shut down");
    if *sigint_rx.borrow_and_update() {
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
