//! Observability HTTP surface: `/metrics` and `/health` on port 8080.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::core::ScanError;
use crate::metrics::Metrics;
use crate::store::SharedStore;

/// How recent the last successful engine PING must be for `/health`.
const ENGINE_RECENCY: Duration = Duration::from_secs(30);

/// Tracks when the engine last answered a PING.
#[derive(Default)]
pub struct EngineHealth {
    last_ok: Mutex<Option<Instant>>,
}

impl EngineHealth {
    /// Creates a tracker with no successful ping yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful PING.
    pub fn record_ok(&self) {
        if let Ok(mut guard) = self.last_ok.lock() {
            *guard = Some(Instant::now());
        }
    }

    /// Whether the engine answered within the recency window.
    pub fn is_recent(&self) -> bool {
        match self.last_ok.lock() {
            Ok(guard) => matches!(*guard, Some(at) if at.elapsed() < ENGINE_RECENCY),
            Err(_) => false,
        }
    }
}

/// Shared state behind the observability routes.
#[derive(Clone)]
pub struct ObservabilityState {
    /// Store handle used for the Redis reachability probe.
    pub store: SharedStore,
    /// Metrics registry.
    pub metrics: Arc<Metrics>,
    /// Engine recency tracker; `None` for the producer, which has no clamd.
    pub engine_health: Option<Arc<EngineHealth>>,
}

/// Builds the observability router.
pub fn router(state: ObservabilityState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Binds and serves the observability endpoints until the process exits.
pub async fn serve(state: ObservabilityState, port: u16) -> Result<(), ScanError> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "observability server listening");
    axum::serve(listener, router(state))
        .await
        .map_err(ScanError::Io)
}

async fn metrics_handler(State(state): State<ObservabilityState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn health_handler(State(state): State<ObservabilityState>) -> impl IntoResponse {
    if state.store.ping().await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "redis unreachable");
    }
    if let Some(engine) = &state.engine_health {
        if !engine.is_recent() {
            return (StatusCode::SERVICE_UNAVAILABLE, "engine ping stale");
        }
    }
    (StatusCode::OK, "OK")
}
