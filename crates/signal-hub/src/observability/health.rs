//! Health and status endpoints.
//!
//! - `GET /health` - liveness probe (is the process running?)
//! - `GET /ready` - readiness probe (can we serve traffic?), flipped off at
//!   the start of shutdown so load balancers stop routing to us
//! - `GET /status` - live session/peer/connection counts as JSON
//!
//! The `/metrics` endpoint is served separately by the Prometheus exporter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use super::metrics::HubMetrics;

/// Liveness/readiness state.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    /// Mark the service ready to serve traffic.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service not ready (shutdown in progress).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Shared state for the observability router.
#[derive(Clone)]
pub struct ObservabilityState {
    pub health: Arc<HealthState>,
    pub metrics: Arc<HubMetrics>,
}

/// Build the health/status router.
pub fn observability_router(state: ObservabilityState) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

async fn liveness_handler(State(state): State<ObservabilityState>) -> StatusCode {
    if state.health.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<ObservabilityState>) -> StatusCode {
    if state.health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status_handler(
    State(state): State<ObservabilityState>,
) -> (StatusCode, Json<serde_json::Value>) {
    let snap = state.metrics.snapshot();
    (
        StatusCode::OK,
        Json(json!({
            "sessions": snap.sessions,
            "peers": snap.peers,
            "connections": snap.connections,
            "signals_relayed": snap.signals_relayed,
            "rate_limited": snap.rate_limited,
        })),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_defaults() {
        let state = HealthState::new();
        assert!(state.is_live(), "should be live by default");
        assert!(!state.is_ready(), "should not be ready by default");
    }

    #[test]
    fn test_readiness_toggles() {
        let state = HealthState::new();

        state.set_ready();
        assert!(state.is_ready());

        state.set_not_ready();
        assert!(!state.is_ready());
    }
}
