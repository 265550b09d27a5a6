//! Health check endpoints

use crate::bus::ChatBus;
use crate::coordination::{Assignment, ShardingHandle};
use crate::metrics::SyncMetrics;
use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub shard_id: Option<u64>,
    pub shard_count: Option<u64>,
    pub bus_connected: bool,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub sharding: ShardingHandle,
    pub bus: Arc<ChatBus>,
    pub metrics: Arc<SyncMetrics>,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness endpoint - 200 once a shard is assigned and the bus is up
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let assignment = state.sharding.assignment();
    let bus_connected = state.bus.is_connected();
    let is_ready = assignment.is_assigned() && bus_connected;

    let response = ReadyResponse {
        ready: is_ready,
        shard_id: assignment.shard_id(),
        shard_count: assignment.shard_count(),
        bus_connected,
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if let Assignment::Assigned { total, .. } = state.sharding.assignment() {
        state.metrics.set_shard_count(total);
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_response_serialization() {
        let response = ReadyResponse {
            ready: true,
            shard_id: Some(0),
            shard_count: Some(2),
            bus_connected: true,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"ready\":true"));
        assert!(json.contains("\"shard_id\":0"));
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.3.0",
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
    }
}
