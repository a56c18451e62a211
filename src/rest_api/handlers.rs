//! HTTP handlers for the probe endpoints

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::instrument;

use super::server::ProbeState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Liveness: the process is up and serving
#[instrument]
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: the controller has started watching pods
#[instrument(skip(state))]
pub async fn readyz(State(state): State<Arc<ProbeState>>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status) = if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// Prometheus text exposition
#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, StatusCode> {
    use prometheus_client::encoding::text::encode;

    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY).map_err(|e| {
        tracing::error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(buffer)
}
