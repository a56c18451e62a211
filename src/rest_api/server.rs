//! Axum HTTP server for the probe endpoints

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers;
use crate::{Error, Result};

/// Readiness shared between the controller and the HTTP server
#[derive(Debug, Default)]
pub struct ProbeState {
    ready: AtomicBool,
}

impl ProbeState {
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

fn router(state: Arc<ProbeState>) -> Router {
    let app = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(handlers::metrics));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the probe server until the process exits
pub async fn run_server(addr: SocketAddr, state: Arc<ProbeState>) -> Result<()> {
    let app = router(state);

    info!("Health server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
