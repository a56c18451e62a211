//! HTTP endpoints for probes and metrics
//!
//! Serves `/healthz` and `/readyz` for the kubelet, and `/metrics` when built
//! with the `metrics` feature.

mod handlers;
mod server;

pub use server::{run_server, ProbeState};
