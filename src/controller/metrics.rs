//! Prometheus metrics for the drain controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the
//! following; counters are registered without the `_total` suffix, which the
//! encoder appends:
//! - `vpa_drain_reconcile_duration_seconds` (histogram): reconcile duration.
//! - `vpa_drain_reconcile_errors_total` (counter): reconcile errors labeled by kind.
//! - `vpa_drain_decisions_total` (counter): drain decisions labeled by outcome and reason.
//! - `vpa_drain_finalizer_operations_total` (counter): finalizer writes labeled by operation and result.

use std::sync::atomic::AtomicU64;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error kind, e.g. "kube", "conflict", "traffic_probe"
    pub kind: String,
}

/// Labels for drain decision metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    /// "hold" or "release"
    pub outcome: String,
    pub reason: String,
}

/// Labels for finalizer write metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FinalizerLabels {
    /// "attach" or "release"
    pub operation: String,
    pub result: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Histogram> =
    // 1ms .. ~32s across 16 buckets.
    Lazy::new(|| Histogram::new(exponential_buckets(0.001, 2.0, 16)));

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking drain decisions
pub static DRAIN_DECISIONS_TOTAL: Lazy<Family<DecisionLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking finalizer writes
pub static FINALIZER_OPERATIONS_TOTAL: Lazy<Family<FinalizerLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "vpa_drain_reconcile_duration_seconds",
        "Duration of pod reconciles in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "vpa_drain_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "vpa_drain_decisions",
        "Drain decisions taken for terminating pods",
        DRAIN_DECISIONS_TOTAL.clone(),
    );
    registry.register(
        "vpa_drain_finalizer_operations",
        "Finalizer writes performed on pods",
        FINALIZER_OPERATIONS_TOTAL.clone(),
    );

    registry
});

pub fn observe_reconcile(duration: Duration) {
    RECONCILE_DURATION_SECONDS.observe(duration.as_secs_f64());
}

pub fn inc_reconcile_error(kind: &str) {
    RECONCILE_ERRORS_TOTAL
        .get_or_create(&ErrorLabels {
            kind: kind.to_string(),
        })
        .inc();
}

pub fn inc_decision(release: bool, reason: &str) {
    DRAIN_DECISIONS_TOTAL
        .get_or_create(&DecisionLabels {
            outcome: if release { "release" } else { "hold" }.to_string(),
            reason: reason.to_string(),
        })
        .inc();
}

pub fn inc_finalizer_operation(operation: &str, result: &str) {
    FINALIZER_OPERATIONS_TOTAL
        .get_or_create(&FinalizerLabels {
            operation: operation.to_string(),
            result: result.to_string(),
        })
        .inc();
}
