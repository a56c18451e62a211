//! Controller module for graceful pod draining
//!
//! This module contains the main controller loop, the drain decision logic,
//! and the pod guard (finalizer) handling.

pub mod cluster;
pub mod conditions;
pub mod config;
pub mod drain;
pub mod eligibility;
pub mod finalizers;
pub mod leader;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod namespace_filter;
pub mod quantity;
mod reconciler;
#[cfg(test)]
mod testing;
pub mod traffic;

pub use cluster::{ClusterClient, KubeCluster};
pub use config::{parse_config, DrainConfig, NamespaceSelector};
pub use drain::{DrainDecision, DrainDecisionEngine, DrainReason};
pub use eligibility::{classify, is_managed};
pub use finalizers::DRAIN_FINALIZER;
pub use namespace_filter::namespace_matches;
pub use reconciler::{
    is_eligible, reconcile_pod, resolve_config, retry_delay, run_controller, ConfigSource,
    ControllerState, ReconcileOutcome,
};
pub use traffic::{EndpointTrafficProbe, TrafficProbe};
