//! Drain decision engine
//!
//! Decides, on every reconcile of a terminating pod, whether the pod may be
//! released. The policy is a strict ordered list of gates:
//!
//! 1. no deletion timestamp: release (nothing to drain)
//! 2. inside the grace period: hold, whatever the traffic state
//! 3. past the drain timeout: release, whatever the traffic state
//! 4. pod Succeeded or Failed: release
//! 5. pod not Ready: release
//! 6. otherwise ask the traffic probe; release only if it reports no traffic
//!
//! Elapsed-time thresholds are re-evaluated lazily, so every hold carries the
//! delay after which the pod should be reconciled again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info};

use super::conditions::{is_pod_ready, PodPhase};
use super::config::DrainConfig;
use super::traffic::TrafficProbe;
use crate::error::Result;

/// Upper bound between two checks of a held pod
pub const RECHECK_INTERVAL: Duration = Duration::from_secs(10);

const MIN_REQUEUE: Duration = Duration::from_secs(1);

/// Why the engine decided what it decided
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainReason {
    NotTerminating,
    WithinGracePeriod,
    TimeoutExceeded,
    PodCompleted,
    PodNotReady,
    NoActiveTraffic,
    ActiveTraffic,
}

impl DrainReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DrainReason::NotTerminating => "NotTerminating",
            DrainReason::WithinGracePeriod => "WithinGracePeriod",
            DrainReason::TimeoutExceeded => "TimeoutExceeded",
            DrainReason::PodCompleted => "PodCompleted",
            DrainReason::PodNotReady => "PodNotReady",
            DrainReason::NoActiveTraffic => "NoActiveTraffic",
            DrainReason::ActiveTraffic => "ActiveTraffic",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainDecision {
    Hold {
        reason: DrainReason,
        requeue_after: Duration,
    },
    Release {
        reason: DrainReason,
    },
}

impl DrainDecision {
    pub fn release(&self) -> bool {
        matches!(self, DrainDecision::Release { .. })
    }

    pub fn reason(&self) -> DrainReason {
        match self {
            DrainDecision::Hold { reason, .. } | DrainDecision::Release { reason } => *reason,
        }
    }
}

pub struct DrainDecisionEngine {
    probe: Arc<dyn TrafficProbe>,
}

impl DrainDecisionEngine {
    pub fn new(probe: Arc<dyn TrafficProbe>) -> Self {
        Self { probe }
    }

    /// Decide whether the pod may be released at `now`.
    ///
    /// Probe failures are returned as errors; callers must keep holding the
    /// pod in that case.
    pub async fn decide(
        &self,
        pod: &Pod,
        config: &DrainConfig,
        now: DateTime<Utc>,
    ) -> Result<DrainDecision> {
        let name = pod.name_any();

        let Some(deletion) = pod.metadata.deletion_timestamp.as_ref() else {
            debug!("Pod {} has no deletion timestamp, nothing to drain", name);
            return Ok(DrainDecision::Release {
                reason: DrainReason::NotTerminating,
            });
        };

        let elapsed = now - deletion.0;
        let grace_period = config.grace_period();
        let drain_timeout = config.drain_timeout();

        if elapsed < grace_period {
            info!(
                "Grace period not yet elapsed for pod {} (elapsed {}s of {}s)",
                name,
                elapsed.num_seconds(),
                grace_period.num_seconds()
            );
            return Ok(DrainDecision::Hold {
                reason: DrainReason::WithinGracePeriod,
                requeue_after: requeue_delay(grace_period - elapsed),
            });
        }

        if elapsed > drain_timeout {
            info!(
                "Drain timeout exceeded for pod {} (elapsed {}s, timeout {}s), releasing",
                name,
                elapsed.num_seconds(),
                drain_timeout.num_seconds()
            );
            return Ok(DrainDecision::Release {
                reason: DrainReason::TimeoutExceeded,
            });
        }

        let phase = PodPhase::of(pod);
        if phase.is_terminal() {
            info!("Pod {} has completed ({:?}), releasing", name, phase);
            return Ok(DrainDecision::Release {
                reason: DrainReason::PodCompleted,
            });
        }

        if !is_pod_ready(pod) {
            info!("Pod {} is not ready, releasing", name);
            return Ok(DrainDecision::Release {
                reason: DrainReason::PodNotReady,
            });
        }

        if self.probe.has_active_connections(pod).await? {
            info!("Pod {} still receives traffic, continuing drain", name);
            // One second past the timeout so the next pass sees it exceeded
            let until_timeout = drain_timeout - elapsed + chrono::Duration::seconds(1);
            Ok(DrainDecision::Hold {
                reason: DrainReason::ActiveTraffic,
                requeue_after: requeue_delay(until_timeout),
            })
        } else {
            info!("No active traffic detected for pod {}, releasing", name);
            Ok(DrainDecision::Release {
                reason: DrainReason::NoActiveTraffic,
            })
        }
    }
}

/// Delay until the next threshold, bounded to `[MIN_REQUEUE, RECHECK_INTERVAL]`
fn requeue_delay(until_next_threshold: chrono::Duration) -> Duration {
    until_next_threshold
        .to_std()
        .unwrap_or(Duration::ZERO)
        .clamp(MIN_REQUEUE, RECHECK_INTERVAL)
}
