//! Main reconciler for pods
//!
//! Implements the controller pattern using kube-rs runtime. Each pod is
//! reconciled independently; every pass re-reads the pod and the
//! configuration, so duplicate or late triggers converge to the same result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::cluster::ClusterClient;
use super::config::{parse_config, DrainConfig};
use super::drain::{DrainDecision, DrainDecisionEngine, DrainReason};
use super::eligibility::classify;
use super::finalizers::{is_being_deleted, transition, GuardEvent, GuardState, GuardWrite};
use super::namespace_filter::namespace_matches;
use super::traffic::{EndpointTrafficProbe, TrafficProbe};
use crate::error::{Error, Result};

const CONFLICT_REQUEUE: Duration = Duration::from_millis(100);
const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(5);

/// Location of the configuration ConfigMap
#[derive(Clone, Debug)]
pub struct ConfigSource {
    pub namespace: String,
    pub name: String,
}

/// Shared state for the controller
pub struct ControllerState {
    pub cluster: Arc<dyn ClusterClient>,
    pub engine: DrainDecisionEngine,
    pub config_source: ConfigSource,
    /// `None` when leader election is disabled
    pub is_leader: Option<Arc<AtomicBool>>,
}

impl ControllerState {
    pub fn new(cluster: Arc<dyn ClusterClient>, config_source: ConfigSource) -> Self {
        let probe: Arc<dyn TrafficProbe> = Arc::new(EndpointTrafficProbe::new(cluster.clone()));
        Self {
            cluster,
            engine: DrainDecisionEngine::new(probe),
            config_source,
            is_leader: None,
        }
    }

    pub fn with_leader_flag(mut self, is_leader: Arc<AtomicBool>) -> Self {
        self.is_leader = Some(is_leader);
        self
    }

    fn is_leader(&self) -> bool {
        self.is_leader
            .as_ref()
            .map_or(true, |flag| flag.load(Ordering::Relaxed))
    }
}

/// What a reconcile pass did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The pod no longer exists
    NotFound,
    /// Another replica holds the leader lease
    NotLeader,
    /// The pod is out of scope
    NotManaged,
    /// The finalizer was added
    Attached,
    /// The finalizer was already present on a live pod
    AlreadyGuarded,
    /// The pod is terminating and was never guarded
    UnguardedTermination,
    /// Drain in progress; check again later
    Holding {
        reason: DrainReason,
        requeue_after: Duration,
    },
    /// The finalizer is gone and Kubernetes may finish the deletion
    Released { reason: DrainReason },
    /// The pod changed between read and write; decide again from fresh state
    Conflict,
    /// The guard lifecycle does not allow `event` from `from`
    Rejected { from: GuardState, event: GuardEvent },
}

impl ReconcileOutcome {
    pub fn action(&self) -> Action {
        match self {
            ReconcileOutcome::NotLeader => Action::requeue(NOT_LEADER_REQUEUE),
            ReconcileOutcome::Holding { requeue_after, .. } => Action::requeue(*requeue_after),
            ReconcileOutcome::Conflict => Action::requeue(CONFLICT_REQUEUE),
            _ => Action::await_change(),
        }
    }
}

/// Main entry point to start the controller
pub async fn run_controller(client: Client, state: Arc<ControllerState>) -> Result<()> {
    let pods: Api<Pod> = Api::all(client);

    info!(
        "Starting pod drain controller (config: {}/{})",
        state.config_source.namespace, state.config_source.name
    );

    Controller::new(pods, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!("Reconciled {}: {:?}", obj, action),
                Err(e) => warn!("Reconcile failed: {:?}", e),
            }
        })
        .await;

    info!("Pod drain controller stopped");
    Ok(())
}

/// The reconciliation function called by the controller runtime
///
/// The watched object is only a trigger; the pod is fetched again inside.
async fn reconcile(obj: Arc<Pod>, ctx: Arc<ControllerState>) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();

    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let outcome = reconcile_pod(&ctx, &namespace, &name, Utc::now()).await;

    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile(started.elapsed());

    Ok(outcome?.action())
}

/// Load and validate the configuration for this pass
pub async fn resolve_config(
    cluster: &dyn ClusterClient,
    source: &ConfigSource,
) -> Result<DrainConfig> {
    let data = cluster
        .get_config_data(&source.namespace, &source.name)
        .await?;
    if data.is_none() {
        debug!(
            "ConfigMap {}/{} not found, using defaults",
            source.namespace, source.name
        );
    }
    Ok(parse_config(data.as_ref())?)
}

/// Whether the pod is governed by the controller under `config`
pub fn is_eligible(pod: &Pod, config: &DrainConfig) -> bool {
    let classification = classify(pod);
    if !classification.managed {
        debug!(
            "Pod {} not managed (rule: {})",
            pod.name_any(),
            classification.rule.unwrap_or("none")
        );
        return false;
    }

    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    if !namespace_matches(&namespace, config.namespace_selector.as_ref()) {
        debug!("Namespace {} excluded by namespace selector", namespace);
        return false;
    }

    true
}

/// Reconcile one pod at `now`
#[instrument(skip_all, fields(name = %name, namespace = %namespace))]
pub async fn reconcile_pod(
    state: &ControllerState,
    namespace: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome> {
    if !state.is_leader() {
        return Ok(ReconcileOutcome::NotLeader);
    }

    let Some(pod) = state.cluster.get_pod(namespace, name).await? else {
        debug!("Pod not found, ignoring since it must have been deleted");
        return Ok(ReconcileOutcome::NotFound);
    };

    match GuardState::observe(&pod) {
        GuardState::Draining => {
            let config = match resolve_config(state.cluster.as_ref(), &state.config_source).await
            {
                Ok(config) => config,
                Err(Error::InvalidConfig(e)) => {
                    warn!("Rejected configuration ({}), draining with defaults", e);
                    DrainConfig::default()
                }
                Err(e) => return Err(e),
            };
            drain(state, &pod, &config, now).await
        }
        GuardState::Guarded => {
            debug!("Pod already carries the drain finalizer");
            Ok(ReconcileOutcome::AlreadyGuarded)
        }
        GuardState::Unguarded | GuardState::Released => {
            if is_being_deleted(&pod) {
                debug!("Pod is terminating without the drain finalizer, skipping");
                return Ok(ReconcileOutcome::UnguardedTermination);
            }

            let config = resolve_config(state.cluster.as_ref(), &state.config_source).await?;
            if !is_eligible(&pod, &config) {
                return Ok(ReconcileOutcome::NotManaged);
            }

            guard(state, &pod).await
        }
    }
}

async fn guard(state: &ControllerState, pod: &Pod) -> Result<ReconcileOutcome> {
    let result = transition(state.cluster.as_ref(), pod, GuardEvent::Attach).await;
    record_finalizer_operation(GuardEvent::Attach, &result);

    let Some(write) = settle(result)? else {
        return Ok(ReconcileOutcome::Conflict);
    };
    match write {
        GuardWrite::Applied(_) => Ok(ReconcileOutcome::Attached),
        GuardWrite::Unchanged(_) => Ok(ReconcileOutcome::AlreadyGuarded),
        GuardWrite::Gone => Ok(ReconcileOutcome::NotFound),
        GuardWrite::Rejected { from, event } => Ok(ReconcileOutcome::Rejected { from, event }),
    }
}

async fn drain(
    state: &ControllerState,
    pod: &Pod,
    config: &DrainConfig,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome> {
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let name = pod.name_any();

    let decision = match state.engine.decide(pod, config, now).await {
        Ok(decision) => decision,
        Err(e) => {
            warn!("Drain check failed, keeping pod {}/{}: {}", namespace, name, e);
            return Err(e);
        }
    };

    #[cfg(feature = "metrics")]
    super::metrics::inc_decision(decision.release(), decision.reason().as_str());

    let event = if decision.release() {
        GuardEvent::Release
    } else {
        GuardEvent::Hold
    };
    let result = transition(state.cluster.as_ref(), pod, event).await;
    record_finalizer_operation(event, &result);

    let Some(write) = settle(result)? else {
        debug!("Pod {}/{} changed before the {} write", namespace, name, event.as_str());
        return Ok(ReconcileOutcome::Conflict);
    };
    match (decision, write) {
        (
            DrainDecision::Hold {
                reason,
                requeue_after,
            },
            GuardWrite::Unchanged(_),
        ) => {
            info!(
                "Graceful drain not yet completed for {}/{} ({}), requeuing in {:?}",
                namespace,
                name,
                reason.as_str(),
                requeue_after
            );
            Ok(ReconcileOutcome::Holding {
                reason,
                requeue_after,
            })
        }
        (DrainDecision::Release { reason }, GuardWrite::Applied(_)) => {
            info!(
                "Graceful drain completed for {}/{} ({})",
                namespace,
                name,
                reason.as_str()
            );
            emit_release_event(state.cluster.as_ref(), pod, reason).await;
            Ok(ReconcileOutcome::Released { reason })
        }
        (_, GuardWrite::Gone) => Ok(ReconcileOutcome::NotFound),
        (_, GuardWrite::Rejected { from, event }) => Ok(ReconcileOutcome::Rejected { from, event }),
        (decision, write) => {
            warn!(
                "Unexpected guard write {:?} for decision {:?} on {}/{}",
                write, decision, namespace, name
            );
            Ok(ReconcileOutcome::Rejected {
                from: GuardState::observe(pod),
                event,
            })
        }
    }
}

/// A conflicting write becomes `None` so the pass ends with a quick requeue
fn settle(result: Result<GuardWrite>) -> Result<Option<GuardWrite>> {
    match result {
        Ok(write) => Ok(Some(write)),
        Err(e) if e.is_conflict() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Best-effort Kubernetes Event for a released pod
async fn emit_release_event(cluster: &dyn ClusterClient, pod: &Pod, reason: DrainReason) {
    let (event_type, event_reason, message) = match reason {
        DrainReason::TimeoutExceeded => (
            "Warning",
            "DrainTimeoutExceeded",
            "Drain timeout exceeded, releasing pod while it may still receive traffic",
        ),
        _ => (
            "Normal",
            "DrainCompleted",
            "Graceful drain completed, releasing pod for deletion",
        ),
    };

    if let Err(e) = cluster
        .publish_event(pod, event_type, event_reason, message)
        .await
    {
        warn!("Failed to publish {} event: {}", event_reason, e);
    }
}

fn record_finalizer_operation(event: GuardEvent, result: &Result<GuardWrite>) {
    let label = match result {
        Ok(GuardWrite::Applied(_)) => "applied",
        Ok(GuardWrite::Unchanged(_)) => "unchanged",
        Ok(GuardWrite::Rejected { .. }) => "rejected",
        Ok(GuardWrite::Gone) => "gone",
        Err(e) if e.is_conflict() => "conflict",
        Err(_) => "error",
    };
    debug!("Guard {} result: {}", event.as_str(), label);

    #[cfg(feature = "metrics")]
    super::metrics::inc_finalizer_operation(event.as_str(), label);
}

/// Requeue delay after a failed reconcile
pub fn retry_delay(error: &Error) -> Duration {
    match error {
        Error::Conflict { .. } => CONFLICT_REQUEUE,
        Error::InvalidConfig(_) => Duration::from_secs(300),
        Error::TrafficProbe { .. } => Duration::from_secs(30),
        e if e.is_retriable() => Duration::from_secs(15),
        _ => Duration::from_secs(60),
    }
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(pod: Arc<Pod>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!(
        "Reconciliation error for pod {}/{}: {}",
        pod.namespace().unwrap_or_default(),
        pod.name_any(),
        error
    );

    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(error.kind());

    Action::requeue(retry_delay(error))
}
