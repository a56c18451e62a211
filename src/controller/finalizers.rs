//! Guard marker (finalizer) lifecycle for drained pods
//!
//! The finalizer is the only durable signal that the controller is holding a
//! pod. Per pod the lifecycle is:
//!
//! ```text
//! Unguarded --attach--> Guarded --deletion requested--> Draining --release--> Released
//!                                                        |    ^
//!                                                        +hold+
//! ```
//!
//! Guarded and Draining are the same stored state, told apart only by the
//! deletion timestamp. Released is never observed: it is the state a pod is
//! left in once the marker write succeeds. Every write is a single request
//! with a resourceVersion precondition on the pod the decision was made from.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info};

use super::cluster::ClusterClient;
use crate::error::Result;

/// Finalizer name used to hold terminating pods
pub const DRAIN_FINALIZER: &str = "vpa-graceful-drain.cho.github.io/finalizer";

/// Observed guard state of a pod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardState {
    /// No marker
    Unguarded,
    /// Marker present, pod alive
    Guarded,
    /// Marker present, deletion requested
    Draining,
    /// Marker removed by this controller; terminal
    Released,
}

/// Inputs that move a pod through the lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardEvent {
    /// The pod was found eligible and alive
    Attach,
    /// An external actor requested deletion
    DeletionRequested,
    /// The drain engine decided to keep holding
    Hold,
    /// The drain engine authorized release
    Release,
}

impl GuardState {
    /// Classify a freshly read pod
    pub fn observe(pod: &Pod) -> Self {
        match (has_finalizer(pod), is_being_deleted(pod)) {
            (false, _) => GuardState::Unguarded,
            (true, false) => GuardState::Guarded,
            (true, true) => GuardState::Draining,
        }
    }

    /// Transition table. `None` marks an event that is not allowed in the
    /// current state.
    pub fn next(self, event: GuardEvent) -> Option<GuardState> {
        use GuardEvent::*;
        use GuardState::*;

        match (self, event) {
            (Unguarded, Attach) => Some(Guarded),
            (Guarded, Attach) => Some(Guarded),
            (Guarded, DeletionRequested) => Some(Draining),
            (Draining, DeletionRequested) => Some(Draining),
            (Draining, Hold) => Some(Draining),
            (Draining, Release) => Some(Released),
            _ => None,
        }
    }
}

/// Check if the pod is being deleted
pub fn is_being_deleted(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Check if the pod carries our finalizer
pub fn has_finalizer(pod: &Pod) -> bool {
    pod.finalizers().iter().any(|f| f == DRAIN_FINALIZER)
}

/// Result of persisting a guard transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardWrite {
    /// The finalizer list was written; the pod is now in this state
    Applied(GuardState),
    /// The transition needs no write; the pod stays in this state
    Unchanged(GuardState),
    /// The transition table does not allow `event` from `from`
    Rejected { from: GuardState, event: GuardEvent },
    /// The pod no longer exists
    Gone,
}

impl GuardEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardEvent::Attach => "attach",
            GuardEvent::DeletionRequested => "deletion_requested",
            GuardEvent::Hold => "hold",
            GuardEvent::Release => "release",
        }
    }
}

/// Apply `event` to `pod` as it was read in this pass.
///
/// The target state comes from [`GuardState::next`]; only transitions that
/// add or drop the marker touch the API server. The write carries the
/// resourceVersion of `pod`, so if the pod changed since it was read the
/// write fails with a conflict and nothing is applied. Callers must then
/// re-read the pod and decide again rather than retry the same write.
pub async fn transition(
    cluster: &dyn ClusterClient,
    pod: &Pod,
    event: GuardEvent,
) -> Result<GuardWrite> {
    let from = GuardState::observe(pod);
    let Some(to) = from.next(event) else {
        debug!(
            "Guard event {:?} not allowed in state {:?}, skipping",
            event, from
        );
        return Ok(GuardWrite::Rejected { from, event });
    };

    let finalizers = match (from, to) {
        (GuardState::Unguarded, GuardState::Guarded) => {
            let mut finalizers = pod.finalizers().to_vec();
            finalizers.push(DRAIN_FINALIZER.to_string());
            finalizers
        }
        (GuardState::Draining, GuardState::Released) => pod
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != DRAIN_FINALIZER)
            .cloned()
            .collect(),
        _ => return Ok(GuardWrite::Unchanged(to)),
    };

    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let name = pod.name_any();
    let resource_version = pod.resource_version().unwrap_or_default();

    let written = cluster
        .patch_pod_finalizers(&namespace, &name, &resource_version, finalizers)
        .await?;
    if written.is_none() {
        return Ok(GuardWrite::Gone);
    }

    match to {
        GuardState::Guarded => info!("Added drain finalizer to pod {}/{}", namespace, name),
        _ => info!("Removed drain finalizer from pod {}/{}", namespace, name),
    }
    Ok(GuardWrite::Applied(to))
}
