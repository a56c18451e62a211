//! Pod phase and condition helpers following Kubernetes API conventions

use k8s_openapi::api::core::v1::{Pod, PodCondition};

/// Standard condition types
pub const CONDITION_TYPE_READY: &str = "Ready";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Lifecycle phase of a pod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Phase reported in the pod status; missing or unrecognized is `Unknown`
    pub fn of(pod: &Pod) -> Self {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Succeeded and Failed pods will not run again
    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// Find a pod condition by type
pub fn find_condition<'a>(pod: &'a Pod, type_: &str) -> Option<&'a PodCondition> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == type_))
}

/// Ready condition present with status True
pub fn is_pod_ready(pod: &Pod) -> bool {
    find_condition(pod, CONDITION_TYPE_READY)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Ready condition present with any status other than True
pub fn is_explicitly_not_ready(pod: &Pod) -> bool {
    find_condition(pod, CONDITION_TYPE_READY)
        .map(|c| c.status != CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}
