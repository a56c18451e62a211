//! Eligibility classification for pods
//!
//! Decides whether a pod is governed by the drain controller. The decision is
//! an ordered list of named rules; each rule either decides (managed or not)
//! or has no opinion, and the first decisive rule wins. Explicit signals come
//! first, the resource-value heuristic last.

use k8s_openapi::api::core::v1::{Container, Pod};
use kube::ResourceExt;

use super::quantity::parse_quantity;

/// Explicit opt-in/opt-out annotation, `"true"` or anything else
pub const VPA_MANAGED_ANNOTATION: &str = "vpa-managed";

/// Set by the VPA updater on pods it has recreated
pub const VPA_UPDATER_ANNOTATION: &str = "vpa-updater.client.k8s.io/last-updated";

/// Names the VerticalPodAutoscaler object governing the pod
pub const VPA_RESOURCE_NAME_ANNOTATION: &str = "vpa.k8s.io/resource-name";

/// Label marking pods as VPA-managed
pub const VPA_MANAGED_LABEL: &str = "vpa.k8s.io/managed";

const MEBIBYTE: i64 = 1024 * 1024;

/// Outcome of a single rule
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Managed,
    Unmanaged,
    NoOpinion,
}

/// A named eligibility rule
pub struct EligibilityRule {
    pub name: &'static str,
    evaluate: fn(&Pod) -> Verdict,
}

impl EligibilityRule {
    pub fn evaluate(&self, pod: &Pod) -> Verdict {
        (self.evaluate)(pod)
    }
}

/// Rules in priority order
pub static RULES: &[EligibilityRule] = &[
    EligibilityRule {
        name: "explicit-annotation",
        evaluate: explicit_annotation,
    },
    EligibilityRule {
        name: "vpa-updater-annotation",
        evaluate: vpa_updater_annotation,
    },
    EligibilityRule {
        name: "vpa-resource-annotation",
        evaluate: vpa_resource_annotation,
    },
    EligibilityRule {
        name: "vpa-managed-label",
        evaluate: vpa_managed_label,
    },
    EligibilityRule {
        name: "non-round-resources",
        evaluate: non_round_resources,
    },
];

/// Result of classifying a pod, with the rule that decided it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    pub managed: bool,
    pub rule: Option<&'static str>,
}

/// Run the rules in order and stop at the first decisive one
pub fn classify(pod: &Pod) -> Classification {
    for rule in RULES {
        match rule.evaluate(pod) {
            Verdict::Managed => {
                return Classification {
                    managed: true,
                    rule: Some(rule.name),
                }
            }
            Verdict::Unmanaged => {
                return Classification {
                    managed: false,
                    rule: Some(rule.name),
                }
            }
            Verdict::NoOpinion => {}
        }
    }

    Classification {
        managed: false,
        rule: None,
    }
}

/// Whether the pod is governed by the drain controller
pub fn is_managed(pod: &Pod) -> bool {
    classify(pod).managed
}

fn explicit_annotation(pod: &Pod) -> Verdict {
    match pod.annotations().get(VPA_MANAGED_ANNOTATION) {
        Some(value) if value == "true" => Verdict::Managed,
        Some(_) => Verdict::Unmanaged,
        None => Verdict::NoOpinion,
    }
}

fn vpa_updater_annotation(pod: &Pod) -> Verdict {
    if pod.annotations().contains_key(VPA_UPDATER_ANNOTATION) {
        Verdict::Managed
    } else {
        Verdict::NoOpinion
    }
}

fn vpa_resource_annotation(pod: &Pod) -> Verdict {
    match pod.annotations().get(VPA_RESOURCE_NAME_ANNOTATION) {
        Some(name) if !name.is_empty() => Verdict::Managed,
        _ => Verdict::NoOpinion,
    }
}

fn vpa_managed_label(pod: &Pod) -> Verdict {
    if pod.labels().contains_key(VPA_MANAGED_LABEL) {
        Verdict::Managed
    } else {
        Verdict::NoOpinion
    }
}

/// Owned pods whose resources look machine-computed.
///
/// Recommenders emit precise values such as `152m` or `262143k`; round values
/// are assumed to be hand-written. A recommendation that happens to be
/// round is missed.
fn non_round_resources(pod: &Pod) -> Verdict {
    if pod.owner_references().is_empty() {
        return Verdict::NoOpinion;
    }

    let containers = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or_default();

    if containers.iter().any(has_non_round_resources) {
        Verdict::Managed
    } else {
        Verdict::NoOpinion
    }
}

fn has_non_round_resources(container: &Container) -> bool {
    let Some(resources) = &container.resources else {
        return false;
    };

    [&resources.requests, &resources.limits]
        .into_iter()
        .flatten()
        .any(|values| {
            let cpu = values
                .get("cpu")
                .and_then(parse_quantity)
                .and_then(|q| q.milli_value())
                .is_some_and(is_non_round_cpu);
            let memory = values
                .get("memory")
                .and_then(parse_quantity)
                .and_then(|q| q.value())
                .is_some_and(is_non_round_memory);
            cpu || memory
        })
}

fn is_non_round_cpu(millis: i64) -> bool {
    millis > 0 && millis % 100 != 0 && millis % 50 != 0
}

fn is_non_round_memory(bytes: i64) -> bool {
    bytes > 0 && bytes % MEBIBYTE != 0
}
