//! Traffic probe for terminating pods
//!
//! Infers whether a pod is still receiving traffic by checking whether its
//! address is a ready endpoint of any Service selecting it. This proves
//! service membership, not an open connection.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kube::ResourceExt;
use tracing::{debug, instrument, warn};

use super::cluster::ClusterClient;
use super::conditions::{is_explicitly_not_ready, PodPhase};
use crate::error::{Error, Result};

/// Decides whether a pod is currently a traffic target
///
/// An `Err` means the answer could not be determined; callers must treat it
/// as "traffic present" and keep holding the pod.
#[async_trait]
pub trait TrafficProbe: Send + Sync {
    async fn has_active_connections(&self, pod: &Pod) -> Result<bool>;
}

/// [`TrafficProbe`] based on Service/Endpoints membership
pub struct EndpointTrafficProbe {
    cluster: Arc<dyn ClusterClient>,
}

impl EndpointTrafficProbe {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    async fn is_service_endpoint(&self, pod: &Pod, namespace: &str, pod_ip: &str) -> Result<bool> {
        let pod_name = pod.name_any();
        let services = self
            .cluster
            .list_services(namespace)
            .await
            .map_err(|e| Error::TrafficProbe {
                pod: format!("{namespace}/{pod_name}"),
                message: format!("failed to list services: {e}"),
            })?;

        for service in &services {
            let Some(selector) = service.spec.as_ref().and_then(|s| s.selector.as_ref()) else {
                continue;
            };
            if !selector_matches(selector, pod.labels()) {
                continue;
            }

            let service_name = service.name_any();
            let endpoints = match self.cluster.get_endpoints(namespace, &service_name).await {
                Ok(Some(endpoints)) => endpoints,
                // No Endpoints object yet: the service routes nowhere
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        "Skipping service {}/{}, failed to read endpoints: {}",
                        namespace, service_name, e
                    );
                    continue;
                }
            };

            if endpoints_contain_address(&endpoints, pod_ip) {
                debug!(
                    "Pod {}/{} found in endpoints of service {} ({})",
                    namespace, pod_name, service_name, pod_ip
                );
                return Ok(true);
            }
        }

        debug!(
            "Pod {}/{} not found in any service endpoints",
            namespace, pod_name
        );
        Ok(false)
    }
}

#[async_trait]
impl TrafficProbe for EndpointTrafficProbe {
    #[instrument(skip(self, pod), fields(name = %pod.name_any(), namespace = pod.namespace()))]
    async fn has_active_connections(&self, pod: &Pod) -> Result<bool> {
        let phase = PodPhase::of(pod);
        if phase != PodPhase::Running {
            debug!("Pod is not running ({:?}), no active connections", phase);
            return Ok(false);
        }

        let containers = pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default();
        if containers.is_empty() {
            return Ok(false);
        }

        let exposes_ports = containers
            .iter()
            .any(|c| c.ports.as_ref().is_some_and(|ports| !ports.is_empty()));
        if !exposes_ports {
            debug!("Pod exposes no ports, assuming no active connections");
            return Ok(false);
        }

        if is_explicitly_not_ready(pod) {
            debug!("Pod is not ready, assuming no active connections");
            return Ok(false);
        }

        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .unwrap_or_default();
        if pod_ip.is_empty() {
            debug!("Pod has no IP address");
            return Ok(false);
        }

        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        self.is_service_endpoint(pod, &namespace, pod_ip).await
    }
}

/// Equality-based label selection: every selector pair must be on the pod.
/// An empty selector selects everything.
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Whether `ip` is a ready address in any subset
pub fn endpoints_contain_address(endpoints: &Endpoints, ip: &str) -> bool {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .any(|address| address.ip == ip)
}
