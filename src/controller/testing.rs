//! In-memory cluster used by the controller tests

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EndpointAddress, EndpointSubset, Endpoints, Pod, PodCondition,
    PodSpec, PodStatus, Service, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;

use super::cluster::ClusterClient;
use crate::error::{Error, Result};

#[derive(Default)]
struct FakeState {
    pods: BTreeMap<(String, String), Pod>,
    config_data: Option<BTreeMap<String, String>>,
    services: Vec<Service>,
    endpoints: BTreeMap<(String, String), Endpoints>,
    next_resource_version: u64,
    conflicts_to_inject: u32,
    pending_update: Option<Pod>,
    fail_service_list: bool,
    failing_endpoints: Vec<String>,
    fail_config: bool,
    patches: u32,
    events: Vec<(String, String)>,
}

/// [`ClusterClient`] fake with API-server-like resourceVersion semantics
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pod(&self, mut pod: Pod) {
        let mut state = self.state.lock().unwrap();
        state.next_resource_version += 1;
        pod.metadata.resource_version = Some(state.next_resource_version.to_string());
        let key = (pod.namespace().unwrap_or_default(), pod.name_any());
        state.pods.insert(key, pod);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        let state = self.state.lock().unwrap();
        state
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Simulate `kubectl delete`: set the deletion timestamp, or remove the
    /// pod outright when it carries no finalizers.
    pub fn request_deletion(&self, namespace: &str, name: &str, at: Time) {
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let has_finalizers = state
            .pods
            .get(&key)
            .is_some_and(|p| !p.finalizers().is_empty());
        if !has_finalizers {
            state.pods.remove(&key);
            return;
        }
        state.next_resource_version += 1;
        let rv = state.next_resource_version.to_string();
        if let Some(pod) = state.pods.get_mut(&key) {
            pod.metadata.deletion_timestamp = Some(at);
            pod.metadata.resource_version = Some(rv);
        }
    }

    pub fn set_config_data(&self, data: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        state.config_data = Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    pub fn add_service(&self, service: Service) {
        self.state.lock().unwrap().services.push(service);
    }

    pub fn add_endpoints(&self, endpoints: Endpoints) {
        let key = (endpoints.namespace().unwrap_or_default(), endpoints.name_any());
        self.state.lock().unwrap().endpoints.insert(key, endpoints);
    }

    /// The next `count` finalizer writes fail as if another actor updated
    /// the pod in between
    pub fn inject_conflicts(&self, count: u32) {
        self.state.lock().unwrap().conflicts_to_inject = count;
    }

    /// Store `pod` right before the next finalizer write is handled, as if
    /// another actor had updated it after the controller read it
    pub fn update_before_next_patch(&self, pod: Pod) {
        self.state.lock().unwrap().pending_update = Some(pod);
    }

    pub fn fail_service_list(&self) {
        self.state.lock().unwrap().fail_service_list = true;
    }

    pub fn fail_endpoints(&self, service: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_endpoints
            .push(service.to_string());
    }

    pub fn fail_config(&self) {
        self.state.lock().unwrap().fail_config = true;
    }

    pub fn patch_count(&self) -> u32 {
        self.state.lock().unwrap().patches
    }

    pub fn event_reasons(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.events.iter().map(|(_, reason)| reason.clone()).collect()
    }

    fn unavailable(what: &str) -> Error {
        Error::Timeout {
            operation: what.to_string(),
            seconds: 10,
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pod(namespace, name))
    }

    async fn patch_pod_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<Option<Pod>> {
        let pending = self.state.lock().unwrap().pending_update.take();
        if let Some(update) = pending {
            self.insert_pod(update);
        }

        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let conflict = Error::Conflict {
            kind: "Pod",
            namespace: namespace.to_string(),
            name: name.to_string(),
        };

        if !state.pods.contains_key(&key) {
            return Ok(None);
        }

        state.next_resource_version += 1;
        let next_rv = state.next_resource_version.to_string();

        if state.conflicts_to_inject > 0 {
            state.conflicts_to_inject -= 1;
            // Someone else touched the pod
            if let Some(pod) = state.pods.get_mut(&key) {
                pod.metadata.resource_version = Some(next_rv);
            }
            return Err(conflict);
        }

        let current_rv = state
            .pods
            .get(&key)
            .and_then(|p| p.metadata.resource_version.clone())
            .unwrap_or_default();
        if current_rv != resource_version {
            return Err(conflict);
        }

        state.patches += 1;
        let Some(pod) = state.pods.get_mut(&key) else {
            return Ok(None);
        };
        pod.metadata.finalizers = Some(finalizers);
        pod.metadata.resource_version = Some(next_rv);
        let updated = pod.clone();

        // The API server completes deletion once the last finalizer is gone
        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.pods.remove(&key);
        }

        Ok(Some(updated))
    }

    async fn get_config_data(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let state = self.state.lock().unwrap();
        if state.fail_config {
            return Err(Self::unavailable("get configmap"));
        }
        Ok(state.config_data.clone())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let state = self.state.lock().unwrap();
        if state.fail_service_list {
            return Err(Self::unavailable("list services"));
        }
        Ok(state
            .services
            .iter()
            .filter(|s| s.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let state = self.state.lock().unwrap();
        if state.failing_endpoints.iter().any(|s| s == name) {
            return Err(Self::unavailable("get endpoints"));
        }
        Ok(state
            .endpoints
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn publish_event(
        &self,
        pod: &Pod,
        _event_type: &str,
        reason: &str,
        _message: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push((pod.name_any(), reason.to_string()));
        Ok(())
    }
}

/// Builder for test pods
pub struct PodBuilder {
    pod: Pod,
}

impl PodBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            pod: Pod {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".to_string(),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                status: Some(PodStatus {
                    phase: Some("Running".to_string()),
                    ..Default::default()
                }),
            },
        }
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.pod
            .annotations_mut()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.pod
            .labels_mut()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn finalizer(mut self, finalizer: &str) -> Self {
        self.pod.finalizers_mut().push(finalizer.to_string());
        self
    }

    pub fn deleted_at(mut self, at: Time) -> Self {
        self.pod.metadata.deletion_timestamp = Some(at);
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        if let Some(status) = self.pod.status.as_mut() {
            status.phase = Some(phase.to_string());
        }
        self
    }

    pub fn ready(mut self, ready: bool) -> Self {
        if let Some(status) = self.pod.status.as_mut() {
            status.conditions = Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]);
        }
        self
    }

    pub fn ip(mut self, ip: &str) -> Self {
        if let Some(status) = self.pod.status.as_mut() {
            status.pod_ip = Some(ip.to_string());
        }
        self
    }

    pub fn port(mut self, port: i32) -> Self {
        if let Some(spec) = self.pod.spec.as_mut() {
            spec.containers[0]
                .ports
                .get_or_insert_with(Vec::new)
                .push(ContainerPort {
                    container_port: port,
                    ..Default::default()
                });
        }
        self
    }

    pub fn no_containers(mut self) -> Self {
        if let Some(spec) = self.pod.spec.as_mut() {
            spec.containers.clear();
        }
        self
    }

    /// Running, Ready, serving on 8080 at `ip`
    pub fn serving(self, ip: &str) -> Self {
        self.phase("Running").ready(true).port(8080).ip(ip)
    }

    pub fn build(self) -> Pod {
        self.pod
    }
}

/// Service in `namespace` selecting `selector`
pub fn service(namespace: &str, name: &str, selector: Option<&[(&str, &str)]>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: selector.map(|pairs| {
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Endpoints object with a single subset of ready addresses
pub fn endpoints(namespace: &str, name: &str, ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    }
}
