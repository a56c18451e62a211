//! Cluster access for the drain controller
//!
//! Everything the controller reads or writes goes through [`ClusterClient`].
//! [`KubeCluster`] is the production implementation; every call it makes is
//! single-shot and bounded by a deadline so a stuck API server surfaces as a
//! retriable [`Error::Timeout`] instead of hanging a reconcile worker.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Event, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    Client, Resource, ResourceExt,
};
use serde_json::json;

use crate::error::{Error, Result};

pub const FIELD_MANAGER: &str = "vpa-graceful-drain";

/// Reads and writes the controller performs against the cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the latest copy of a pod, `None` if it no longer exists
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Replace the pod's finalizer list in a single write.
    ///
    /// The write only succeeds if the pod is still at `resource_version`;
    /// otherwise [`Error::Conflict`] is returned. `None` means the pod is gone.
    async fn patch_pod_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<Option<Pod>>;

    /// Data of the configuration ConfigMap, `None` if the ConfigMap is absent
    async fn get_config_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>>;

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;

    /// Record a Kubernetes Event against the pod
    async fn publish_event(
        &self,
        pod: &Pod,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    timeout: Duration,
}

impl KubeCluster {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn bounded<T, F>(&self, operation: impl FnOnce() -> String, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Error::KubeError),
            Err(_) => Err(Error::Timeout {
                operation: operation(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(|| format!("get pod {namespace}/{name}"), api.get_opt(name))
            .await
    }

    async fn patch_pod_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        // resourceVersion in a merge patch makes the API server reject the
        // write with 409 if the pod changed since it was read.
        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers
            }
        });

        let result = self
            .bounded(
                || format!("patch finalizers of pod {namespace}/{name}"),
                api.patch(
                    name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&patch),
                ),
            )
            .await;

        match result {
            Ok(pod) => Ok(Some(pod)),
            Err(Error::KubeError(kube::Error::Api(err))) if err.code == 409 => {
                Err(Error::Conflict {
                    kind: "Pod",
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            Err(Error::KubeError(kube::Error::Api(err))) if err.code == 404 => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_config_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = self
            .bounded(
                || format!("get configmap {namespace}/{name}"),
                api.get_opt(name),
            )
            .await?;
        Ok(config_map.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let services = self
            .bounded(
                || format!("list services in {namespace}"),
                api.list(&ListParams::default()),
            )
            .await?;
        Ok(services.items)
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(
            || format!("get endpoints {namespace}/{name}"),
            api.get_opt(name),
        )
        .await
    }

    async fn publish_event(
        &self,
        pod: &Pod,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-drain-", pod.name_any())),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: pod.object_ref(&()),
            reporting_component: Some(FIELD_MANAGER.to_string()),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };

        self.bounded(
            || format!("create event for pod {}/{}", namespace, pod.name_any()),
            events.create(&PostParams::default(), &event),
        )
        .await?;
        Ok(())
    }
}
