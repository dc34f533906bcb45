//! One adapter for the four apps/v1 workload shapes. The original leaned on
//! runtime reflection to reach `spec.replicas` and `spec.template.spec`
//! generically; here each kind supplies its own typed accessors and the rest
//! of the pipeline is shared.

use crate::crd::WorkloadReference;
use crate::error::{Error, Result};
use crate::workload::{
    created_by_controller, decode_object, extract_volumes, released_volumes, AdmittedWorkload,
    VolumeInfo, WorkloadAdapter,
};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::PodSpec;
use kube::core::admission::{AdmissionRequest, Operation};
use kube::core::DynamicObject;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

const APPS_API_VERSION: &str = "apps/v1";

/// Adapter over one apps/v1 kind, parameterised by its typed accessors.
pub struct AppAdapter<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    kind: &'static str,
    store: Store<K>,
    replicas: fn(&K) -> Option<i32>,
    pod_spec: fn(&K) -> Option<&PodSpec>,
}

impl AppAdapter<Deployment> {
    pub fn deployments(store: Store<Deployment>) -> Self {
        Self {
            kind: "Deployment",
            store,
            replicas: |deployment| deployment.spec.as_ref().and_then(|spec| spec.replicas),
            pod_spec: |deployment| {
                deployment
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.template.spec.as_ref())
            },
        }
    }
}

impl AppAdapter<ReplicaSet> {
    pub fn replica_sets(store: Store<ReplicaSet>) -> Self {
        Self {
            kind: "ReplicaSet",
            store,
            replicas: |replica_set| replica_set.spec.as_ref().and_then(|spec| spec.replicas),
            pod_spec: |replica_set| {
                replica_set
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.template.as_ref())
                    .and_then(|template| template.spec.as_ref())
            },
        }
    }
}

impl AppAdapter<StatefulSet> {
    pub fn stateful_sets(store: Store<StatefulSet>) -> Self {
        Self {
            kind: "StatefulSet",
            store,
            replicas: |stateful_set| stateful_set.spec.as_ref().and_then(|spec| spec.replicas),
            pod_spec: |stateful_set| {
                stateful_set
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.template.spec.as_ref())
            },
        }
    }
}

impl AppAdapter<DaemonSet> {
    pub fn daemon_sets(store: Store<DaemonSet>) -> Self {
        Self {
            kind: "DaemonSet",
            store,
            // A DaemonSet's effective replica count depends on scheduling,
            // so it stays unknown.
            replicas: |_| None,
            pod_spec: |daemon_set| {
                daemon_set
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.template.spec.as_ref())
            },
        }
    }
}

impl<K> AppAdapter<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn reference(&self, object: &K) -> WorkloadReference {
        WorkloadReference {
            api_version: APPS_API_VERSION.to_string(),
            kind: self.kind.to_string(),
            namespace: object.namespace().unwrap_or_default(),
            name: object.name_any(),
            uid: object.uid().unwrap_or_default(),
        }
    }

    fn lookup(&self, reference: &WorkloadReference) -> Option<std::sync::Arc<K>> {
        self.store
            .get(&ObjectRef::new(&reference.name).within(&reference.namespace))
    }
}

#[async_trait]
impl<K> WorkloadAdapter for AppAdapter<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn handle(&self, request: &AdmissionRequest<DynamicObject>) -> Result<AdmittedWorkload> {
        let object: K = decode_object(self.kind, request.object.as_ref())?;

        // ReplicaSets in particular are usually owned by a Deployment; only
        // first-level objects are tracked.
        if created_by_controller(&object) {
            return Err(Error::IrrelevantWorkload {});
        }

        let reference = self.reference(&object);
        let used = extract_volumes((self.pod_spec)(&object));
        let released = if request.operation == Operation::Update {
            let old: K = decode_object(self.kind, request.old_object.as_ref())?;
            released_volumes(&used, [(self.pod_spec)(&old)])
        } else {
            vec![]
        };

        debug!(workload = %reference, "processed app");
        Ok(AdmittedWorkload {
            replicas: (self.replicas)(&object),
            reference,
            used,
            released,
        })
    }

    async fn mounted_volumes(&self, reference: &WorkloadReference) -> Result<Vec<VolumeInfo>> {
        match self.lookup(reference) {
            Some(object) => Ok(extract_volumes((self.pod_spec)(&object))),
            None => {
                debug!(workload = %reference, "app does not exist");
                Ok(vec![])
            }
        }
    }

    async fn exist(&self, reference: &WorkloadReference) -> Result<bool> {
        Ok(self.lookup(reference).is_some())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::workload::fixture::admission_request;
    use kube::runtime::reflector::store;
    use serde_json::json;

    fn deployment_manifest(name: &str, replicas: i32, claims: &[&str]) -> serde_json::Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "ns1", "uid": "uid-1"},
            "spec": {
                "replicas": replicas,
                "selector": {"matchLabels": {"app": name}},
                "template": {
                    "spec": {
                        "containers": [{"name": "main", "image": "nginx"}],
                        "volumes": claims.iter().map(|claim| json!({
                            "name": format!("vol-{claim}"),
                            "persistentVolumeClaim": {"claimName": claim}
                        })).collect::<Vec<_>>()
                    }
                }
            }
        })
    }

    fn adapter() -> AppAdapter<Deployment> {
        let (reader, _writer) = store();
        AppAdapter::deployments(reader)
    }

    #[tokio::test]
    async fn create_extracts_claims_and_replicas() {
        let request = admission_request(
            "CREATE",
            ("apps", "v1", "Deployment"),
            deployment_manifest("web", 2, &["a"]),
            None,
        );
        let admitted = adapter().handle(&request).await.unwrap();
        assert_eq!(admitted.reference.kind, "Deployment");
        assert_eq!(admitted.reference.name, "web");
        assert_eq!(admitted.replicas, Some(2));
        assert_eq!(admitted.used.len(), 1);
        assert_eq!(admitted.used[0].claim_name, "a");
        assert!(admitted.released.is_empty());
    }

    #[tokio::test]
    async fn update_releases_dropped_claims() {
        let request = admission_request(
            "UPDATE",
            ("apps", "v1", "Deployment"),
            deployment_manifest("web", 1, &["b"]),
            Some(deployment_manifest("web", 1, &["a", "b"])),
        );
        let admitted = adapter().handle(&request).await.unwrap();
        assert_eq!(admitted.used[0].claim_name, "b");
        assert_eq!(admitted.released.len(), 1);
        assert_eq!(admitted.released[0].claim_name, "a");
    }

    #[tokio::test]
    async fn controller_owned_objects_are_irrelevant() {
        let mut manifest = deployment_manifest("web", 1, &["a"]);
        manifest["metadata"]["ownerReferences"] = json!([{
            "apiVersion": "example.io/v1",
            "kind": "Parent",
            "name": "p",
            "uid": "u",
            "controller": true
        }]);
        let request = admission_request("CREATE", ("apps", "v1", "Deployment"), manifest, None);
        match adapter().handle(&request).await {
            Err(Error::IrrelevantWorkload {}) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_workloads_have_no_mounted_volumes() {
        let reference = WorkloadReference {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            namespace: "ns1".into(),
            name: "gone".into(),
            uid: String::new(),
        };
        let adapter = adapter();
        assert!(adapter.mounted_volumes(&reference).await.unwrap().is_empty());
        assert!(!adapter.exist(&reference).await.unwrap());
    }
}
