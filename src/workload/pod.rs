//! Adapter for bare pods. Pods owned by a controller are filtered out at
//! admission; lookups go to the live API so the informer set does not have to
//! cache every pod in the cluster.

use crate::crd::WorkloadReference;
use crate::error::{Error, Result};
use crate::workload::{
    created_by_controller, decode_object, extract_volumes, released_volumes, AdmittedWorkload,
    VolumeInfo, WorkloadAdapter,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, Operation};
use kube::core::DynamicObject;
use kube::{Api, Client, ResourceExt};
use tracing::debug;

pub struct PodAdapter {
    client: Client,
}

impl PodAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get(&self, reference: &WorkloadReference) -> Result<Option<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &reference.namespace);
        Ok(pods.get_opt(&reference.name).await?)
    }
}

fn pod_reference(pod: &Pod) -> WorkloadReference {
    WorkloadReference {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        namespace: pod.namespace().unwrap_or_default(),
        name: pod.name_any(),
        uid: pod.uid().unwrap_or_default(),
    }
}

/// True once a pod can no longer run: a terminal phase, or deletion in
/// progress with every container stopped.
fn pod_completed(pod: &Pod) -> bool {
    let phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or_default();
    if phase == "Failed" || phase == "Succeeded" {
        return true;
    }
    pod.metadata.deletion_timestamp.is_some() && pod_not_running(pod)
}

fn pod_not_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| {
            statuses.iter().all(|container| {
                container
                    .state
                    .as_ref()
                    .is_some_and(|state| state.terminated.is_some() || state.waiting.is_some())
            })
        })
        .unwrap_or(true)
}

/// Admission handling for pods; pure so it can be exercised without a client.
fn admit_pod(request: &AdmissionRequest<DynamicObject>) -> Result<AdmittedWorkload> {
    let pod: Pod = decode_object("Pod", request.object.as_ref())?;

    // Pods created by a controller (deployment, sts, ...) are accounted
    // through their first-level object.
    if created_by_controller(&pod) {
        return Err(Error::IrrelevantWorkload {});
    }

    let mut used = extract_volumes(pod.spec.as_ref());
    let mut released = vec![];
    if request.operation == Operation::Update {
        let old: Pod = decode_object("Pod", request.old_object.as_ref())?;
        if pod_completed(&pod) {
            // The pod is done; everything it used goes back.
            released = extract_volumes(old.spec.as_ref());
            used = vec![];
        } else {
            released = released_volumes(&used, [old.spec.as_ref()]);
        }
    }

    let reference = pod_reference(&pod);
    debug!(workload = %reference, "processed pod");
    Ok(AdmittedWorkload {
        reference,
        replicas: Some(1),
        used,
        released,
    })
}

#[async_trait]
impl WorkloadAdapter for PodAdapter {
    async fn handle(&self, request: &AdmissionRequest<DynamicObject>) -> Result<AdmittedWorkload> {
        admit_pod(request)
    }

    async fn mounted_volumes(&self, reference: &WorkloadReference) -> Result<Vec<VolumeInfo>> {
        let Some(pod) = self.get(reference).await? else {
            debug!(workload = %reference, "pod does not exist");
            return Ok(vec![]);
        };
        if pod_completed(&pod) {
            debug!(workload = %reference, "pod is already completed");
            return Ok(vec![]);
        }
        Ok(extract_volumes(pod.spec.as_ref()))
    }

    async fn exist(&self, reference: &WorkloadReference) -> Result<bool> {
        Ok(self.get(reference).await?.is_some())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::workload::fixture::admission_request;
    use serde_json::json;

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    fn manifest(claims: &[&str], status: serde_json::Value) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p", "namespace": "ns1", "uid": "uid-p"},
            "spec": {
                "containers": [{"name": "main", "image": "nginx"}],
                "volumes": claims.iter().map(|claim| json!({
                    "name": format!("vol-{claim}"),
                    "persistentVolumeClaim": {"claimName": claim, "readOnly": true}
                })).collect::<Vec<_>>()
            },
            "status": status
        })
    }

    #[test]
    fn terminal_phases_complete_a_pod() {
        for phase in ["Failed", "Succeeded"] {
            assert!(pod_completed(&pod(json!({
                "metadata": {"name": "p"},
                "status": {"phase": phase}
            }))));
        }
        assert!(!pod_completed(&pod(json!({
            "metadata": {"name": "p"},
            "status": {"phase": "Running"}
        }))));
    }

    #[test]
    fn deleting_pods_complete_once_containers_stop() {
        let running = pod(json!({
            "metadata": {"name": "p", "deletionTimestamp": "2020-01-01T00:00:00Z"},
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"name": "main", "ready": true, "restartCount": 0, "image": "i", "imageID": "",
                     "state": {"running": {}}}
                ]
            }
        }));
        assert!(!pod_completed(&running));

        let stopped = pod(json!({
            "metadata": {"name": "p", "deletionTimestamp": "2020-01-01T00:00:00Z"},
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"name": "main", "ready": false, "restartCount": 0, "image": "i", "imageID": "",
                     "state": {"terminated": {"exitCode": 0}}}
                ]
            }
        }));
        assert!(pod_completed(&stopped));
    }

    #[test]
    fn create_uses_claims_with_their_read_only_flag() {
        let request =
            admission_request("CREATE", ("", "v1", "Pod"), manifest(&["a"], json!({})), None);
        let admitted = admit_pod(&request).unwrap();
        assert_eq!(admitted.reference.kind, "Pod");
        assert_eq!(admitted.reference.namespace, "ns1");
        assert_eq!(admitted.replicas, Some(1));
        assert_eq!(admitted.used.len(), 1);
        assert_eq!(admitted.used[0].read_only, Some(true));
        assert!(admitted.released.is_empty());
    }

    #[test]
    fn controller_owned_pods_are_irrelevant() {
        let mut owned = manifest(&["a"], json!({}));
        owned["metadata"]["ownerReferences"] = json!([{
            "apiVersion": "apps/v1",
            "kind": "ReplicaSet",
            "name": "web-5b8",
            "uid": "u",
            "controller": true
        }]);
        let request = admission_request("CREATE", ("", "v1", "Pod"), owned, None);
        match admit_pod(&request) {
            Err(Error::IrrelevantWorkload {}) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn terminal_update_releases_everything() {
        let request = admission_request(
            "UPDATE",
            ("", "v1", "Pod"),
            manifest(&["a", "b"], json!({"phase": "Succeeded"})),
            Some(manifest(&["a", "b"], json!({"phase": "Running"}))),
        );
        let admitted = admit_pod(&request).unwrap();
        assert!(admitted.used.is_empty());
        let released: Vec<_> = admitted
            .released
            .iter()
            .map(|volume| volume.claim_name.as_str())
            .collect();
        assert_eq!(released, vec!["a", "b"]);
    }
}
