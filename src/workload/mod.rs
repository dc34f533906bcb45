//! Workload adapters: one per tracked kind, all exposing the same three
//! operations, plus a dispatcher routing on GroupVersionKind.

pub mod apps;
pub mod job;
pub mod pod;
pub mod tapp;

use crate::crd::WorkloadReference;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaimVolumeSource, PodSpec};
use kube::core::admission::AdmissionRequest;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::runtime::reflector::Store;
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashSet;

/// A persistentVolumeClaim entry of a pod spec.
pub type VolumeInfo = PersistentVolumeClaimVolumeSource;

/// The outcome of admitting a workload: its identity plus the claim sets the
/// request uses and releases.
#[derive(Debug, Clone)]
pub struct AdmittedWorkload {
    pub reference: WorkloadReference,
    pub replicas: Option<i32>,
    pub used: Vec<VolumeInfo>,
    pub released: Vec<VolumeInfo>,
}

/// Adapter over a single workload kind.
#[async_trait]
pub trait WorkloadAdapter: Send + Sync {
    /// Decode and classify an admission request for this kind.
    async fn handle(&self, request: &AdmissionRequest<DynamicObject>) -> Result<AdmittedWorkload>;

    /// Claims a stored workload currently mounts; empty when the workload is
    /// gone or already terminal.
    async fn mounted_volumes(&self, reference: &WorkloadReference) -> Result<Vec<VolumeInfo>>;

    /// Whether the workload still exists.
    async fn exist(&self, reference: &WorkloadReference) -> Result<bool>;
}

/// Routes workload operations to the adapter of the object's kind.
pub struct WorkloadDispatcher {
    pod: pod::PodAdapter,
    deployment: apps::AppAdapter<Deployment>,
    replica_set: apps::AppAdapter<ReplicaSet>,
    stateful_set: apps::AppAdapter<StatefulSet>,
    daemon_set: apps::AppAdapter<DaemonSet>,
    job: job::JobAdapter,
    tapp: Option<tapp::TAppAdapter>,
}

impl WorkloadDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        deployments: Store<Deployment>,
        replica_sets: Store<ReplicaSet>,
        stateful_sets: Store<StatefulSet>,
        daemon_sets: Store<DaemonSet>,
        jobs: Store<k8s_openapi::api::batch::v1::Job>,
        tapps: Option<Store<tapp::TApp>>,
    ) -> Self {
        Self {
            pod: pod::PodAdapter::new(client),
            deployment: apps::AppAdapter::deployments(deployments),
            replica_set: apps::AppAdapter::replica_sets(replica_sets),
            stateful_set: apps::AppAdapter::stateful_sets(stateful_sets),
            daemon_set: apps::AppAdapter::daemon_sets(daemon_sets),
            job: job::JobAdapter::new(jobs),
            tapp: tapps.map(tapp::TAppAdapter::new),
        }
    }

    pub async fn handle(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmittedWorkload> {
        self.adapter_for(&request.kind)?.handle(request).await
    }

    pub async fn mounted_volumes(&self, reference: &WorkloadReference) -> Result<Vec<VolumeInfo>> {
        self.adapter_for(&reference_gvk(reference))?
            .mounted_volumes(reference)
            .await
    }

    pub async fn exist(&self, reference: &WorkloadReference) -> Result<bool> {
        self.adapter_for(&reference_gvk(reference))?
            .exist(reference)
            .await
    }

    fn adapter_for(&self, gvk: &GroupVersionKind) -> Result<&dyn WorkloadAdapter> {
        match (gvk.group.as_str(), gvk.kind.as_str()) {
            ("", "Pod") => Ok(&self.pod),
            ("apps", "Deployment") => Ok(&self.deployment),
            ("apps", "ReplicaSet") => Ok(&self.replica_set),
            ("apps", "StatefulSet") => Ok(&self.stateful_set),
            ("apps", "DaemonSet") => Ok(&self.daemon_set),
            ("batch", "Job") => Ok(&self.job),
            (tapp::TAPP_GROUP, tapp::TAPP_KIND) => match &self.tapp {
                Some(adapter) => Ok(adapter),
                None => no_admitor(gvk),
            },
            _ => no_admitor(gvk),
        }
    }
}

fn no_admitor(gvk: &GroupVersionKind) -> Result<&'static dyn WorkloadAdapter> {
    Err(Error::NoAdmitor {
        group: gvk.group.clone(),
        version: gvk.version.clone(),
        kind: gvk.kind.clone(),
    })
}

fn reference_gvk(reference: &WorkloadReference) -> GroupVersionKind {
    let (group, version) = reference.group_version();
    GroupVersionKind::gvk(group, version, &reference.kind)
}

/// Deserialise the (new or old) object payload of an admission request.
pub(crate) fn decode_object<T: DeserializeOwned>(
    kind: &'static str,
    object: Option<&DynamicObject>,
) -> Result<T> {
    let object = object.ok_or(Error::MissingObject { kind })?;
    let value =
        serde_json::to_value(object).map_err(|source| Error::DecodeWorkload { kind, source })?;
    serde_json::from_value(value).map_err(|source| Error::DecodeWorkload { kind, source })
}

/// True when the object carries a controller owner reference; such objects
/// are managed by a tracked first-level workload and are not admitted on
/// their own.
pub(crate) fn created_by_controller<K: ResourceExt>(object: &K) -> bool {
    object
        .meta()
        .owner_references
        .as_ref()
        .map(|owners| {
            owners
                .iter()
                .any(|owner| owner.controller == Some(true))
        })
        .unwrap_or(false)
}

/// The persistentVolumeClaim entries of a pod spec.
pub(crate) fn extract_volumes(spec: Option<&PodSpec>) -> Vec<VolumeInfo> {
    let Some(spec) = spec else { return vec![] };
    spec.volumes
        .as_ref()
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|volume| volume.persistent_volume_claim.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// The claims of `old_specs` that do not appear in `used`, i.e. the claims
/// released by an update.
pub(crate) fn released_volumes<'a>(
    used: &[VolumeInfo],
    old_specs: impl IntoIterator<Item = Option<&'a PodSpec>>,
) -> Vec<VolumeInfo> {
    let kept: HashSet<&str> = used.iter().map(|volume| volume.claim_name.as_str()).collect();
    let mut released = vec![];
    for spec in old_specs {
        for volume in extract_volumes(spec) {
            if !kept.contains(volume.claim_name.as_str()) {
                released.push(volume);
            }
        }
    }
    released
}

#[cfg(test)]
pub(crate) mod fixture {
    use kube::core::admission::{AdmissionRequest, AdmissionReview};
    use kube::core::DynamicObject;

    /// Build an admission request from raw object payloads, the way the API
    /// server would deliver it.
    pub(crate) fn admission_request(
        operation: &str,
        gvk: (&str, &str, &str),
        object: serde_json::Value,
        old_object: Option<serde_json::Value>,
    ) -> AdmissionRequest<DynamicObject> {
        let (group, version, kind) = gvk;
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "req-uid",
                "kind": {"group": group, "version": version, "kind": kind},
                "resource": {"group": group, "version": version, "resource": ""},
                "requestKind": {"group": group, "version": version, "kind": kind},
                "name": object["metadata"]["name"],
                "namespace": object["metadata"]["namespace"],
                "operation": operation,
                "userInfo": {},
                "object": object,
                "oldObject": old_object,
                "dryRun": false
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, Volume};

    fn spec_with_claims(claims: &[&str]) -> PodSpec {
        PodSpec {
            volumes: Some(
                claims
                    .iter()
                    .map(|claim| Volume {
                        name: format!("vol-{claim}"),
                        persistent_volume_claim: Some(VolumeInfo {
                            claim_name: claim.to_string(),
                            read_only: None,
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn extracts_only_claim_volumes() {
        let mut spec = spec_with_claims(&["a", "b"]);
        spec.volumes
            .as_mut()
            .unwrap()
            .push(Volume {
                name: "scratch".into(),
                ..Default::default()
            });
        let volumes = extract_volumes(Some(&spec));
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].claim_name, "a");
        assert!(extract_volumes(None).is_empty());
    }

    #[test]
    fn released_is_old_minus_new() {
        let old = spec_with_claims(&["a", "b", "c"]);
        let used = extract_volumes(Some(&spec_with_claims(&["b"])));
        let released = released_volumes(&used, [Some(&old)]);
        let names: Vec<_> = released.iter().map(|volume| volume.claim_name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn unknown_kinds_have_no_admitor() {
        let gvk = GroupVersionKind::gvk("example.io", "v1", "Widget");
        let error = match no_admitor(&gvk) {
            Err(error) => error,
            Ok(_) => panic!("expected no admitor error"),
        };
        assert_eq!(
            error.to_string(),
            "no available admitor for example.io/v1, Kind=Widget"
        );
    }
}
