//! Composition of the per driver probes with cluster state: given a claim,
//! resolve its volume and driver, then answer status, attachment, mount and
//! usage questions about it.

use crate::cache::namespaced_ref;
use crate::config::{self, VolumeConfig};
use crate::crd::{
    AttachedWorkload, ClaimStatus, PersistentVolumeClaimRuntime, PersistentVolumeClaimRuntimeSpec,
};
use crate::error::{Error, Result};
use crate::volume::{cbs::CbsVolume, ceph::CephFsVolume, ceph::CephRbdVolume, VolumeProbe};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::PostParams;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// PVC conditions which indicate an in-flight expansion.
const RESIZE_CONDITIONS: [&str; 2] = ["Resizing", "FileSystemResizePending"];

pub struct VolumeManager {
    client: Client,
    pvc_store: Store<PersistentVolumeClaim>,
    pv_store: Store<PersistentVolume>,
    pvcr_store: Store<PersistentVolumeClaimRuntime>,
    probes: HashMap<String, Arc<dyn VolumeProbe>>,
}

impl VolumeManager {
    pub fn new(
        config: &VolumeConfig,
        client: Client,
        pvc_store: Store<PersistentVolumeClaim>,
        pv_store: Store<PersistentVolume>,
        pvcr_store: Store<PersistentVolumeClaimRuntime>,
    ) -> Self {
        let mut probes: HashMap<String, Arc<dyn VolumeProbe>> = HashMap::new();
        for volume_type in &config.volume_types {
            match volume_type.as_str() {
                config::CEPH_RBD => {
                    probes.insert(volume_type.clone(), Arc::new(CephRbdVolume::new(config)));
                }
                config::CEPH_FS => {
                    probes.insert(volume_type.clone(), Arc::new(CephFsVolume::new(config)));
                }
                config::TENCENT_CBS => {
                    probes.insert(volume_type.clone(), Arc::new(CbsVolume::default()));
                }
                other => debug!(volume_type = other, "ignoring unknown volume type"),
            }
        }
        Self {
            client,
            pvc_store,
            pv_store,
            pvcr_store,
            probes,
        }
    }

    /// Start the probes' background duties.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        for probe in self.probes.values() {
            Arc::clone(probe).start(cancel.clone()).await?;
        }
        Ok(())
    }

    /// Current statuses of a claim, derived from the claim phase, the bound
    /// volume and the runtime attachment state.
    pub fn status(&self, namespace: &str, name: &str) -> Result<Vec<ClaimStatus>> {
        let pvc = self.claim(namespace, name)?;
        let pv = self.resolve_pv(&pvc);
        let pvcr = self.pvcr_store.get(&namespaced_ref(namespace, name));
        Ok(claim_statuses(
            &pvc,
            pv.as_deref(),
            pvcr.as_deref().map(|pvcr| &pvcr.spec),
        ))
    }

    /// Attach a workload to a claim: no-op if it is already attached, checked
    /// against the driver's access rules otherwise, then persisted with
    /// recomputed statuses. Concurrent writers are healed by the controllers'
    /// next pass, so no retry happens here.
    pub async fn attach(
        &self,
        workload: AttachedWorkload,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        debug!(%workload.reference, namespace, name, "try to attach volume");

        let (pvc, pv, probe) = self.volume(namespace, name)?;
        let pvcr = self
            .pvcr_store
            .get(&namespaced_ref(namespace, name))
            .ok_or_else(|| Error::RuntimeNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        if pvcr
            .spec
            .workloads
            .iter()
            .any(|attached| attached.reference.same_attacher(&workload.reference))
        {
            return Ok(());
        }

        probe.available(&workload, &pvcr)?;

        let mut updated = pvcr.as_ref().clone();
        updated.spec.workloads.push(workload);
        let statuses = claim_statuses(&pvc, Some(&pv), Some(&updated.spec));
        updated.spec.statuses = statuses;
        self.pvcr_api(namespace)
            .replace(name, &PostParams::default(), &updated)
            .await?;
        Ok(())
    }

    /// Nodes currently mounting the claim's volume.
    pub async fn mounted_nodes(&self, namespace: &str, name: &str) -> Result<Vec<String>> {
        let (_, pv, probe) = self.volume(namespace, name)?;
        probe.mounted_nodes(&pv).await
    }

    /// Used bytes of the claim's volume.
    pub async fn usage(&self, namespace: &str, name: &str) -> Result<i64> {
        let (_, pv, probe) = self.volume(namespace, name)?;
        probe.usage(&pv).await
    }

    fn claim(&self, namespace: &str, name: &str) -> Result<Arc<PersistentVolumeClaim>> {
        self.pvc_store
            .get(&namespaced_ref(namespace, name))
            .ok_or_else(|| Error::ClaimNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    fn resolve_pv(&self, pvc: &PersistentVolumeClaim) -> Option<Arc<PersistentVolume>> {
        let volume_name = pvc.spec.as_ref()?.volume_name.as_deref()?;
        if volume_name.is_empty() {
            return None;
        }
        self.pv_store.get(&ObjectRef::new(volume_name))
    }

    /// Resolve a claim to its bound volume and the probe registered for the
    /// volume's CSI driver.
    fn volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(
        Arc<PersistentVolumeClaim>,
        Arc<PersistentVolume>,
        Arc<dyn VolumeProbe>,
    )> {
        let pvc = self.claim(namespace, name)?;
        let pv = self.resolve_pv(&pvc).ok_or(Error::VolumeCreating {})?;
        let csi = pv
            .spec
            .as_ref()
            .and_then(|spec| spec.csi.as_ref())
            .ok_or(Error::NotCsiVolume {})?;
        let probe = self
            .probes
            .get(&csi.driver)
            .cloned()
            .ok_or_else(|| Error::UnsupportedVolumeType {
                driver: csi.driver.clone(),
            })?;
        Ok((pvc, pv, probe))
    }

    fn pvcr_api(&self, namespace: &str) -> Api<PersistentVolumeClaimRuntime> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// The claim status function. Deletion, pending provisioning and lost
/// volumes override everything; a bound claim is `InUse` while any workload
/// or node holds it and `Available` otherwise, with `Expanding` appended
/// while a resize condition is true.
pub fn claim_statuses(
    pvc: &PersistentVolumeClaim,
    pv: Option<&PersistentVolume>,
    runtime: Option<&PersistentVolumeClaimRuntimeSpec>,
) -> Vec<ClaimStatus> {
    if pvc.metadata.deletion_timestamp.is_some() {
        return vec![ClaimStatus::Deleting];
    }

    let mut statuses = Vec::with_capacity(2);
    let phase = pvc
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or_default();
    match phase {
        "Pending" => return vec![ClaimStatus::Creating],
        "Lost" => return vec![ClaimStatus::Lost],
        "Bound" => {
            if pv.is_none() {
                return vec![ClaimStatus::Lost];
            }
            let in_use = runtime.is_some_and(|spec| {
                !spec.workloads.is_empty() || !spec.mounted_nodes.is_empty()
            });
            statuses.push(if in_use {
                ClaimStatus::InUse
            } else {
                ClaimStatus::Available
            });
        }
        _ => {}
    }

    let conditions = pvc
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref());
    if let Some(conditions) = conditions {
        if conditions
            .iter()
            .any(|condition| {
                RESIZE_CONDITIONS.contains(&condition.type_.as_str()) && condition.status == "True"
            })
        {
            statuses.push(ClaimStatus::Expanding);
        }
    }

    statuses
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn pvc(value: serde_json::Value) -> PersistentVolumeClaim {
        serde_json::from_value(value).unwrap()
    }

    fn bound_pv() -> PersistentVolume {
        serde_json::from_value(json!({
            "metadata": {"name": "pv-1"},
            "spec": {"csi": {"driver": "cephrbd", "volumeHandle": "h"}}
        }))
        .unwrap()
    }

    fn runtime(
        workloads: usize,
        mounted_nodes: usize,
    ) -> PersistentVolumeClaimRuntimeSpec {
        PersistentVolumeClaimRuntimeSpec {
            workloads: (0..workloads).map(|_| Default::default()).collect(),
            mounted_nodes: (0..mounted_nodes).map(|i| format!("n{i}")).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn deletion_overrides_everything() {
        let claim = pvc(json!({
            "metadata": {"name": "a", "deletionTimestamp": "2020-01-01T00:00:00Z"},
            "status": {"phase": "Bound"}
        }));
        assert_eq!(
            claim_statuses(&claim, Some(&bound_pv()), Some(&runtime(1, 1))),
            vec![ClaimStatus::Deleting]
        );
    }

    #[test]
    fn pending_claims_are_creating() {
        let claim = pvc(json!({"metadata": {"name": "a"}, "status": {"phase": "Pending"}}));
        assert_eq!(claim_statuses(&claim, None, None), vec![ClaimStatus::Creating]);
    }

    #[test]
    fn lost_phase_and_missing_volumes_are_lost() {
        let claim = pvc(json!({"metadata": {"name": "a"}, "status": {"phase": "Lost"}}));
        assert_eq!(claim_statuses(&claim, None, None), vec![ClaimStatus::Lost]);

        let bound = pvc(json!({"metadata": {"name": "a"}, "status": {"phase": "Bound"}}));
        assert_eq!(claim_statuses(&bound, None, None), vec![ClaimStatus::Lost]);
    }

    #[test]
    fn bound_claims_flip_between_available_and_in_use() {
        let claim = pvc(json!({"metadata": {"name": "a"}, "status": {"phase": "Bound"}}));
        let pv = bound_pv();
        assert_eq!(
            claim_statuses(&claim, Some(&pv), Some(&runtime(0, 0))),
            vec![ClaimStatus::Available]
        );
        assert_eq!(
            claim_statuses(&claim, Some(&pv), Some(&runtime(1, 0))),
            vec![ClaimStatus::InUse]
        );
        // A mounted node alone also counts as in use.
        assert_eq!(
            claim_statuses(&claim, Some(&pv), Some(&runtime(0, 1))),
            vec![ClaimStatus::InUse]
        );
        assert_eq!(
            claim_statuses(&claim, Some(&pv), None),
            vec![ClaimStatus::Available]
        );
    }

    #[test]
    fn resize_conditions_append_expanding() {
        let claim = pvc(json!({
            "metadata": {"name": "a"},
            "status": {
                "phase": "Bound",
                "conditions": [
                    {"type": "Resizing", "status": "True"},
                    {"type": "SomethingElse", "status": "True"}
                ]
            }
        }));
        assert_eq!(
            claim_statuses(&claim, Some(&bound_pv()), Some(&runtime(1, 0))),
            vec![ClaimStatus::InUse, ClaimStatus::Expanding]
        );

        let false_condition = pvc(json!({
            "metadata": {"name": "a"},
            "status": {
                "phase": "Bound",
                "conditions": [{"type": "FileSystemResizePending", "status": "False"}]
            }
        }));
        assert_eq!(
            claim_statuses(&false_condition, Some(&bound_pv()), None),
            vec![ClaimStatus::Available]
        );
    }
}
