//! Per driver volume probes and their registry.

pub mod cbs;
pub mod ceph;
pub mod exec;
pub mod manager;

pub use manager::VolumeManager;

use crate::crd::{AttachedWorkload, PersistentVolumeClaimRuntime};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A uniform view over one storage technology.
#[async_trait]
pub trait VolumeProbe: Send + Sync {
    /// Start background duties. Idempotent; most probes have none.
    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()>;

    /// Check whether `workload` may attach to the claim, given the current
    /// attachment state in `pvcr`. Pure.
    fn available(
        &self,
        workload: &AttachedWorkload,
        pvcr: &PersistentVolumeClaimRuntime,
    ) -> Result<()>;

    /// Hosts currently mounting the volume.
    async fn mounted_nodes(&self, pv: &PersistentVolume) -> Result<Vec<String>>;

    /// Bytes currently used on the backing storage.
    async fn usage(&self, pv: &PersistentVolume) -> Result<i64>;
}

/// The block access discipline shared by CephRBD and CBS: a read-write
/// attachment requires at most one replica and no other read-write attacher.
pub(crate) fn block_volume_available(
    workload: &AttachedWorkload,
    pvcr: &PersistentVolumeClaimRuntime,
) -> Result<()> {
    if workload.read_only {
        return Ok(());
    }
    if let Some(replicas) = workload.replicas {
        if replicas > 1 {
            return Err(Error::VolumeNotAvailable {
                message: format!(
                    "CephRBD volume cannot be mounted as ReadWrite mode by workloads with {replicas} replicas"
                ),
            });
        }
    }
    if pvcr.spec.workloads.iter().any(|attached| !attached.read_only) {
        return Err(Error::VolumeNotAvailable {
            message: "CephRBD volume cannot be mounted as ReadWrite mode by more than one workload"
                .to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::WorkloadReference;

    fn workload(read_only: bool, replicas: Option<i32>) -> AttachedWorkload {
        AttachedWorkload {
            reference: WorkloadReference {
                api_version: "apps/v1".into(),
                kind: "Deployment".into(),
                namespace: "ns1".into(),
                name: "web".into(),
                uid: "u".into(),
            },
            read_only,
            replicas,
            timestamp: None,
        }
    }

    fn pvcr_with(workloads: Vec<AttachedWorkload>) -> PersistentVolumeClaimRuntime {
        let mut pvcr = PersistentVolumeClaimRuntime::new("a", Default::default());
        pvcr.spec.workloads = workloads;
        pvcr
    }

    #[test]
    fn read_only_attachments_always_pass() {
        let pvcr = pvcr_with(vec![workload(false, Some(1))]);
        assert!(block_volume_available(&workload(true, Some(5)), &pvcr).is_ok());
    }

    #[test]
    fn read_write_needs_at_most_one_replica() {
        let pvcr = pvcr_with(vec![]);
        let error = block_volume_available(&workload(false, Some(2)), &pvcr).unwrap_err();
        assert_eq!(
            error.to_string(),
            "CephRBD volume cannot be mounted as ReadWrite mode by workloads with 2 replicas"
        );
        // Unknown replica counts are given the benefit of the doubt.
        assert!(block_volume_available(&workload(false, None), &pvcr).is_ok());
        assert!(block_volume_available(&workload(false, Some(1)), &pvcr).is_ok());
    }

    #[test]
    fn read_write_rejects_a_second_writer() {
        let pvcr = pvcr_with(vec![workload(false, Some(1))]);
        let error = block_volume_available(&workload(false, Some(1)), &pvcr).unwrap_err();
        assert_eq!(
            error.to_string(),
            "CephRBD volume cannot be mounted as ReadWrite mode by more than one workload"
        );

        let readers = pvcr_with(vec![workload(true, Some(1))]);
        assert!(block_volume_available(&workload(false, Some(1)), &readers).is_ok());
    }
}
