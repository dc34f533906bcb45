//! Placeholder probe for Tencent Cloud CBS block volumes. CBS shares the
//! block access discipline but exposes no mount or usage introspection yet.

use crate::crd::{AttachedWorkload, PersistentVolumeClaimRuntime};
use crate::error::Result;
use crate::volume::{block_volume_available, VolumeProbe};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct CbsVolume {}

#[async_trait]
impl VolumeProbe for CbsVolume {
    async fn start(self: Arc<Self>, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    fn available(
        &self,
        workload: &AttachedWorkload,
        pvcr: &PersistentVolumeClaimRuntime,
    ) -> Result<()> {
        block_volume_available(workload, pvcr)
    }

    async fn mounted_nodes(&self, _pv: &PersistentVolume) -> Result<Vec<String>> {
        // TODO: query the cloud API for attachment information.
        Ok(vec![])
    }

    async fn usage(&self, _pv: &PersistentVolume) -> Result<i64> {
        Ok(0)
    }
}
