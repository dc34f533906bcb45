//! Usage collector: refreshes the used-bytes figure of every claim runtime
//! from the volume probes.

use crate::controller::Updater;
use crate::crd::PersistentVolumeClaimRuntime;
use crate::error::Result;
use crate::volume::VolumeManager;
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const USAGE_SYNC_INTERVAL: Duration = Duration::from_secs(60);

pub struct UsageCollector {
    volume_manager: Arc<VolumeManager>,
}

impl UsageCollector {
    pub fn new(volume_manager: Arc<VolumeManager>) -> Self {
        Self { volume_manager }
    }
}

#[async_trait]
impl Updater for UsageCollector {
    async fn update(
        &self,
        pvcr: &PersistentVolumeClaimRuntime,
    ) -> Result<Option<PersistentVolumeClaimRuntime>> {
        let namespace = pvcr.namespace().unwrap_or_default();
        let usage = self
            .volume_manager
            .usage(&namespace, &pvcr.name_any())
            .await?;
        if usage == pvcr.spec.usage_bytes {
            return Ok(None);
        }
        info!(
            namespace,
            name = pvcr.name_any(),
            old = pvcr.spec.usage_bytes,
            new = usage,
            "usage bytes changed"
        );

        let mut updated = pvcr.clone();
        updated.spec.usage_bytes = usage;
        Ok(Some(updated))
    }
}
