//! Mounted-nodes collector: refreshes the node list of every claim runtime
//! from the volume probes.

use crate::controller::{refresh_idle_status, same_node_set, Updater};
use crate::crd::PersistentVolumeClaimRuntime;
use crate::error::Result;
use crate::volume::VolumeManager;
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const NODE_SYNC_INTERVAL: Duration = Duration::from_secs(5);

pub struct MountedNodesCollector {
    volume_manager: Arc<VolumeManager>,
}

impl MountedNodesCollector {
    pub fn new(volume_manager: Arc<VolumeManager>) -> Self {
        Self { volume_manager }
    }
}

#[async_trait]
impl Updater for MountedNodesCollector {
    async fn update(
        &self,
        pvcr: &PersistentVolumeClaimRuntime,
    ) -> Result<Option<PersistentVolumeClaimRuntime>> {
        let namespace = pvcr.namespace().unwrap_or_default();
        let nodes = self
            .volume_manager
            .mounted_nodes(&namespace, &pvcr.name_any())
            .await?;
        if same_node_set(&nodes, &pvcr.spec.mounted_nodes) {
            return Ok(None);
        }
        info!(
            namespace,
            name = pvcr.name_any(),
            old = ?pvcr.spec.mounted_nodes,
            new = ?nodes,
            "mounted nodes changed"
        );

        let mut updated = pvcr.clone();
        updated.spec.mounted_nodes = nodes;
        refresh_idle_status(&mut updated);
        Ok(Some(updated))
    }
}
