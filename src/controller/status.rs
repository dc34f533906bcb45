//! The status mirror: creates a claim runtime for every claim and keeps the
//! status list in step with the claim's phase. Driven by PVC watch events
//! rather than a timer.

use crate::cache::{namespaced_ref, split_key};
use crate::crd::{PersistentVolumeClaimRuntime, PersistentVolumeClaimRuntimeSpec};
use crate::error::Result;
use crate::queue::WorkQueue;
use crate::volume::VolumeManager;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::PostParams;
use kube::runtime::reflector::Store;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct StatusMirror {
    volume_manager: Arc<VolumeManager>,
    pvc_store: Store<PersistentVolumeClaim>,
    pvcr_store: Store<PersistentVolumeClaimRuntime>,
    client: Client,
    queue: Arc<WorkQueue>,
}

impl StatusMirror {
    pub fn new(
        volume_manager: Arc<VolumeManager>,
        pvc_store: Store<PersistentVolumeClaim>,
        pvcr_store: Store<PersistentVolumeClaimRuntime>,
        client: Client,
        queue: Arc<WorkQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            volume_manager,
            pvc_store,
            pvcr_store,
            client,
            queue,
        })
    }

    pub fn run(self: Arc<Self>, workers: usize, cancel: &CancellationToken) {
        for _ in 0..workers {
            let mirror = Arc::clone(&self);
            let worker_cancel = cancel.clone();
            tokio::spawn(async move {
                while let Some(key) = mirror.queue.next(&worker_cancel).await {
                    mirror.process(&key).await;
                    mirror.queue.done(&key);
                }
            });
        }
        info!("PVC runtime status mirror started");
    }

    async fn process(&self, key: &str) {
        match self.sync_claim(key).await {
            Ok(()) => self.queue.forget(key),
            // The claim vanished mid-flight; the next PVC event re-queues it.
            Err(error) if error.is_not_found() => self.queue.forget(key),
            Err(error) => {
                error!(key, %error, "sync claim failed");
                self.queue.requeue_rate_limited(key);
            }
        }
    }

    async fn sync_claim(&self, key: &str) -> Result<()> {
        debug!(key, "started PVC processing");
        let (namespace, name) = split_key(key)?;

        let Some(pvc) = self.pvc_store.get(&namespaced_ref(namespace, name)) else {
            debug!(key, "PVC deleted, skip it");
            return Ok(());
        };

        match self.pvcr_store.get(&namespaced_ref(namespace, name)) {
            None => self.create_runtime(&pvc).await,
            Some(pvcr) => self.update_statuses(&pvc, &pvcr).await,
        }
    }

    /// First sighting of a claim: create its runtime with computed statuses
    /// and an owner reference back to the claim, so deletion cascades.
    async fn create_runtime(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        let namespace = pvc.namespace().unwrap_or_default();
        let statuses = self.volume_manager.status(&namespace, &pvc.name_any())?;

        let mut pvcr = PersistentVolumeClaimRuntime::new(
            &pvc.name_any(),
            PersistentVolumeClaimRuntimeSpec {
                statuses,
                ..Default::default()
            },
        );
        pvcr.metadata.namespace = Some(namespace.clone());
        pvcr.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".to_string(),
            kind: "PersistentVolumeClaim".to_string(),
            name: pvc.name_any(),
            uid: pvc.uid().unwrap_or_default(),
            ..Default::default()
        }]);

        let api: Api<PersistentVolumeClaimRuntime> =
            Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), &pvcr).await?;
        info!(namespace, name = pvc.name_any(), "created PVC runtime");
        Ok(())
    }

    /// Refresh only the status list, leaving the other runtime facts to
    /// their own controllers.
    async fn update_statuses(
        &self,
        pvc: &PersistentVolumeClaim,
        pvcr: &PersistentVolumeClaimRuntime,
    ) -> Result<()> {
        let namespace = pvc.namespace().unwrap_or_default();
        let statuses = self.volume_manager.status(&namespace, &pvc.name_any())?;
        if statuses == pvcr.spec.statuses {
            return Ok(());
        }

        let mut updated = pvcr.clone();
        updated.spec.statuses = statuses;
        let api: Api<PersistentVolumeClaimRuntime> =
            Api::namespaced(self.client.clone(), &namespace);
        api.replace(&pvc.name_any(), &PostParams::default(), &updated)
            .await?;
        Ok(())
    }
}
