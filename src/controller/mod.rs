//! The reconciliation loops keeping claim runtimes in sync, and the shared
//! framework they run on: a ticker that re-queues every known key, a rate
//! limited queue, and a pool of workers applying an updater to each PVCR.

pub mod nodes;
pub mod recycler;
pub mod status;
pub mod usage;

use crate::cache::{namespaced_ref, object_key, split_key};
use crate::crd::{ClaimStatus, PersistentVolumeClaimRuntime};
use crate::error::Result;
use crate::queue::WorkQueue;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::PostParams;
use kube::runtime::reflector::Store;
use kube::{Api, Client};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One periodic pass over a claim runtime. Returning `None` means nothing
/// changed and no write happens.
#[async_trait]
pub trait Updater: Send + Sync + 'static {
    async fn update(
        &self,
        pvcr: &PersistentVolumeClaimRuntime,
    ) -> Result<Option<PersistentVolumeClaimRuntime>>;
}

/// Which object set a controller re-queues on every tick.
pub enum Resync {
    /// Every PVC key, for the collectors that follow claims.
    Claims(Store<PersistentVolumeClaim>),
    /// Every PVCR key, for the recycler.
    Runtimes,
}

/// The shared reconcile loop.
pub struct Controller<U> {
    name: &'static str,
    updater: Arc<U>,
    sync_interval: Duration,
    resync: Resync,
    pvcr_store: Store<PersistentVolumeClaimRuntime>,
    client: Client,
    queue: Arc<WorkQueue>,
}

impl<U: Updater> Controller<U> {
    pub fn new(
        name: &'static str,
        updater: U,
        sync_interval: Duration,
        resync: Resync,
        pvcr_store: Store<PersistentVolumeClaimRuntime>,
        client: Client,
    ) -> Self {
        Self {
            name,
            updater: Arc::new(updater),
            sync_interval,
            resync,
            pvcr_store,
            client,
            queue: WorkQueue::new(name),
        }
    }

    /// Start the resync ticker and `workers` worker tasks.
    pub fn run(self: Arc<Self>, workers: usize, cancel: &CancellationToken) {
        let ticker = Arc::clone(&self);
        let ticker_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ticker.sync_interval);
            loop {
                tokio::select! {
                    _ = ticker_cancel.cancelled() => break,
                    _ = interval.tick() => ticker.resync(),
                }
            }
        });

        for _ in 0..workers {
            let worker = Arc::clone(&self);
            let worker_cancel = cancel.clone();
            tokio::spawn(async move {
                while let Some(key) = worker.queue.next(&worker_cancel).await {
                    worker.process(&key).await;
                    worker.queue.done(&key);
                }
            });
        }
        info!("{} started", self.name);
    }

    fn resync(&self) {
        match &self.resync {
            Resync::Claims(pvc_store) => {
                for pvc in pvc_store.state() {
                    self.queue.add(&object_key(pvc.as_ref()));
                }
            }
            Resync::Runtimes => {
                for pvcr in self.pvcr_store.state() {
                    self.queue.add(&object_key(pvcr.as_ref()));
                }
            }
        }
    }

    async fn process(&self, key: &str) {
        match self.sync_key(key).await {
            Ok(()) => self.queue.forget(key),
            // The runtime vanished mid-flight; the work is done.
            Err(error) if error.is_not_found() => self.queue.forget(key),
            Err(error) => {
                error!(controller = self.name, key, %error, "sync failed");
                self.queue.requeue_rate_limited(key);
            }
        }
    }

    async fn sync_key(&self, key: &str) -> Result<()> {
        debug!(controller = self.name, key, "start to process PVC runtime");
        let (namespace, name) = split_key(key)?;

        // Gone from the cache means the work is already done.
        let Some(pvcr) = self.pvcr_store.get(&namespaced_ref(namespace, name)) else {
            return Ok(());
        };

        let Some(updated) = self.updater.update(&pvcr).await? else {
            return Ok(());
        };

        let api: Api<PersistentVolumeClaimRuntime> =
            Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), &updated).await?;
        Ok(())
    }
}

/// Remove every `old` entry; append `new` unless already present.
pub(crate) fn replace_status(
    statuses: &[ClaimStatus],
    old: ClaimStatus,
    new: ClaimStatus,
) -> Vec<ClaimStatus> {
    let mut replaced = Vec::with_capacity(statuses.len());
    let mut new_exists = false;
    for status in statuses {
        if *status == old {
            continue;
        }
        replaced.push(*status);
        if *status == new {
            new_exists = true;
        }
    }
    if !new_exists {
        replaced.push(new);
    }
    replaced
}

/// The InUse/Available flip: once nothing mounts the claim any more, swap
/// `InUse` for `Available`.
pub(crate) fn refresh_idle_status(pvcr: &mut PersistentVolumeClaimRuntime) {
    if pvcr.spec.workloads.is_empty() && pvcr.spec.mounted_nodes.is_empty() {
        pvcr.spec.statuses =
            replace_status(&pvcr.spec.statuses, ClaimStatus::InUse, ClaimStatus::Available);
    }
}

/// Set equality of two node lists.
pub(crate) fn same_node_set(left: &[String], right: &[String]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let set: HashSet<&str> = left.iter().map(String::as_str).collect();
    right.iter().all(|node| set.contains(node.as_str()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replace_drops_old_and_appends_new_once() {
        let statuses = [ClaimStatus::InUse, ClaimStatus::Expanding, ClaimStatus::InUse];
        assert_eq!(
            replace_status(&statuses, ClaimStatus::InUse, ClaimStatus::Available),
            vec![ClaimStatus::Expanding, ClaimStatus::Available]
        );

        let already = [ClaimStatus::Available, ClaimStatus::Expanding];
        assert_eq!(
            replace_status(&already, ClaimStatus::InUse, ClaimStatus::Available),
            vec![ClaimStatus::Available, ClaimStatus::Expanding]
        );
    }

    #[test]
    fn idle_flip_is_a_fixed_point() {
        let mut pvcr = PersistentVolumeClaimRuntime::new("a", Default::default());
        pvcr.spec.statuses = vec![ClaimStatus::InUse];
        refresh_idle_status(&mut pvcr);
        assert_eq!(pvcr.spec.statuses, vec![ClaimStatus::Available]);

        // Applying it again changes nothing.
        refresh_idle_status(&mut pvcr);
        assert_eq!(pvcr.spec.statuses, vec![ClaimStatus::Available]);
    }

    #[test]
    fn busy_runtimes_keep_their_statuses() {
        let mut pvcr = PersistentVolumeClaimRuntime::new("a", Default::default());
        pvcr.spec.statuses = vec![ClaimStatus::InUse];
        pvcr.spec.mounted_nodes = vec!["n1".into()];
        refresh_idle_status(&mut pvcr);
        assert_eq!(pvcr.spec.statuses, vec![ClaimStatus::InUse]);
    }

    #[test]
    fn node_sets_compare_unordered() {
        let left = ["n1".to_string(), "n2".to_string()];
        let right = ["n2".to_string(), "n1".to_string()];
        assert!(same_node_set(&left, &right));
        assert!(!same_node_set(&left, &["n1".to_string()]));
        assert!(!same_node_set(&left, &["n1".to_string(), "n3".to_string()]));
    }
}
