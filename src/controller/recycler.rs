//! Workload recycler: prunes attached workloads whose object no longer
//! exists, so deleted or completed workloads eventually release their claims.

use crate::controller::{refresh_idle_status, Updater};
use crate::crd::{AttachedWorkload, PersistentVolumeClaimRuntime};
use crate::error::Result;
use crate::workload::WorkloadDispatcher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub const RECYCLE_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// A workload just admitted may not have reached the caches yet; entries
/// younger than this are never pruned.
const WORKLOAD_CHECK_GRACE_SECONDS: i64 = 10;

pub struct WorkloadRecycler {
    workloads: Arc<WorkloadDispatcher>,
}

impl WorkloadRecycler {
    pub fn new(workloads: Arc<WorkloadDispatcher>) -> Self {
        Self { workloads }
    }

    async fn keep(&self, workload: &AttachedWorkload, now: DateTime<Utc>) -> bool {
        let exists = match self.workloads.exist(&workload.reference).await {
            Ok(exists) => exists,
            Err(error) => {
                error!(
                    workload = %workload.reference,
                    %error,
                    "cannot determine whether workload exists, keeping it"
                );
                true
            }
        };
        exists || in_grace_window(workload, now)
    }
}

fn in_grace_window(workload: &AttachedWorkload, now: DateTime<Utc>) -> bool {
    workload
        .timestamp
        .map(|attached| attached + chrono::Duration::seconds(WORKLOAD_CHECK_GRACE_SECONDS) > now)
        .unwrap_or(false)
}

#[async_trait]
impl Updater for WorkloadRecycler {
    async fn update(
        &self,
        pvcr: &PersistentVolumeClaimRuntime,
    ) -> Result<Option<PersistentVolumeClaimRuntime>> {
        let now = Utc::now();
        let mut kept = Vec::with_capacity(pvcr.spec.workloads.len());
        for workload in &pvcr.spec.workloads {
            if self.keep(workload, now).await {
                kept.push(workload.clone());
            }
        }

        if kept.len() == pvcr.spec.workloads.len() {
            return Ok(None);
        }
        info!(
            namespace = pvcr.namespace().unwrap_or_default(),
            name = pvcr.name_any(),
            before = pvcr.spec.workloads.len(),
            after = kept.len(),
            "pruned vanished workloads"
        );

        let mut updated = pvcr.clone();
        updated.spec.workloads = kept;
        refresh_idle_status(&mut updated);
        Ok(Some(updated))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::WorkloadReference;

    fn workload(age_seconds: i64) -> AttachedWorkload {
        AttachedWorkload {
            reference: WorkloadReference::default(),
            read_only: false,
            replicas: Some(1),
            timestamp: Some(Utc::now() - chrono::Duration::seconds(age_seconds)),
        }
    }

    #[test]
    fn young_entries_stay_in_the_grace_window() {
        let now = Utc::now();
        assert!(in_grace_window(&workload(5), now));
        assert!(!in_grace_window(&workload(15), now));
    }

    #[test]
    fn entries_without_a_timestamp_have_no_grace() {
        let mut entry = workload(0);
        entry.timestamp = None;
        assert!(!in_grace_window(&entry, Utc::now()));
    }
}
