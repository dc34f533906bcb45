//! Composition root: builds the clients, caches, probes, adapters and
//! controllers, then runs them until shutdown.

use crate::cache::{object_key, spawn_reflector, spawn_watch, wait_ready};
use crate::config::Config;
use crate::controller::nodes::{MountedNodesCollector, NODE_SYNC_INTERVAL};
use crate::controller::recycler::{WorkloadRecycler, RECYCLE_SYNC_INTERVAL};
use crate::controller::status::StatusMirror;
use crate::controller::usage::{UsageCollector, USAGE_SYNC_INTERVAL};
use crate::controller::{Controller, Resync};
use crate::crd::{self, PersistentVolumeClaimRuntime};
use crate::error::Result;
use crate::leader::LeaderElector;
use crate::nodes::VolumeUsageCollector;
use crate::queue::WorkQueue;
use crate::registration;
use crate::volume::VolumeManager;
use crate::webhook::{self, AdmissionGate};
use crate::workload::{tapp, WorkloadDispatcher};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use kube::{Api, Client};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run the decorator until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let client = Client::try_default().await?;

    if config.create_crd {
        crd::ensure_crd(&client).await?;
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    if config.leader_election {
        let identity = format!(
            "volume-decorator-{}",
            std::process::id()
        );
        info!(identity, "leader election enabled, campaigning");
        LeaderElector::new(
            client.clone(),
            &config.leader_election_namespace,
            identity,
        )
        .acquire_and_hold(&cancel)
        .await?;
        if cancel.is_cancelled() {
            return Ok(());
        }
    }

    run_controllers(config, client, cancel).await
}

async fn run_controllers(
    config: Config,
    client: Client,
    cancel: CancellationToken,
) -> Result<()> {
    // Caches over the claim side. PVC events also drive the status mirror.
    let status_queue = WorkQueue::new("status_updater");
    let pvc_queue = Arc::clone(&status_queue);
    let pvc_store = spawn_watch(
        Api::<PersistentVolumeClaim>::all(client.clone()),
        cancel.clone(),
        move |pvc| pvc_queue.add(&object_key(pvc)),
    );
    let pv_store = spawn_reflector(Api::<PersistentVolume>::all(client.clone()), cancel.clone());
    let pvcr_store = spawn_reflector(
        Api::<PersistentVolumeClaimRuntime>::all(client.clone()),
        cancel.clone(),
    );
    let node_store = spawn_reflector(Api::<Node>::all(client.clone()), cancel.clone());

    // Caches over the workload side.
    let deployment_store =
        spawn_reflector(Api::<Deployment>::all(client.clone()), cancel.clone());
    let replica_set_store =
        spawn_reflector(Api::<ReplicaSet>::all(client.clone()), cancel.clone());
    let stateful_set_store =
        spawn_reflector(Api::<StatefulSet>::all(client.clone()), cancel.clone());
    let daemon_set_store = spawn_reflector(Api::<DaemonSet>::all(client.clone()), cancel.clone());
    let job_store = spawn_reflector(Api::<Job>::all(client.clone()), cancel.clone());
    let tapp_store = if tapp::supported(&client).await? {
        Some(spawn_reflector(
            Api::<tapp::TApp>::all(client.clone()),
            cancel.clone(),
        ))
    } else {
        None
    };

    wait_ready(&pvc_store, "PersistentVolumeClaim").await?;
    wait_ready(&pv_store, "PersistentVolume").await?;
    wait_ready(&pvcr_store, "PersistentVolumeClaimRuntime").await?;
    wait_ready(&node_store, "Node").await?;
    wait_ready(&deployment_store, "Deployment").await?;
    wait_ready(&replica_set_store, "ReplicaSet").await?;
    wait_ready(&stateful_set_store, "StatefulSet").await?;
    wait_ready(&daemon_set_store, "DaemonSet").await?;
    wait_ready(&job_store, "Job").await?;
    if let Some(store) = &tapp_store {
        wait_ready(store, "TApp").await?;
    }
    info!("caches synced");

    let volume_manager = Arc::new(VolumeManager::new(
        &config.volumes,
        client.clone(),
        pvc_store.clone(),
        pv_store.clone(),
        pvcr_store.clone(),
    ));
    volume_manager.start(&cancel).await?;

    let workloads = Arc::new(WorkloadDispatcher::new(
        client.clone(),
        deployment_store,
        replica_set_store,
        stateful_set_store,
        daemon_set_store,
        job_store,
        tapp_store,
    ));

    // The kubelet based usage collector runs alongside the probes; see the
    // module notes on how it is meant to be consumed.
    VolumeUsageCollector::new(node_store).start(&cancel);

    StatusMirror::new(
        Arc::clone(&volume_manager),
        pvc_store.clone(),
        pvcr_store.clone(),
        client.clone(),
        status_queue,
    )
    .run(config.workers, &cancel);

    Arc::new(Controller::new(
        "node-collector",
        MountedNodesCollector::new(Arc::clone(&volume_manager)),
        NODE_SYNC_INTERVAL,
        Resync::Claims(pvc_store.clone()),
        pvcr_store.clone(),
        client.clone(),
    ))
    .run(config.workers, &cancel);

    Arc::new(Controller::new(
        "usage-collector",
        UsageCollector::new(Arc::clone(&volume_manager)),
        USAGE_SYNC_INTERVAL,
        Resync::Claims(pvc_store.clone()),
        pvcr_store.clone(),
        client.clone(),
    ))
    .run(config.workers, &cancel);

    Arc::new(Controller::new(
        "workload-recycler",
        WorkloadRecycler::new(Arc::clone(&workloads)),
        RECYCLE_SYNC_INTERVAL,
        Resync::Runtimes,
        pvcr_store.clone(),
        client.clone(),
    ))
    .run(config.workers, &cancel);

    if !config.webhook.workload_admission {
        info!("workload admission disabled");
        cancel.cancelled().await;
        return Ok(());
    }

    registration::ensure_webhook(&client, &config.webhook).await?;
    let gate = AdmissionGate::new(volume_manager, workloads);
    webhook::serve(gate, &config.bind, &config.webhook, &cancel).await
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        cancel.cancel();
    });
}
