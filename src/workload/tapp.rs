//! Adapter for the TApp multi-template workload. TApp is a vendor CRD, so
//! the type is declared locally and the adapter is only wired up when API
//! discovery reports the group.

use crate::crd::WorkloadReference;
use crate::error::{Error, Result};
use crate::workload::{
    created_by_controller, decode_object, extract_volumes, released_volumes, AdmittedWorkload,
    VolumeInfo, WorkloadAdapter,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use kube::core::admission::{AdmissionRequest, Operation};
use kube::core::DynamicObject;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

pub const TAPP_GROUP: &str = "tkestack.io";
pub const TAPP_KIND: &str = "TApp";

/// Aggregate states in which a TApp no longer runs any instance.
const COMPLETED_TAPP_STATUSES: [&str; 3] = ["Succ", "Failed", "Killed"];

/// Spec of the TApp workload: a default pod template plus a pool of named
/// templates, with `templates` assigning instances to pool entries.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, Clone, JsonSchema)]
#[kube(
    group = "tkestack.io",
    version = "v1",
    kind = "TApp",
    plural = "tapps",
    namespaced,
    status = "TAppStatus",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct TAppSpec {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub template: PodTemplateSpec,
    #[serde(default)]
    pub template_pool: HashMap<String, PodTemplateSpec>,
    /// Instance id to template pool name.
    #[serde(default)]
    pub templates: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TAppStatus {
    #[serde(default)]
    pub app_status: String,
}

/// True once the cluster serves the TApp group.
pub async fn supported(client: &Client) -> Result<bool> {
    let groups = client.list_api_groups().await?;
    let found = groups
        .groups
        .iter()
        .any(|group| group.name == TAPP_GROUP);
    if !found {
        warn!("TApp is not served by this cluster, its admitor stays disabled");
    }
    Ok(found)
}

/// The distinct pod specs a TApp can run: every referenced pool template,
/// plus the default template when more instances exist than template
/// assignments.
fn tapp_pod_specs(tapp: &TApp) -> Vec<&PodSpec> {
    let names: BTreeSet<&String> = tapp.spec.templates.values().collect();
    let mut specs: Vec<&PodSpec> = names
        .into_iter()
        .filter_map(|name| tapp.spec.template_pool.get(name))
        .filter_map(|template| template.spec.as_ref())
        .collect();
    if (tapp.spec.templates.len() as i32) < tapp.spec.replicas {
        // Some instances run the default template.
        if let Some(spec) = tapp.spec.template.spec.as_ref() {
            specs.push(spec);
        }
    }
    specs
}

fn tapp_completed(tapp: &TApp) -> bool {
    tapp.status
        .as_ref()
        .map(|status| COMPLETED_TAPP_STATUSES.contains(&status.app_status.as_str()))
        .unwrap_or(false)
}

fn admit_tapp(request: &AdmissionRequest<DynamicObject>) -> Result<AdmittedWorkload> {
    let tapp: TApp = decode_object(TAPP_KIND, request.object.as_ref())?;

    if created_by_controller(&tapp) {
        return Err(Error::IrrelevantWorkload {});
    }

    let mut used: Vec<VolumeInfo> = vec![];
    for spec in tapp_pod_specs(&tapp) {
        used.extend(extract_volumes(Some(spec)));
    }

    let mut released = vec![];
    if request.operation == Operation::Update {
        let old: TApp = decode_object(TAPP_KIND, request.old_object.as_ref())?;
        if tapp_completed(&tapp) {
            // The tapp is done; everything it used goes back.
            released = tapp_pod_specs(&old)
                .into_iter()
                .flat_map(|spec| extract_volumes(Some(spec)))
                .collect();
            used = vec![];
        } else {
            released = released_volumes(&used, tapp_pod_specs(&old).into_iter().map(Some));
        }
    }

    let reference = WorkloadReference {
        api_version: format!("{TAPP_GROUP}/v1"),
        kind: TAPP_KIND.to_string(),
        namespace: tapp.namespace().unwrap_or_default(),
        name: tapp.name_any(),
        uid: tapp.uid().unwrap_or_default(),
    };
    debug!(workload = %reference, "processed tapp");
    Ok(AdmittedWorkload {
        reference,
        replicas: Some(1),
        used,
        released,
    })
}

pub struct TAppAdapter {
    store: Store<TApp>,
}

impl TAppAdapter {
    pub fn new(store: Store<TApp>) -> Self {
        Self { store }
    }

    fn lookup(&self, reference: &WorkloadReference) -> Option<std::sync::Arc<TApp>> {
        self.store
            .get(&ObjectRef::new(&reference.name).within(&reference.namespace))
    }
}

#[async_trait]
impl WorkloadAdapter for TAppAdapter {
    async fn handle(&self, request: &AdmissionRequest<DynamicObject>) -> Result<AdmittedWorkload> {
        admit_tapp(request)
    }

    async fn mounted_volumes(&self, reference: &WorkloadReference) -> Result<Vec<VolumeInfo>> {
        let Some(tapp) = self.lookup(reference) else {
            debug!(workload = %reference, "tapp does not exist");
            return Ok(vec![]);
        };
        if tapp_completed(&tapp) {
            debug!(workload = %reference, "tapp is already completed");
            return Ok(vec![]);
        }
        Ok(tapp_pod_specs(&tapp)
            .into_iter()
            .flat_map(|spec| extract_volumes(Some(spec)))
            .collect())
    }

    async fn exist(&self, reference: &WorkloadReference) -> Result<bool> {
        Ok(self.lookup(reference).is_some())
    }
}
