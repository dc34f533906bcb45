//! The `PersistentVolumeClaimRuntime` custom resource: a per-claim companion
//! object carrying the runtime facts the builtin storage API does not track.

use crate::error::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{api::PostParams, Api, Client, CustomResource, CustomResourceExt, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Lifecycle status of a claim. A claim may hold more than one status at a
/// time, e.g. an `InUse` volume may also be `Expanding`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, JsonSchema)]
pub enum ClaimStatus {
    /// The status cannot be determined.
    Unknown,
    /// The backing volume is still being provisioned.
    Creating,
    /// The claim is being expanded.
    Expanding,
    /// The claim is bound and no workload uses it.
    Available,
    /// The claim is mounted by at least one workload or node.
    InUse,
    /// The backing volume is gone.
    Lost,
    /// The claim is being deleted.
    Deleting,
}

/// Reference to a workload object. Two references identify the same attacher
/// when apiVersion, kind, namespace and name all match; the uid is carried for
/// bookkeeping but deliberately ignored, so a workload recreated under the
/// same name is still the same attacher.
#[derive(Serialize, Deserialize, Default, Debug, Clone, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReference {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

impl WorkloadReference {
    /// True if both references point at the same attacher.
    pub fn same_attacher(&self, other: &WorkloadReference) -> bool {
        self.api_version == other.api_version
            && self.kind == other.kind
            && self.namespace == other.namespace
            && self.name == other.name
    }

    /// Split the apiVersion into its (group, version) halves.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl std::fmt::Display for WorkloadReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}, Kind={} {}/{}",
            self.group_version().0,
            self.group_version().1,
            self.kind,
            self.namespace,
            self.name
        )
    }
}

/// A workload currently attached to a claim.
#[derive(Serialize, Deserialize, Default, Debug, Clone, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttachedWorkload {
    #[serde(flatten)]
    pub reference: WorkloadReference,
    /// The workload mounts the volume read only.
    #[serde(default)]
    pub read_only: bool,
    /// Replica count, absent when it cannot be determined (DaemonSet).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// When the workload was attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// The runtime information of a PVC/PV pair.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, Clone, Eq, PartialEq, JsonSchema)]
#[kube(
    group = "storage.tkestack.io",
    version = "v1",
    kind = "PersistentVolumeClaimRuntime",
    plural = "persistentvolumeclaimruntimes",
    singular = "persistentvolumeclaimruntime",
    namespaced,
    derive = "PartialEq",
    derive = "Default",
    shortname = "pvcr",
    shortname = "pvcrs",
    printcolumn = r#"{ "name":"statuses", "type":"string", "description":"claim statuses", "jsonPath":".spec.statuses"}"#,
    printcolumn = r#"{ "name":"usage", "type":"integer", "format":"int64", "description":"used bytes", "jsonPath":".spec.usageBytes"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimRuntimeSpec {
    /// Current statuses of the claim, a set serialised as a list.
    #[serde(default)]
    pub statuses: Vec<ClaimStatus>,
    /// Workloads the volume is mounted by.
    #[serde(default)]
    pub workloads: Vec<AttachedWorkload>,
    /// Current usage in bytes, 0 if unknown.
    #[serde(default)]
    pub usage_bytes: i64,
    /// Nodes which mount this volume.
    #[serde(default)]
    pub mounted_nodes: Vec<String>,
}

/// Create the PVCR definition, or bring a stored definition back to the
/// desired shape if someone changed it.
pub async fn ensure_crd(client: &Client) -> Result<()> {
    let desired = PersistentVolumeClaimRuntime::crd();
    let api = Api::<CustomResourceDefinition>::all(client.clone());

    match api.get_opt(&desired.name_any()).await? {
        None => {
            api.create(&PostParams::default(), &desired).await?;
            info!(crd = desired.name_any(), "CRD created");
        }
        Some(stored) => {
            if serde_json::to_value(&stored.spec).ok() == serde_json::to_value(&desired.spec).ok() {
                info!("CRD is already created, no need to update it");
                return Ok(());
            }
            let mut updated = stored.clone();
            updated.spec = desired.spec;
            api.replace(&stored.name_any(), &PostParams::default(), &updated)
                .await?;
            info!(crd = stored.name_any(), "CRD updated");
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn statuses_serialise_as_plain_strings() {
        let statuses = vec![ClaimStatus::InUse, ClaimStatus::Expanding];
        assert_eq!(
            serde_json::to_value(&statuses).unwrap(),
            serde_json::json!(["InUse", "Expanding"])
        );
    }

    #[test]
    fn workload_reference_ignores_uid_for_identity() {
        let mut a = WorkloadReference {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            namespace: "ns1".into(),
            name: "web".into(),
            uid: "uid-1".into(),
        };
        let mut b = a.clone();
        b.uid = "uid-2".into();
        assert!(a.same_attacher(&b));

        b.name = "db".into();
        assert!(!a.same_attacher(&b));

        a.api_version = "v1".into();
        assert_eq!(a.group_version(), ("", "v1"));
    }

    #[test]
    fn crd_names_and_scope() {
        let crd = PersistentVolumeClaimRuntime::crd();
        assert_eq!(crd.spec.group, "storage.tkestack.io");
        assert_eq!(crd.spec.names.plural, "persistentvolumeclaimruntimes");
        assert_eq!(
            crd.spec.names.short_names,
            Some(vec!["pvcr".to_string(), "pvcrs".to_string()])
        );
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn attached_workload_flattens_its_reference() {
        let workload = AttachedWorkload {
            reference: WorkloadReference {
                api_version: "batch/v1".into(),
                kind: "Job".into(),
                namespace: "ns1".into(),
                name: "import".into(),
                uid: "u".into(),
            },
            read_only: true,
            replicas: Some(2),
            timestamp: None,
        };
        let value = serde_json::to_value(&workload).unwrap();
        assert_eq!(value["kind"], "Job");
        assert_eq!(value["readOnly"], true);
        assert_eq!(value["replicas"], 2);
    }
}
