//! Command line configuration of the decorator daemon.

use clap::Parser;
use std::path::PathBuf;

/// Volume driver identifier for CephRBD block volumes.
pub const CEPH_RBD: &str = "cephrbd";
/// Volume driver identifier for CephFS shared filesystems.
pub const CEPH_FS: &str = "cephfs";
/// Volume driver identifier for Tencent CBS block volumes.
pub const TENCENT_CBS: &str = "tencentcbs";

/// The RBD command used to measure image usage.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RbdUsageMethod {
    /// `rbd du`, fast on fast-diff images.
    Du,
    /// `rbd diff`, summing extent lengths.
    Diff,
}

impl std::fmt::Display for RbdUsageMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RbdUsageMethod::Du => write!(f, "du"),
            RbdUsageMethod::Diff => write!(f, "diff"),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "volume-decorator", version, about)]
pub struct Config {
    /// The bind address of the admission webhook server (HTTPS).
    #[arg(long, env = "BIND_ADDRESS", default_value = "[::]:443")]
    pub bind: String,

    /// Worker tasks per controller.
    #[arg(long, env = "WORKERS", default_value_t = 10)]
    pub workers: usize,

    /// Create or update the PersistentVolumeClaimRuntime CRD on startup.
    #[arg(long)]
    pub create_crd: bool,

    /// Enable leader election.
    #[arg(long)]
    pub leader_election: bool,

    /// Namespace where the leader election resource lives.
    #[arg(long, default_value = "kube-system")]
    pub leader_election_namespace: String,

    #[command(flatten)]
    pub webhook: WebhookConfig,

    #[command(flatten)]
    pub volumes: VolumeConfig,
}

/// Admission webhook settings.
#[derive(clap::Args, Debug, Clone)]
pub struct WebhookConfig {
    /// Enable workload admission.
    #[arg(long)]
    pub workload_admission: bool,

    /// Name of the webhook.
    #[arg(long, default_value = "volume-decorator")]
    pub webhook_name: String,

    /// Path of the workload webhook.
    #[arg(long, default_value = "/storage/workload")]
    pub workload_webhook_path: String,

    /// File containing the x509 certificate for HTTPS.
    #[arg(long)]
    pub tls_cert_file: Option<PathBuf>,

    /// File containing the x509 private key matching --tls-cert-file.
    #[arg(long)]
    pub tls_private_key_file: Option<PathBuf>,

    /// File containing the certificate authority bundled into the webhook
    /// registration.
    #[arg(long)]
    pub client_ca_file: Option<PathBuf>,

    /// URL of the webhook service, used when the service runs out of cluster.
    #[arg(long)]
    pub webhook_url: Option<String>,

    /// Name of the webhook service, used when the service runs in cluster.
    #[arg(long, default_value = "volume-decorator")]
    pub service_name: String,

    /// Namespace of the webhook service.
    #[arg(long, default_value = "kube-system")]
    pub service_namespace: String,
}

/// Settings of the concrete volume drivers.
#[derive(clap::Args, Debug, Clone)]
pub struct VolumeConfig {
    /// Volume types the cluster supports.
    #[arg(long, value_delimiter = ',', default_value = "cephrbd,cephfs")]
    pub volume_types: Vec<String>,

    /// How CephRBD usage is measured: `du` needs fast-diff enabled images,
    /// `diff` works everywhere but walks the whole image.
    #[arg(long, value_enum, default_value_t = RbdUsageMethod::Du)]
    pub rbd_usage_method: RbdUsageMethod,

    /// Path of the ceph config file.
    #[arg(long, default_value = "/etc/ceph/ceph.conf")]
    pub ceph_config_file: String,

    /// Path of the ceph admin keyring file.
    #[arg(long, default_value = "/etc/ceph/ceph.client.admin.keyring")]
    pub ceph_keyring_file: String,

    /// Period between two consecutive mds session list operations.
    #[arg(long, default_value = "30s")]
    pub ceph_mds_session_list_period: humantime::Duration,

    /// Path of the cephfs root dir.
    #[arg(long, default_value = "/")]
    pub cephfs_root_path: String,

    /// Local path to mount the cephfs root dir.
    #[arg(long, default_value = "/tmp/cephfs-root")]
    pub cephfs_root_mount_path: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::parse_from(["volume-decorator"]);
        assert_eq!(config.workers, 10);
        assert_eq!(config.volumes.volume_types, vec![CEPH_RBD, CEPH_FS]);
        assert_eq!(config.webhook.workload_webhook_path, "/storage/workload");
        assert!(!config.leader_election);
    }

    #[test]
    fn volume_types_split_on_commas() {
        let config =
            Config::parse_from(["volume-decorator", "--volume-types", "cephrbd,tencentcbs"]);
        assert_eq!(config.volumes.volume_types, vec![CEPH_RBD, TENCENT_CBS]);
        let period: std::time::Duration = config.volumes.ceph_mds_session_list_period.into();
        assert_eq!(period.as_secs(), 30);
    }
}
