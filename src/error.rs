use snafu::Snafu;

/// Errors generated while reconciling claim runtimes or admitting workloads.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Kubernetes client error: {}", source))]
    /// k8s client error
    Kube { source: kube::Error },

    #[snafu(display("claim {}/{} is not known yet", namespace, name))]
    ClaimNotFound { namespace: String, name: String },

    #[snafu(display("claim runtime {}/{} is not known yet", namespace, name))]
    RuntimeNotFound { namespace: String, name: String },

    #[snafu(display("volume is still creating"))]
    VolumeCreating {},

    #[snafu(display("not a CSI volume"))]
    NotCsiVolume {},

    #[snafu(display("unsupported volume type: {}", driver))]
    UnsupportedVolumeType { driver: String },

    #[snafu(display("volume attribute {} is missing on volume {}", key, volume))]
    MissingVolumeAttribute { key: String, volume: String },

    #[snafu(display("{}", message))]
    /// Access-mode conflicts surfaced to the admission caller.
    VolumeNotAvailable { message: String },

    /// Sentinel for objects the admission gate does not track, such as
    /// workloads owned by another controller.
    #[snafu(display("Irrelevant workload"))]
    IrrelevantWorkload {},

    #[snafu(display("no available admitor for {}/{}, Kind={}", group, version, kind))]
    NoAdmitor {
        group: String,
        version: String,
        kind: String,
    },

    #[snafu(display("decode {} failed: {}", kind, source))]
    DecodeWorkload {
        kind: &'static str,
        source: serde_json::Error,
    },

    #[snafu(display("admission request carries no {} payload", kind))]
    MissingObject { kind: &'static str },

    #[snafu(display("execute command({}) failed: {}, exit code {:?}", command, stderr, code))]
    CommandFailed {
        command: String,
        stderr: String,
        code: Option<i32>,
    },

    #[snafu(display("execute command({}) timeout", command))]
    CommandTimeout { command: String },

    #[snafu(display("spawn command({}) failed: {}", command, source))]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },

    #[snafu(display("parse output of command({}) failed: {}", command, message))]
    CommandOutput { command: String, message: String },

    #[snafu(display("invalid object key: {}", key))]
    InvalidKey { key: String },

    #[snafu(display("wait for {} cache sync failed", resource))]
    CacheSync { resource: &'static str },

    #[snafu(display("read file {} failed: {}", path, source))]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("filesystem operation on {} failed: {}", path, source))]
    Filesystem {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("load TLS configuration failed: {}", message))]
    TlsConfig { message: String },

    #[snafu(display("webhook server error: {}", source))]
    WebhookServer { source: std::io::Error },

    #[snafu(display("lost the {} leader lease", lease))]
    LeaseLost { lease: String },
}

impl From<kube::Error> for Error {
    fn from(source: kube::Error) -> Self {
        Self::Kube { source }
    }
}

impl Error {
    /// Map an error to the (code, reason) pair carried by a denied admission
    /// response. Conflicts and malformed requests are client errors; anything
    /// else is reported as an internal error, matching the apiserver's own
    /// status conventions.
    pub fn admission_status(&self) -> (u16, &'static str) {
        match self {
            Error::VolumeNotAvailable { .. }
            | Error::NotCsiVolume {}
            | Error::UnsupportedVolumeType { .. }
            | Error::MissingVolumeAttribute { .. }
            | Error::VolumeCreating {} => (400, "BadRequest"),
            Error::ClaimNotFound { .. } | Error::RuntimeNotFound { .. } => (404, "NotFound"),
            Error::Kube {
                source: kube::Error::Api(response),
            } => (response.code, "InternalError"),
            _ => (500, "InternalError"),
        }
    }

    /// True for upstream 404s, which controllers treat as "nothing to do".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(response),
            } if response.code == 404
        )
    }
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
