//! Probes for the two Ceph backed drivers: RBD block images and CephFS
//! shared directories.

use crate::config::{RbdUsageMethod, VolumeConfig};
use crate::crd::{AttachedWorkload, PersistentVolumeClaimRuntime};
use crate::error::{Error, Result};
use crate::volume::exec::{exec_command, exec_with_timeout, LONG_CMD_TIMEOUT};
use crate::volume::{block_volume_available, VolumeProbe};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// All provisioned CephFS volumes live under this directory, an internal of
/// the CephFS CSI driver.
const CEPHFS_VOLUMES_ROOT: &str = "/csi-volumes";

const MOUNT_RETRY_PERIOD: Duration = Duration::from_secs(10);

/// Shared pieces of the Ceph command line: config and keyring flags, RBD
/// invocation helpers.
#[derive(Clone)]
pub(crate) struct CephCommand {
    config_file: String,
    keyring_file: String,
}

impl CephCommand {
    fn new(config: &VolumeConfig) -> Self {
        Self {
            config_file: config.ceph_config_file.clone(),
            keyring_file: config.ceph_keyring_file.clone(),
        }
    }

    /// Append the config and keyring flags to `args`.
    fn with_config_args<I>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args: Vec<String> = args.into_iter().collect();
        args.push("-c".to_string());
        args.push(self.config_file.clone());
        args.push("--keyring".to_string());
        args.push(self.keyring_file.clone());
        args
    }

    async fn exec_rbd(&self, info: &RbdInfo, args: &[&str]) -> Result<Vec<u8>> {
        let args = self.with_config_args(with_pool_args(info, args));
        exec_command("rbd", &args).await
    }

    async fn exec_rbd_with_timeout(
        &self,
        info: &RbdInfo,
        timeout: Duration,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        let args = self.with_config_args(with_pool_args(info, args));
        exec_with_timeout(timeout, "rbd", &args).await
    }
}

/// Append the pool, monitor and format flags of an RBD invocation.
fn with_pool_args(info: &RbdInfo, args: &[&str]) -> Vec<String> {
    let mut full: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
    full.extend([
        "--pool".to_string(),
        info.pool.clone(),
        "-m".to_string(),
        info.monitors.clone(),
        "--format".to_string(),
        "json".to_string(),
    ]);
    full
}

/// Identity of an RBD image.
struct RbdInfo {
    pool: String,
    image: String,
    monitors: String,
}

/// Extract the RBD image identity from a bound volume. The `pool` and
/// `monitors` volume attributes are required for RBD volumes.
fn rbd_info(pv: &PersistentVolume) -> Result<RbdInfo> {
    let csi = pv
        .spec
        .as_ref()
        .and_then(|spec| spec.csi.as_ref())
        .ok_or(Error::NotCsiVolume {})?;
    let attribute = |key: &str| -> Result<String> {
        csi.volume_attributes
            .as_ref()
            .and_then(|attributes| attributes.get(key))
            .cloned()
            .ok_or_else(|| Error::MissingVolumeAttribute {
                key: key.to_string(),
                volume: pv.name_any(),
            })
    };
    Ok(RbdInfo {
        pool: attribute("pool")?,
        image: pv.name_any(),
        monitors: attribute("monitors")?,
    })
}

/// True when an `rbd` invocation failed because the image is gone. The tool
/// exits with ENOENT; the stderr match is a fallback for wrappers that
/// swallow the exit code.
fn is_image_not_found(error: &Error) -> bool {
    match error {
        Error::CommandFailed { code, stderr, .. } => {
            *code == Some(2) || stderr.contains("No such file or directory")
        }
        _ => false,
    }
}

/// Strip the `:port/nonce` suffix from a watcher address.
fn parse_address(address: &str) -> &str {
    match address.split_once(':') {
        Some((host, _)) => host,
        None => address,
    }
}

#[derive(Deserialize)]
struct RbdStatus {
    #[serde(default)]
    watchers: Vec<RbdWatcher>,
}

#[derive(Deserialize)]
struct RbdWatcher {
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
struct RbdLocker {
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
struct RbdDu {
    #[serde(default)]
    images: Vec<RbdImageUsage>,
}

#[derive(Deserialize)]
struct RbdImageUsage {
    used_size: i64,
}

#[derive(Deserialize)]
struct RbdDiffExtent {
    length: i64,
}

fn parse_watchers(output: &[u8]) -> Result<Vec<String>> {
    let status: RbdStatus =
        serde_json::from_slice(output).map_err(|error| Error::CommandOutput {
            command: "rbd status".to_string(),
            message: error.to_string(),
        })?;
    Ok(status
        .watchers
        .iter()
        .map(|watcher| parse_address(&watcher.address).to_string())
        .filter(|host| !host.is_empty())
        .collect())
}

fn parse_lockers(output: &[u8]) -> Result<Vec<String>> {
    let lockers: Vec<RbdLocker> =
        serde_json::from_slice(output).map_err(|error| Error::CommandOutput {
            command: "rbd lock list".to_string(),
            message: error.to_string(),
        })?;
    Ok(lockers
        .iter()
        .map(|locker| parse_address(&locker.address).to_string())
        .filter(|host| !host.is_empty())
        .collect())
}

fn parse_du(volume: &str, output: &[u8]) -> Result<i64> {
    let du: RbdDu = serde_json::from_slice(output).map_err(|error| Error::CommandOutput {
        command: "rbd du".to_string(),
        message: format!("unmarshal usage of volume {volume} failed: {error}"),
    })?;
    if du.images.len() != 1 {
        return Err(Error::CommandOutput {
            command: "rbd du".to_string(),
            message: format!("unexpected result count of du {}: {}", volume, du.images.len()),
        });
    }
    Ok(du.images[0].used_size)
}

fn parse_diff(volume: &str, output: &[u8]) -> Result<i64> {
    let extents: Vec<RbdDiffExtent> =
        serde_json::from_slice(output).map_err(|error| Error::CommandOutput {
            command: "rbd diff".to_string(),
            message: format!("unmarshal extents of volume {volume} failed: {error}"),
        })?;
    Ok(extents.iter().map(|extent| extent.length).sum())
}

/// Probe for CephRBD block images.
pub struct CephRbdVolume {
    ceph: CephCommand,
    usage_method: RbdUsageMethod,
}

impl CephRbdVolume {
    pub fn new(config: &VolumeConfig) -> Self {
        Self {
            ceph: CephCommand::new(config),
            usage_method: config.rbd_usage_method,
        }
    }

    async fn list_watchers(&self, info: &RbdInfo) -> Result<Vec<String>> {
        match self.ceph.exec_rbd(info, &["status", &info.image]).await {
            Ok(output) => parse_watchers(&output),
            Err(error) if is_image_not_found(&error) => {
                warn!(pool = info.pool, image = info.image, "image is deleted, ignore it");
                Ok(vec![])
            }
            Err(error) => Err(error),
        }
    }

    async fn list_lockers(&self, info: &RbdInfo) -> Result<Vec<String>> {
        match self
            .ceph
            .exec_rbd(info, &["lock", "list", &info.image])
            .await
        {
            Ok(output) => parse_lockers(&output),
            Err(error) if is_image_not_found(&error) => {
                warn!(pool = info.pool, image = info.image, "image is deleted, ignore it");
                Ok(vec![])
            }
            Err(error) => Err(error),
        }
    }

    /// Usage as reported by `rbd du`.
    async fn usage_by_du(&self, pv: &PersistentVolume) -> Result<i64> {
        let info = rbd_info(pv)?;
        match self
            .ceph
            .exec_rbd_with_timeout(&info, LONG_CMD_TIMEOUT, &["du", &info.image])
            .await
        {
            Ok(output) => parse_du(&pv.name_any(), &output),
            Err(error) if is_image_not_found(&error) => Ok(0),
            Err(error) => Err(error),
        }
    }

    /// Usage summed from `rbd diff` extents. Slower, but available on
    /// clusters whose `rbd` predates fast-diff.
    async fn usage_by_diff(&self, pv: &PersistentVolume) -> Result<i64> {
        let info = rbd_info(pv)?;
        match self
            .ceph
            .exec_rbd_with_timeout(&info, LONG_CMD_TIMEOUT, &["diff", &info.image])
            .await
        {
            Ok(output) => parse_diff(&pv.name_any(), &output),
            Err(error) if is_image_not_found(&error) => Ok(0),
            Err(error) => Err(error),
        }
    }
}

#[async_trait]
impl VolumeProbe for CephRbdVolume {
    async fn start(self: Arc<Self>, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    fn available(
        &self,
        workload: &AttachedWorkload,
        pvcr: &PersistentVolumeClaimRuntime,
    ) -> Result<()> {
        block_volume_available(workload, pvcr)
    }

    async fn mounted_nodes(&self, pv: &PersistentVolume) -> Result<Vec<String>> {
        let info = rbd_info(pv)?;
        let mut hosts: BTreeSet<String> = BTreeSet::new();
        hosts.extend(self.list_watchers(&info).await?);
        hosts.extend(self.list_lockers(&info).await?);
        Ok(hosts.into_iter().collect())
    }

    async fn usage(&self, pv: &PersistentVolume) -> Result<i64> {
        match self.usage_method {
            RbdUsageMethod::Du => self.usage_by_du(pv).await,
            RbdUsageMethod::Diff => self.usage_by_diff(pv).await,
        }
    }
}

/// Session list of one MDS, mapping mounted CephFS paths to hostnames.
type SessionSet = HashMap<String, BTreeSet<String>>;

#[derive(Default)]
struct MdsSessions {
    // Updates are full map swaps, reads are per path lookups.
    sessions: Mutex<SessionSet>,
}

impl MdsSessions {
    fn update(&self, sessions: SessionSet) {
        let mut held = self.sessions.lock().expect("session lock poisoned");
        *held = sessions;
    }

    fn get(&self, path: &str) -> Option<BTreeSet<String>> {
        let held = self.sessions.lock().expect("session lock poisoned");
        held.get(path).cloned()
    }
}

#[derive(Deserialize)]
struct MdsSession {
    #[serde(default)]
    client_metadata: MdsClientMetadata,
}

#[derive(Deserialize, Default)]
struct MdsClientMetadata {
    #[serde(default)]
    root: String,
    #[serde(default)]
    hostname: String,
}

/// Index sessions by their root path, keeping the hostname sets sorted.
fn generate_session_set(sessions: &[MdsSession]) -> SessionSet {
    let mut set = SessionSet::new();
    for session in sessions {
        let metadata = &session.client_metadata;
        if metadata.root.is_empty() || metadata.hostname.is_empty() {
            continue;
        }
        set.entry(metadata.root.clone())
            .or_default()
            .insert(metadata.hostname.clone());
    }
    set
}

/// Extract the `mds.<name>` handle from an active line of `ceph mds stat`.
fn fetch_mds(line: &str) -> Option<String> {
    let start = line.find('{')? + 1;
    let end = line.find('=')?;
    if end <= start {
        return None;
    }
    Some(format!("mds.{}", &line[start..end]))
}

/// The CephFS path the CSI driver provisioned for a volume.
fn cephfs_path(pv: &PersistentVolume) -> String {
    let handle = pv
        .spec
        .as_ref()
        .and_then(|spec| spec.csi.as_ref())
        .map(|csi| csi.volume_handle.as_str())
        .unwrap_or_default();
    format!("{CEPHFS_VOLUMES_ROOT}/{handle}")
}

/// Pull the `ceph.dir.rbytes` value out of `getfattr -d` output.
fn parse_rbytes(output: &str) -> Result<i64> {
    for line in output.lines() {
        if !line.starts_with("ceph.dir.rbytes") {
            continue;
        }
        let value = line
            .split_once('=')
            .map(|(_, value)| value.trim_matches('"'))
            .unwrap_or_default();
        return value.parse().map_err(|_| Error::CommandOutput {
            command: "getfattr".to_string(),
            message: format!("cannot parse rbytes value {value:?}"),
        });
    }
    Err(Error::CommandOutput {
        command: "getfattr".to_string(),
        message: "cannot parse getfattr output".to_string(),
    })
}

/// Probe for CephFS shared directories.
///
/// CephFS has no per image watcher list, so mounted nodes come from the MDS
/// session lists, refreshed on a timer, and usage comes from the recursive
/// bytes xattr on the volume directory under a locally mounted CephFS root.
pub struct CephFsVolume {
    ceph: CephCommand,
    sessions: MdsSessions,
    session_list_period: Duration,
    root_path: String,
    root_mount_path: String,
}

impl CephFsVolume {
    pub fn new(config: &VolumeConfig) -> Self {
        Self {
            ceph: CephCommand::new(config),
            sessions: MdsSessions::default(),
            session_list_period: config.ceph_mds_session_list_period.into(),
            root_path: config.cephfs_root_path.clone(),
            root_mount_path: config.cephfs_root_mount_path.clone(),
        }
    }

    /// Mount the CephFS root locally so volume directories can be read
    /// directly. Returns false for conditions worth retrying.
    async fn mount_root(&self) -> Result<bool> {
        match tokio::fs::metadata(&self.root_mount_path).await {
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                info!("cephfs root mount point does not exist, create it");
                tokio::fs::create_dir_all(&self.root_mount_path)
                    .await
                    .map_err(|source| Error::Filesystem {
                        path: self.root_mount_path.clone(),
                        source,
                    })?;
                tokio::fs::set_permissions(
                    &self.root_mount_path,
                    std::fs::Permissions::from_mode(0o700),
                )
                .await
                .map_err(|source| Error::Filesystem {
                    path: self.root_mount_path.clone(),
                    source,
                })?;
            }
            Err(source) => {
                return Err(Error::Filesystem {
                    path: self.root_mount_path.clone(),
                    source,
                })
            }
        }

        // The mount point may be left over from a previous run; unmount it
        // first to eliminate stale state.
        if let Err(error) = exec_command("umount", &[self.root_mount_path.clone()]).await {
            let message = error.to_string();
            if !message.contains("not mounted") && !message.contains("mountpoint not found") {
                error!(%error, path = self.root_mount_path, "umount cephfs root mount dir failed");
                return Ok(false);
            }
        }

        info!("mount cephfs root dir");
        let args = self.ceph.with_config_args([
            self.root_mount_path.clone(),
            "-r".to_string(),
            self.root_path.clone(),
        ]);
        match exec_command("ceph-fuse", &args).await {
            Ok(_) => {
                info!("mount cephfs root dir succeeded");
                Ok(true)
            }
            Err(error) if error.to_string().contains("mountpoint is not empty") => {
                info!("cephfs root dir is already mounted");
                Ok(true)
            }
            Err(error) => {
                error!(%error, "mount cephfs root dir failed");
                Ok(false)
            }
        }
    }

    /// One refresh pass: enumerate active MDSes and rebuild the session map
    /// from the union of their session lists.
    async fn list_mds_sessions(&self) {
        let mut merged = SessionSet::new();
        for mds in self.active_mds_list().await {
            match self.mds_session_list(&mds).await {
                Ok(sessions) => {
                    for (path, hosts) in generate_session_set(&sessions) {
                        merged.entry(path).or_default().extend(hosts);
                    }
                }
                Err(error) => {
                    error!(%error, mds, "list mds sessions failed");
                }
            }
        }
        debug!(paths = merged.len(), "updating mds sessions");
        self.sessions.update(merged);
    }

    async fn active_mds_list(&self) -> Vec<String> {
        let args = self
            .ceph
            .with_config_args(["mds".to_string(), "stat".to_string()]);
        let output = match exec_command("ceph", &args).await {
            Ok(output) => output,
            Err(error) => {
                error!(%error, "get mds stat failed");
                return vec![];
            }
        };
        String::from_utf8_lossy(&output)
            .lines()
            .filter(|line| line.contains("up:active"))
            .filter_map(fetch_mds)
            .collect()
    }

    async fn mds_session_list(&self, mds: &str) -> Result<Vec<MdsSession>> {
        let args = self.ceph.with_config_args([
            "tell".to_string(),
            mds.to_string(),
            "session".to_string(),
            "ls".to_string(),
        ]);
        let output = exec_command("ceph", &args).await?;
        serde_json::from_slice(&output).map_err(|error| Error::CommandOutput {
            command: format!("ceph tell {mds} session ls"),
            message: error.to_string(),
        })
    }
}

#[async_trait]
impl VolumeProbe for CephFsVolume {
    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        loop {
            if self.mount_root().await? {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(MOUNT_RETRY_PERIOD) => {}
            }
        }

        let probe = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe.session_list_period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => probe.list_mds_sessions().await,
                }
            }
        });
        Ok(())
    }

    fn available(
        &self,
        _workload: &AttachedWorkload,
        _pvcr: &PersistentVolumeClaimRuntime,
    ) -> Result<()> {
        // Shared filesystems take any number of writers.
        Ok(())
    }

    async fn mounted_nodes(&self, pv: &PersistentVolume) -> Result<Vec<String>> {
        let path = cephfs_path(pv);
        match self.sessions.get(&path) {
            Some(hosts) => Ok(hosts.into_iter().collect()),
            None => {
                debug!(path, "cannot find cephfs session");
                Ok(vec![])
            }
        }
    }

    async fn usage(&self, pv: &PersistentVolume) -> Result<i64> {
        let path = format!("{}{}", self.root_mount_path, cephfs_path(pv));
        let args = [
            "-d".to_string(),
            "-m".to_string(),
            "ceph.dir.rbytes".to_string(),
            path,
        ];
        let output = exec_command("getfattr", &args).await?;
        parse_rbytes(&String::from_utf8_lossy(&output))
    }
}
