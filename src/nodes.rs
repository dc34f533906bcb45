//! Volume usage scraped from the kubelet read-only metrics endpoint.
//!
//! A reusable alternative to asking the storage backend: each node's kubelet
//! already measures `kubelet_volume_stats_used_bytes` for the volumes it
//! mounts. Values are cached per (node, claim) and evicted five minutes
//! after their last read. No probe consumes this collector yet; wiring it
//! under the Ceph probes is a future extension.

use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::{ObjectRef, Store};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const KUBELET_READONLY_PORT: u16 = 10255;
const KUBELET_VOLUME_USAGE_METRIC: &str = "kubelet_volume_stats_used_bytes";

const SYNC_PERIOD: Duration = Duration::from_secs(60);
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(30);
const USAGE_TIMEOUT: Duration = Duration::from_secs(300);

struct CachedUsage {
    value: i64,
    last_query: Instant,
}

/// node name -> claim key -> usage.
#[derive(Default)]
struct UsageMap {
    usages: RwLock<HashMap<String, HashMap<String, CachedUsage>>>,
}

impl UsageMap {
    async fn nodes(&self) -> Vec<String> {
        self.usages.read().await.keys().cloned().collect()
    }

    async fn volumes(&self, node: &str) -> HashSet<String> {
        self.usages
            .read()
            .await
            .get(node)
            .map(|volumes| volumes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Read a cached value, touching its last-query time.
    async fn get(&self, node: &str, key: &str) -> Option<i64> {
        let mut usages = self.usages.write().await;
        let usage = usages.get_mut(node)?.get_mut(key)?;
        usage.last_query = Instant::now();
        Some(usage.value)
    }

    /// Merge fresh values for a node and evict entries nobody asked about
    /// within the timeout.
    async fn update(&self, node: &str, values: HashMap<String, i64>) {
        let now = Instant::now();
        let mut usages = self.usages.write().await;
        let volumes = usages.entry(node.to_string()).or_default();

        for (key, value) in values {
            volumes
                .entry(key)
                .or_insert_with(|| CachedUsage {
                    value: 0,
                    last_query: now,
                })
                .value = value;
        }

        volumes.retain(|key, usage| {
            let keep = usage.last_query + USAGE_TIMEOUT > now;
            if !keep {
                debug!(node, volume = key, "evicting stale usage entry");
            }
            keep
        });
    }
}

/// Collects volume usage from the kubelets' metric endpoints periodically.
pub struct VolumeUsageCollector {
    usages: UsageMap,
    node_store: Store<Node>,
    http: reqwest::Client,
}

impl VolumeUsageCollector {
    pub fn new(node_store: Store<Node>) -> Arc<Self> {
        Arc::new(Self {
            usages: UsageMap::default(),
            node_store,
            http: reqwest::Client::builder()
                .timeout(SCRAPE_TIMEOUT)
                .build()
                .expect("static http client configuration"),
        })
    }

    /// Start the periodic refresh of every tracked node.
    pub fn start(self: Arc<Self>, cancel: &CancellationToken) {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SYNC_PERIOD);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.sync_all_nodes().await,
                }
            }
        });
    }

    /// The usage of a claim as seen from the first of `nodes` that knows it.
    /// A cache miss forces a synchronous scrape for that single volume.
    pub async fn get_usage(&self, namespace: &str, name: &str, nodes: &[String]) -> Option<i64> {
        let key = volume_key(namespace, name);
        for node in nodes {
            if let Some(value) = self.usage_from_node(node, &key).await {
                return Some(value);
            }
        }
        None
    }

    async fn usage_from_node(&self, node: &str, key: &str) -> Option<i64> {
        if let Some(value) = self.usages.get(node, key).await {
            return Some(value);
        }

        let mut wanted = HashSet::new();
        wanted.insert(key.to_string());
        match self.scrape_node(node, &wanted).await {
            Ok(values) => {
                let value = values.get(key).copied();
                self.usages.update(node, values).await;
                value
            }
            Err(error) => {
                error!(node, %error, "fetch volume usage from node failed");
                None
            }
        }
    }

    async fn sync_all_nodes(&self) {
        let nodes = self.usages.nodes().await;
        let scrapes = nodes.iter().map(|node| async move {
            let wanted = self.usages.volumes(node).await;
            match self.scrape_node(node, &wanted).await {
                Ok(values) => self.usages.update(node, values).await,
                Err(error) => error!(node, %error, "fetch volume usage from node failed"),
            }
        });
        futures::future::join_all(scrapes).await;
    }

    /// One metrics scrape, filtered down to the wanted claim keys.
    async fn scrape_node(
        &self,
        node: &str,
        wanted: &HashSet<String>,
    ) -> Result<HashMap<String, i64>> {
        let Some(address) = self.node_address(node)? else {
            return Ok(HashMap::new());
        };

        let url = format!("http://{address}:{KUBELET_READONLY_PORT}/metrics");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|error| scrape_error(node, &error.to_string()))?;
        if !response.status().is_success() {
            return Err(scrape_error(
                node,
                &format!("unexpected status {}", response.status()),
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|error| scrape_error(node, &error.to_string()))?;

        parse_usage_samples(&body, wanted).map_err(|message| scrape_error(node, &message))
    }

    /// The node's internal IP from the node cache.
    fn node_address(&self, node_name: &str) -> Result<Option<String>> {
        let Some(node) = self.node_store.get(&ObjectRef::new(node_name)) else {
            debug!(node = node_name, "node does not exist");
            return Ok(None);
        };
        let address = node
            .status
            .as_ref()
            .and_then(|status| status.addresses.as_ref())
            .and_then(|addresses| {
                addresses
                    .iter()
                    .find(|address| address.type_ == "InternalIP")
            })
            .map(|address| address.address.clone());
        match address {
            Some(address) => Ok(Some(address)),
            None => Err(scrape_error(
                node_name,
                "cannot find an internal address for the node",
            )),
        }
    }
}

fn scrape_error(node: &str, message: &str) -> Error {
    Error::CommandOutput {
        command: format!("scrape node {node}"),
        message: message.to_string(),
    }
}

/// Pull the wanted `kubelet_volume_stats_used_bytes` samples out of a
/// Prometheus text document.
fn parse_usage_samples(
    body: &str,
    wanted: &HashSet<String>,
) -> std::result::Result<HashMap<String, i64>, String> {
    let lines = body
        .lines()
        .map(|line| std::io::Result::Ok(line.to_string()));
    let scrape =
        prometheus_parse::Scrape::parse(lines).map_err(|error| error.to_string())?;

    let mut result = HashMap::with_capacity(wanted.len());
    for sample in scrape.samples {
        if sample.metric != KUBELET_VOLUME_USAGE_METRIC {
            continue;
        }
        let (name, namespace) = (
            sample.labels.get("persistentvolumeclaim"),
            sample.labels.get("namespace"),
        );
        let (Some(name), Some(namespace)) = (name, namespace) else {
            debug!(?sample, "sample without claim labels");
            continue;
        };

        let value = match sample.value {
            prometheus_parse::Value::Counter(value)
            | prometheus_parse::Value::Gauge(value)
            | prometheus_parse::Value::Untyped(value) => value,
            _ => continue,
        };

        let key = volume_key(namespace, name);
        if wanted.contains(&key) {
            result.insert(key, value as i64);
        }
    }
    Ok(result)
}

fn volume_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

#[cfg(test)]
mod test {
    use super::*;

    const METRICS: &str = r#"# HELP kubelet_volume_stats_used_bytes Number of used bytes in the volume
# TYPE kubelet_volume_stats_used_bytes gauge
kubelet_volume_stats_used_bytes{namespace="ns1",persistentvolumeclaim="a"} 1.048576e+06
kubelet_volume_stats_used_bytes{namespace="ns2",persistentvolumeclaim="b"} 2048
kubelet_volume_stats_used_bytes{persistentvolumeclaim="orphan"} 1
some_other_metric{namespace="ns1"} 7
"#;

    #[test]
    fn extracts_only_wanted_claims() {
        let wanted: HashSet<String> = ["ns1/a".to_string()].into();
        let samples = parse_usage_samples(METRICS, &wanted).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples["ns1/a"], 1_048_576);
    }

    #[test]
    fn ignores_samples_without_claim_labels() {
        let wanted: HashSet<String> = ["ns2/b".to_string(), "/orphan".to_string()].into();
        let samples = parse_usage_samples(METRICS, &wanted).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples["ns2/b"], 2048);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_reads_touch_and_updates_evict() {
        let map = UsageMap::default();
        map.update("n1", HashMap::from([("ns1/a".to_string(), 100)]))
            .await;
        assert_eq!(map.get("n1", "ns1/a").await, Some(100));
        assert_eq!(map.get("n1", "ns1/missing").await, None);

        // Values refresh in place.
        map.update("n1", HashMap::from([("ns1/a".to_string(), 200)]))
            .await;
        assert_eq!(map.get("n1", "ns1/a").await, Some(200));

        // An entry untouched past the timeout is evicted by the next update.
        tokio::time::advance(USAGE_TIMEOUT + Duration::from_secs(1)).await;
        map.update("n1", HashMap::from([("ns1/b".to_string(), 5)]))
            .await;
        assert_eq!(map.get("n1", "ns1/a").await, None);
        assert_eq!(map.get("n1", "ns1/b").await, Some(5));
        assert_eq!(map.volumes("n1").await.len(), 1);
        assert_eq!(map.nodes().await, vec!["n1".to_string()]);
    }
}
