//! Watch based caches standing in for the usual informer listers. Every
//! lookup in the controllers goes through one of these stores; all writes go
//! through the API client.

use crate::error::{Error, Result};
use futures::{StreamExt, TryStreamExt};
use kube::runtime::reflector::{reflector, store, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Start a reflector for `api` and hand back its read side. `on_applied` runs
/// for every added or updated object, which is how the status mirror feeds its
/// work queue.
pub fn spawn_watch<K, F>(api: Api<K>, cancel: CancellationToken, on_applied: F) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: Fn(&K) + Send + 'static,
{
    let (reader, writer) = store();
    let stream = reflector(
        writer,
        watcher(api, watcher::Config::default()).default_backoff(),
    );
    tokio::spawn(async move {
        let mut objects = stream.applied_objects().boxed();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = objects.try_next() => match next {
                    Ok(Some(object)) => on_applied(&object),
                    Ok(None) => break,
                    Err(error) => warn!(%error, "watch stream error"),
                }
            }
        }
    });
    reader
}

/// Start a reflector without an event hook.
pub fn spawn_reflector<K>(api: Api<K>, cancel: CancellationToken) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    spawn_watch(api, cancel, |_| {})
}

/// Block until a store has seen its first complete list.
pub async fn wait_ready<K>(store: &Store<K>, resource: &'static str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store
        .wait_until_ready()
        .await
        .map_err(|_| Error::CacheSync { resource })
}

/// Reference to a namespaced object in a store.
pub fn namespaced_ref<K>(namespace: &str, name: &str) -> ObjectRef<K>
where
    K: Resource<DynamicType = ()>,
{
    ObjectRef::new(name).within(namespace)
}

/// `namespace/name` cache key of an object, mirroring the usual meta
/// namespace key functions.
pub fn object_key<K>(object: &K) -> String
where
    K: Resource<DynamicType = ()>,
{
    match object.meta().namespace.as_deref() {
        Some(namespace) => format!(
            "{}/{}",
            namespace,
            object.meta().name.as_deref().unwrap_or_default()
        ),
        None => object.meta().name.clone().unwrap_or_default(),
    }
}

/// Split a `namespace/name` key back into its halves.
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    key.split_once('/').ok_or_else(|| Error::InvalidKey {
        key: key.to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;

    #[test]
    fn object_keys_round_trip() {
        let mut pvc = PersistentVolumeClaim::default();
        pvc.metadata.namespace = Some("ns1".into());
        pvc.metadata.name = Some("a".into());

        let key = object_key(&pvc);
        assert_eq!(key, "ns1/a");
        assert_eq!(split_key(&key).unwrap(), ("ns1", "a"));
        assert!(split_key("no-namespace").is_err());
    }
}
