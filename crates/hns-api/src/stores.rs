//! Reflector-backed caches over cluster state the server reads per request.
//!
//! Namespaces feed the subtree resolver; the kube-system ConfigMap cache
//! feeds the auth gate. Both are plain kube-runtime reflectors driven by
//! background tasks; readers see a consistent, possibly stale snapshot.

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tracing::warn;

use crate::consts::KUBE_SYSTEM_NAMESPACE;

/// Handles to the cluster caches.
#[derive(Clone)]
pub struct ClusterCaches {
    pub namespaces: Store<Namespace>,
    pub config_maps: Store<ConfigMap>,
}

/// Starts the namespace and ConfigMap reflectors and waits for their first
/// sync. Failing to sync is a startup error; after that the watches retry
/// forever in the background.
pub async fn start(client: &Client) -> anyhow::Result<ClusterCaches> {
    let namespace_api: Api<Namespace> = Api::all(client.clone());
    let config_map_api: Api<ConfigMap> = Api::namespaced(client.clone(), KUBE_SYSTEM_NAMESPACE);

    let namespaces = spawn_reflector(namespace_api, "namespaces");
    let config_maps = spawn_reflector(config_map_api, "configmaps");

    namespaces
        .wait_until_ready()
        .await
        .map_err(|err| anyhow::anyhow!("namespace cache failed to sync: {err}"))?;
    config_maps
        .wait_until_ready()
        .await
        .map_err(|err| anyhow::anyhow!("configmap cache failed to sync: {err}"))?;

    Ok(ClusterCaches {
        namespaces,
        config_maps,
    })
}

fn spawn_reflector<K>(api: Api<K>, what: &'static str) -> Store<K>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + Send
        + Sync
        + serde::de::DeserializeOwned
        + 'static,
{
    let (reader, writer) = reflector::store();
    // Timeout below the client read timeout so the server closes watches
    // before the transport does.
    let watcher_config = watcher::Config::default().timeout(25);
    let stream = reflector::reflector(writer, watcher::watcher(api, watcher_config).default_backoff());

    tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        while let Some(event) = stream.next().await {
            if let Err(err) = event {
                warn!(error = %err, cache = what, "cache watch error, will retry");
            }
        }
    });

    reader
}
