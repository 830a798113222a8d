//! Shadow registry of upstream API resources.
//!
//! Watches CRDs and APIServices and re-derives the set of namespaced
//! resources served under the aggregated group. Change events only mark the
//! table dirty; a delayed task performs the discovery sweep so a burst of
//! schema changes costs a single fetch. On fetch failure the dirty flag is
//! re-armed and the sweep retried on a timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::consts::{GROUP_VERSION, REFRESH_DELAY, RETRY_PERIOD};
use crate::upstream::Gvr;

/// A single entry of the shadow schema, serialized into the discovery
/// document with the same field layout Kubernetes uses for `APIResource`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowResource {
    /// Flat lookup name: `<group>.<resource>` for grouped resources,
    /// the bare resource name otherwise.
    pub name: String,
    #[serde(default)]
    pub singular_name: String,
    pub namespaced: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    pub kind: String,
    pub verbs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_version_hash: String,
}

/// A namespaced resource reported by upstream discovery.
#[derive(Clone, Debug)]
pub struct DiscoveredResource {
    pub name: String,
    pub kind: String,
    pub short_names: Vec<String>,
}

/// The namespaced resources of one group at its preferred version.
#[derive(Clone, Debug)]
pub struct ResourceList {
    /// `<group>/<version>`, or just `<version>` for the core group.
    pub group_version: String,
    pub resources: Vec<DiscoveredResource>,
}

/// Source of upstream schema information.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Namespaced, non-subresource entries for every served group at the
    /// group's preferred version.
    async fn preferred_namespaced_resources(&self) -> kube::Result<Vec<ResourceList>>;
}

/// Discovery against a live API server.
pub struct ApiServerDiscovery {
    client: Client,
}

impl ApiServerDiscovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DiscoverySource for ApiServerDiscovery {
    async fn preferred_namespaced_resources(&self) -> kube::Result<Vec<ResourceList>> {
        let mut lists = Vec::new();

        let core = self.client.list_core_api_versions().await?;
        if let Some(version) = core.versions.first() {
            let resources = self.client.list_core_api_resources(version).await?;
            lists.push(convert_resource_list(version.clone(), resources));
        }

        let groups = self.client.list_api_groups().await?;
        for group in groups.groups {
            let preferred = group
                .preferred_version
                .map(|v| v.group_version)
                .or_else(|| group.versions.first().map(|v| v.group_version.clone()));
            let Some(group_version) = preferred else {
                continue;
            };
            let resources = self.client.list_api_group_resources(&group_version).await?;
            lists.push(convert_resource_list(group_version, resources));
        }

        Ok(lists)
    }
}

fn convert_resource_list(
    group_version: String,
    list: k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList,
) -> ResourceList {
    let resources = list
        .resources
        .into_iter()
        // Subresources like pods/log show up in the same list; they are not
        // independently listable.
        .filter(|r| r.namespaced && !r.name.contains('/'))
        .map(|r| DiscoveredResource {
            name: r.name,
            kind: r.kind,
            short_names: r.short_names.unwrap_or_default(),
        })
        .collect();
    ResourceList {
        group_version,
        resources,
    }
}

#[derive(Default)]
struct Table {
    resources: Vec<ShadowResource>,
    by_name: HashMap<String, ShadowResource>,
    kinds: HashMap<Gvr, String>,
}

/// Thread-safe shadow schema. Handlers read concurrently; the refresh task
/// swaps the whole table under the writer lock.
pub struct Catalog {
    source: Arc<dyn DiscoverySource>,
    table: RwLock<Table>,
    dirty: AtomicBool,
}

impl Catalog {
    pub fn new(source: Arc<dyn DiscoverySource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            table: RwLock::new(Table::default()),
            dirty: AtomicBool::new(false),
        })
    }

    /// Snapshot of all shadow resources.
    pub fn list(&self) -> Vec<ShadowResource> {
        self.table.read().resources.clone()
    }

    /// Looks up an entry by resource name and group. An empty group matches
    /// entries registered without a group prefix.
    pub fn get(&self, resource: &str, group: &str) -> Option<ShadowResource> {
        let table = self.table.read();
        if group.is_empty() {
            table.by_name.get(resource).cloned()
        } else {
            table.by_name.get(&format!("{group}.{resource}")).cloned()
        }
    }

    /// The upstream kind for a group/version/resource triple.
    pub fn kind_for(&self, gvr: &Gvr) -> Option<String> {
        self.table.read().kinds.get(gvr).cloned()
    }

    /// Marks the schema dirty and schedules a coalesced rebuild.
    ///
    /// Every caller within the coalescing window shares one discovery fetch:
    /// the first task to wake clears the flag and fetches, the rest see a
    /// clean flag and return.
    pub fn queue_refresh(self: Arc<Self>) {
        self.dirty.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tokio::time::sleep(REFRESH_DELAY).await;
            if let Err(err) = self.refresh_if_dirty().await {
                warn!(error = %err, "failed to sync schemas, will retry");
                self.dirty.store(true, Ordering::SeqCst);
                tokio::spawn(async move {
                    tokio::time::sleep(RETRY_PERIOD).await;
                    self.queue_refresh();
                });
            }
        });
    }

    async fn refresh_if_dirty(&self) -> kube::Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("refreshing all shadowed api resources");
        let lists = self.source.preferred_namespaced_resources().await?;
        let table = build_table(lists);
        *self.table.write() = table;
        Ok(())
    }
}

fn build_table(lists: Vec<ResourceList>) -> Table {
    let mut table = Table::default();
    for list in lists {
        // Never shadow the aggregated group itself.
        if list.group_version == GROUP_VERSION {
            continue;
        }
        let (group, version) = match list.group_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), list.group_version.clone()),
        };
        for resource in list.resources {
            let name = if group.is_empty() {
                resource.name.clone()
            } else {
                format!("{group}.{}", resource.name)
            };
            if table.by_name.contains_key(&name) {
                continue;
            }
            let shadow = ShadowResource {
                name: name.clone(),
                singular_name: String::new(),
                namespaced: true,
                group: group.clone(),
                version: version.clone(),
                kind: resource.kind.clone(),
                verbs: vec!["list".to_string(), "watch".to_string()],
                short_names: resource.short_names,
                storage_version_hash: storage_version_hash(&group, &version, &resource.kind),
            };
            table.kinds.insert(
                Gvr {
                    group: group.clone(),
                    version: version.clone(),
                    resource: resource.name,
                },
                resource.kind,
            );
            table.by_name.insert(name, shadow.clone());
            table.resources.push(shadow);
        }
    }
    table
}

/// Discovery storage version hash: first eight characters of the base64
/// encoded SHA-256 of `<group>/<version>/<kind>`.
fn storage_version_hash(group: &str, version: &str, kind: &str) -> String {
    let digest = Sha256::digest(format!("{group}/{version}/{kind}").as_bytes());
    BASE64.encode(digest)[..8].to_string()
}

/// Drives CRD and APIService watches, queueing a catalog refresh on every
/// change. Runs until the process exits.
pub async fn watch_schema_changes(client: Client, catalog: Arc<Catalog>) {
    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let api_service_api: Api<APIService> = Api::all(client);

    // Timeout below the client read timeout so the server closes watches
    // before the transport does.
    let watcher_config = watcher::Config::default().timeout(25);
    let crd_watcher = watcher::watcher(crd_api, watcher_config.clone()).default_backoff();
    let api_service_watcher = watcher::watcher(api_service_api, watcher_config).default_backoff();

    let mut crd_watcher = std::pin::pin!(crd_watcher);
    let mut api_service_watcher = std::pin::pin!(api_service_watcher);

    info!("watching CRDs and APIServices for schema changes");

    loop {
        tokio::select! {
            Some(event) = crd_watcher.next() => {
                handle_schema_event(&catalog, event, "CustomResourceDefinition");
            }
            Some(event) = api_service_watcher.next() => {
                handle_schema_event(&catalog, event, "APIService");
            }
            else => break,
        }
    }
}

fn handle_schema_event<K>(
    catalog: &Arc<Catalog>,
    event: Result<Event<K>, watcher::Error>,
    resource_type: &str,
) where
    K: ResourceExt,
{
    match event {
        Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => {
            debug!(%resource_type, name = %obj.name_any(), "schema entry changed");
            Arc::clone(catalog).queue_refresh();
        }
        Ok(Event::Delete(obj)) => {
            debug!(%resource_type, name = %obj.name_any(), "schema entry deleted");
            Arc::clone(catalog).queue_refresh();
        }
        Ok(Event::Init) => {}
        Ok(Event::InitDone) => {
            debug!(%resource_type, "schema watch synced");
            Arc::clone(catalog).queue_refresh();
        }
        Err(err) => {
            warn!(error = %err, %resource_type, "schema watch error, will retry");
        }
    }
}
