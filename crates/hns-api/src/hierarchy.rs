//! Resolves a parent namespace to its hierarchical-namespace subtree.
//!
//! HNC labels every descendant namespace with a
//! `<ancestor>.tree.hnc.x-k8s.io/depth` key per ancestor; membership is
//! decided by key presence alone. The parent itself carries its own key at
//! depth zero, so it is part of its own subtree.

use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::Store;

use crate::consts::HNS_LABEL_SUFFIX;

/// Read-only view over the namespace cache.
#[derive(Clone)]
pub struct NamespaceResolver {
    store: Store<Namespace>,
}

impl NamespaceResolver {
    pub fn new(store: Store<Namespace>) -> Self {
        Self { store }
    }

    /// Names of all namespaces in `parent`'s subtree, sorted. May be empty;
    /// an empty subtree is not an error.
    pub fn subtree(&self, parent: &str) -> Vec<String> {
        let label = format!("{parent}{HNS_LABEL_SUFFIX}");
        let mut names: Vec<String> = self
            .store
            .state()
            .iter()
            .filter(|ns| {
                ns.metadata
                    .labels
                    .as_ref()
                    .is_some_and(|labels| labels.contains_key(&label))
            })
            .filter_map(|ns| ns.metadata.name.clone())
            .collect();
        names.sort();
        names
    }
}
