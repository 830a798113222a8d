//! Wire shapes for discovery, list, and table responses.
//!
//! These mirror the exact layouts Kubernetes clients expect from an
//! aggregated API server; field names and casing are part of the contract.

use serde_json::{json, Value};

use crate::catalog::ShadowResource;
use crate::consts::GROUP_VERSION;
use crate::upstream::Gvr;

/// The `APIResourceList` discovery document for the aggregated group.
pub fn discovery_response(resources: Vec<ShadowResource>) -> Value {
    json!({
        "kind": "APIResourceList",
        "apiVersion": "v1",
        "groupVersion": GROUP_VERSION,
        "resources": resources,
    })
}

/// A `<Kind>List` collection response. `api_version` is the upstream
/// group/version of the listed resource.
pub fn list_response(gvr: &Gvr, kind: &str, resource_version: &str, items: Vec<Value>) -> Value {
    json!({
        "apiVersion": gvr.group_version(),
        "kind": kind,
        "metadata": { "resourceVersion": resource_version },
        "items": items,
    })
}

/// A `meta.k8s.io/v1` Table response.
pub fn table_response(resource_version: &str, column_definitions: Value, rows: Vec<Value>) -> Value {
    json!({
        "apiVersion": "meta.k8s.io/v1",
        "kind": "Table",
        "metadata": { "resourceVersion": resource_version },
        "columnDefinitions": column_definitions,
        "rows": rows,
    })
}
