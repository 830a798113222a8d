//! HTTP handlers for the aggregated API.
//!
//! Three GET endpoints: the discovery document, cluster-scoped list/watch
//! (a single upstream call, no fan-out), and namespace-scoped list/watch
//! across the HNC subtree. The `watch` query parameter selects streaming.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use tracing::trace;

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::fanout::{aggregate_list, aggregate_watch};
use crate::hierarchy::NamespaceResolver;
use crate::response;
use crate::upstream::{Gvr, ListOptions, UpstreamFactory};

/// Shared state for the aggregated API handlers.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub resolver: NamespaceResolver,
    pub upstream: Arc<dyn UpstreamFactory>,
}

/// `GET /apis/resources.hns.demo/v1alpha1`
pub async fn discovery(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(response::discovery_response(state.catalog.list()))
}

/// `GET /apis/resources.hns.demo/v1alpha1/{resource}`
///
/// Cluster-scoped: one upstream call, response passed through unchanged.
pub async fn cluster_scope(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Query(opts): Query<ListOptions>,
    headers: HeaderMap,
) -> Result<Response> {
    trace!(%resource, "handling cluster-scoped request");
    let gvr = gvr_from_path(&resource, &state.catalog)?;
    let upstream = state.upstream.for_request(accept_header(&headers))?;

    if opts.is_watch() {
        let body = aggregate_watch(upstream, gvr, Vec::new(), opts).await?;
        return Ok(watch_response(body));
    }
    let value = upstream.list(&gvr, None, &opts).await?;
    Ok(Json(value).into_response())
}

/// `GET /apis/resources.hns.demo/v1alpha1/namespaces/{namespace}/{resource}`
///
/// Fans out across the parent namespace's subtree.
pub async fn subtree_scope(
    State(state): State<AppState>,
    Path((namespace, resource)): Path<(String, String)>,
    Query(opts): Query<ListOptions>,
    headers: HeaderMap,
) -> Result<Response> {
    trace!(%namespace, %resource, "handling namespace-scoped request");
    let gvr = gvr_from_path(&resource, &state.catalog)?;
    let upstream = state.upstream.for_request(accept_header(&headers))?;
    let namespaces = state.resolver.subtree(&namespace);

    if opts.is_watch() {
        let body = aggregate_watch(upstream, gvr, namespaces, opts).await?;
        return Ok(watch_response(body));
    }
    let kind_list = format!("{}List", state.catalog.kind_for(&gvr).unwrap_or_default());
    let value = aggregate_list(upstream, gvr, namespaces, opts, kind_list).await?;
    Ok(Json(value).into_response())
}

fn accept_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
}

/// Maps the `{resource}` path segment to an upstream GVR via the catalog.
/// Everything before the last dot is the group.
fn gvr_from_path(resource_path: &str, catalog: &Catalog) -> Result<Gvr> {
    let (group, resource) = match resource_path.rsplit_once('.') {
        Some((group, resource)) => (group, resource),
        None => ("", resource_path),
    };
    let entry = catalog
        .get(resource, group)
        .ok_or_else(|| Error::ResourceNotFound(resource_path.to_string()))?;
    Ok(Gvr {
        group: group.to_string(),
        version: entry.version,
        resource: resource.to_string(),
    })
}

fn watch_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::TRANSFER_ENCODING, "chunked")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
