//! Bounded-parallel list fan-out across a namespace subtree.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::consts::LIST_WORKERS;
use crate::error::{Error, Result};
use crate::response;
use crate::upstream::{Gvr, ListOptions, UpstreamApi};

/// What one namespace contributed to the aggregate.
#[derive(Debug, Default)]
struct NamespacePage {
    items: Vec<Value>,
    rows: Vec<Value>,
    columns: Option<Value>,
    resource_version: Option<u64>,
}

/// Lists the resource in every namespace of the subtree and merges the
/// results into a single collection response.
///
/// At most [`LIST_WORKERS`] upstream calls are in flight at once. The first
/// upstream error cancels the remaining workers and fails the request.
/// Items and rows are returned sorted by `(namespace, name)`; if any
/// namespace answered with Table rows the aggregate is a Table, otherwise a
/// `<Kind>List` named by `kind_list`.
pub async fn aggregate_list(
    upstream: Arc<dyn UpstreamApi>,
    gvr: Gvr,
    namespaces: Vec<String>,
    opts: ListOptions,
    kind_list: String,
) -> Result<Value> {
    let semaphore = Arc::new(Semaphore::new(LIST_WORKERS));
    let cancel = CancellationToken::new();
    let mut workers: JoinSet<Result<NamespacePage>> = JoinSet::new();

    for namespace in namespaces {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| Error::Internal(err.to_string()))?;
        let upstream = Arc::clone(&upstream);
        let gvr = gvr.clone();
        let opts = opts.clone();
        let cancel = cancel.clone();
        workers.spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = cancel.cancelled() => Ok(NamespacePage::default()),
                result = upstream.list(&gvr, Some(namespace.as_str()), &opts) => match result {
                    Ok(value) => Ok(extract_page(value)),
                    Err(err) => {
                        cancel.cancel();
                        Err(err)
                    }
                }
            }
        });
    }

    let mut items = Vec::new();
    let mut rows = Vec::new();
    let mut columns: Option<Value> = None;
    let mut latest: u64 = 0;
    let mut first_error: Option<Error> = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(page)) => {
                items.extend(page.items);
                rows.extend(page.rows);
                if columns.is_none() {
                    columns = page.columns;
                }
                latest = latest.max(page.resource_version.unwrap_or(0));
            }
            Ok(Err(err)) => {
                first_error.get_or_insert(err);
            }
            Err(err) => {
                first_error.get_or_insert(Error::Internal(err.to_string()));
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    sort_items(&mut items)?;
    sort_rows(&mut rows)?;

    // Every per-namespace list was empty (or there were no namespaces): the
    // collection resourceVersion comes from a cluster-scoped probe so watch
    // resume tokens stay valid.
    let resource_version = if latest == 0 {
        collection_resource_version(upstream.as_ref(), &gvr).await?
    } else {
        latest.to_string()
    };

    debug!(
        resource = %gvr.resource,
        items = items.len(),
        rows = rows.len(),
        %resource_version,
        "aggregated list"
    );

    if !rows.is_empty() {
        let columns = columns.unwrap_or_else(|| Value::Array(vec![]));
        return Ok(response::table_response(&resource_version, columns, rows));
    }
    Ok(response::list_response(&gvr, &kind_list, &resource_version, items))
}

fn extract_page(value: Value) -> NamespacePage {
    let mut page = NamespacePage::default();
    let Value::Object(mut body) = value else {
        return page;
    };
    if let Some(Value::Array(items)) = body.remove("items") {
        page.items = items;
    }
    if let Some(Value::Array(rows)) = body.remove("rows") {
        page.rows = rows;
    }
    page.columns = body
        .remove("columnDefinitions")
        .filter(|columns| columns.as_array().is_some_and(|a| !a.is_empty()));
    if !page.items.is_empty() || !page.rows.is_empty() {
        let version = body
            .get("metadata")
            .and_then(|meta| meta.get("resourceVersion"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        page.resource_version = Some(version.parse().unwrap_or(0));
    }
    page
}

/// Cluster-level resourceVersion via a `limit=1` list that discards items.
async fn collection_resource_version(upstream: &dyn UpstreamApi, gvr: &Gvr) -> Result<String> {
    let opts = ListOptions {
        limit: Some(1),
        ..ListOptions::default()
    };
    let value = upstream.list(gvr, None, &opts).await.map_err(|err| {
        let message = format!(
            "failed to get resource version for resource {}: {err}",
            gvr.resource
        );
        match err {
            Error::NotFound(_) => Error::NotFound(message),
            _ => Error::Upstream(message),
        }
    })?;
    Ok(value
        .get("metadata")
        .and_then(|meta| meta.get("resourceVersion"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

fn sort_items(items: &mut Vec<Value>) -> Result<()> {
    let mut keyed = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        let key = object_sort_key(&item).ok_or(Error::InvalidSortObject)?;
        keyed.push((key, item));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    items.extend(keyed.into_iter().map(|(_, item)| item));
    Ok(())
}

fn sort_rows(rows: &mut Vec<Value>) -> Result<()> {
    let mut keyed = Vec::with_capacity(rows.len());
    for row in rows.drain(..) {
        let key = row
            .get("object")
            .and_then(object_sort_key)
            .ok_or(Error::InvalidSortObject)?;
        keyed.push((key, row));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    rows.extend(keyed.into_iter().map(|(_, row)| row));
    Ok(())
}

fn object_sort_key(object: &Value) -> Option<(String, String)> {
    let object = object.as_object()?;
    let meta = object.get("metadata").and_then(Value::as_object);
    let field = |name: &str| {
        meta.and_then(|meta| meta.get(name))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Some((field("namespace"), field("name")))
}
