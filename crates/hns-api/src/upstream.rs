//! Upstream clients with per-request Accept pass-through.
//!
//! kube's typed clients pin their own Accept header, which would drop the
//! Table conversion kubectl asks for. Requests are therefore built directly
//! at the resource URL path and stamped with the Accept string negotiated
//! from the incoming request. Only `application/json` is accepted, and the
//! only permitted conversion is to `Table`; a Table conversion also adds the
//! `includeObject=Object` query parameter so rows carry full objects.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use kube::core::WatchEvent;
use kube::Client;
use serde::Deserialize;

use crate::error::{Error, Result};

const JSON_MIME: &str = "application/json";

/// An upstream group/version/resource triple.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    /// `<group>/<version>`, or bare `<version>` for the core group.
    pub fn group_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// URL path of the collection, optionally scoped to a namespace.
    pub fn url_path(&self, namespace: Option<&str>) -> String {
        let prefix = if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };
        match namespace {
            Some(ns) => format!("{prefix}/namespaces/{ns}/{}", self.resource),
            None => format!("{prefix}/{}", self.resource),
        }
    }
}

/// List/watch options parsed from the incoming request's query string.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
    #[serde(rename = "continue")]
    pub continue_token: Option<String>,
    pub resource_version: Option<String>,
    pub timeout_seconds: Option<u32>,
    pub allow_watch_bookmarks: Option<bool>,
    pub watch: Option<String>,
}

impl ListOptions {
    /// Whether the request asked for streaming mode.
    pub fn is_watch(&self) -> bool {
        matches!(self.watch.as_deref(), Some("true") | Some("1"))
    }
}

/// Result of Accept-header negotiation: the reconstructed upstream Accept
/// string and whether a Table conversion was requested.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NegotiatedFormat {
    pub accept: String,
    pub table: bool,
}

/// Negotiates the response format from the client's Accept header.
///
/// The first acceptable clause wins, matching server-side negotiation order.
/// An absent or empty header means plain JSON.
pub fn negotiate_format(accept: Option<&str>) -> Result<NegotiatedFormat> {
    let header = accept.unwrap_or("").trim();
    if header.is_empty() {
        return Ok(NegotiatedFormat {
            accept: JSON_MIME.to_string(),
            table: false,
        });
    }
    header
        .split(',')
        .find_map(negotiate_clause)
        .ok_or(Error::Negotiation)
}

fn negotiate_clause(clause: &str) -> Option<NegotiatedFormat> {
    let mut parts = clause.split(';').map(str::trim);
    let media = parts.next()?;
    if !matches!(media, "application/json" | "application/*" | "*/*") {
        return None;
    }

    let mut as_kind = None;
    let mut version = None;
    let mut group = None;
    for param in parts {
        let (key, value) = param.split_once('=')?;
        match key.trim() {
            "as" => as_kind = Some(value.trim().to_string()),
            "v" => version = Some(value.trim().to_string()),
            "g" => group = Some(value.trim().to_string()),
            // quality factors and charsets are irrelevant here
            _ => {}
        }
    }

    let conversion = as_kind.filter(|kind| !kind.is_empty());
    if conversion.as_deref().is_some_and(|kind| kind != "Table") {
        return None;
    }

    let mut accept = JSON_MIME.to_string();
    if let Some(kind) = &conversion {
        accept.push_str(&format!(";as={kind}"));
        if let Some(v) = &version {
            accept.push_str(&format!(";v={v}"));
        }
        if let Some(g) = &group {
            accept.push_str(&format!(";g={g}"));
        }
    }

    Some(NegotiatedFormat {
        accept,
        table: conversion.as_deref() == Some("Table"),
    })
}

fn build_request(
    path: &str,
    opts: &ListOptions,
    format: &NegotiatedFormat,
    watch: bool,
) -> Result<http::Request<Vec<u8>>> {
    let mut qp = form_urlencoded::Serializer::new(format!("{path}?"));
    if let Some(v) = &opts.label_selector {
        qp.append_pair("labelSelector", v);
    }
    if let Some(v) = &opts.field_selector {
        qp.append_pair("fieldSelector", v);
    }
    if let Some(v) = opts.limit {
        qp.append_pair("limit", &v.to_string());
    }
    if let Some(v) = &opts.continue_token {
        qp.append_pair("continue", v);
    }
    if let Some(v) = &opts.resource_version {
        qp.append_pair("resourceVersion", v);
    }
    if let Some(v) = opts.timeout_seconds {
        qp.append_pair("timeoutSeconds", &v.to_string());
    }
    if let Some(v) = opts.allow_watch_bookmarks {
        qp.append_pair("allowWatchBookmarks", if v { "true" } else { "false" });
    }
    if watch {
        qp.append_pair("watch", "true");
    }
    if format.table {
        qp.append_pair("includeObject", "Object");
    }
    let url = qp.finish();

    http::Request::get(url)
        .header(http::header::ACCEPT, &format.accept)
        .body(Vec::new())
        .map_err(Error::from)
}

/// Stream of decoded upstream watch events.
pub type WatchStream =
    Pin<Box<dyn Stream<Item = kube::Result<WatchEvent<serde_json::Value>>> + Send>>;

/// One upstream resource API bound to a negotiated response format.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// List the collection, namespace-scoped or cluster-wide. Returns the
    /// raw upstream body (a `<Kind>List` or a `Table`).
    async fn list<'a>(
        &self,
        gvr: &'a Gvr,
        namespace: Option<&'a str>,
        opts: &'a ListOptions,
    ) -> Result<serde_json::Value>;

    /// Open a watch on the collection.
    async fn watch<'a>(
        &self,
        gvr: &'a Gvr,
        namespace: Option<&'a str>,
        opts: &'a ListOptions,
    ) -> Result<WatchStream>;
}

/// Produces an [`UpstreamApi`] for each incoming request, carrying the
/// request's negotiated Accept format.
#[cfg_attr(test, mockall::automock)]
pub trait UpstreamFactory: Send + Sync {
    fn for_request<'a>(&self, accept: Option<&'a str>) -> Result<Arc<dyn UpstreamApi>>;
}

/// [`UpstreamFactory`] backed by a shared kube client.
#[derive(Clone)]
pub struct ClientFactory {
    client: Client,
}

impl ClientFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl UpstreamFactory for ClientFactory {
    fn for_request(&self, accept: Option<&str>) -> Result<Arc<dyn UpstreamApi>> {
        let format = negotiate_format(accept)?;
        Ok(Arc::new(UpstreamClient {
            client: self.client.clone(),
            format,
        }))
    }
}

/// Dynamic client issuing raw requests with the negotiated Accept header.
pub struct UpstreamClient {
    client: Client,
    format: NegotiatedFormat,
}

#[async_trait]
impl UpstreamApi for UpstreamClient {
    async fn list<'a>(
        &self,
        gvr: &'a Gvr,
        namespace: Option<&'a str>,
        opts: &'a ListOptions,
    ) -> Result<serde_json::Value> {
        let request = build_request(&gvr.url_path(namespace), opts, &self.format, false)?;
        self.client
            .request::<serde_json::Value>(request)
            .await
            .map_err(Error::from)
    }

    async fn watch<'a>(
        &self,
        gvr: &'a Gvr,
        namespace: Option<&'a str>,
        opts: &'a ListOptions,
    ) -> Result<WatchStream> {
        let request = build_request(&gvr.url_path(namespace), opts, &self.format, true)?;
        let stream = self
            .client
            .request_events::<serde_json::Value>(request)
            .await
            .map_err(Error::from)?;
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gvr(group: &str, version: &str, resource: &str) -> Gvr {
        Gvr {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }

    #[test]
    fn url_paths_cover_core_and_grouped_resources() {
        assert_eq!(gvr("", "v1", "pods").url_path(None), "/api/v1/pods");
        assert_eq!(
            gvr("", "v1", "pods").url_path(Some("team-a")),
            "/api/v1/namespaces/team-a/pods"
        );
        assert_eq!(
            gvr("apps", "v1", "deployments").url_path(Some("team-a")),
            "/apis/apps/v1/namespaces/team-a/deployments"
        );
    }

    #[test]
    fn negotiate_defaults_to_json() {
        let format = negotiate_format(None).unwrap();
        assert_eq!(format.accept, "application/json");
        assert!(!format.table);

        let format = negotiate_format(Some("application/json")).unwrap();
        assert_eq!(format.accept, "application/json");
        assert!(!format.table);
    }

    #[test]
    fn negotiate_rebuilds_table_accept() {
        let format =
            negotiate_format(Some("application/json;as=Table;v=v1;g=meta.k8s.io")).unwrap();
        assert_eq!(format.accept, "application/json;as=Table;v=v1;g=meta.k8s.io");
        assert!(format.table);
    }

    #[test]
    fn negotiate_takes_first_acceptable_clause() {
        // kubectl sends the Table clause first with a plain fallback.
        let format = negotiate_format(Some(
            "application/json;as=Table;v=v1;g=meta.k8s.io, application/json",
        ))
        .unwrap();
        assert!(format.table);

        // A non-Table conversion is skipped in favor of the plain clause.
        let format = negotiate_format(Some(
            "application/json;as=PartialObjectMetadataList;v=v1;g=meta.k8s.io, application/json",
        ))
        .unwrap();
        assert!(!format.table);
        assert_eq!(format.accept, "application/json");
    }

    #[test]
    fn negotiate_rejects_unsupported_media_types() {
        assert!(matches!(
            negotiate_format(Some("application/yaml")),
            Err(Error::Negotiation)
        ));
        assert!(matches!(
            negotiate_format(Some("application/json;as=PartialObjectMetadataList;v=v1;g=meta.k8s.io")),
            Err(Error::Negotiation)
        ));
    }

    #[test]
    fn negotiate_accepts_wildcards() {
        let format = negotiate_format(Some("*/*")).unwrap();
        assert_eq!(format.accept, "application/json");
    }

    #[test]
    fn build_request_passes_options_through() {
        let opts = ListOptions {
            label_selector: Some("app=web".to_string()),
            field_selector: Some("status.phase=Running".to_string()),
            limit: Some(10),
            resource_version: Some("42".to_string()),
            ..ListOptions::default()
        };
        let format = NegotiatedFormat {
            accept: "application/json".to_string(),
            table: false,
        };
        let request =
            build_request(&gvr("", "v1", "pods").url_path(Some("team-a")), &opts, &format, false)
                .unwrap();
        let uri = request.uri().to_string();
        assert!(uri.starts_with("/api/v1/namespaces/team-a/pods?"));
        assert!(uri.contains("labelSelector=app%3Dweb"));
        assert!(uri.contains("fieldSelector=status.phase%3DRunning"));
        assert!(uri.contains("limit=10"));
        assert!(uri.contains("resourceVersion=42"));
        assert!(!uri.contains("watch=true"));
        assert!(!uri.contains("includeObject"));
        assert_eq!(
            request.headers().get(http::header::ACCEPT).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn build_request_adds_table_parameters() {
        let format = negotiate_format(Some("application/json;as=Table;v=v1;g=meta.k8s.io")).unwrap();
        let request = build_request(
            &gvr("apps", "v1", "deployments").url_path(None),
            &ListOptions::default(),
            &format,
            true,
        )
        .unwrap();
        let uri = request.uri().to_string();
        assert!(uri.contains("watch=true"));
        assert!(uri.contains("includeObject=Object"));
        assert_eq!(
            request.headers().get(http::header::ACCEPT).unwrap(),
            "application/json;as=Table;v=v1;g=meta.k8s.io"
        );
    }

    #[test]
    fn watch_flag_parses_like_a_query_parameter() {
        let opts: ListOptions = serde_urlencoded_from("watch=true&labelSelector=app%3Dweb");
        assert!(opts.is_watch());
        assert_eq!(opts.label_selector.as_deref(), Some("app=web"));

        let opts: ListOptions = serde_urlencoded_from("watch=1");
        assert!(opts.is_watch());

        let opts: ListOptions = serde_urlencoded_from("watch=false");
        assert!(!opts.is_watch());

        let opts: ListOptions = serde_urlencoded_from("limit=1&continue=token");
        assert!(!opts.is_watch());
        assert_eq!(opts.limit, Some(1));
        assert_eq!(opts.continue_token.as_deref(), Some("token"));
    }

    fn serde_urlencoded_from(query: &str) -> ListOptions {
        serde_urlencoded::from_str(query).unwrap()
    }
}
