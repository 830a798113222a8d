//! `kubectl hns get` - list a resource across a namespace subtree.

use std::path::PathBuf;

use futures::StreamExt;
use kube::core::WatchEvent;

use crate::error::{Error, Result};
use crate::format::{render_table, Table};

/// Accept header requesting server-side Table rendering.
const TABLE_ACCEPT: &str = "application/json;as=Table;v=v1;g=meta.k8s.io";

/// Arguments for `get`
#[derive(clap::Args, Debug)]
pub struct GetArgs {
    /// Resource to list, e.g. `pods` or `apps.deployments`
    pub resource: String,

    /// Parent namespace whose subtree is listed
    #[arg(short = 'n', long, default_value = "default", conflicts_with = "all_namespaces")]
    pub namespace: String,

    /// List across all namespaces instead of a subtree
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    /// Watch for changes after listing
    #[arg(short = 'w', long)]
    pub watch: bool,

    /// Path to a kubeconfig
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,
}

/// Run the get command
pub async fn run(args: GetArgs) -> Result<()> {
    let client = client(args.kubeconfig.clone()).await?;
    let namespace = (!args.all_namespaces).then_some(args.namespace.as_str());
    let path = resource_path(&args.resource, namespace);

    let table = fetch_table(&client, &path).await?;
    print!("{}", render_table(&table, true));

    if args.watch {
        let resource_version = table
            .metadata
            .resource_version
            .unwrap_or_else(|| "0".to_string());
        watch_table(&client, &path, &resource_version).await?;
    }
    Ok(())
}

fn resource_path(resource: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("/apis/resources.hns.demo/v1alpha1/namespaces/{ns}/{resource}"),
        None => format!("/apis/resources.hns.demo/v1alpha1/{resource}"),
    }
}

async fn fetch_table(client: &kube::Client, path: &str) -> Result<Table> {
    let request = http::Request::get(format!("{path}?includeObject=Object"))
        .header(http::header::ACCEPT, TABLE_ACCEPT)
        .body(Vec::new())?;
    client.request::<Table>(request).await.map_err(Error::from)
}

async fn watch_table(client: &kube::Client, path: &str, resource_version: &str) -> Result<()> {
    let request = http::Request::get(format!(
        "{path}?includeObject=Object&watch=true&resourceVersion={resource_version}"
    ))
    .header(http::header::ACCEPT, TABLE_ACCEPT)
    .body(Vec::new())?;

    let stream = client.request_events::<Table>(request).await?;
    let mut stream = std::pin::pin!(stream);
    while let Some(event) = stream.next().await {
        match event? {
            WatchEvent::Added(table)
            | WatchEvent::Modified(table)
            | WatchEvent::Deleted(table) => {
                print!("{}", render_table(&table, false));
            }
            WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(err) => return Err(Error::Api(err.to_string())),
        }
    }
    Ok(())
}

async fn client(kubeconfig: Option<PathBuf>) -> Result<kube::Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(&path)
                .map_err(|err| Error::Kubeconfig(err.to_string()))?;
            kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await
            .map_err(|err| Error::Kubeconfig(err.to_string()))?
        }
        None => kube::Config::infer()
            .await
            .map_err(|err| Error::Kubeconfig(err.to_string()))?,
    };
    kube::Client::try_from(config).map_err(Error::from)
}
