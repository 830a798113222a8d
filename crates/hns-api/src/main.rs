//! Server binary: starts the caches and schema watches, then serves the
//! aggregated API over mutual TLS.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hns_api::catalog::{self, ApiServerDiscovery, Catalog};
use hns_api::handlers::AppState;
use hns_api::hierarchy::NamespaceResolver;
use hns_api::upstream::ClientFactory;
use hns_api::{auth, server, stores};

/// Aggregated list/watch API for hierarchical namespace subtrees.
#[derive(Parser, Debug)]
#[command(name = "hns-api", version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDRESS", default_value = "0.0.0.0")]
    host: String,

    /// TLS port to listen on
    #[arg(long, env = "LISTEN_PORT", default_value_t = 7443)]
    port: u16,

    /// Path to the serving certificate
    #[arg(long, env = "CERTPATH")]
    certpath: PathBuf,

    /// Path to the serving key
    #[arg(long, env = "KEYPATH")]
    keypath: PathBuf,

    /// Path to a kubeconfig; in-cluster config is tried first
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Enable debug logs
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// Enable trace logs
    #[arg(long, env = "TRACE")]
    trace: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("could not install default TLS crypto provider"))?;

    let config = kube_config(args.kubeconfig.clone()).await?;
    let client = kube::Client::try_from(config)?;

    let caches = stores::start(&client).await?;

    let catalog = Catalog::new(Arc::new(ApiServerDiscovery::new(client.clone())));
    tokio::spawn(catalog::watch_schema_changes(
        client.clone(),
        Arc::clone(&catalog),
    ));

    let state = AppState {
        catalog,
        resolver: NamespaceResolver::new(caches.namespaces.clone()),
        upstream: Arc::new(ClientFactory::new(client)),
    };
    let app = server::router(state, caches.config_maps.clone());

    let client_ca = auth::client_ca(&caches.config_maps)
        .map_err(|err| anyhow::anyhow!("could not load client CA: {err}"))?;

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    server::serve(
        addr,
        server::TlsPaths {
            cert: args.certpath,
            key: args.keypath,
        },
        &client_ca,
        app,
    )
    .await
}

fn init_tracing(args: &Args) {
    let default_level = if args.trace {
        "trace"
    } else if args.debug {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// In-cluster config when available, otherwise the given kubeconfig path or
/// `~/.kube/config`.
async fn kube_config(kubeconfig: Option<PathBuf>) -> anyhow::Result<kube::Config> {
    if let Ok(config) = kube::Config::incluster() {
        return Ok(config);
    }
    let path = match kubeconfig {
        Some(path) => path,
        None => std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".kube").join("config"))
            .ok_or_else(|| anyhow::anyhow!("could not get kubeconfig"))?,
    };
    let kubeconfig = kube::config::Kubeconfig::read_from(&path)?;
    let config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &kube::config::KubeConfigOptions::default())
            .await?;
    Ok(config)
}
