//! kubectl-hns entry point.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hns_cli::Cli;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("could not install default TLS crypto provider");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    if let Err(err) = cli.run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
