//! kubectl plugin for the aggregated subtree API.
//!
//! `kubectl hns get <resource>` lists a resource across an entire
//! hierarchical-namespace subtree through the `resources.hns.demo/v1alpha1`
//! aggregated API, printing kubectl-style tables.

pub mod commands;
pub mod error;
pub mod format;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// kubectl-hns - subtree-wide resource listing
#[derive(Parser, Debug)]
#[command(name = "kubectl-hns")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List resources across a namespace subtree
    Get(commands::get::GetArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Get(args) => commands::get::run(args).await,
        }
    }
}
