//! CLI subcommands

pub mod get;
