//! # vigil — embedded application supervisor
//!
//! Single binary that turns a declarative application configuration into
//! running, confined, monitored processes and keeps them alive per their
//! fault policies.

mod commands;

use clap::Parser;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    commands::execute(cli)
}
