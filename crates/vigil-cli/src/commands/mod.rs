//! CLI command definitions and dispatch.

pub mod inspect;
pub mod modules;
pub mod run;

use clap::{Parser, Subcommand};

/// Top-level CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Embedded application supervisor")]
pub struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the supervisor: insert kernel modules, start the configured
    /// applications, and dispatch events until shut down.
    Run(run::RunArgs),
    /// Insert or remove the bundled kernel modules.
    Modules(modules::ModulesArgs),
    /// Print the resolved settings for configured applications.
    Inspect(inspect::InspectArgs),
}

/// Dispatches the parsed CLI to its command.
///
/// # Errors
///
/// Propagates the command's failure.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run::execute(args),
        Commands::Modules(args) => modules::execute(&args),
        Commands::Inspect(args) => inspect::execute(&args),
    }
}
