//! `vigil modules` — insert or remove the bundled kernel modules.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Subcommand};
use vigil_common::config::MemoryConfig;
use vigil_common::constants::MODULES_DIR;
use vigil_core::kmod::ModuleTable;

/// Arguments for the `modules` command.
#[derive(Args, Debug)]
pub struct ModulesArgs {
    /// Path to the configuration document holding module parameters.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory holding the bundled module objects.
    #[arg(long, default_value = MODULES_DIR)]
    pub dir: PathBuf,

    /// Insert or remove.
    #[command(subcommand)]
    pub command: ModulesCommand,
}

/// Module operations.
#[derive(Subcommand, Debug)]
pub enum ModulesCommand {
    /// Insert every bundled module, in alphabetical order.
    Insert,
    /// Remove every bundled module, in reverse order.
    Remove,
}

/// Executes the `modules` command.
///
/// # Errors
///
/// Returns an error when the configuration or the module directory cannot
/// be read.
pub fn execute(args: &ModulesArgs) -> anyhow::Result<()> {
    let cfg = match &args.config {
        Some(path) => {
            let document = std::fs::read_to_string(path)
                .with_context(|| format!("could not read {}", path.display()))?;
            MemoryConfig::from_yaml_str(&document)?
        }
        None => MemoryConfig::default(),
    };

    let mut table = ModuleTable::new();
    match args.command {
        ModulesCommand::Insert => {
            table.insert_all(&cfg, &args.dir)?;
            tracing::info!(count = table.len(), "modules inserted");
        }
        ModulesCommand::Remove => {
            table.adopt_all(&args.dir)?;
            table.remove_all();
            tracing::info!("modules removed");
        }
    }
    Ok(())
}
