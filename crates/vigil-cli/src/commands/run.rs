//! `vigil run` — the supervisor daemon.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::Args;
use vigil_common::config::{ConfigStore, MemoryConfig};
use vigil_common::constants::{APPS_CFG_ROOT, MODULES_DIR};
use vigil_core::kmod::ModuleTable;
use vigil_core::rlimits::TmpfsLimiter;
use vigil_core::sandbox::DirSandbox;
use vigil_core::users::SystemUsers;
use vigil_supervisor::SupervisorCtx;
use vigil_supervisor::events::{Dispatcher, OsSystemControl};
use vigil_supervisor::fault_record::FaultRecord;
use vigil_supervisor::launcher::ForkLauncher;
use vigil_supervisor::registry::AppRegistry;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the configuration document.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Applications to start; all configured applications when empty.
    pub apps: Vec<String>,

    /// Skip kernel module insertion and removal.
    #[arg(long)]
    pub skip_modules: bool,
}

/// Executes the `run` command.
///
/// # Errors
///
/// Returns an error when the configuration cannot be loaded or the
/// dispatcher's plumbing fails.
pub fn execute(args: RunArgs) -> anyhow::Result<()> {
    let document = std::fs::read_to_string(&args.config)
        .with_context(|| format!("could not read {}", args.config.display()))?;
    let cfg = MemoryConfig::from_yaml_str(&document)?;

    // Block the supervised signals before anything can fork.
    let mut dispatcher = Dispatcher::new()?;

    let mut modules = ModuleTable::new();
    if !args.skip_modules {
        modules.insert_all(&cfg, Path::new(MODULES_DIR))?;
    }

    let mut launcher = ForkLauncher;
    let mut sandbox = DirSandbox;
    let mut limiter = TmpfsLimiter;
    let mut users = SystemUsers;
    let fault_record = FaultRecord::at_default_path();
    let mut ctx = SupervisorCtx {
        cfg: &cfg,
        launcher: &mut launcher,
        sandbox: &mut sandbox,
        limiter: &mut limiter,
        users: &mut users,
        fault_record: &fault_record,
    };

    let app_names = if args.apps.is_empty() {
        cfg.read_txn(APPS_CFG_ROOT).child_names("")
    } else {
        args.apps.clone()
    };

    let mut registry = AppRegistry::new();
    let now = Instant::now();
    for name in &app_names {
        let cfg_path = format!("{APPS_CFG_ROOT}/{name}");
        if let Err(e) = registry.create_app(&cfg_path, &mut ctx) {
            tracing::error!(app = %name, error = %e, "could not create application");
            continue;
        }
        match registry.start_app(name, &mut ctx, now) {
            Ok(()) => tracing::info!(app = %name, "application started"),
            Err(e) => tracing::error!(app = %name, error = %e, "could not start application"),
        }
    }

    let mut system = OsSystemControl;
    dispatcher.run(&mut registry, &mut ctx, &mut system)?;

    if !args.skip_modules {
        modules.remove_all();
    }
    Ok(())
}
