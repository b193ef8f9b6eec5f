//! `vigil inspect` — print the resolved settings of configured applications.
//!
//! Resolves the same limit tables and policy strings the supervisor would
//! apply at start, without starting anything. Useful for checking what a
//! configuration document actually means on the device.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use serde::Serialize;
use vigil_common::config::{ConfigStore, MemoryConfig};
use vigil_common::constants::APPS_CFG_ROOT;
use vigil_common::types::SchedPolicy;
use vigil_core::rlimits::{AppLimits, ProcLimits};

/// Arguments for the `inspect` command.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Path to the configuration document.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Applications to inspect; all configured applications when empty.
    pub apps: Vec<String>,
}

/// Resolved view of one application.
#[derive(Debug, Serialize)]
struct AppReport {
    name: String,
    sandboxed: bool,
    file_system_bytes: u64,
    procs: Vec<ProcReport>,
}

/// Resolved view of one process.
#[derive(Debug, Serialize)]
struct ProcReport {
    name: String,
    priority: SchedPolicy,
    fault_action: String,
    limits: ProcLimits,
}

/// Executes the `inspect` command.
///
/// # Errors
///
/// Returns an error when the configuration cannot be loaded or the report
/// cannot be rendered.
pub fn execute(args: &InspectArgs) -> anyhow::Result<()> {
    let document = std::fs::read_to_string(&args.config)
        .with_context(|| format!("could not read {}", args.config.display()))?;
    let cfg = MemoryConfig::from_yaml_str(&document)?;

    let app_names = if args.apps.is_empty() {
        cfg.read_txn(APPS_CFG_ROOT).child_names("")
    } else {
        args.apps.clone()
    };

    let mut reports = Vec::with_capacity(app_names.len());
    for name in app_names {
        let app_path = format!("{APPS_CFG_ROOT}/{name}");
        let app_txn = cfg.read_txn(&app_path);

        let procs = app_txn
            .child_names("procs")
            .into_iter()
            .map(|proc_name| {
                let proc_path = format!("{app_path}/procs/{proc_name}");
                let proc_txn = cfg.read_txn(&proc_path);
                let priority = proc_txn
                    .get_string("priority")
                    .unwrap_or_else(|| "medium".to_owned());
                ProcReport {
                    priority: SchedPolicy::from_config_str(&priority, &proc_name),
                    fault_action: proc_txn
                        .get_string("faultAction")
                        .unwrap_or_else(|| "ignore".to_owned()),
                    limits: ProcLimits::resolve(&cfg, &proc_path, &app_path),
                    name: proc_name,
                }
            })
            .collect();

        reports.push(AppReport {
            sandboxed: app_txn.get_bool("sandboxed", true),
            file_system_bytes: AppLimits::resolve(&cfg, &app_path).file_system_bytes,
            procs,
            name,
        });
    }

    let rendered = serde_yaml::to_string(&reports).context("could not render report")?;
    println!("{rendered}");
    Ok(())
}
