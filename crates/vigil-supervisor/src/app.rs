//! Supervision of a named application: an ordered set of processes plus the
//! identity and confinement they share.
//!
//! The application aggregates per-process fault classifications into an
//! application-level action, applying a fault-rate limiter: a process that
//! keeps faulting fast enough is stopped along with its whole application
//! instead of being restarted forever, and a reboot-classified fault that
//! already rebooted the device once (per the persisted record) stops the
//! application instead of rebooting again.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::unistd::{Gid, Pid, Uid};
use vigil_common::config::ConfigTxn;
use vigil_common::constants::{
    APPS_INSTALL_DIR, FAULT_LIMIT_INTERVAL_RESTART, FAULT_LIMIT_INTERVAL_RESTART_APP,
    HOME_BASE_DIR, MAX_SUPPLEMENTARY_GROUPS, SANDBOXES_DIR,
};
use vigil_common::error::{Result, VigilError};
use vigil_common::types::{AppFaultAction, AppState, ChildStatus, FaultAction, ProcState, WatchdogAction};
use vigil_core::rlimits::AppLimits;
use vigil_core::users::UserRegistry;

use crate::SupervisorCtx;
use crate::fault_record::FaultRecord;
use crate::launcher::ConfinementSpec;
use crate::proc::Process;

/// Configuration node: whether the app runs sandboxed. Defaults to true.
const CFG_NODE_SANDBOXED: &str = "sandboxed";

/// Configuration node: supplementary group names for the app's user.
const CFG_NODE_GROUPS: &str = "groups";

/// Configuration node: the ordered process list.
const CFG_NODE_PROC_LIST: &str = "procs";

/// Configuration node: the application-level watchdog action string.
const CFG_NODE_WATCHDOG_ACTION: &str = "watchdogAction";

/// A process owned by an application, with its one-shot restart marker.
#[derive(Debug)]
pub struct ProcEntry {
    process: Process,
    /// Set by a watchdog decision: restart this process when its commanded
    /// death is observed. Consumed exactly once.
    restart_on_exit: bool,
}

impl ProcEntry {
    /// The supervised process.
    #[must_use]
    pub const fn process(&self) -> &Process {
        &self.process
    }
}

/// A supervised application.
#[derive(Debug)]
pub struct App {
    name: String,
    cfg_path: String,
    sandboxed: bool,
    install_path: PathBuf,
    sandbox_path: PathBuf,
    home_dir: PathBuf,
    uid: Uid,
    gid: Gid,
    supplementary_gids: Vec<Gid>,
    state: AppState,
    procs: Vec<ProcEntry>,
}

impl App {
    /// Creates an application from its configuration subtree: reads the
    /// sandboxed flag, fixes the app's identity for its lifetime (root for
    /// unsandboxed apps, a derived unique user plus supplementary groups
    /// otherwise), and builds one process per `procs` entry in declared
    /// order. On failure all partially-built state is released.
    ///
    /// # Errors
    ///
    /// Fails when the app's user cannot be resolved or the group list
    /// overflows its bound.
    pub fn create(cfg_path: &str, ctx: &mut SupervisorCtx<'_>) -> Result<Self> {
        let name = cfg_path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_owned();
        let cfg = ctx.cfg;
        let txn = cfg.read_txn(cfg_path);

        let sandboxed = txn.get_bool(CFG_NODE_SANDBOXED, true);

        let (uid, gid, supplementary_gids) = if sandboxed {
            let user_name = ctx.users.user_name_for_app(&name);
            let (uid, gid) = ctx.users.resolve_ids(&user_name)?;
            let groups = create_supplementary_groups(&name, &txn, ctx.users)?;
            (uid, gid, groups)
        } else {
            // Unsandboxed apps run as root so they can perform system
            // operations such as changing routing tables.
            (Uid::from_raw(0), Gid::from_raw(0), Vec::new())
        };

        let install_path = Path::new(APPS_INSTALL_DIR).join(&name);
        let home_dir = PathBuf::from(format!("{HOME_BASE_DIR}/app{name}"));
        let sandbox_path = if sandboxed {
            Path::new(SANDBOXES_DIR).join(&name)
        } else {
            PathBuf::new()
        };

        let procs = txn
            .child_names(CFG_NODE_PROC_LIST)
            .into_iter()
            .map(|proc_name| ProcEntry {
                process: Process::create(
                    &format!("{cfg_path}/{CFG_NODE_PROC_LIST}/{proc_name}"),
                    &name,
                ),
                restart_on_exit: false,
            })
            .collect();

        Ok(Self {
            name,
            cfg_path: cfg_path.to_owned(),
            sandboxed,
            install_path,
            sandbox_path,
            home_dir,
            uid,
            gid,
            supplementary_gids,
            state: AppState::Stopped,
            procs,
        })
    }

    /// The application name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The application's configuration path.
    #[must_use]
    pub fn cfg_path(&self) -> &str {
        &self.cfg_path
    }

    /// Whether the application runs sandboxed.
    #[must_use]
    pub const fn sandboxed(&self) -> bool {
        self.sandboxed
    }

    /// The application's install directory.
    #[must_use]
    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    /// The sandbox root (empty for unsandboxed apps).
    #[must_use]
    pub fn sandbox_path(&self) -> &Path {
        &self.sandbox_path
    }

    /// The home directory processes start in; inside the sandbox root for
    /// sandboxed apps.
    #[must_use]
    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    /// The application's user id. Fixed at creation.
    #[must_use]
    pub const fn uid(&self) -> Uid {
        self.uid
    }

    /// The application's primary group id. Fixed at creation.
    #[must_use]
    pub const fn gid(&self) -> Gid {
        self.gid
    }

    /// The application state.
    #[must_use]
    pub const fn state(&self) -> AppState {
        self.state
    }

    /// The owned processes in start order.
    #[must_use]
    pub fn procs(&self) -> &[ProcEntry] {
        &self.procs
    }

    /// Whether any owned process is in a non-stopped state.
    #[must_use]
    pub fn has_running_proc(&self) -> bool {
        self.procs
            .iter()
            .any(|entry| entry.process.state() != ProcState::Stopped)
    }

    /// Whether one of the owned processes currently has this pid.
    #[must_use]
    pub fn owns_pid(&self, pid: Pid) -> bool {
        self.procs.iter().any(|entry| entry.process.pid() == Some(pid))
    }

    /// Earliest pending hard-kill deadline across the owned processes.
    #[must_use]
    pub fn next_kill_deadline(&self) -> Option<Instant> {
        self.procs
            .iter()
            .filter_map(|entry| entry.process.kill_deadline())
            .min()
    }

    /// Fires every hard-kill timer that is due at `now`.
    pub fn fire_due_kill_timers(&mut self, launcher: &mut dyn crate::launcher::Launcher, now: Instant) {
        for entry in &mut self.procs {
            if entry.process.kill_deadline().is_some_and(|deadline| deadline <= now) {
                entry.process.on_kill_timeout(launcher);
            }
        }
    }

    /// Starts the application: constructs the sandbox and applies the
    /// filesystem quota (or creates the home directory for unsandboxed
    /// apps), then starts every process in list order. If any process fails
    /// to start the whole application is stopped again.
    ///
    /// # Errors
    ///
    /// Fails with [`VigilError::AlreadyRunning`] when already running, or
    /// [`VigilError::Fault`] when setup or any process start fails.
    pub fn start(&mut self, ctx: &mut SupervisorCtx<'_>, now: Instant) -> Result<()> {
        if self.state == AppState::Running {
            tracing::error!(app = %self.name, "application is already running");
            return Err(VigilError::AlreadyRunning {
                kind: "application",
                name: self.name.clone(),
            });
        }

        if self.sandboxed {
            ctx.sandbox.setup(&self.name, &self.sandbox_path)?;
            let limits = AppLimits::resolve(ctx.cfg, &self.cfg_path);
            let mut prepared = ctx.limiter.set_app_limits(&self.sandbox_path, &limits);
            if prepared.is_ok() {
                prepared = ctx.sandbox.populate(
                    &self.name,
                    &self.sandbox_path,
                    &self.home_dir,
                    self.uid,
                    self.gid,
                );
            }
            if let Err(e) = prepared {
                tracing::error!(app = %self.name, error = %e, "could not prepare sandbox");
                self.cleanup(ctx);
                return Err(e);
            }
        } else if let Err(e) = self.create_home_dir() {
            tracing::error!(app = %self.name, error = %e, "could not create home directory");
            return Err(e);
        }

        self.state = AppState::Running;

        for index in 0..self.procs.len() {
            if let Err(e) = self.launch_proc(index, ctx) {
                tracing::error!(
                    app = %self.name,
                    error = %e,
                    "could not start all application processes, stopping the application"
                );
                self.stop(ctx, now);
                return Err(VigilError::fault(format!(
                    "could not start all processes of application '{}'",
                    self.name
                )));
            }
        }

        Ok(())
    }

    /// Stops the application. Idempotent-guarded: stopping a stopped app
    /// only logs. Otherwise every non-stopped process gets a graceful stop,
    /// then any further processes sharing the app's uid are killed
    /// best-effort. The app reaches `Stopped` immediately when nothing is
    /// running, or asynchronously as death notifications arrive.
    pub fn stop(&mut self, ctx: &mut SupervisorCtx<'_>, now: Instant) {
        if self.state == AppState::Stopped {
            tracing::error!(app = %self.name, "application is already stopped");
            return;
        }

        for entry in &mut self.procs {
            entry.restart_on_exit = false;
            if entry.process.state() != ProcState::Stopped && !entry.process.is_stopping() {
                if let Err(e) = entry.process.stop(ctx.launcher, now) {
                    tracing::error!(
                        app = %self.name,
                        process = entry.process.name(),
                        error = %e,
                        "could not stop process"
                    );
                }
            }
        }

        // Sweep forked descendants that share the app's uid. Their deaths
        // are not tracked, so this cannot confirm they are gone before the
        // app is declared stopped.
        if self.uid.is_root() {
            tracing::info!(app = %self.name, "app runs as root, cannot kill all root processes");
        } else if let Err(e) = ctx.launcher.kill_all_for_uid(self.uid) {
            tracing::error!(app = %self.name, error = %e, "could not kill remaining app processes");
        }

        if !self.has_running_proc() {
            self.finish_stop(ctx);
        }
    }

    /// Handles one child-status change for the owned process with this pid.
    ///
    /// Delegates classification to the process, applies the fault-rate
    /// limiter, performs process-level actions (restarts) directly, and
    /// returns the application-level action for the caller. When no owned
    /// process remains non-stopped afterwards, the application is cleaned
    /// up and marked stopped.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::NotFound`] when no owned process has this pid.
    pub fn handle_child_status(
        &mut self,
        pid: Pid,
        status: ChildStatus,
        ctx: &mut SupervisorCtx<'_>,
        now: Instant,
    ) -> Result<AppFaultAction> {
        let Some(index) = self
            .procs
            .iter()
            .position(|entry| entry.process.pid() == Some(pid))
        else {
            return Err(VigilError::NotFound {
                kind: "process",
                id: pid.to_string(),
            });
        };

        let prev_fault_time = self.procs[index].process.fault_time();
        let fault = self.procs[index]
            .process
            .handle_child_status(ctx.cfg, status, now);
        let proc_name = self.procs[index].process.name().to_owned();

        let mut action = AppFaultAction::Ignore;

        if self.reached_fault_limit(index, fault, prev_fault_time, ctx.fault_record) {
            tracing::error!(
                app = %self.name,
                process = %proc_name,
                "process reached the fault limit, stopping the application instead of \
                 performing the configured fault action"
            );
            action = AppFaultAction::StopApp;
        } else {
            match fault {
                FaultAction::NoFault => {
                    // A commanded death. A watchdog decision may have asked
                    // for this process to come back.
                    if self.procs[index].process.state() == ProcState::Stopped
                        && self.procs[index].restart_on_exit
                    {
                        self.procs[index].restart_on_exit = false;
                        if self.launch_proc(index, ctx).is_err() {
                            tracing::error!(
                                app = %self.name,
                                process = %proc_name,
                                "watchdog could not restart process"
                            );
                            action = AppFaultAction::StopApp;
                        }
                    }
                }
                FaultAction::Ignore => {
                    tracing::error!(
                        app = %self.name,
                        process = %proc_name,
                        "process faulted and will be ignored per its fault policy"
                    );
                }
                FaultAction::Restart => {
                    tracing::error!(
                        app = %self.name,
                        process = %proc_name,
                        "process faulted and will be restarted per its fault policy"
                    );
                    if self.launch_proc(index, ctx).is_err() {
                        tracing::error!(app = %self.name, process = %proc_name, "could not restart process");
                        action = AppFaultAction::StopApp;
                    }
                }
                FaultAction::RestartApp => {
                    tracing::error!(
                        app = %self.name,
                        process = %proc_name,
                        "process faulted and the application will be restarted per its fault policy"
                    );
                    action = AppFaultAction::RestartApp;
                }
                FaultAction::StopApp => {
                    tracing::error!(
                        app = %self.name,
                        process = %proc_name,
                        "process faulted and the application will be stopped per its fault policy"
                    );
                    action = AppFaultAction::StopApp;
                }
                FaultAction::Reboot => {
                    tracing::error!(
                        app = %self.name,
                        process = %proc_name,
                        "process faulted and the system will be rebooted per its fault policy"
                    );
                    if let Err(e) = ctx.fault_record.write(&self.name, &proc_name) {
                        tracing::error!(
                            error = %e,
                            "could not write the reboot fault record, the reboot fault limit \
                             will not be enforced correctly"
                        );
                    }
                    action = AppFaultAction::Reboot;
                }
            }
        }

        if !self.has_running_proc() {
            self.finish_stop(ctx);
        }

        Ok(action)
    }

    /// Handles a liveness-timeout report for the owned process with this
    /// pid. The process's own watchdog policy applies first; if it has
    /// none (or it is unreadable), the application's policy is used.
    /// Process-scoped outcomes are performed here and reported as
    /// `Handled`; application-scoped outcomes are returned for the caller.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::NotFound`] when no owned process has this pid.
    pub fn handle_watchdog_timeout(
        &mut self,
        pid: Pid,
        ctx: &mut SupervisorCtx<'_>,
        now: Instant,
    ) -> Result<WatchdogAction> {
        let Some(index) = self
            .procs
            .iter()
            .position(|entry| entry.process.pid() == Some(pid))
        else {
            return Err(VigilError::NotFound {
                kind: "process",
                id: pid.to_string(),
            });
        };

        let mut action = self.procs[index].process.watchdog_action(ctx.cfg);
        if matches!(action, WatchdogAction::NotFound | WatchdogAction::Error) {
            let value = ctx
                .cfg
                .read_txn(&self.cfg_path)
                .get_string(CFG_NODE_WATCHDOG_ACTION);
            let fallback = WatchdogAction::from_config_str(value.as_deref());
            if fallback == WatchdogAction::Error {
                tracing::warn!(
                    app = %self.name,
                    action = value.as_deref().unwrap_or_default(),
                    "unknown watchdog action"
                );
            }
            // Keep Error when the proc-level policy existed but was
            // unreadable and the app level has nothing better.
            if !(fallback == WatchdogAction::NotFound && action == WatchdogAction::Error) {
                action = fallback;
            }
        }

        let proc_name = self.procs[index].process.name().to_owned();
        match action {
            WatchdogAction::NotFound => {
                tracing::error!(
                    app = %self.name,
                    process = %proc_name,
                    "watchdog timed out but no policy is configured, restarting the process by default"
                );
                self.procs[index].restart_on_exit = true;
                self.stop_proc_for_watchdog(index, ctx, now);
                Ok(WatchdogAction::Handled)
            }
            WatchdogAction::Ignore => {
                tracing::error!(
                    app = %self.name,
                    process = %proc_name,
                    "watchdog timed out and will be ignored per its timeout policy"
                );
                Ok(WatchdogAction::Handled)
            }
            WatchdogAction::Stop => {
                tracing::error!(
                    app = %self.name,
                    process = %proc_name,
                    "watchdog timed out, terminating the process per its timeout policy"
                );
                self.stop_proc_for_watchdog(index, ctx, now);
                Ok(WatchdogAction::Handled)
            }
            WatchdogAction::Restart => {
                tracing::error!(
                    app = %self.name,
                    process = %proc_name,
                    "watchdog timed out, restarting the process per its timeout policy"
                );
                self.procs[index].restart_on_exit = true;
                self.stop_proc_for_watchdog(index, ctx, now);
                Ok(WatchdogAction::Handled)
            }
            WatchdogAction::RestartApp | WatchdogAction::StopApp | WatchdogAction::Reboot => {
                tracing::error!(
                    app = %self.name,
                    process = %proc_name,
                    action = ?action,
                    "watchdog timed out, escalating per its timeout policy"
                );
                self.stop_proc_for_watchdog(index, ctx, now);
                Ok(action)
            }
            WatchdogAction::Error => {
                tracing::error!(
                    app = %self.name,
                    process = %proc_name,
                    "could not determine a watchdog action for the process"
                );
                Ok(WatchdogAction::Handled)
            }
            WatchdogAction::Handled => Ok(WatchdogAction::Handled),
        }
    }

    /// Starts (or restarts) the process at `index` under the app's identity.
    fn launch_proc(&mut self, index: usize, ctx: &mut SupervisorCtx<'_>) -> Result<()> {
        let home = self.home_dir.clone();
        if self.sandboxed {
            let confinement = ConfinementSpec {
                root: self.sandbox_path.clone(),
                uid: self.uid,
                gid: self.gid,
                groups: self.supplementary_gids.clone(),
            };
            self.procs[index].process.start_sandboxed(ctx, &home, confinement)
        } else {
            self.procs[index].process.start(ctx, &home)
        }
    }

    /// Issues a graceful stop for a watchdog decision, tolerating a process
    /// that is already on its way down.
    fn stop_proc_for_watchdog(&mut self, index: usize, ctx: &mut SupervisorCtx<'_>, now: Instant) {
        let entry = &mut self.procs[index];
        if entry.process.state() != ProcState::Stopped && !entry.process.is_stopping() {
            if let Err(e) = entry.process.stop(ctx.launcher, now) {
                tracing::error!(
                    app = %self.name,
                    process = entry.process.name(),
                    error = %e,
                    "could not stop process for watchdog action"
                );
            }
        }
    }

    /// Whether this fault reaches the fault limit: two restarts inside the
    /// short interval, two app restarts inside the longer one, or a reboot
    /// fault that already has a persisted record naming this app/process.
    fn reached_fault_limit(
        &self,
        index: usize,
        fault: FaultAction,
        prev_fault_time: Option<Instant>,
        record: &FaultRecord,
    ) -> bool {
        match fault {
            FaultAction::Restart => {
                within_interval(prev_fault_time, self.procs[index].process.fault_time(), FAULT_LIMIT_INTERVAL_RESTART)
            }
            FaultAction::RestartApp => within_interval(
                prev_fault_time,
                self.procs[index].process.fault_time(),
                FAULT_LIMIT_INTERVAL_RESTART_APP,
            ),
            FaultAction::Reboot => record.matches(&self.name, self.procs[index].process.name()),
            _ => false,
        }
    }

    /// Marks the application stopped and tears down its sandbox and limits.
    /// Cleanup happens here so a restart picks up fresh configuration.
    fn finish_stop(&mut self, ctx: &mut SupervisorCtx<'_>) {
        if self.state == AppState::Stopped {
            return;
        }
        tracing::info!(app = %self.name, "application has stopped");
        self.cleanup(ctx);
        self.state = AppState::Stopped;
    }

    /// Tears down the sandbox filesystem and confinement root.
    fn cleanup(&mut self, ctx: &mut SupervisorCtx<'_>) {
        if !self.sandboxed {
            return;
        }
        if let Err(e) = ctx.limiter.clear_app_limits(&self.sandbox_path) {
            tracing::error!(app = %self.name, error = %e, "could not remove application filesystem");
        }
        if let Err(e) = ctx.sandbox.remove(&self.name, &self.sandbox_path) {
            tracing::error!(app = %self.name, error = %e, "could not remove sandbox");
        }
    }

    /// Creates and owns the home directory for an unsandboxed app.
    fn create_home_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.home_dir).map_err(|e| VigilError::Io {
            path: self.home_dir.clone(),
            source: e,
        })?;
        nix::unistd::chown(&self.home_dir, Some(self.uid), Some(self.gid))
            .map_err(|e| VigilError::sys("chown", e))
    }
}

/// Whether two consecutive fault times fall within the limit interval.
fn within_interval(prev: Option<Instant>, current: Option<Instant>, limit: Duration) -> bool {
    match (prev, current) {
        (Some(prev), Some(current)) => current.duration_since(prev) <= limit,
        _ => false,
    }
}

/// Creates the supplementary groups configured for an application. A group
/// that cannot be created is logged and skipped; an oversized list is a
/// misconfiguration the caller cannot continue from.
fn create_supplementary_groups(
    app_name: &str,
    txn: &ConfigTxn<'_>,
    users: &mut dyn UserRegistry,
) -> Result<Vec<Gid>> {
    let Some(names) = txn.get_string_list(CFG_NODE_GROUPS) else {
        tracing::debug!(app = app_name, "no supplementary groups configured");
        return Ok(Vec::new());
    };
    if names.len() > MAX_SUPPLEMENTARY_GROUPS {
        return Err(VigilError::Overflow {
            what: "supplementary groups",
            limit: MAX_SUPPLEMENTARY_GROUPS,
        });
    }

    let mut gids = Vec::with_capacity(names.len());
    for group_name in names {
        if group_name.is_empty() {
            tracing::warn!(app = app_name, "skipping invalid supplementary group entry");
            continue;
        }
        match users.create_group(&group_name) {
            Ok(gid) => gids.push(gid),
            Err(e) => {
                tracing::warn!(
                    app = app_name,
                    group = %group_name,
                    error = %e,
                    "could not create supplementary group, skipping it"
                );
            }
        }
    }
    Ok(gids)
}
