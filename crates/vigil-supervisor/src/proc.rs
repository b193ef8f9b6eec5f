//! Supervision of a single OS process.
//!
//! A [`Process`] is created from a configuration subtree and keeps the state
//! the supervisor needs across the process's lifetime: its pid, paused flag,
//! last fault time, the intentional-kill flag, and the hard-kill timer. The
//! dispatcher must route every relevant child-status change to
//! [`Process::handle_child_status`].
//!
//! All state here is owned by the single control thread; correctness depends
//! on the strict ordering of "mark intentional-kill, send signal, arm timer"
//! on stop and "cancel timer, clear pid, classify fault" on death.

use std::path::Path;
use std::time::Instant;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use vigil_common::config::ConfigStore;
use vigil_common::constants::{KILL_TIMEOUT, MAX_CMD_LINE_ARGS, MAX_ENV_VARS};
use vigil_common::error::{Result, VigilError};
use vigil_common::types::{ChildStatus, FaultAction, ProcState, SchedPolicy, WatchdogAction};
use vigil_core::rlimits::ProcLimits;

use crate::SupervisorCtx;
use crate::launcher::{ConfinementSpec, LaunchSpec, Launcher};
use crate::timer::KillTimer;

/// Configuration node holding the command-line argument list. The first
/// entry must be the executable path; a missing or empty list means the
/// process cannot be launched.
const CFG_NODE_ARGS: &str = "args";

/// Configuration node holding the environment variable map. Missing means
/// the child gets an empty environment.
const CFG_NODE_ENV_VARS: &str = "envVars";

/// Configuration node holding the scheduling priority string.
const CFG_NODE_PRIORITY: &str = "priority";

/// Configuration node holding the fault action string.
const CFG_NODE_FAULT_ACTION: &str = "faultAction";

/// Configuration node holding the watchdog action string.
const CFG_NODE_WATCHDOG_ACTION: &str = "watchdogAction";

/// A supervised process.
#[derive(Debug)]
pub struct Process {
    name: String,
    cfg_path: String,
    app_name: String,
    pid: Option<Pid>,
    paused: bool,
    fault_time: Option<Instant>,
    cmd_kill: bool,
    kill_timer: Option<KillTimer>,
}

impl Process {
    /// Creates a process record. The process name is the last segment of
    /// its configuration path.
    #[must_use]
    pub fn create(cfg_path: &str, app_name: &str) -> Self {
        let name = cfg_path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_owned();
        Self {
            name,
            cfg_path: cfg_path.to_owned(),
            app_name: app_name.to_owned(),
            pid: None,
            paused: false,
            fault_time: None,
            cmd_kill: false,
            kill_timer: None,
        }
    }

    /// The process name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning application.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// The process's configuration path.
    #[must_use]
    pub fn cfg_path(&self) -> &str {
        &self.cfg_path
    }

    /// The live pid, if any.
    #[must_use]
    pub const fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Time of the last fault, if the process has ever faulted.
    #[must_use]
    pub const fn fault_time(&self) -> Option<Instant> {
        self.fault_time
    }

    /// The process state derived from pid and paused flag.
    #[must_use]
    pub const fn state(&self) -> ProcState {
        match (self.pid, self.paused) {
            (None, _) => ProcState::Stopped,
            (Some(_), false) => ProcState::Running,
            (Some(_), true) => ProcState::Paused,
        }
    }

    /// Whether a graceful stop is in flight (the hard-kill timer is armed
    /// and death has not been observed yet).
    #[must_use]
    pub const fn is_stopping(&self) -> bool {
        self.kill_timer.is_some()
    }

    /// Deadline of the pending hard-kill timer, if armed.
    #[must_use]
    pub fn kill_deadline(&self) -> Option<Instant> {
        self.kill_timer.as_ref().map(KillTimer::deadline)
    }

    /// Starts the process unsandboxed in the given working directory.
    ///
    /// # Errors
    ///
    /// See [`Process::start_sandboxed`].
    pub fn start(&mut self, ctx: &mut SupervisorCtx<'_>, working_dir: &Path) -> Result<()> {
        self.start_with(ctx, working_dir, None)
    }

    /// Starts the process confined to a sandbox root under the given
    /// identity.
    ///
    /// # Errors
    ///
    /// Fails with [`VigilError::AlreadyRunning`] when the process has a live
    /// pid, [`VigilError::Overflow`] when a configured list exceeds its cap
    /// (a misconfiguration the caller cannot safely continue from), or
    /// [`VigilError::Fault`]/[`VigilError::Sys`] when the launch itself
    /// fails.
    pub fn start_sandboxed(
        &mut self,
        ctx: &mut SupervisorCtx<'_>,
        working_dir: &Path,
        confinement: ConfinementSpec,
    ) -> Result<()> {
        self.start_with(ctx, working_dir, Some(confinement))
    }

    fn start_with(
        &mut self,
        ctx: &mut SupervisorCtx<'_>,
        working_dir: &Path,
        confinement: Option<ConfinementSpec>,
    ) -> Result<()> {
        if let Some(pid) = self.pid {
            tracing::error!(
                process = %self.name,
                pid = pid.as_raw(),
                "cannot start, process is already running"
            );
            return Err(VigilError::AlreadyRunning {
                kind: "process",
                name: self.name.clone(),
            });
        }

        let cfg = ctx.cfg;
        let args = self.read_args(cfg)?;
        let env = self.read_env_vars(cfg)?;
        let policy = self.read_priority(cfg);
        let limits = ProcLimits::resolve(cfg, &self.cfg_path, owning_app_cfg_path(&self.cfg_path));

        let spec = LaunchSpec {
            proc_name: self.name.clone(),
            app_name: self.app_name.clone(),
            args,
            env,
            working_dir: working_dir.to_path_buf(),
            policy,
            limits,
            confinement,
        };

        let pid = ctx.launcher.launch(&spec)?;
        self.pid = Some(pid);
        self.paused = false;
        Ok(())
    }

    /// Requests a graceful stop: marks the death as intentional, sends the
    /// termination signal, and arms the hard-kill timer. The process is not
    /// stopped when this returns; the timer or the death notification,
    /// whichever comes first, finishes the job.
    ///
    /// Calling this without a live pid, or twice before the death is
    /// observed, is a caller contract violation.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Sys`] when the signal cannot be sent.
    ///
    /// # Panics
    ///
    /// Panics on the contract violations above.
    pub fn stop(&mut self, launcher: &mut dyn Launcher, now: Instant) -> Result<()> {
        assert!(
            self.kill_timer.is_none(),
            "process '{}' stopped twice before its death was observed",
            self.name
        );
        let Some(pid) = self.pid else {
            panic!("process '{}' has no live pid to stop", self.name);
        };

        tracing::debug!(process = %self.name, pid = pid.as_raw(), "soft killing");

        // The flag must be set before the signal so a fast death cannot be
        // classified as a fault.
        self.cmd_kill = true;
        launcher.signal(pid, Signal::SIGTERM)?;
        self.kill_timer = Some(KillTimer::arm(now, KILL_TIMEOUT));
        Ok(())
    }

    /// Suspends the running process. The recorded pid does not change.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Sys`] when the signal cannot be sent.
    ///
    /// # Panics
    ///
    /// Panics when the process has no live pid.
    pub fn pause(&mut self, launcher: &mut dyn Launcher) -> Result<()> {
        let Some(pid) = self.pid else {
            panic!("process '{}' has no live pid to pause", self.name);
        };
        launcher.signal(pid, Signal::SIGSTOP)
    }

    /// Continues the paused process. The recorded pid does not change.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Sys`] when the signal cannot be sent.
    ///
    /// # Panics
    ///
    /// Panics when the process has no live pid.
    pub fn resume(&mut self, launcher: &mut dyn Launcher) -> Result<()> {
        let Some(pid) = self.pid else {
            panic!("process '{}' has no live pid to resume", self.name);
        };
        launcher.signal(pid, Signal::SIGCONT)
    }

    /// Handles one child-status change for this process. Must be called once
    /// per relevant SIGCHLD.
    ///
    /// A stop/continue status only updates the paused flag. Anything else
    /// means the process died: the hard-kill timer is cancelled, the pid is
    /// cleared, and the death is classified. An intentional kill consumes
    /// the flag and is never a fault; a clean exit is not a fault; any other
    /// death records the fault time and maps the configured fault action.
    pub fn handle_child_status(
        &mut self,
        cfg: &dyn ConfigStore,
        status: ChildStatus,
        now: Instant,
    ) -> FaultAction {
        match status {
            ChildStatus::Stopped => {
                self.paused = true;
                tracing::info!(process = %self.name, "process has paused");
                FaultAction::NoFault
            }
            ChildStatus::Continued => {
                self.paused = false;
                tracing::info!(process = %self.name, "process has been continued");
                FaultAction::NoFault
            }
            ChildStatus::Exited(code) => {
                let Some(pid) = self.pid else {
                    tracing::warn!(
                        process = %self.name,
                        "death notification for a process with no live pid, ignoring"
                    );
                    return FaultAction::NoFault;
                };
                tracing::info!(
                    process = %self.name,
                    pid = pid.as_raw(),
                    code,
                    "process has exited"
                );
                self.on_death();
                if self.consume_cmd_kill() || code == 0 {
                    FaultAction::NoFault
                } else {
                    self.classify_fault(cfg, now)
                }
            }
            ChildStatus::Signaled(signal) => {
                let Some(pid) = self.pid else {
                    tracing::warn!(
                        process = %self.name,
                        "death notification for a process with no live pid, ignoring"
                    );
                    return FaultAction::NoFault;
                };
                tracing::info!(
                    process = %self.name,
                    pid = pid.as_raw(),
                    signal,
                    "process has exited due to a signal"
                );
                self.on_death();
                if self.consume_cmd_kill() {
                    FaultAction::NoFault
                } else {
                    self.classify_fault(cfg, now)
                }
            }
        }
    }

    /// Hard-kill timer expiry. Consumes the timer handle; if the death
    /// notification already consumed it this is a no-op, so the forced
    /// signal and the death can never both act.
    pub fn on_kill_timeout(&mut self, launcher: &mut dyn Launcher) {
        if self.kill_timer.take().is_none() {
            return;
        }
        let Some(pid) = self.pid else {
            tracing::warn!(process = %self.name, "process already exited before the hard-kill timeout");
            return;
        };
        tracing::warn!(process = %self.name, pid = pid.as_raw(), "hard killing");
        if let Err(e) = launcher.signal(pid, Signal::SIGKILL) {
            // The death may have raced the timeout before its SIGCHLD was
            // processed.
            tracing::warn!(
                process = %self.name,
                pid = pid.as_raw(),
                error = %e,
                "could not hard kill process"
            );
        }
    }

    /// The process's own watchdog policy. A paused process has nothing to
    /// do, a missing policy lets the caller fall back to the application's.
    #[must_use]
    pub fn watchdog_action(&self, cfg: &dyn ConfigStore) -> WatchdogAction {
        if self.paused {
            return WatchdogAction::Handled;
        }
        let value = cfg.read_txn(&self.cfg_path).get_string(CFG_NODE_WATCHDOG_ACTION);
        let action = WatchdogAction::from_config_str(value.as_deref());
        if action == WatchdogAction::Error {
            tracing::warn!(
                process = %self.name,
                action = value.as_deref().unwrap_or_default(),
                "unknown watchdog action"
            );
        }
        action
    }

    /// Tears down the per-death state: cancels any pending hard-kill timer
    /// and clears pid and paused flag.
    fn on_death(&mut self) {
        drop(self.kill_timer.take());
        self.pid = None;
        self.paused = false;
    }

    /// Consumes the intentional-kill flag, exactly once per kill.
    fn consume_cmd_kill(&mut self) -> bool {
        let was_set = self.cmd_kill;
        self.cmd_kill = false;
        was_set
    }

    /// Records the fault time and maps the configured fault action.
    fn classify_fault(&mut self, cfg: &dyn ConfigStore, now: Instant) -> FaultAction {
        self.fault_time = Some(now);
        let value = cfg.read_txn(&self.cfg_path).get_string(CFG_NODE_FAULT_ACTION);
        FaultAction::from_config_str(value.as_deref(), &self.name)
    }

    /// Reads the argument list: executable path first, then arguments.
    fn read_args(&self, cfg: &dyn ConfigStore) -> Result<Vec<String>> {
        let Some(args) = cfg.read_txn(&self.cfg_path).get_string_list(CFG_NODE_ARGS) else {
            return Err(VigilError::fault(format!(
                "no command-line arguments for process '{}'",
                self.name
            )));
        };
        if args.is_empty() {
            return Err(VigilError::fault(format!(
                "no command-line arguments for process '{}'",
                self.name
            )));
        }
        if args.len() > MAX_CMD_LINE_ARGS {
            return Err(VigilError::Overflow {
                what: "command-line arguments",
                limit: MAX_CMD_LINE_ARGS,
            });
        }
        if args.iter().any(String::is_empty) {
            return Err(VigilError::fault(format!(
                "empty entry in argument list for process '{}'",
                self.name
            )));
        }
        Ok(args)
    }

    /// Reads the environment variable list. A missing list is allowed.
    fn read_env_vars(&self, cfg: &dyn ConfigStore) -> Result<Vec<(String, String)>> {
        let Some(vars) = cfg.read_txn(&self.cfg_path).get_string_map(CFG_NODE_ENV_VARS) else {
            tracing::warn!(process = %self.name, "no environment variables configured");
            return Ok(Vec::new());
        };
        if vars.len() > MAX_ENV_VARS {
            return Err(VigilError::Overflow {
                what: "environment variables",
                limit: MAX_ENV_VARS,
            });
        }
        Ok(vars)
    }

    /// Reads the priority string, defaulting to "medium".
    fn read_priority(&self, cfg: &dyn ConfigStore) -> SchedPolicy {
        let value = cfg
            .read_txn(&self.cfg_path)
            .get_string(CFG_NODE_PRIORITY)
            .unwrap_or_else(|| "medium".to_owned());
        SchedPolicy::from_config_str(&value, &self.name)
    }
}

/// The owning application's configuration path, two segments above the
/// process's (`.../<app>/procs/<proc>`).
fn owning_app_cfg_path(proc_cfg_path: &str) -> &str {
    proc_cfg_path.rsplitn(3, '/').nth(2).unwrap_or("")
}
