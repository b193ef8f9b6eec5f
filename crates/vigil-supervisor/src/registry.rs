//! The owned application registry.
//!
//! An explicit registry object passed into the supervisor at startup, never
//! a hidden singleton, so tests can construct isolated instances. The
//! registry routes child-status changes and watchdog timeouts to the owning
//! application and carries out the application-level consequences (stop,
//! restart); rebooting is left to the caller.

use std::time::Instant;

use nix::unistd::Pid;
use vigil_common::error::{Result, VigilError};
use vigil_common::types::{AppFaultAction, AppState, ChildStatus, WatchdogAction};

use crate::SupervisorCtx;
use crate::app::App;

/// Registry of every application the supervisor owns.
#[derive(Debug, Default)]
pub struct AppRegistry {
    apps: Vec<App>,
    /// Names of applications to start again once they reach `Stopped`.
    pending_restart: Vec<String>,
}

impl AppRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an application from its configuration subtree and takes
    /// ownership of it.
    ///
    /// # Errors
    ///
    /// Fails when an application of the same name already exists or the
    /// application cannot be built.
    pub fn create_app(&mut self, cfg_path: &str, ctx: &mut SupervisorCtx<'_>) -> Result<&App> {
        let app = App::create(cfg_path, ctx)?;
        if self.app(app.name()).is_some() {
            return Err(VigilError::BadParameter {
                message: format!("application '{}' already exists", app.name()),
            });
        }
        self.apps.push(app);
        let index = self.apps.len() - 1;
        Ok(&self.apps[index])
    }

    /// Releases an application. Deletion is only valid while stopped.
    ///
    /// # Errors
    ///
    /// Fails with [`VigilError::NotFound`] for an unknown name and
    /// [`VigilError::Busy`] for a running application.
    pub fn delete_app(&mut self, name: &str) -> Result<()> {
        let Some(index) = self.apps.iter().position(|app| app.name() == name) else {
            return Err(VigilError::NotFound {
                kind: "application",
                id: name.to_owned(),
            });
        };
        if self.apps[index].state() == AppState::Running {
            return Err(VigilError::Busy {
                kind: "application",
                name: name.to_owned(),
            });
        }
        drop(self.apps.remove(index));
        self.pending_restart.retain(|pending| pending != name);
        Ok(())
    }

    /// Looks an application up by name.
    #[must_use]
    pub fn app(&self, name: &str) -> Option<&App> {
        self.apps.iter().find(|app| app.name() == name)
    }

    /// The owned applications.
    pub fn apps(&self) -> impl Iterator<Item = &App> {
        self.apps.iter()
    }

    /// Starts the named application.
    ///
    /// # Errors
    ///
    /// Fails with [`VigilError::NotFound`] for an unknown name, or with the
    /// application's start failure.
    pub fn start_app(&mut self, name: &str, ctx: &mut SupervisorCtx<'_>, now: Instant) -> Result<()> {
        let Some(index) = self.apps.iter().position(|app| app.name() == name) else {
            return Err(VigilError::NotFound {
                kind: "application",
                id: name.to_owned(),
            });
        };
        self.apps[index].start(ctx, now)
    }

    /// Stops the named application.
    ///
    /// # Errors
    ///
    /// Fails with [`VigilError::NotFound`] for an unknown name.
    pub fn stop_app(&mut self, name: &str, ctx: &mut SupervisorCtx<'_>, now: Instant) -> Result<()> {
        let Some(index) = self.apps.iter().position(|app| app.name() == name) else {
            return Err(VigilError::NotFound {
                kind: "application",
                id: name.to_owned(),
            });
        };
        self.apps[index].stop(ctx, now);
        Ok(())
    }

    /// Stops every running application and forgets pending restarts.
    pub fn stop_all(&mut self, ctx: &mut SupervisorCtx<'_>, now: Instant) {
        self.pending_restart.clear();
        for app in &mut self.apps {
            if app.state() == AppState::Running {
                app.stop(ctx, now);
            }
        }
    }

    /// Whether every application is stopped.
    #[must_use]
    pub fn all_stopped(&self) -> bool {
        self.apps.iter().all(|app| app.state() == AppState::Stopped)
    }

    /// Routes one child-status change to the owning application and carries
    /// out the resulting application-level action. Returns the action so the
    /// caller can reboot on [`AppFaultAction::Reboot`].
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::NotFound`] when no application owns the pid.
    pub fn handle_child_status(
        &mut self,
        pid: Pid,
        status: ChildStatus,
        ctx: &mut SupervisorCtx<'_>,
        now: Instant,
    ) -> Result<AppFaultAction> {
        let Some(index) = self.apps.iter().position(|app| app.owns_pid(pid)) else {
            return Err(VigilError::NotFound {
                kind: "process",
                id: pid.to_string(),
            });
        };

        let action = self.apps[index].handle_child_status(pid, status, ctx, now)?;
        match action {
            AppFaultAction::Ignore | AppFaultAction::Reboot => {}
            AppFaultAction::RestartApp => {
                self.mark_pending_restart(index);
                if self.apps[index].state() == AppState::Running {
                    self.apps[index].stop(ctx, now);
                }
            }
            AppFaultAction::StopApp => {
                if self.apps[index].state() == AppState::Running {
                    self.apps[index].stop(ctx, now);
                }
            }
        }

        self.run_pending_restarts(ctx, now);
        Ok(action)
    }

    /// Routes a liveness-timeout report to the owning application and
    /// carries out the application-level consequences. Returns the action so
    /// the caller can reboot on [`WatchdogAction::Reboot`].
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::NotFound`] when no application owns the pid.
    pub fn handle_watchdog_timeout(
        &mut self,
        pid: Pid,
        ctx: &mut SupervisorCtx<'_>,
        now: Instant,
    ) -> Result<WatchdogAction> {
        let Some(index) = self.apps.iter().position(|app| app.owns_pid(pid)) else {
            return Err(VigilError::NotFound {
                kind: "process",
                id: pid.to_string(),
            });
        };

        let action = self.apps[index].handle_watchdog_timeout(pid, ctx, now)?;
        match action {
            WatchdogAction::RestartApp => {
                self.mark_pending_restart(index);
                if self.apps[index].state() == AppState::Running {
                    self.apps[index].stop(ctx, now);
                }
            }
            WatchdogAction::StopApp => {
                if self.apps[index].state() == AppState::Running {
                    self.apps[index].stop(ctx, now);
                }
            }
            _ => {}
        }

        self.run_pending_restarts(ctx, now);
        Ok(action)
    }

    /// Earliest pending hard-kill deadline across all applications.
    #[must_use]
    pub fn next_kill_deadline(&self) -> Option<Instant> {
        self.apps.iter().filter_map(App::next_kill_deadline).min()
    }

    /// Fires every hard-kill timer due at `now`.
    pub fn fire_due_kill_timers(&mut self, launcher: &mut dyn crate::launcher::Launcher, now: Instant) {
        for app in &mut self.apps {
            app.fire_due_kill_timers(launcher, now);
        }
    }

    fn mark_pending_restart(&mut self, index: usize) {
        let name = self.apps[index].name().to_owned();
        if !self.pending_restart.contains(&name) {
            self.pending_restart.push(name);
        }
    }

    /// Starts any pending-restart application that has fully stopped.
    fn run_pending_restarts(&mut self, ctx: &mut SupervisorCtx<'_>, now: Instant) {
        let mut index = 0;
        while index < self.pending_restart.len() {
            let name = self.pending_restart[index].clone();
            let stopped = self
                .app(&name)
                .is_some_and(|app| app.state() == AppState::Stopped);
            if stopped {
                let _ = self.pending_restart.remove(index);
                if let Err(e) = self.start_app(&name, ctx, now) {
                    tracing::error!(app = %name, error = %e, "could not restart application");
                }
            } else {
                index += 1;
            }
        }
    }
}
