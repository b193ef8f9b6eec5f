//! Domain types shared across the Vigil workspace.
//!
//! The string-keyed enums read from configuration (fault action, watchdog
//! action, scheduling priority) each have a single total mapping function
//! with an explicit default-and-log arm, so a misconfigured policy can never
//! silently no-op.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_RT_PRIORITY, MIN_RT_PRIORITY};

/// Lifecycle state of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppState {
    /// No owned process is in a non-stopped state.
    Stopped,
    /// The application has been started and not yet fully stopped.
    Running,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcState {
    /// No live OS process.
    Stopped,
    /// A live OS process exists.
    Running,
    /// A live OS process exists but is stopped by `SIGSTOP`.
    Paused,
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Per-process fault classification derived from a wait status and the
/// process's configured fault policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// The death was not a fault (clean exit, pause/resume, or an
    /// intentional kill by the supervisor).
    NoFault,
    /// Fault noted, no action taken.
    Ignore,
    /// Restart the faulting process.
    Restart,
    /// Restart the whole application.
    RestartApp,
    /// Stop the whole application.
    StopApp,
    /// Reboot the system.
    Reboot,
}

impl FaultAction {
    /// Maps a configured fault-action string to a classification.
    ///
    /// A missing or unrecognized string yields [`FaultAction::Ignore`]; it is
    /// never silently promoted to a stronger action.
    pub fn from_config_str(value: Option<&str>, proc_name: &str) -> Self {
        match value {
            Some("ignore") => Self::Ignore,
            Some("restart") => Self::Restart,
            Some("restartApp") => Self::RestartApp,
            Some("stopApp") => Self::StopApp,
            Some("reboot") => Self::Reboot,
            Some(other) => {
                tracing::warn!(
                    process = proc_name,
                    action = other,
                    "unrecognized fault action, assuming 'ignore'"
                );
                Self::Ignore
            }
            None => {
                tracing::debug!(process = proc_name, "no fault action configured, assuming 'ignore'");
                Self::Ignore
            }
        }
    }
}

/// Application-level action derived by aggregating a process fault
/// classification with the fault-rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppFaultAction {
    /// Nothing further for the caller to do.
    Ignore,
    /// The application should be stopped and started again.
    RestartApp,
    /// The application should be stopped.
    StopApp,
    /// The system should be rebooted.
    Reboot,
}

/// Action to take when a process's liveness watchdog times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// No policy was configured at this level.
    NotFound,
    /// The configured policy could not be read or is unknown.
    Error,
    /// Timeout noted, no action taken.
    Ignore,
    /// Stop the process.
    Stop,
    /// Restart the process.
    Restart,
    /// Restart the whole application.
    RestartApp,
    /// Stop the whole application.
    StopApp,
    /// Reboot the system.
    Reboot,
    /// Already dealt with; no further action required.
    Handled,
}

impl WatchdogAction {
    /// Maps a configured watchdog-action string to an action.
    ///
    /// `None` (node absent) yields [`WatchdogAction::NotFound`] so the caller
    /// can fall back to a policy at a wider scope; an unrecognized string
    /// yields [`WatchdogAction::Error`].
    pub fn from_config_str(value: Option<&str>) -> Self {
        match value {
            None => Self::NotFound,
            Some("ignore") => Self::Ignore,
            Some("stop") => Self::Stop,
            Some("restart") => Self::Restart,
            Some("restartApp") => Self::RestartApp,
            Some("stopApp") => Self::StopApp,
            Some("reboot") => Self::Reboot,
            Some(_) => Self::Error,
        }
    }
}

/// Scheduling class resolved from a configured priority string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedPolicy {
    /// `SCHED_IDLE`: only runs when nothing else wants the CPU.
    Idle,
    /// `SCHED_OTHER` with a nice offset.
    Normal {
        /// Nice level; +10 for "low", 0 for "medium", -10 for "high".
        nice: i32,
    },
    /// `SCHED_RR` at the given realtime level (1..=32).
    RoundRobin {
        /// Realtime priority level.
        level: i32,
    },
}

impl SchedPolicy {
    /// The "medium" priority every unrecognized string falls back to.
    pub const DEFAULT: Self = Self::Normal { nice: 0 };

    /// Maps a configured priority string to a scheduling class.
    ///
    /// Accepts "idle", "low", "medium", "high" and "rt1".."rt32". Anything
    /// else logs a warning and falls back to "medium"; a bad priority string
    /// is never a fatal error.
    pub fn from_config_str(value: &str, proc_name: &str) -> Self {
        match value {
            "idle" => Self::Idle,
            "low" => Self::Normal { nice: 10 },
            "medium" => Self::Normal { nice: 0 },
            "high" => Self::Normal { nice: -10 },
            other => {
                if let Some(level) = other.strip_prefix("rt") {
                    if let Ok(level) = level.parse::<i32>() {
                        if (MIN_RT_PRIORITY..=MAX_RT_PRIORITY).contains(&level) {
                            return Self::RoundRobin { level };
                        }
                    }
                }
                tracing::warn!(
                    process = proc_name,
                    priority = other,
                    "unrecognized priority level, using default"
                );
                Self::DEFAULT
            }
        }
    }

    /// Whether this is a realtime scheduling class.
    #[must_use]
    pub const fn is_realtime(self) -> bool {
        matches!(self, Self::RoundRobin { .. })
    }
}

/// Outcome of a `wait` on a supervised child, as routed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// The child exited normally with the given code.
    Exited(i32),
    /// The child was terminated by the given signal number.
    Signaled(i32),
    /// The child was stopped by a stop signal.
    Stopped,
    /// The child was resumed by `SIGCONT`.
    Continued,
}
