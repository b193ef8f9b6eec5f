//! The single-threaded event dispatch loop.
//!
//! All supervision state is mutated from this loop: a `signalfd` delivers
//! SIGCHLD (and the shutdown signals) synchronously, children are reaped
//! with `waitpid(WNOHANG)`, and the poll timeout is the earliest pending
//! hard-kill deadline. There is no other thread and no re-entrant signal
//! handler.

use std::os::fd::AsFd;
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use vigil_common::constants::REBOOT_FAULT_RECORD_LIFETIME;
use vigil_common::error::{Result, VigilError};
use vigil_common::types::{AppFaultAction, ChildStatus};

use crate::SupervisorCtx;
use crate::registry::AppRegistry;

/// Host-level actions escalated out of the supervision logic.
pub trait SystemControl {
    /// Reboots the device after a reboot-classified fault. Only returns on
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Sys`] when the reboot could not be initiated.
    fn reboot(&mut self) -> Result<()>;
}

/// The real system control: sync filesystems and reboot.
#[derive(Debug, Default)]
pub struct OsSystemControl;

impl SystemControl for OsSystemControl {
    fn reboot(&mut self) -> Result<()> {
        tracing::error!("rebooting the system");
        nix::unistd::sync();
        match nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT) {
            Ok(never) => match never {},
            Err(e) => Err(VigilError::sys("reboot", e)),
        }
    }
}

/// The supervisor's control loop.
pub struct Dispatcher {
    signal_fd: SignalFd,
    shutdown_requested: bool,
}

impl Dispatcher {
    /// Blocks the managed signals and opens the signalfd. Must run before
    /// any child is forked so no child death can be missed.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Sys`] when the signal mask or the signalfd
    /// cannot be set up.
    pub fn new() -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGINT);
        mask.thread_block()
            .map_err(|e| VigilError::sys("pthread_sigmask", e))?;
        let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| VigilError::sys("signalfd", e))?;
        Ok(Self {
            signal_fd,
            shutdown_requested: false,
        })
    }

    /// Runs the dispatch loop. Returns once a shutdown signal has arrived
    /// and every application has stopped.
    ///
    /// # Errors
    ///
    /// Returns an error when the loop's own plumbing (poll, signalfd,
    /// waitpid) fails, or when a required reboot fails.
    pub fn run(
        &mut self,
        registry: &mut AppRegistry,
        ctx: &mut SupervisorCtx<'_>,
        system: &mut dyn SystemControl,
    ) -> Result<()> {
        // The reboot-fault record only counts against the fault limit when
        // the fault recurs promptly after boot; expire it once we survive
        // long enough.
        let mut record_expiry = Some(Instant::now() + REBOOT_FAULT_RECORD_LIFETIME);

        loop {
            let now = Instant::now();

            if let Some(deadline) = record_expiry {
                if now >= deadline {
                    if let Err(e) = ctx.fault_record.clear() {
                        tracing::error!(
                            error = %e,
                            "could not delete the reboot fault record, the fault limit may \
                             trip incorrectly on the next reboot fault"
                        );
                    }
                    record_expiry = None;
                }
            }

            if self.shutdown_requested && registry.all_stopped() {
                return Ok(());
            }

            let deadline = [registry.next_kill_deadline(), record_expiry]
                .into_iter()
                .flatten()
                .min();
            let timeout = deadline.map_or(PollTimeout::NONE, |deadline| {
                let millis = deadline.saturating_duration_since(now).as_millis();
                u16::try_from(millis).map_or(PollTimeout::MAX, PollTimeout::from)
            });

            let mut fds = [PollFd::new(self.signal_fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(VigilError::sys("poll", e)),
            }
            drop(fds);

            let now = Instant::now();
            self.drain_signals(registry, ctx, system, now)?;
            registry.fire_due_kill_timers(ctx.launcher, now);
        }
    }

    /// Consumes every queued signal from the signalfd.
    fn drain_signals(
        &mut self,
        registry: &mut AppRegistry,
        ctx: &mut SupervisorCtx<'_>,
        system: &mut dyn SystemControl,
        now: Instant,
    ) -> Result<()> {
        loop {
            match self.signal_fd.read_signal() {
                Ok(Some(info)) => {
                    if info.ssi_signo == Signal::SIGCHLD as u32 {
                        reap_children(registry, ctx, system, now)?;
                    } else {
                        tracing::info!(
                            signal = info.ssi_signo,
                            "shutdown requested, stopping all applications"
                        );
                        self.shutdown_requested = true;
                        registry.stop_all(ctx, now);
                    }
                }
                Ok(None) => return Ok(()),
                Err(Errno::EINTR) => {}
                Err(e) => return Err(VigilError::sys("read signalfd", e)),
            }
        }
    }
}

/// Reaps every waitable child and routes its status change.
fn reap_children(
    registry: &mut AppRegistry,
    ctx: &mut SupervisorCtx<'_>,
    system: &mut dyn SystemControl,
    now: Instant,
) -> Result<()> {
    let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
    loop {
        match waitpid(Pid::from_raw(-1), Some(flags)) {
            Ok(WaitStatus::StillAlive) => return Ok(()),
            Ok(status) => {
                let Some((pid, child_status)) = child_status_from_wait(&status) else {
                    continue;
                };
                match registry.handle_child_status(pid, child_status, ctx, now) {
                    Ok(AppFaultAction::Reboot) => system.reboot()?,
                    Ok(_) => {}
                    Err(VigilError::NotFound { .. }) => {
                        tracing::debug!(
                            pid = pid.as_raw(),
                            "reaped a child no application claims"
                        );
                    }
                    Err(e) => {
                        tracing::error!(pid = pid.as_raw(), error = %e, "could not handle child status");
                    }
                }
            }
            Err(Errno::ECHILD) => return Ok(()),
            Err(Errno::EINTR) => {}
            Err(e) => return Err(VigilError::sys("waitpid", e)),
        }
    }
}

/// Maps a wait status onto the supervision-level child status. Ptrace and
/// other statuses the supervisor does not track map to `None`.
fn child_status_from_wait(status: &WaitStatus) -> Option<(Pid, ChildStatus)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((*pid, ChildStatus::Exited(*code))),
        WaitStatus::Signaled(pid, signal, _) => Some((*pid, ChildStatus::Signaled(*signal as i32))),
        WaitStatus::Stopped(pid, _) => Some((*pid, ChildStatus::Stopped)),
        WaitStatus::Continued(pid) => Some((*pid, ChildStatus::Continued)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_statuses_map_to_child_statuses() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            child_status_from_wait(&WaitStatus::Exited(pid, 3)),
            Some((pid, ChildStatus::Exited(3)))
        );
        assert_eq!(
            child_status_from_wait(&WaitStatus::Signaled(pid, Signal::SIGSEGV, false)),
            Some((pid, ChildStatus::Signaled(Signal::SIGSEGV as i32)))
        );
        assert_eq!(
            child_status_from_wait(&WaitStatus::Stopped(pid, Signal::SIGSTOP)),
            Some((pid, ChildStatus::Stopped))
        );
        assert_eq!(
            child_status_from_wait(&WaitStatus::Continued(pid)),
            Some((pid, ChildStatus::Continued))
        );
        assert_eq!(child_status_from_wait(&WaitStatus::StillAlive), None);
    }
}
