//! Process launch and signalling.
//!
//! [`Launcher`] is the seam between the supervision logic and the OS.
//! [`ForkLauncher`] is the real implementation: it forks, holds the child on
//! a close-signalled pipe while the parent applies scheduling priority and
//! resource limits, then releases it to confine itself and exec. Tests
//! substitute a recording fake.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal, kill};
use nix::sys::stat::{Mode, umask};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Gid, Pid, Uid, execvpe, fork, pipe, setuid};
use vigil_common::error::{Result, VigilError};
use vigil_common::types::SchedPolicy;
use vigil_core::rlimits::ProcLimits;
use vigil_core::{fd, sandbox, sched};

/// Identity and confinement root a sandboxed child assumes before exec.
#[derive(Debug, Clone)]
pub struct ConfinementSpec {
    /// The chroot root.
    pub root: PathBuf,
    /// User the child runs as.
    pub uid: Uid,
    /// Primary group the child runs as.
    pub gid: Gid,
    /// Supplementary groups.
    pub groups: Vec<Gid>,
}

/// A fully resolved launch request.
///
/// Every configuration read happens before the fork, on the control thread;
/// the child only consumes pre-resolved buffers.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Name of the process being launched; becomes the child's `argv[0]`.
    pub proc_name: String,
    /// Name of the owning application.
    pub app_name: String,
    /// Executable path followed by its command-line arguments.
    pub args: Vec<String>,
    /// Environment the child's environment is replaced with.
    pub env: Vec<(String, String)>,
    /// Working directory; inside the sandbox root when confined.
    pub working_dir: PathBuf,
    /// Scheduling class the parent applies while the child is blocked.
    pub policy: SchedPolicy,
    /// Resource limits the parent applies while the child is blocked.
    pub limits: ProcLimits,
    /// Confinement; `None` launches unsandboxed.
    pub confinement: Option<ConfinementSpec>,
}

/// Launches, signals, and sweeps OS processes on behalf of the supervisor.
pub trait Launcher {
    /// Starts a child per the launch spec and returns its pid once the
    /// child has been released past the handshake. Does not wait for the
    /// exec.
    ///
    /// # Errors
    ///
    /// Returns an error if the fork fails or the child cannot be configured
    /// while blocked (in which case it is killed, never released).
    fn launch(&mut self, spec: &LaunchSpec) -> Result<Pid>;

    /// Sends a signal to a process.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Sys`] when the signal cannot be delivered.
    fn signal(&mut self, pid: Pid, signal: Signal) -> Result<()>;

    /// Best-effort kill of every process owned by `uid`, to catch forked
    /// descendants outside supervision. Cannot confirm their deaths.
    ///
    /// # Errors
    ///
    /// Returns an error when the sweep could not be performed at all.
    fn kill_all_for_uid(&mut self, uid: Uid) -> Result<()>;
}

/// The real launcher.
#[derive(Debug, Default)]
pub struct ForkLauncher;

impl Launcher for ForkLauncher {
    fn launch(&mut self, spec: &LaunchSpec) -> Result<Pid> {
        // Resolve everything that allocates before the fork; the child only
        // touches these buffers and async-signal-safe calls.
        let Some(exe_path) = spec.args.first() else {
            return Err(VigilError::BadParameter {
                message: format!("empty argument vector for process '{}'", spec.proc_name),
            });
        };
        let exe = to_cstring(exe_path)?;
        let mut argv = Vec::with_capacity(spec.args.len());
        argv.push(to_cstring(&spec.proc_name)?);
        for arg in &spec.args[1..] {
            argv.push(to_cstring(arg)?);
        }
        let mut envp = Vec::with_capacity(spec.env.len());
        for (name, value) in &spec.env {
            envp.push(to_cstring(&format!("{name}={value}"))?);
        }

        let (read_end, write_end) = pipe().map_err(|e| VigilError::sys("pipe", e))?;

        // SAFETY: the supervisor is single-threaded; the child runs only the
        // pre-resolved launch sequence before exec.
        match unsafe { fork() }.map_err(|e| VigilError::sys("fork", e))? {
            ForkResult::Child => child_entry(spec, &exe, &argv, &envp, read_end, write_end),
            ForkResult::Parent { child } => {
                drop(read_end);

                // Configure the child while it is still blocked on the pipe.
                let configured =
                    sched::apply(child, spec.policy).and_then(|()| spec.limits.apply(child));
                if let Err(e) = configured {
                    tracing::error!(
                        process = %spec.proc_name,
                        pid = child.as_raw(),
                        error = %e,
                        "could not configure child, killing it before release"
                    );
                    let _ = kill(child, Signal::SIGKILL);
                    return Err(e);
                }

                tracing::info!(
                    process = %spec.proc_name,
                    app = %spec.app_name,
                    pid = child.as_raw(),
                    "starting process"
                );

                // Closing our end of the pipe releases the child.
                drop(write_end);
                Ok(child)
            }
        }
    }

    fn signal(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        kill(pid, signal).map_err(|e| VigilError::sys("kill", e))
    }

    fn kill_all_for_uid(&mut self, uid: Uid) -> Result<()> {
        // SAFETY: single-threaded; the helper child drops to the target uid
        // and only signals before exiting.
        match unsafe { fork() }.map_err(|e| VigilError::sys("fork", e))? {
            ForkResult::Child => {
                if setuid(uid).is_err() {
                    // SAFETY: _exit is async-signal-safe.
                    unsafe { libc::_exit(1) }
                }
                // Signal every process sharing our (new) uid.
                if kill(Pid::from_raw(-1), Signal::SIGKILL).is_err() {
                    // SAFETY: as above.
                    unsafe { libc::_exit(1) }
                }
                // SAFETY: as above.
                unsafe { libc::_exit(0) }
            }
            ForkResult::Parent { child } => loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, 0)) => return Ok(()),
                    Ok(WaitStatus::Exited(_, code)) => {
                        return Err(VigilError::fault(format!(
                            "uid sweep helper exited with code {code}"
                        )));
                    }
                    Ok(_) => {}
                    Err(Errno::EINTR) => {}
                    Err(e) => return Err(VigilError::sys("waitpid", e)),
                }
            },
        }
    }
}

/// Converts a supervisor string into a `CString` for exec.
fn to_cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| VigilError::BadParameter {
        message: format!("embedded NUL in launch string '{value}'"),
    })
}

/// The child side of the launch sequence. Never returns; every failure here
/// is fatal to this child only.
fn child_entry(
    spec: &LaunchSpec,
    exe: &CString,
    argv: &[CString],
    envp: &[CString],
    read_end: OwnedFd,
    write_end: OwnedFd,
) -> ! {
    // Files created by the app must not get group/other permissions.
    let _ = umask(Mode::from_bits_truncate(0o077));

    // Undo any signal blocking inherited from the supervisor.
    if SigSet::all().thread_unblock().is_err() {
        child_fatal("could not unblock signals");
    }

    drop(write_end);
    wait_for_release(&read_end);
    drop(read_end);

    // The parent has set our priority and limits and released us.
    fd::close_all_nonstd();

    let confined = match &spec.confinement {
        Some(confinement) => sandbox::confine(
            &confinement.root,
            confinement.uid,
            confinement.gid,
            &confinement.groups,
            &spec.working_dir,
        ),
        None => sandbox::enter_working_dir(&spec.working_dir),
    };
    if confined.is_err() {
        child_fatal("could not confine process");
    }

    let _ = execvpe(exe, argv, envp);
    child_fatal("could not exec");
}

/// Blocks until the parent closes its end of the synchronization pipe.
fn wait_for_release(read_end: &OwnedFd) {
    let mut buf = [0_u8; 1];
    loop {
        // SAFETY: reads into a valid one-byte buffer on an open descriptor.
        let n = unsafe { libc::read(read_end.as_raw_fd(), buf.as_mut_ptr().cast(), 1) };
        match n {
            0 => return,
            -1 if Errno::last() == Errno::EINTR => {}
            -1 => child_fatal("could not read synchronization pipe"),
            // A stray byte; keep waiting for the close.
            _ => {}
        }
    }
}

/// Terminates the freshly forked child without touching parent state.
fn child_fatal(message: &str) -> ! {
    tracing::error!(errno = %Errno::last(), "{message}");
    // SAFETY: _exit is async-signal-safe and skips atexit handlers that
    // belong to the parent.
    unsafe { libc::_exit(127) }
}
