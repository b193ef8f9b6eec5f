//! Applies a resolved scheduling class and priority to a process.

use nix::errno::Errno;
use nix::unistd::Pid;
use vigil_common::error::{Result, VigilError};
use vigil_common::types::SchedPolicy;

/// Sets the scheduling policy, realtime priority, and nice level for the
/// given process, normally a freshly forked child still blocked on the
/// launch handshake.
///
/// # Errors
///
/// Returns [`VigilError::Sys`] when `sched_setscheduler(2)` or
/// `setpriority(2)` fails; the caller is expected to kill the child rather
/// than let it run with an unknown priority.
pub fn apply(pid: Pid, policy: SchedPolicy) -> Result<()> {
    let (os_policy, rt_level, nice) = match policy {
        SchedPolicy::Idle => (libc::SCHED_IDLE, 0, 0),
        SchedPolicy::Normal { nice } => (libc::SCHED_OTHER, 0, nice),
        SchedPolicy::RoundRobin { level } => (libc::SCHED_RR, level, 0),
    };

    let param = libc::sched_param {
        sched_priority: rt_level,
    };
    // SAFETY: the kernel copies the sched_param; no pointer is retained.
    if unsafe { libc::sched_setscheduler(pid.as_raw(), os_policy, &param) } == -1 {
        return Err(VigilError::sys("sched_setscheduler", std::io::Error::last_os_error()));
    }

    // setpriority can legitimately return -1, so errno is the real signal.
    Errno::clear();
    // SAFETY: plain FFI call without pointers.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid.as_raw() as _, nice) };
    if rc == -1 && Errno::last_raw() != 0 {
        return Err(VigilError::sys("setpriority", std::io::Error::last_os_error()));
    }

    tracing::debug!(pid = pid.as_raw(), policy = ?policy, "applied scheduling priority");
    Ok(())
}
