//! Resource governance via classic rlimits and a size-bounded tmpfs.
//!
//! Per-process limits are read from a fixed table of configuration keys and
//! applied with `prlimit(2)` while the child is still blocked on the launch
//! handshake. The application-wide filesystem quota is enforced by mounting
//! a size-bounded tmpfs at the sandbox root.

use std::path::Path;

use nix::mount::{MsFlags, mount, umount};
use nix::unistd::Pid;
use serde::Serialize;
use vigil_common::config::{ConfigStore, ConfigTxn};
use vigil_common::constants::{
    DEFAULT_MAX_CORE_DUMP_FILE_BYTES, DEFAULT_MAX_FILE_BYTES, DEFAULT_MAX_FILE_DESCRIPTORS,
    DEFAULT_MAX_FILE_SYSTEM_BYTES, DEFAULT_MAX_LOCKED_MEMORY_BYTES, DEFAULT_MAX_MQUEUE_BYTES,
    DEFAULT_MAX_QUEUED_SIGNALS, DEFAULT_MAX_THREADS, DEFAULT_MAX_VIRTUAL_MEMORY_BYTES,
    MAX_FILE_DESCRIPTORS_CEILING,
};
use vigil_common::error::{Result, VigilError};

/// Configuration node names for the per-process limits.
const CFG_MAX_VIRTUAL_MEMORY_BYTES: &str = "maxVirtualMemoryBytes";
const CFG_MAX_CORE_DUMP_FILE_BYTES: &str = "maxCoreDumpFileBytes";
const CFG_MAX_FILE_BYTES: &str = "maxFileBytes";
const CFG_MAX_LOCKED_MEMORY_BYTES: &str = "maxLockedMemoryBytes";
const CFG_MAX_FILE_DESCRIPTORS: &str = "maxFileDescriptors";

/// Configuration node names for the application-scope limits. These are read
/// from the application's subtree but still applied per process, because
/// rlimits attach to individual processes.
const CFG_MAX_MQUEUE_BYTES: &str = "maxMQueueBytes";
const CFG_MAX_THREADS: &str = "maxThreads";
const CFG_MAX_QUEUED_SIGNALS: &str = "maxQueuedSignals";

/// Configuration node name for the application filesystem quota.
const CFG_MAX_FILE_SYSTEM_BYTES: &str = "maxFileSystemBytes";

/// Reads one numeric limit with the config-tree defaulting rules: a missing
/// node uses the default quietly, while an empty, mistyped, or negative
/// value is reported and replaced by the default.
fn cfg_limit(txn: &ConfigTxn<'_>, node: &str, default: u64) -> u64 {
    if !txn.node_exists(node) {
        tracing::info!(limit = node, default, "limit not configured, using default");
        return default;
    }
    if txn.is_empty(node) {
        tracing::warn!(limit = node, default, "configured limit is empty, using default");
        return default;
    }
    let Some(value) = txn.get_i64(node) else {
        tracing::error!(limit = node, default, "configured limit has the wrong type, using default");
        return default;
    };
    u64::try_from(value).unwrap_or_else(|_| {
        tracing::error!(limit = node, default, "configured limit is negative, using default");
        default
    })
}

/// Per-process resource limits resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcLimits {
    /// Virtual address space limit (`RLIMIT_AS`).
    pub virtual_memory_bytes: u64,
    /// Core dump file size limit (`RLIMIT_CORE`).
    pub core_dump_file_bytes: u64,
    /// Limit on the size of files the process may create (`RLIMIT_FSIZE`).
    pub file_bytes: u64,
    /// Limit on memory locked into RAM (`RLIMIT_MEMLOCK`).
    pub locked_memory_bytes: u64,
    /// Open file descriptor limit (`RLIMIT_NOFILE`), clamped to the ceiling.
    pub file_descriptors: u64,
    /// POSIX message queue byte limit (`RLIMIT_MSGQUEUE`), app scope.
    pub mqueue_bytes: u64,
    /// Process/thread count limit (`RLIMIT_NPROC`), app scope.
    pub threads: u64,
    /// Queued signal limit (`RLIMIT_SIGPENDING`), app scope.
    pub queued_signals: u64,
}

impl ProcLimits {
    /// Resolves the limit table for one process. Process-scope keys are read
    /// from the process subtree, application-scope keys from the owning
    /// application's subtree.
    pub fn resolve(cfg: &dyn ConfigStore, proc_cfg_path: &str, app_cfg_path: &str) -> Self {
        let proc_txn = cfg.read_txn(proc_cfg_path);
        let app_txn = cfg.read_txn(app_cfg_path);

        let mut file_descriptors = cfg_limit(
            &proc_txn,
            CFG_MAX_FILE_DESCRIPTORS,
            DEFAULT_MAX_FILE_DESCRIPTORS,
        );
        if file_descriptors > MAX_FILE_DESCRIPTORS_CEILING {
            tracing::error!(
                configured = file_descriptors,
                ceiling = MAX_FILE_DESCRIPTORS_CEILING,
                "file descriptor limit exceeds the maximum allowed, clamping"
            );
            file_descriptors = MAX_FILE_DESCRIPTORS_CEILING;
        }

        Self {
            virtual_memory_bytes: cfg_limit(
                &proc_txn,
                CFG_MAX_VIRTUAL_MEMORY_BYTES,
                DEFAULT_MAX_VIRTUAL_MEMORY_BYTES,
            ),
            core_dump_file_bytes: cfg_limit(
                &proc_txn,
                CFG_MAX_CORE_DUMP_FILE_BYTES,
                DEFAULT_MAX_CORE_DUMP_FILE_BYTES,
            ),
            file_bytes: cfg_limit(&proc_txn, CFG_MAX_FILE_BYTES, DEFAULT_MAX_FILE_BYTES),
            locked_memory_bytes: cfg_limit(
                &proc_txn,
                CFG_MAX_LOCKED_MEMORY_BYTES,
                DEFAULT_MAX_LOCKED_MEMORY_BYTES,
            ),
            file_descriptors,
            mqueue_bytes: cfg_limit(&app_txn, CFG_MAX_MQUEUE_BYTES, DEFAULT_MAX_MQUEUE_BYTES),
            threads: cfg_limit(&app_txn, CFG_MAX_THREADS, DEFAULT_MAX_THREADS),
            queued_signals: cfg_limit(
                &app_txn,
                CFG_MAX_QUEUED_SIGNALS,
                DEFAULT_MAX_QUEUED_SIGNALS,
            ),
        }
    }

    /// Applies every limit to the given process with soft = hard.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Sys`] on the first `prlimit(2)` failure. The
    /// caller still owns a child blocked on the launch handshake and is
    /// expected to kill it rather than release it with partial limits.
    pub fn apply(&self, pid: Pid) -> Result<()> {
        let table: [(&str, libc::c_int, u64); 8] = [
            ("RLIMIT_AS", libc::RLIMIT_AS as libc::c_int, self.virtual_memory_bytes),
            ("RLIMIT_CORE", libc::RLIMIT_CORE as libc::c_int, self.core_dump_file_bytes),
            ("RLIMIT_FSIZE", libc::RLIMIT_FSIZE as libc::c_int, self.file_bytes),
            ("RLIMIT_MEMLOCK", libc::RLIMIT_MEMLOCK as libc::c_int, self.locked_memory_bytes),
            ("RLIMIT_NOFILE", libc::RLIMIT_NOFILE as libc::c_int, self.file_descriptors),
            ("RLIMIT_MSGQUEUE", libc::RLIMIT_MSGQUEUE as libc::c_int, self.mqueue_bytes),
            ("RLIMIT_NPROC", libc::RLIMIT_NPROC as libc::c_int, self.threads),
            ("RLIMIT_SIGPENDING", libc::RLIMIT_SIGPENDING as libc::c_int, self.queued_signals),
        ];

        for (name, resource, value) in table {
            tracing::debug!(pid = pid.as_raw(), resource = name, value, "setting resource limit");
            let lim = libc::rlimit {
                rlim_cur: value as libc::rlim_t,
                rlim_max: value as libc::rlim_t,
            };
            // SAFETY: prlimit reads the rlimit struct and retains no pointers.
            let rc = unsafe { libc::prlimit(pid.as_raw(), resource as _, &lim, std::ptr::null_mut()) };
            if rc == -1 {
                return Err(VigilError::sys("prlimit", std::io::Error::last_os_error()));
            }
        }
        Ok(())
    }
}

/// Application-wide resource limits resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppLimits {
    /// Byte quota for the application's private filesystem.
    pub file_system_bytes: u64,
}

impl AppLimits {
    /// Resolves the application limit set. A configured quota of zero would
    /// make the tmpfs unlimited and is replaced by the default.
    pub fn resolve(cfg: &dyn ConfigStore, app_cfg_path: &str) -> Self {
        let txn = cfg.read_txn(app_cfg_path);
        let mut file_system_bytes = cfg_limit(
            &txn,
            CFG_MAX_FILE_SYSTEM_BYTES,
            DEFAULT_MAX_FILE_SYSTEM_BYTES,
        );
        if file_system_bytes == 0 {
            tracing::error!(
                default = DEFAULT_MAX_FILE_SYSTEM_BYTES,
                "configured filesystem quota of zero is invalid, using default"
            );
            file_system_bytes = DEFAULT_MAX_FILE_SYSTEM_BYTES;
        }
        Self { file_system_bytes }
    }
}

/// Applies and tears down application-wide resource limits.
pub trait AppLimiter {
    /// Mounts the application's size-bounded private filesystem at its
    /// sandbox root.
    ///
    /// # Errors
    ///
    /// Fails when the quota exceeds currently free memory or the mount call
    /// fails.
    fn set_app_limits(&mut self, sandbox_root: &Path, limits: &AppLimits) -> Result<()>;

    /// Removes the application's private filesystem.
    ///
    /// # Errors
    ///
    /// Fails when the unmount call fails for a reason other than the
    /// filesystem not being mounted.
    fn clear_app_limits(&mut self, sandbox_root: &Path) -> Result<()>;
}

/// The real limiter: a memory-backed tmpfs mounted with a size option.
#[derive(Debug, Default)]
pub struct TmpfsLimiter;

impl AppLimiter for TmpfsLimiter {
    fn set_app_limits(&mut self, sandbox_root: &Path, limits: &AppLimits) -> Result<()> {
        let free = free_ram_bytes()?;
        if limits.file_system_bytes > free {
            return Err(VigilError::fault(format!(
                "filesystem quota of {} bytes exceeds the {free} bytes of free memory",
                limits.file_system_bytes
            )));
        }

        let options = format!("size={},mode=0705", limits.file_system_bytes);
        mount(
            Some("none"),
            sandbox_root,
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some(options.as_str()),
        )
        .map_err(|e| VigilError::sys("mount", e))?;

        tracing::info!(
            root = %sandbox_root.display(),
            bytes = limits.file_system_bytes,
            "mounted application filesystem"
        );
        Ok(())
    }

    fn clear_app_limits(&mut self, sandbox_root: &Path) -> Result<()> {
        match umount(sandbox_root) {
            Ok(()) => {
                tracing::info!(root = %sandbox_root.display(), "unmounted application filesystem");
                Ok(())
            }
            // EINVAL means the target is not a mount point, which is the
            // case when the app never got as far as the mount.
            Err(nix::errno::Errno::EINVAL | nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(VigilError::sys("umount", e)),
        }
    }
}

/// Returns the number of bytes of currently unused RAM.
fn free_ram_bytes() -> Result<u64> {
    let mut info = std::mem::MaybeUninit::<libc::sysinfo>::zeroed();
    // SAFETY: sysinfo fills the struct on success and reads nothing.
    let rc = unsafe { libc::sysinfo(info.as_mut_ptr()) };
    if rc == -1 {
        return Err(VigilError::sys("sysinfo", std::io::Error::last_os_error()));
    }
    // SAFETY: a zero return from sysinfo guarantees the struct is initialized.
    let info = unsafe { info.assume_init() };
    Ok(info.freeram as u64 * u64::from(info.mem_unit))
}
