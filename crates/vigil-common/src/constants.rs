//! System-wide constants, paths, and compiled-in defaults.

use std::time::Duration;

/// Where applications are installed.
pub const APPS_INSTALL_DIR: &str = "/var/lib/vigil/apps";

/// Where sandbox confinement roots are constructed.
pub const SANDBOXES_DIR: &str = "/run/vigil/sandboxes";

/// Base directory for per-application home directories.
pub const HOME_BASE_DIR: &str = "/home";

/// The flat file that records the app/process behind a reboot-classified
/// fault so a boot loop can be detected across power cycles.
pub const REBOOT_FAULT_RECORD: &str = "/var/lib/vigil/reboot-fault";

/// Directory scanned for bundled kernel modules.
pub const MODULES_DIR: &str = "/var/lib/vigil/modules";

/// Config subtree holding per-module parameter lists, keyed by module name.
pub const MODULES_CFG_ROOT: &str = "/modules";

/// Config subtree holding one entry per application.
pub const APPS_CFG_ROOT: &str = "/apps";

/// Module insert command.
pub const INSMOD_CMD: &str = "/sbin/insmod";

/// Module remove command.
pub const RMMOD_CMD: &str = "/sbin/rmmod";

/// Group creation command used when provisioning supplementary groups.
pub const GROUPADD_CMD: &str = "/usr/sbin/groupadd";

/// Grace period between the soft kill signal and the hard kill.
pub const KILL_TIMEOUT: Duration = Duration::from_millis(300);

/// Two `restart` faults closer together than this reach the fault limit.
pub const FAULT_LIMIT_INTERVAL_RESTART: Duration = Duration::from_secs(1);

/// Two `restartApp` faults closer together than this reach the fault limit.
pub const FAULT_LIMIT_INTERVAL_RESTART_APP: Duration = Duration::from_secs(3);

/// The reboot-fault record is deleted this long after startup, so the reboot
/// fault limit only trips when a second reboot-fault occurs promptly.
pub const REBOOT_FAULT_RECORD_LIFETIME: Duration = Duration::from_secs(120);

/// Maximum number of command-line arguments a process may configure.
pub const MAX_CMD_LINE_ARGS: usize = 20;

/// Maximum number of environment variables a process may configure.
pub const MAX_ENV_VARS: usize = 30;

/// Maximum number of supplementary groups an application may configure.
pub const MAX_SUPPLEMENTARY_GROUPS: usize = 32;

/// Maximum number of entries in a kernel module's insert argument vector.
pub const MAX_MODULE_ARGS: usize = 32;

/// Lowest realtime level accepted in an "rtN" priority string.
pub const MIN_RT_PRIORITY: i32 = 1;

/// Highest realtime level accepted in an "rtN" priority string.
pub const MAX_RT_PRIORITY: i32 = 32;

// Resource limit defaults. These only apply when the corresponding node is
// missing from an application's configuration; the build tools normally
// write every limit explicitly.

/// Default size of a sandboxed application's private filesystem.
pub const DEFAULT_MAX_FILE_SYSTEM_BYTES: u64 = 128 * 1024 * 1024;

/// Default virtual address space limit per process.
pub const DEFAULT_MAX_VIRTUAL_MEMORY_BYTES: u64 = 40_960_000;

/// Default core dump file size limit per process.
pub const DEFAULT_MAX_CORE_DUMP_FILE_BYTES: u64 = 8_192;

/// Default limit on the size of files a process can create or expand.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 90_112;

/// Default limit on memory a process may lock into RAM.
pub const DEFAULT_MAX_LOCKED_MEMORY_BYTES: u64 = 8_192;

/// Default limit on open file descriptors per process.
pub const DEFAULT_MAX_FILE_DESCRIPTORS: u64 = 256;

/// Hard ceiling for the configured file descriptor limit. Configured values
/// above this are clamped, never rejected.
pub const MAX_FILE_DESCRIPTORS_CEILING: u64 = 1_024;

/// Default POSIX message queue byte limit per application.
pub const DEFAULT_MAX_MQUEUE_BYTES: u64 = 512;

/// Default limit on the number of processes/threads per application.
pub const DEFAULT_MAX_THREADS: u64 = 20;

/// Default limit on signals queued with `sigqueue` per application.
pub const DEFAULT_MAX_QUEUED_SIGNALS: u64 = 100;
