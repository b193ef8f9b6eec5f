//! # vigil-core
//!
//! Low-level Linux primitives for the Vigil application supervisor:
//! - **Resource limits**: classic rlimits applied per process, plus a
//!   size-bounded tmpfs per sandboxed application.
//! - **Scheduling**: applying a resolved scheduling class and priority to a
//!   freshly forked child.
//! - **Sandbox**: chroot-style confinement roots and the child-side
//!   confinement sequence.
//! - **Users**: the user/group provisioning collaborator.
//! - **Kernel modules**: ordered insertion and removal of bundled modules.
//!
//! Unsafe system calls are confined to small wrappers with `// SAFETY:`
//! comments.

pub mod fd;
pub mod kmod;
pub mod rlimits;
pub mod sandbox;
pub mod sched;
pub mod users;
