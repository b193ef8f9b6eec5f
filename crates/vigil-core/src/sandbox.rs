//! Chroot-style confinement roots for sandboxed applications.
//!
//! The [`Sandbox`] collaborator constructs and destroys the on-disk root;
//! [`confine`] is the sequence a freshly forked child runs on itself before
//! exec, after the parent has released it.

use std::path::Path;

use nix::unistd::{Gid, Uid, chdir, chroot, setgid, setgroups, setuid};
use vigil_common::error::{Result, VigilError};

/// Constructs and destroys application confinement roots.
pub trait Sandbox {
    /// Creates the (initially empty) confinement root directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created.
    fn setup(&mut self, app_name: &str, root: &Path) -> Result<()>;

    /// Creates the application's working directory inside the root, after
    /// any filesystem has been mounted over it, and hands it to the
    /// application's user.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or chowned.
    fn populate(&mut self, app_name: &str, root: &Path, home_dir: &Path, uid: Uid, gid: Gid)
    -> Result<()>;

    /// Tears the confinement root down. The application's filesystem must
    /// already be unmounted.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be removed.
    fn remove(&mut self, app_name: &str, root: &Path) -> Result<()>;
}

/// The default sandbox: a plain directory tree under the sandboxes dir.
#[derive(Debug, Default)]
pub struct DirSandbox;

impl Sandbox for DirSandbox {
    fn setup(&mut self, app_name: &str, root: &Path) -> Result<()> {
        std::fs::create_dir_all(root).map_err(|e| VigilError::Io {
            path: root.to_path_buf(),
            source: e,
        })?;
        tracing::info!(app = app_name, root = %root.display(), "sandbox root created");
        Ok(())
    }

    fn populate(
        &mut self,
        app_name: &str,
        root: &Path,
        home_dir: &Path,
        uid: Uid,
        gid: Gid,
    ) -> Result<()> {
        let inner = root.join(home_dir.strip_prefix("/").unwrap_or(home_dir));
        std::fs::create_dir_all(&inner).map_err(|e| VigilError::Io {
            path: inner.clone(),
            source: e,
        })?;
        nix::unistd::chown(&inner, Some(uid), Some(gid)).map_err(|e| VigilError::sys("chown", e))?;
        tracing::debug!(app = app_name, dir = %inner.display(), "sandbox home directory created");
        Ok(())
    }

    fn remove(&mut self, app_name: &str, root: &Path) -> Result<()> {
        match std::fs::remove_dir_all(root) {
            Ok(()) => {
                tracing::info!(app = app_name, root = %root.display(), "sandbox root removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VigilError::Io {
                path: root.to_path_buf(),
                source: e,
            }),
        }
    }
}

/// Confines the calling process into a sandbox root: chroot, enter the
/// working directory, then drop to the application's identity. Runs inside
/// the forked child immediately before exec; any failure is fatal to that
/// child only.
///
/// # Errors
///
/// Returns [`VigilError::Sys`] on the first failing call.
pub fn confine(
    root: &Path,
    uid: Uid,
    gid: Gid,
    groups: &[Gid],
    working_dir: &Path,
) -> Result<()> {
    chroot(root).map_err(|e| VigilError::sys("chroot", e))?;
    chdir(working_dir).map_err(|e| VigilError::sys("chdir", e))?;
    setgroups(groups).map_err(|e| VigilError::sys("setgroups", e))?;
    setgid(gid).map_err(|e| VigilError::sys("setgid", e))?;
    setuid(uid).map_err(|e| VigilError::sys("setuid", e))?;
    Ok(())
}

/// Enters the working directory of an unconfined process. Runs inside the
/// forked child immediately before exec.
///
/// # Errors
///
/// Returns [`VigilError::Sys`] when the directory cannot be entered.
pub fn enter_working_dir(working_dir: &Path) -> Result<()> {
    chdir(working_dir).map_err(|e| VigilError::sys("chdir", e))
}
