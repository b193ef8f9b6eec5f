//! The persisted reboot-fault record.
//!
//! When a process fault escalates to a system reboot, the app and process
//! names are written to a flat file before the reboot. If the record still
//! names the same app/process when that fault recurs after the boot, the
//! reboot fault limit has been reached. Absence of the record, or any
//! failure reading it, means "no prior record" and is never fatal.

use std::path::{Path, PathBuf};

use vigil_common::constants::REBOOT_FAULT_RECORD;
use vigil_common::error::{Result, VigilError};

/// Handle to the reboot-fault record file.
#[derive(Debug, Clone)]
pub struct FaultRecord {
    path: PathBuf,
}

impl FaultRecord {
    /// A record at an explicit path. Tests point this into a tempdir.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The record at its system path.
    #[must_use]
    pub fn at_default_path() -> Self {
        Self::new(REBOOT_FAULT_RECORD)
    }

    /// Path of the record file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the record with `<app>/<proc>`, atomically (the content is
    /// written to a side file and renamed into place).
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Io`] when the record cannot be written; the
    /// caller logs this and continues, since a missing record only weakens
    /// fault-limit detection.
    pub fn write(&self, app_name: &str, proc_name: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VigilError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let side = self.path.with_extension("new");
        std::fs::write(&side, format!("{app_name}/{proc_name}")).map_err(|e| VigilError::Io {
            path: side.clone(),
            source: e,
        })?;
        std::fs::rename(&side, &self.path).map_err(|e| VigilError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Whether the record exists and names exactly this app/process.
    #[must_use]
    pub fn matches(&self, app_name: &str, proc_name: &str) -> bool {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => content == format!("{app_name}/{proc_name}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "could not read reboot fault record, treating it as absent"
                );
                false
            }
        }
    }

    /// Deletes the record. A record that is already absent is fine.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Io`] on any other filesystem failure.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VigilError::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_in_tempdir() -> (tempfile::TempDir, FaultRecord) {
        let dir = tempfile::tempdir().expect("tempdir");
        let record = FaultRecord::new(dir.path().join("reboot-fault"));
        (dir, record)
    }

    #[test]
    fn absent_record_matches_nothing() {
        let (_dir, record) = record_in_tempdir();
        assert!(!record.matches("web", "server"));
    }

    #[test]
    fn write_then_match_round_trips() {
        let (_dir, record) = record_in_tempdir();
        record.write("web", "server").expect("write");
        assert!(record.matches("web", "server"));
        assert!(!record.matches("web", "logger"));
        assert!(!record.matches("other", "server"));
    }

    #[test]
    fn record_content_has_no_trailing_newline() {
        let (_dir, record) = record_in_tempdir();
        record.write("web", "server").expect("write");
        let content = std::fs::read_to_string(record.path()).expect("read");
        assert_eq!(content, "web/server");
    }

    #[test]
    fn write_replaces_previous_record() {
        let (_dir, record) = record_in_tempdir();
        record.write("web", "server").expect("first write");
        record.write("telemetry", "collector").expect("second write");
        assert!(!record.matches("web", "server"));
        assert!(record.matches("telemetry", "collector"));
    }

    #[test]
    fn clear_is_idempotent() {
        let (_dir, record) = record_in_tempdir();
        record.write("web", "server").expect("write");
        record.clear().expect("first clear");
        record.clear().expect("second clear");
        assert!(!record.matches("web", "server"));
    }
}
