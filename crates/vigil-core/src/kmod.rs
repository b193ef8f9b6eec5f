//! Kernel module insertion and removal.
//!
//! Modules bundled with the system live in a fixed directory and are
//! inserted in alphabetical order, with per-module parameters read from the
//! configuration subtree keyed by module name. The table preserves insertion
//! order explicitly so removal is strictly LIFO.

use std::path::{Path, PathBuf};
use std::process::Command;

use vigil_common::config::ConfigStore;
use vigil_common::constants::{INSMOD_CMD, MAX_MODULE_ARGS, MODULES_CFG_ROOT, RMMOD_CMD};
use vigil_common::error::{Result, VigilError};

/// File extension of loadable kernel modules.
const MODULE_EXTENSION: &str = "ko";

/// A kernel module inserted by the supervisor.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    name: String,
    path: PathBuf,
    args: Vec<String>,
}

impl ModuleRecord {
    /// The module name (file stem, extension stripped).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the module object file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The insert argument vector: module path, then `name=value` pairs.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// Table of loaded modules, one record per distinct module name.
///
/// The table is an owned value handed to the supervisor at startup, never a
/// hidden global, so tests can construct isolated instances.
#[derive(Debug)]
pub struct ModuleTable {
    insmod: PathBuf,
    rmmod: PathBuf,
    records: Vec<ModuleRecord>,
}

impl Default for ModuleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleTable {
    /// Creates a table using the system insert/remove commands.
    #[must_use]
    pub fn new() -> Self {
        Self::with_commands(INSMOD_CMD.into(), RMMOD_CMD.into())
    }

    /// Creates a table using the given insert/remove commands.
    #[must_use]
    pub const fn with_commands(insmod: PathBuf, rmmod: PathBuf) -> Self {
        Self {
            insmod,
            rmmod,
            records: Vec::new(),
        }
    }

    /// Number of loaded modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether a module with this name is recorded.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.records.iter().any(|r| r.name == name)
    }

    /// Module names in insertion order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.name.as_str()).collect()
    }

    /// Scans the module directory and inserts every `.ko` file found, in
    /// alphabetical order. A module that fails to insert is logged and
    /// skipped; the scan continues.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Io`] only when the directory itself cannot be
    /// read. A missing directory means no modules are bundled and is not an
    /// error.
    pub fn insert_all(&mut self, cfg: &dyn ConfigStore, modules_dir: &Path) -> Result<()> {
        let entries = match std::fs::read_dir(modules_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(dir = %modules_dir.display(), "no module directory, nothing to insert");
                return Ok(());
            }
            Err(e) => {
                return Err(VigilError::Io {
                    path: modules_dir.to_path_buf(),
                    source: e,
                });
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == MODULE_EXTENSION))
            .collect();
        paths.sort();

        for path in paths {
            self.insert_one(cfg, &path);
        }
        Ok(())
    }

    /// Inserts a single module, recording it on success.
    fn insert_one(&mut self, cfg: &dyn ConfigStore, path: &Path) {
        let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
            tracing::warn!(path = %path.display(), "module file name is not valid UTF-8, skipping");
            return;
        };
        if self.contains(name) {
            tracing::warn!(module = name, "module already inserted, skipping duplicate");
            return;
        }

        let params = cfg
            .read_txn(&format!("{MODULES_CFG_ROOT}/{name}"))
            .get_string_map("")
            .unwrap_or_default();
        let Some(args) = module_args(path, &params) else {
            tracing::error!(module = name, "too many module parameters, skipping module");
            return;
        };

        match Command::new(&self.insmod).args(&args).status() {
            Ok(status) if status.success() => {
                tracing::info!(module = name, "kernel module inserted");
                self.records.push(ModuleRecord {
                    name: name.to_owned(),
                    path: path.to_path_buf(),
                    args,
                });
            }
            Ok(status) => {
                tracing::error!(module = name, %status, "module insert failed, skipping module");
            }
            Err(e) => {
                tracing::error!(module = name, error = %e, "could not run module insert command");
            }
        }
    }

    /// Records every module file in the directory without invoking the
    /// insert command, for when the modules are already loaded (e.g. a
    /// removal pass after a supervisor restart).
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Io`] when the directory cannot be read.
    pub fn adopt_all(&mut self, modules_dir: &Path) -> Result<()> {
        let entries = std::fs::read_dir(modules_dir).map_err(|e| VigilError::Io {
            path: modules_dir.to_path_buf(),
            source: e,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == MODULE_EXTENSION))
            .collect();
        paths.sort();

        for path in paths {
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if self.contains(name) {
                continue;
            }
            self.records.push(ModuleRecord {
                name: name.to_owned(),
                args: vec![path.display().to_string()],
                path,
            });
        }
        Ok(())
    }

    /// Removes every recorded module in reverse insertion order, draining
    /// the table. Removal failures are logged; the record is dropped either
    /// way.
    pub fn remove_all(&mut self) {
        while let Some(record) = self.records.pop() {
            match Command::new(&self.rmmod).arg(&record.name).status() {
                Ok(status) if status.success() => {
                    tracing::info!(module = record.name, "kernel module removed");
                }
                Ok(status) => {
                    tracing::error!(module = record.name, %status, "module remove failed");
                }
                Err(e) => {
                    tracing::error!(module = record.name, error = %e, "could not run module remove command");
                }
            }
        }
    }
}

/// Builds the insert argument vector for a module: the object path followed
/// by `name=value` parameter pairs. Values containing whitespace are quoted.
/// `None` when the vector would exceed its bound.
fn module_args(path: &Path, params: &[(String, String)]) -> Option<Vec<String>> {
    if params.len() + 1 > MAX_MODULE_ARGS {
        return None;
    }
    let mut args = Vec::with_capacity(params.len() + 1);
    args.push(path.display().to_string());
    for (name, value) in params {
        if value.chars().any(char::is_whitespace) {
            args.push(format!("{name}=\"{value}\""));
        } else {
            args.push(format!("{name}={value}"));
        }
    }
    Some(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use vigil_common::config::MemoryConfig;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").expect("create file");
    }

    /// Writes an executable shell script that appends its first argument to
    /// a log file, so tests can count and order command invocations.
    fn logging_script(dir: &Path, name: &str, log: &Path) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\necho \"$1\" >> {}\n", log.display()))
            .expect("write script");
        let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod script");
        path
    }

    #[test]
    fn module_args_start_with_path_and_quote_whitespace() {
        let params = vec![
            ("irq".to_owned(), "7".to_owned()),
            ("label".to_owned(), "left radio".to_owned()),
        ];
        let args = module_args(Path::new("/mods/radio.ko"), &params).expect("within bounds");
        assert_eq!(args[0], "/mods/radio.ko");
        assert_eq!(args[1], "irq=7");
        assert_eq!(args[2], "label=\"left radio\"");
    }

    #[test]
    fn module_args_reject_oversized_parameter_lists() {
        let params: Vec<_> = (0..MAX_MODULE_ARGS)
            .map(|i| (format!("p{i}"), "1".to_owned()))
            .collect();
        assert!(module_args(Path::new("/mods/big.ko"), &params).is_none());
    }

    #[test]
    fn insert_all_records_only_module_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "a.ko");
        touch(dir.path(), "b.ko");
        touch(dir.path(), "notes.txt");

        let cfg = MemoryConfig::default();
        let mut table = ModuleTable::with_commands("/bin/true".into(), "/bin/true".into());
        table.insert_all(&cfg, dir.path()).expect("scan succeeds");

        assert_eq!(table.len(), 2);
        assert!(table.contains("a"));
        assert!(table.contains("b"));
        assert_eq!(table.names(), vec!["a", "b"]);
    }

    #[test]
    fn insert_failure_skips_the_module_and_continues() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "a.ko");
        touch(dir.path(), "b.ko");

        let cfg = MemoryConfig::default();
        let mut table = ModuleTable::with_commands("/bin/false".into(), "/bin/true".into());
        table.insert_all(&cfg, dir.path()).expect("scan still succeeds");
        assert!(table.is_empty());
    }

    #[test]
    fn missing_module_directory_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = MemoryConfig::default();
        let mut table = ModuleTable::with_commands("/bin/true".into(), "/bin/true".into());
        table
            .insert_all(&cfg, &dir.path().join("absent"))
            .expect("missing directory is fine");
        assert!(table.is_empty());
    }

    #[test]
    fn remove_all_unloads_in_reverse_order_and_drains_the_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "a.ko");
        touch(dir.path(), "b.ko");
        let log = dir.path().join("rmmod.log");
        let rmmod = logging_script(dir.path(), "rmmod.sh", &log);

        let cfg = MemoryConfig::default();
        let mut table = ModuleTable::with_commands("/bin/true".into(), rmmod);
        table.insert_all(&cfg, dir.path()).expect("scan succeeds");
        assert_eq!(table.len(), 2);

        table.remove_all();
        assert!(table.is_empty());

        let calls = std::fs::read_to_string(&log).expect("rmmod was invoked");
        assert_eq!(calls, "b\na\n");
    }

    #[test]
    fn configured_parameters_reach_the_argument_vector() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "radio.ko");

        let cfg = MemoryConfig::from_yaml_str("modules:\n  radio:\n    irq: 7\n")
            .expect("config parses");
        let mut table = ModuleTable::with_commands("/bin/true".into(), "/bin/true".into());
        table.insert_all(&cfg, dir.path()).expect("scan succeeds");

        assert_eq!(table.len(), 1);
        let record = &table.records[0];
        assert!(record.args()[0].ends_with("radio.ko"));
        assert_eq!(record.args()[1], "irq=7");
    }
}
