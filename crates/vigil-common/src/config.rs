//! Read-only configuration access.
//!
//! The supervisor reads every setting through [`ConfigStore`], opening a
//! short-lived read transaction per lookup and never holding one across a
//! start or stop operation. A node that is absent or empty means "use the
//! compiled-in default"; it is never an error.
//!
//! [`MemoryConfig`] is the bundled implementation, backed by a YAML document.
//! YAML mappings preserve declared order, which is what carries the
//! process-list start-order invariant.

use serde_yaml::Value;

use crate::error::{Result, VigilError};

/// Read-only, transactional access to a configuration tree keyed by path.
pub trait ConfigStore {
    /// Opens a read transaction rooted at an absolute path such as
    /// `/apps/web/procs/server`. A transaction over an absent subtree is
    /// valid; every lookup through it reports the node as missing.
    fn read_txn(&self, path: &str) -> ConfigTxn<'_>;
}

/// A read transaction rooted at a configuration node.
#[derive(Debug, Clone, Copy)]
pub struct ConfigTxn<'a> {
    root: Option<&'a Value>,
}

impl<'a> ConfigTxn<'a> {
    /// Builds a transaction over an already-resolved subtree.
    #[must_use]
    pub const fn new(root: Option<&'a Value>) -> Self {
        Self { root }
    }

    /// Resolves a node relative to the transaction root. An empty relative
    /// path names the root itself.
    #[must_use]
    pub fn node(&self, rel_path: &str) -> Option<&'a Value> {
        let mut current = self.root?;
        for segment in rel_path.split('/').filter(|s| !s.is_empty()) {
            let key = Value::String(segment.to_owned());
            current = current.as_mapping()?.get(&key)?;
        }
        Some(current)
    }

    /// Whether the node exists at all.
    #[must_use]
    pub fn node_exists(&self, rel_path: &str) -> bool {
        self.node(rel_path).is_some()
    }

    /// Whether the node exists but holds no value.
    #[must_use]
    pub fn is_empty(&self, rel_path: &str) -> bool {
        matches!(self.node(rel_path), Some(Value::Null))
    }

    /// Whether the node holds an integer.
    #[must_use]
    pub fn is_int(&self, rel_path: &str) -> bool {
        self.node(rel_path).is_some_and(|v| v.as_i64().is_some())
    }

    /// Reads a boolean, falling back to `default` when the node is absent or
    /// not a boolean.
    #[must_use]
    pub fn get_bool(&self, rel_path: &str, default: bool) -> bool {
        self.node(rel_path).and_then(Value::as_bool).unwrap_or(default)
    }

    /// Reads a scalar as a string. `None` when the node is absent, empty, or
    /// not a scalar.
    #[must_use]
    pub fn get_string(&self, rel_path: &str) -> Option<String> {
        self.node(rel_path).and_then(scalar_to_string)
    }

    /// Reads an integer. `None` when the node is absent or not an integer.
    #[must_use]
    pub fn get_i64(&self, rel_path: &str) -> Option<i64> {
        self.node(rel_path).and_then(Value::as_i64)
    }

    /// Reads a sequence of scalars. Non-scalar entries come back as empty
    /// strings so the caller can reject them explicitly. `None` when the
    /// node is absent or not a sequence.
    #[must_use]
    pub fn get_string_list(&self, rel_path: &str) -> Option<Vec<String>> {
        let seq = self.node(rel_path)?.as_sequence()?;
        Some(
            seq.iter()
                .map(|v| scalar_to_string(v).unwrap_or_default())
                .collect(),
        )
    }

    /// Reads a mapping of scalars as ordered name/value pairs. Entries with
    /// non-string keys are skipped; entries with non-scalar values come back
    /// with an empty value. `None` when the node is absent or not a mapping.
    #[must_use]
    pub fn get_string_map(&self, rel_path: &str) -> Option<Vec<(String, String)>> {
        let map = self.node(rel_path)?.as_mapping()?;
        Some(
            map.iter()
                .filter_map(|(k, v)| {
                    k.as_str()
                        .map(|k| (k.to_owned(), scalar_to_string(v).unwrap_or_default()))
                })
                .collect(),
        )
    }

    /// Names of the node's mapping children, in declared order.
    #[must_use]
    pub fn child_names(&self, rel_path: &str) -> Vec<String> {
        self.node(rel_path)
            .and_then(Value::as_mapping)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, _)| k.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Renders a scalar node as a string.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// An in-memory configuration tree backed by a YAML document.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    root: Value,
}

impl MemoryConfig {
    /// Wraps an already-parsed document.
    #[must_use]
    pub const fn new(root: Value) -> Self {
        Self { root }
    }

    /// Parses a YAML document into a configuration tree.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::BadParameter`] when the document is not valid
    /// YAML.
    pub fn from_yaml_str(document: &str) -> Result<Self> {
        let root = serde_yaml::from_str(document).map_err(|e| VigilError::BadParameter {
            message: format!("invalid configuration document: {e}"),
        })?;
        Ok(Self { root })
    }
}

impl ConfigStore for MemoryConfig {
    fn read_txn(&self, path: &str) -> ConfigTxn<'_> {
        ConfigTxn::new(Some(&self.root)).node(path).map_or_else(
            || ConfigTxn::new(None),
            |node| ConfigTxn::new(Some(node)),
        )
    }
}
