// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Credential store.
//!
//! Secrets are kept out of the collector configuration in a YAML file of
//! named entries:
//!
//! ```yaml
//! mqtt:
//!   user: collector
//!   passwd: secret
//! influx:
//!   passwd: my-token
//! ```

use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Value meaning "not set" in overrides.
const UNSET: &str = "-";

/// Credential store errors.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Lookup of named credential entries.
pub trait CredentialStore: Send + Sync {
    /// Field `field` of entry `entry`.
    fn lookup(&self, entry: &str, field: &str) -> Option<String>;
}

/// In-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    entries: HashMap<String, HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one field of an entry.
    pub fn insert(&mut self, entry: &str, field: &str, value: &str) {
        self.entries
            .entry(entry.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, entry: &str, field: &str, value: &str) -> Self {
        self.insert(entry, field, value);
        self
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn lookup(&self, entry: &str, field: &str) -> Option<String> {
        self.entries.get(entry)?.get(field).cloned()
    }
}

/// Store backed by a YAML file.
#[derive(Debug, Clone, Default)]
pub struct YamlCredentialStore {
    inner: MemoryCredentialStore,
}

impl YamlCredentialStore {
    /// Parse a store from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self, CredentialError> {
        let mut inner = MemoryCredentialStore::new();
        if yaml.trim().is_empty() {
            return Ok(Self { inner });
        }
        let raw: BTreeMap<String, BTreeMap<String, Value>> = serde_yaml::from_str(yaml)?;
        for (entry, fields) in raw {
            for (field, value) in fields {
                let value = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                inner.insert(&entry, &field, &value);
            }
        }
        Ok(Self { inner })
    }

    /// Read a store file.
    pub fn from_file(path: &Path) -> Result<Self, CredentialError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Read a store file, falling back to an empty store.
    pub fn load_or_empty(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        if !path.exists() {
            debug!(path = %path.display(), "no credential store");
            return Self::default();
        }
        match Self::from_file(path) {
            Ok(store) => store,
            Err(e) => {
                warn!(path = %path.display(), "ignoring credential store: {}", e);
                Self::default()
            }
        }
    }
}

impl CredentialStore for YamlCredentialStore {
    fn lookup(&self, entry: &str, field: &str) -> Option<String> {
        self.inner.lookup(entry, field)
    }
}

/// Resolve a credential: an explicit value wins unless empty or `-`,
/// otherwise `field` of `entry` is looked up in `store`.
pub fn resolve(
    explicit: Option<&str>,
    store: &dyn CredentialStore,
    entry: Option<&str>,
    field: &str,
) -> Option<String> {
    if let Some(value) = explicit.map(str::trim) {
        if !value.is_empty() && value != UNSET {
            return Some(value.to_string());
        }
    }
    let entry = entry.map(str::trim).filter(|e| !e.is_empty() && *e != UNSET)?;
    store.lookup(entry, field)
}
