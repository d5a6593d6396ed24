//! The atom whitelist: `flow.registry.json`.
//!
//! A single JSON object mapping atom names to implementation identifiers.
//! Anything not listed here does not exist to the engine. The startup
//! consistency check marks unresolvable entries BROKEN instead of killing
//! the boot; dispatching to a broken entry fails cleanly.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Ok,
    Broken(String),
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub impl_id: String,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl Registry {
    /// Load the whitelist. A missing file is an empty registry; anything that
    /// parses but is not a string→string object is `ConfigError`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no registry file; starting empty");
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&contents).map_err(|err| {
            FlowError::Config(format!("invalid JSON in {}: {err}", path.display()))
        })?;
        let Value::Object(map) = value else {
            return Err(FlowError::Config(format!(
                "invalid registry {}: root must be an object",
                path.display()
            )));
        };

        let mut entries = BTreeMap::new();
        for (name, value) in map {
            let Value::String(impl_id) = value else {
                return Err(FlowError::Config(format!(
                    "invalid registry entry '{name}': implementation id must be a string"
                )));
            };
            entries.insert(
                name,
                RegistryEntry {
                    impl_id,
                    status: EntryStatus::Ok,
                },
            );
        }
        Ok(Self { entries })
    }

    /// Startup consistency check: resolve each implementation id once and
    /// mark failures BROKEN without killing the engine.
    pub fn consistency_check(
        &mut self,
        resolve: impl Fn(&str) -> std::result::Result<(), String>,
    ) {
        for (name, entry) in &mut self.entries {
            if let Err(reason) = resolve(&entry.impl_id) {
                warn!(atom = %name, impl_id = %entry.impl_id, %reason, "marking atom BROKEN");
                entry.status = EntryStatus::Broken(reason);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
