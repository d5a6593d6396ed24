//! Engine configuration stored at `.flow/config.json`.
//!
//! Human-edited; missing file and missing fields fall back to defaults so a
//! bare `.flow/` directory is runnable. No behavior is read from environment
//! variables.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlowConfig {
    /// Marker directories searched upward from CWD during hydration.
    pub root_markers: Vec<String>,

    /// Circuit breaker: attempts allowed per (task, step) before FATAL.
    pub retry_bound: u32,

    /// Maximum sub-workflow composition depth.
    pub recursion_cap: usize,

    /// Maximum checklist nesting depth accepted by the parser.
    pub parser_depth_cap: usize,

    /// Rotated backups retained under `backups/`.
    pub backups_keep: usize,

    /// Rotate `events.jsonl` beyond this many bytes.
    pub event_rotate_bytes: u64,

    /// Inline payload cap; larger payloads spill to `artifacts/`.
    pub event_inline_cap: usize,

    pub loom: LoomConfig,
    pub scope: ScopeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoomConfig {
    /// Refuse to edit files larger than this.
    pub max_file_bytes: u64,
    /// Advisory lock acquisition deadline.
    pub lock_deadline_ms: u64,
    /// Locks older than this are stale and forcibly replaced.
    pub lock_stale_ms: u64,
    /// Per-match regex budget.
    pub regex_timeout_ms: u64,
}

/// Path whitelist for atom-visible capabilities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScopeConfig {
    pub role: String,
    /// Relative prefixes under the project root that atoms may edit.
    pub allow: Vec<String>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            root_markers: vec![".flow".to_string()],
            retry_bound: 3,
            recursion_cap: 10,
            parser_depth_cap: 64,
            backups_keep: 10,
            event_rotate_bytes: 10 * 1024 * 1024,
            event_inline_cap: 8192,
            loom: LoomConfig::default(),
            scope: ScopeConfig::default(),
        }
    }
}

impl Default for LoomConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 50 * 1024 * 1024,
            lock_deadline_ms: 5_000,
            lock_stale_ms: 30_000,
            regex_timeout_ms: 100,
        }
    }
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            role: "engine".to_string(),
            allow: vec![String::from(".")],
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.root_markers.is_empty() {
            return Err(FlowError::Config("root_markers must not be empty".to_string()));
        }
        if self.retry_bound == 0 {
            return Err(FlowError::Config("retry_bound must be > 0".to_string()));
        }
        if self.recursion_cap == 0 {
            return Err(FlowError::Config("recursion_cap must be > 0".to_string()));
        }
        if self.parser_depth_cap == 0 {
            return Err(FlowError::Config("parser_depth_cap must be > 0".to_string()));
        }
        if self.event_inline_cap == 0 {
            return Err(FlowError::Config("event_inline_cap must be > 0".to_string()));
        }
        if self.loom.max_file_bytes == 0 {
            return Err(FlowError::Config("loom.max_file_bytes must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Load config from `path`; a missing file yields validated defaults.
pub fn load_config(path: &Path) -> Result<FlowConfig> {
    if !path.exists() {
        let config = FlowConfig::default();
        config.validate()?;
        return Ok(config);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))
        .map_err(|e| FlowError::Config(format!("{e:#}")))?;
    let config: FlowConfig = serde_json::from_str(&contents)
        .map_err(|e| FlowError::Config(format!("parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Atomically write config (temp file + rename).
pub fn write_config(path: &Path, config: &FlowConfig) -> Result<()> {
    config.validate()?;
    let mut buf = serde_json::to_string_pretty(config)?;
    buf.push('\n');
    super::write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = load_config(&temp.path().join("missing.json")).expect("load");
        assert_eq!(config, FlowConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        let mut config = FlowConfig::default();
        config.retry_bound = 5;
        write_config(&path, &config).expect("write");
        assert_eq!(load_config(&path).expect("load"), config);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"retry_bound": 7}"#).expect("write");
        let config = load_config(&path).expect("load");
        assert_eq!(config.retry_bound, 7);
        assert_eq!(config.recursion_cap, 10);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"retry_bound": 0}"#).expect("write");
        let err = load_config(&path).expect_err("should fail");
        assert!(matches!(err, FlowError::Config(_)), "{err}");
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        std::fs::write(&path, "not json").expect("write");
        let err = load_config(&path).expect_err("should fail");
        assert!(matches!(err, FlowError::Config(_)), "{err}");
    }
}
