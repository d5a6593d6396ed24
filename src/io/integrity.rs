//! Tamper detection for the status document: sidecar hash + rotated backups.
//!
//! The sidecar is updated last on every save, so a crash between the backup
//! and the hash update leaves a recoverable tamper-detected state rather than
//! an incoherent one.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{FlowError, Result};

/// Sidecar record written next to the protected file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityRecord {
    pub sha256: String,
    /// File name of the most recent backup under `backups/`, if any.
    #[serde(default)]
    pub backup: Option<String>,
    pub saved_at: String,
}

#[derive(Debug)]
pub struct IntegrityStore {
    flow_dir: PathBuf,
    backups_dir: PathBuf,
    keep: usize,
}

impl IntegrityStore {
    pub fn new(flow_dir: impl Into<PathBuf>, keep: usize) -> Self {
        let flow_dir = flow_dir.into();
        Self {
            backups_dir: flow_dir.join("backups"),
            flow_dir,
            keep,
        }
    }

    /// Read and verify `file_name` against its sidecar.
    ///
    /// A missing sidecar is tolerated (first run / manually created file);
    /// a present sidecar must match or the load fails with `IntegrityError`.
    pub fn load(&self, file_name: &str) -> Result<Vec<u8>> {
        let path = self.flow_dir.join(file_name);
        let bytes = fs::read(&path)?;
        let actual = sha256_hex(&bytes);

        let meta_path = sidecar_path(&path);
        if !meta_path.exists() {
            debug!(file = file_name, "no integrity sidecar; accepting as first run");
            return Ok(bytes);
        }

        let record = read_sidecar(&meta_path, &actual)?;
        if record.sha256 != actual {
            return Err(FlowError::Integrity {
                expected: record.sha256,
                actual,
            });
        }
        Ok(bytes)
    }

    /// Save with the full discipline: backup → atomic write → sidecar last.
    pub fn save(&self, file_name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.flow_dir.join(file_name);
        let backup = if path.exists() {
            Some(self.create_backup(&path)?)
        } else {
            None
        };
        super::write_atomic(&path, bytes)?;
        self.write_sidecar(&path, bytes, backup)?;
        Ok(())
    }

    /// Accept the current on-disk bytes as authoritative (rewrite sidecar).
    pub fn accept(&self, file_name: &str) -> Result<()> {
        let path = self.flow_dir.join(file_name);
        let bytes = fs::read(&path)?;
        self.write_sidecar(&path, &bytes, self.newest_backup(&path)?)?;
        Ok(())
    }

    /// Reject the current bytes: restore the newest backup and re-hash.
    pub fn decline(&self, file_name: &str) -> Result<()> {
        let path = self.flow_dir.join(file_name);
        let backup = self
            .newest_backup(&path)?
            .ok_or_else(|| FlowError::State("No backups found to restore.".to_string()))?;
        let bytes = fs::read(self.backups_dir.join(&backup))?;
        super::write_atomic(&path, &bytes)?;
        self.write_sidecar(&path, &bytes, Some(backup))?;
        Ok(())
    }

    fn write_sidecar(&self, path: &Path, bytes: &[u8], backup: Option<String>) -> Result<()> {
        let record = IntegrityRecord {
            sha256: sha256_hex(bytes),
            backup,
            saved_at: chrono::Utc::now().to_rfc3339(),
        };
        let mut buf = serde_json::to_string_pretty(&record)?;
        buf.push('\n');
        super::write_atomic(&sidecar_path(path), buf.as_bytes())
    }

    /// Copy the current file into `backups/<stem>_<ts><ext>` and rotate.
    fn create_backup(&self, path: &Path) -> Result<String> {
        fs::create_dir_all(&self.backups_dir)?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let stem = path.file_stem().unwrap_or_default().to_string_lossy();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        // Zero-padded so lexicographic order is chronological order.
        let name = format!("{stem}_{nanos:025}{ext}");
        fs::copy(path, self.backups_dir.join(&name))?;
        self.rotate(&stem, &ext)?;
        Ok(name)
    }

    fn rotate(&self, stem: &str, ext: &str) -> Result<()> {
        let mut backups = self.backup_names(stem, ext)?;
        backups.sort();
        while backups.len() > self.keep {
            let oldest = backups.remove(0);
            warn!(backup = %oldest, "rotating out old backup");
            fs::remove_file(self.backups_dir.join(oldest))?;
        }
        Ok(())
    }

    fn newest_backup(&self, path: &Path) -> Result<Option<String>> {
        let stem = path.file_stem().unwrap_or_default().to_string_lossy();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let mut backups = self.backup_names(&stem, &ext)?;
        backups.sort();
        Ok(backups.pop())
    }

    fn backup_names(&self, stem: &str, ext: &str) -> Result<Vec<String>> {
        if !self.backups_dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{stem}_");
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.backups_dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(ext) {
                names.push(name);
            }
        }
        Ok(names)
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    path.with_extension("meta")
}

fn read_sidecar(meta_path: &Path, actual: &str) -> Result<IntegrityRecord> {
    let contents = fs::read_to_string(meta_path)?;
    serde_json::from_str(&contents).map_err(|_| FlowError::Integrity {
        expected: "<corrupt sidecar>".to_string(),
        actual: actual.to_string(),
    })
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
