//! Filesystem concerns: layout, jailing, integrity, state, events, editing.

pub mod config;
pub mod event_log;
pub mod integrity;
pub mod intent;
pub mod loom;
pub mod paths;
pub mod registry;
pub mod safe_path;
pub mod state_store;
pub mod status_store;

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{FlowError, Result};

/// Shared two-phase write: temp file in the same directory, fsync, rename.
///
/// Every cross-file state transition in the engine goes through this so a
/// crash mid-write never leaves a half-written file behind.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| FlowError::InvalidRoot(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| FlowError::InvalidRoot(format!("{} has no file name", path.display())))?;
    let tmp = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));

    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}
