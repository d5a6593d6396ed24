//! The path jail: every file-touching component resolves through here.
//!
//! `resolve` turns untrusted relative input into an absolute path proven to
//! live under the given root, or fails with a typed `SecurityError`. Inputs
//! are screened syntactically first so hostile strings are rejected before
//! any filesystem access.

use std::path::{Component, Path, PathBuf};

use crate::core::document::is_reserved_device_name;
use crate::error::{FlowError, Result, SecurityError};

/// Longest accepted input, matching the common PATH_MAX.
const MAX_INPUT_BYTES: usize = 4096;

/// Resolve `input` under `root`, enforcing the jail.
///
/// The target does not need to exist (callers create files through this);
/// containment is checked on the deepest existing ancestor after symlink
/// resolution, so a symlink inside the root cannot smuggle writes outside it.
pub fn resolve(root: &Path, input: &str) -> Result<PathBuf> {
    check_syntax(input)?;

    if !root.exists() {
        return Err(FlowError::RootNotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(FlowError::InvalidRoot(format!(
            "{} exists but is not a directory",
            root.display()
        )));
    }
    let canonical_root = std::fs::canonicalize(root)?;

    let joined = root.join(input);
    let resolved = canonicalize_lenient(&joined)?;

    if !resolved.starts_with(&canonical_root) {
        return Err(SecurityError::OutsideRoot {
            path: resolved,
            root: canonical_root,
        }
        .into());
    }

    check_same_device(&canonical_root, &resolved)?;
    Ok(resolved)
}

/// Syntax screen, aligned with the parser's ref validation rules.
pub fn check_syntax(input: &str) -> Result<()> {
    if input.contains('\0') {
        return Err(SecurityError::NullByte.into());
    }
    if input.len() > MAX_INPUT_BYTES {
        return Err(SecurityError::PathTooLong(input.len()).into());
    }
    if input.starts_with("\\\\") || input.starts_with("//") {
        return Err(SecurityError::UncPath(input.to_string()).into());
    }
    if Path::new(input).is_absolute() || input.starts_with('/') || input.starts_with('\\') {
        return Err(SecurityError::AbsolutePath(input.to_string()).into());
    }
    if is_windows_drive(input) {
        return Err(SecurityError::AbsolutePath(input.to_string()).into());
    }
    let lower = input.to_ascii_lowercase();
    for protocol in ["http:", "https:", "ftp:", "javascript:", "file:", "data:"] {
        if lower.starts_with(protocol) {
            return Err(SecurityError::Protocol(input.to_string()).into());
        }
    }
    for component in Path::new(input).components() {
        match component {
            Component::ParentDir => {
                return Err(SecurityError::Traversal(input.to_string()).into());
            }
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                let stem = part.split('.').next().unwrap_or(&part);
                if is_reserved_device_name(stem) {
                    return Err(SecurityError::ReservedName(part.to_string()).into());
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn is_windows_drive(input: &str) -> bool {
    let bytes = input.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Canonicalize the deepest existing ancestor and re-append the rest.
///
/// `fs::canonicalize` resolves symlinks with the OS's loop cap; a failure on
/// an existing path therefore surfaces as a symlink loop.
fn canonicalize_lenient(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    loop {
        if existing.exists() || existing.symlink_metadata().is_ok() {
            let canonical = std::fs::canonicalize(&existing)
                .map_err(|_| SecurityError::SymlinkLoop(existing.clone()))?;
            let mut out = canonical;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return Ok(out);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return Ok(path.to_path_buf()),
        }
    }
}

#[cfg(unix)]
fn check_same_device(root: &Path, target: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let root_dev = std::fs::metadata(root)?.dev();
    if let Ok(meta) = std::fs::metadata(target) {
        if meta.dev() != root_dev {
            return Err(SecurityError::DeviceCrossing(target.to_path_buf()).into());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_same_device(_root: &Path, _target: &Path) -> Result<()> {
    Ok(())
}
