//! Canonical `.flow/` layout, root discovery, and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{FlowError, Result};
use crate::io::config::FlowConfig;

/// All canonical paths under the data directory for a project root.
#[derive(Debug, Clone)]
pub struct FlowPaths {
    pub root: PathBuf,
    pub flow_dir: PathBuf,
    pub status_path: PathBuf,
    pub meta_path: PathBuf,
    pub registry_path: PathBuf,
    pub config_path: PathBuf,
    pub backups_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub sub_flows_dir: PathBuf,
    pub flows_dir: PathBuf,
    pub writer_lock_path: PathBuf,
}

impl FlowPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_marker(root, ".flow")
    }

    pub fn with_marker(root: impl Into<PathBuf>, marker: &str) -> Self {
        let root = root.into();
        let flow_dir = root.join(marker);
        Self {
            root,
            status_path: flow_dir.join("status.md"),
            meta_path: flow_dir.join("status.meta"),
            registry_path: flow_dir.join("flow.registry.json"),
            config_path: flow_dir.join("config.json"),
            backups_dir: flow_dir.join("backups"),
            state_dir: flow_dir.join("state"),
            logs_dir: flow_dir.join("logs"),
            artifacts_dir: flow_dir.join("artifacts"),
            sub_flows_dir: flow_dir.join("sub_flows"),
            flows_dir: flow_dir.join("flows"),
            writer_lock_path: flow_dir.join("status.lock"),
            flow_dir,
        }
    }
}

/// Scan upward from `start` for the nearest directory containing one of the
/// marker directories. Nested roots bind to the nearest.
pub fn discover_root(start: &Path, markers: &[String]) -> Result<FlowPaths> {
    let start = start
        .canonicalize()
        .map_err(|_| FlowError::RootNotFound(start.to_path_buf()))?;
    let mut current = start.clone();

    loop {
        for marker in markers {
            let candidate = current.join(marker);
            match candidate.symlink_metadata() {
                Ok(_) => {
                    let resolved = candidate.canonicalize().map_err(|_| {
                        FlowError::InvalidRoot(format!(
                            "cannot resolve {} (symlink loop?)",
                            candidate.display()
                        ))
                    })?;
                    if !resolved.is_dir() {
                        return Err(FlowError::InvalidRoot(format!(
                            "found {} but it is not a directory",
                            candidate.display()
                        )));
                    }
                    debug!(root = %current.display(), %marker, "project root discovered");
                    return Ok(FlowPaths::with_marker(current, marker));
                }
                Err(_) => continue,
            }
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return Err(FlowError::RootNotFound(start)),
        }
    }
}

/// Create the `.flow/` scaffolding in `root`.
///
/// Fills in missing directories and files; existing content is left alone so
/// re-running `init` on a live project is safe.
pub fn init_flow(root: &Path) -> Result<FlowPaths> {
    let paths = FlowPaths::new(root);
    if paths.flow_dir.exists() && !paths.flow_dir.is_dir() {
        return Err(FlowError::InvalidRoot(format!(
            "{} exists but is not a directory",
            paths.flow_dir.display()
        )));
    }

    for dir in [
        &paths.flow_dir,
        &paths.backups_dir,
        &paths.state_dir,
        &paths.logs_dir,
        &paths.artifacts_dir,
        &paths.sub_flows_dir,
        &paths.flows_dir,
    ] {
        fs::create_dir_all(dir)?;
    }

    write_if_missing(&paths.status_path, b"")?;
    write_if_missing(&paths.registry_path, b"{}\n")?;
    if !paths.config_path.exists() {
        super::config::write_config(&paths.config_path, &FlowConfig::default())?;
    }

    Ok(paths)
}

fn write_if_missing(path: &Path, contents: &[u8]) -> Result<()> {
    if !path.exists() {
        fs::write(path, contents)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        vec![".flow".to_string()]
    }

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_flow(temp.path()).expect("init");

        assert!(paths.flow_dir.is_dir());
        assert!(paths.backups_dir.is_dir());
        assert!(paths.state_dir.is_dir());
        assert!(paths.logs_dir.is_dir());
        assert!(paths.artifacts_dir.is_dir());
        assert!(paths.status_path.is_file());
        assert!(paths.registry_path.is_file());
        assert!(paths.config_path.is_file());
    }

    #[test]
    fn init_is_idempotent_and_preserves_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_flow(temp.path()).expect("init");
        fs::write(&paths.status_path, "- [ ] Keep me\n").expect("write");
        init_flow(temp.path()).expect("re-init");
        assert_eq!(
            fs::read_to_string(&paths.status_path).expect("read"),
            "- [ ] Keep me\n"
        );
    }

    #[test]
    fn discover_finds_root_from_nested_cwd() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_flow(temp.path()).expect("init");
        let nested = temp.path().join("src/deep/module");
        fs::create_dir_all(&nested).expect("mkdirs");

        let paths = discover_root(&nested, &markers()).expect("discover");
        assert_eq!(
            paths.root,
            temp.path().canonicalize().expect("canonicalize root")
        );
    }

    #[test]
    fn discover_binds_to_nearest_nested_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_flow(temp.path()).expect("outer init");
        let inner = temp.path().join("workspace/project");
        fs::create_dir_all(&inner).expect("mkdirs");
        init_flow(&inner).expect("inner init");

        let paths = discover_root(&inner.join("src"), &markers()).expect("discover");
        assert_eq!(paths.root, inner.canonicalize().expect("canonicalize inner"));
    }

    #[test]
    fn discover_fails_without_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = discover_root(temp.path(), &markers()).expect_err("should fail");
        assert!(matches!(err, FlowError::RootNotFound(_)), "{err}");
    }

    #[test]
    fn discover_rejects_marker_that_is_a_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join(".flow"), "not a dir").expect("write");
        let err = discover_root(temp.path(), &markers()).expect_err("should fail");
        assert!(matches!(err, FlowError::InvalidRoot(_)), "{err}");
    }
}
