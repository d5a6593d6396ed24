//! Test-only helpers for constructing status trees and project layouts.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::tree::{StatusTree, Task, TaskStatus};

/// Create a leaf task with no ref and no children.
pub fn task(name: &str, status: TaskStatus) -> Task {
    Task::new(name, status)
}

/// Create a task with children.
pub fn task_with_children(name: &str, status: TaskStatus, children: Vec<Task>) -> Task {
    let mut task = Task::new(name, status);
    task.children = children;
    task
}

/// Create a task carrying a fractal ref.
pub fn task_with_ref(name: &str, status: TaskStatus, ref_path: &str) -> Task {
    let mut task = Task::new(name, status);
    task.ref_path = Some(ref_path.to_string());
    task
}

/// Build a reindexed tree from root tasks.
pub fn tree(roots: Vec<Task>) -> StatusTree {
    let mut tree = StatusTree::new();
    tree.roots = roots;
    tree.reindex();
    tree
}

/// Temporary project with a scaffolded `.flow/` directory.
pub struct TestProject {
    temp: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("tempdir");
        crate::io::paths::init_flow(temp.path()).expect("init .flow");
        Self { temp }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn flow_dir(&self) -> PathBuf {
        self.temp.path().join(".flow")
    }

    /// Write `status.md` raw bytes without touching the integrity sidecar.
    pub fn write_status(&self, contents: &str) {
        fs::write(self.flow_dir().join("status.md"), contents).expect("write status.md");
    }

    /// Write a sub-status document under `.flow/`.
    pub fn write_doc(&self, rel: &str, contents: &str) {
        let path = self.flow_dir().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create doc dir");
        }
        fs::write(path, contents).expect("write doc");
    }

    /// Write `flow.registry.json`.
    pub fn write_registry(&self, contents: &str) {
        fs::write(self.flow_dir().join("flow.registry.json"), contents).expect("write registry");
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}
