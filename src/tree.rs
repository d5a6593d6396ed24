//! Status tree types: tasks, markers, and the document-level tree.
//!
//! These types define stable contracts between the parser, the CRUD layer,
//! and the engine. They hold no I/O; loading and saving live in `io`.

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Lifecycle state of a single checklist task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Active,
    Done,
    Skipped,
}

impl TaskStatus {
    /// Marker character emitted on save. `[v]` and `[X]` normalize to `[x]`.
    pub fn marker(self) -> char {
        match self {
            TaskStatus::Pending => ' ',
            TaskStatus::Active => '/',
            TaskStatus::Done => 'x',
            TaskStatus::Skipped => '-',
        }
    }

    /// Marker character accepted on read.
    pub fn from_marker(marker: char) -> Option<Self> {
        match marker {
            ' ' => Some(TaskStatus::Pending),
            '/' => Some(TaskStatus::Active),
            'x' | 'X' | 'v' | 'V' => Some(TaskStatus::Done),
            '-' => Some(TaskStatus::Skipped),
            _ => None,
        }
    }
}

/// A single task in the hierarchy.
///
/// `name` is opaque user text and is written back byte-for-byte. `id` is the
/// virtual dotted position (`1.2.3`) assigned by [`StatusTree::reindex`]; it
/// is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    /// Fractal link to a sub-status file, relative to the data directory.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_path: Option<String>,
    pub children: Vec<Task>,
}

impl Task {
    pub fn new(name: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            status,
            ref_path: None,
            children: Vec::new(),
        }
    }
}

/// The entire status document: headers plus a forest of tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTree {
    /// `Key: Value` headers. Insertion order is preserved on save; duplicate
    /// keys keep their first position with the last value.
    pub headers: Vec<(String, String)>,
    pub roots: Vec<Task>,
    /// Set when the source bytes carried a UTF-8 BOM; round-tripped on save.
    pub has_bom: bool,
    ids_valid: bool,
}

impl StatusTree {
    pub fn new() -> Self {
        Self {
            headers: Vec::new(),
            roots: Vec::new(),
            has_bom: false,
            ids_valid: true,
        }
    }

    /// Last write wins; the key keeps its original position.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.headers.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.headers.push((key, value));
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove_header(&mut self, key: &str) {
        self.headers.retain(|(k, _)| k != key);
    }

    /// Recompute virtual dotted ids (`1`, `1.1`, ...) for every task.
    ///
    /// Must be called after load or any structural mutation before ids are
    /// used for addressing.
    pub fn reindex(&mut self) {
        assign_ids(&mut self.roots, "");
        self.ids_valid = true;
    }

    /// Mark virtual ids stale. Addressing a stale tree is `StaleIDError`.
    pub fn invalidate_ids(&mut self) {
        self.ids_valid = false;
    }

    pub fn ids_valid(&self) -> bool {
        self.ids_valid
    }

    /// Parse a dotted id into zero-based sibling indices.
    ///
    /// Fails with `IDError` on malformed input; staleness is checked by the
    /// callers in `core::ops` which also need mutation access.
    pub fn id_indices(id: &str) -> Result<Vec<usize>> {
        let mut indices = Vec::new();
        for part in id.split('.') {
            let n: usize = part
                .parse()
                .map_err(|_| FlowError::Id(id.to_string()))?;
            if n == 0 {
                return Err(FlowError::Id(id.to_string()));
            }
            indices.push(n - 1);
        }
        if indices.is_empty() {
            return Err(FlowError::Id(id.to_string()));
        }
        Ok(indices)
    }

    /// Borrow a task by dotted virtual id.
    pub fn find(&self, id: &str) -> Result<&Task> {
        if !self.ids_valid {
            return Err(FlowError::StaleId);
        }
        let indices = Self::id_indices(id)?;
        let mut siblings = &self.roots;
        let mut found: Option<&Task> = None;
        for index in indices {
            let task = siblings.get(index).ok_or_else(|| FlowError::Id(id.to_string()))?;
            siblings = &task.children;
            found = Some(task);
        }
        found.ok_or_else(|| FlowError::Id(id.to_string()))
    }

    /// Mutably borrow a task by dotted virtual id.
    pub fn find_mut(&mut self, id: &str) -> Result<&mut Task> {
        if !self.ids_valid {
            return Err(FlowError::StaleId);
        }
        let indices = Self::id_indices(id)?;
        let (last, ancestors) = indices.split_last().expect("id_indices is non-empty");
        let mut siblings = &mut self.roots;
        for index in ancestors {
            siblings = &mut siblings
                .get_mut(*index)
                .ok_or_else(|| FlowError::Id(id.to_string()))?
                .children;
        }
        siblings
            .get_mut(*last)
            .ok_or_else(|| FlowError::Id(id.to_string()))
    }

    /// Dotted id of the parent, or `None` for a root task.
    pub fn parent_id(id: &str) -> Option<String> {
        id.rsplit_once('.').map(|(head, _)| head.to_string())
    }
}

fn assign_ids(tasks: &mut [Task], prefix: &str) {
    for (index, task) in tasks.iter_mut().enumerate() {
        task.id = if prefix.is_empty() {
            (index + 1).to_string()
        } else {
            format!("{}.{}", prefix, index + 1)
        };
        let child_prefix = task.id.clone();
        assign_ids(&mut task.children, &child_prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{task, task_with_children};

    #[test]
    fn reindex_assigns_hierarchical_ids() {
        let mut tree = StatusTree::new();
        tree.roots = vec![
            task_with_children(
                "Root 1",
                TaskStatus::Pending,
                vec![
                    task("Child A", TaskStatus::Pending),
                    task("Child B", TaskStatus::Pending),
                ],
            ),
            task_with_children(
                "Root 2",
                TaskStatus::Pending,
                vec![task_with_children(
                    "Child C",
                    TaskStatus::Pending,
                    vec![task("Grandchild D", TaskStatus::Pending)],
                )],
            ),
        ];
        tree.reindex();

        assert_eq!(tree.roots[0].id, "1");
        assert_eq!(tree.roots[0].children[0].id, "1.1");
        assert_eq!(tree.roots[0].children[1].id, "1.2");
        assert_eq!(tree.roots[1].id, "2");
        assert_eq!(tree.roots[1].children[0].children[0].id, "2.1.1");
    }

    #[test]
    fn find_returns_task_by_dotted_id() {
        let mut tree = StatusTree::new();
        tree.roots = vec![task_with_children(
            "Root",
            TaskStatus::Pending,
            vec![task("Child", TaskStatus::Pending)],
        )];
        tree.reindex();

        assert_eq!(tree.find("1.1").expect("find").name, "Child");
        assert!(matches!(tree.find("1.9"), Err(FlowError::Id(_))));
        assert!(matches!(tree.find("bogus"), Err(FlowError::Id(_))));
    }

    #[test]
    fn find_after_invalidate_is_stale() {
        let mut tree = StatusTree::new();
        tree.roots = vec![task("Root", TaskStatus::Pending)];
        tree.reindex();
        tree.invalidate_ids();
        assert!(matches!(tree.find("1"), Err(FlowError::StaleId)));
    }

    #[test]
    fn duplicate_header_keeps_position_with_last_value() {
        let mut tree = StatusTree::new();
        tree.set_header("Proj", "A");
        tree.set_header("Version", "1");
        tree.set_header("Proj", "B");

        assert_eq!(tree.headers.len(), 2);
        assert_eq!(tree.headers[0], ("Proj".to_string(), "B".to_string()));
        assert_eq!(tree.header("Proj"), Some("B"));
    }

    #[test]
    fn done_markers_normalize_on_read() {
        for marker in ['x', 'X', 'v', 'V'] {
            assert_eq!(TaskStatus::from_marker(marker), Some(TaskStatus::Done));
        }
        assert_eq!(TaskStatus::Done.marker(), 'x');
        assert_eq!(TaskStatus::from_marker('?'), None);
    }
}
