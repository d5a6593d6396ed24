//! CRUD operations over the status tree.
//!
//! Every operation is atomic in memory: preconditions are checked first and
//! multi-node mutations (reset, reopen) validate the result before commit, so
//! a failed call leaves the tree untouched.

use crate::core::invariants::check_tree;
use crate::error::{FlowError, Result};
use crate::tree::{StatusTree, TaskStatus};

/// Field updates for [`StatusTree::update_task`]. Unset fields are untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskUpdate<'a> {
    pub name: Option<&'a str>,
    pub status: Option<TaskStatus>,
    /// When set, must equal the task's current name (optimistic anchor).
    pub context_anchor: Option<&'a str>,
}

impl<'a> TaskUpdate<'a> {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

impl StatusTree {
    /// Add a child under `parent_id` (`None` for root level), appended or
    /// inserted at a 0-based index. Invalidates virtual ids.
    pub fn add_task(
        &mut self,
        parent_id: Option<&str>,
        name: &str,
        status: TaskStatus,
        index: Option<usize>,
    ) -> Result<()> {
        validate_name(name)?;

        if let Some(parent_id) = parent_id {
            let parent = self.find(parent_id)?;
            if parent.status == TaskStatus::Done
                && !matches!(status, TaskStatus::Done | TaskStatus::Skipped)
            {
                return Err(FlowError::State(format!(
                    "Cannot add {status:?} child '{name}' to Done parent '{}'.",
                    parent.name
                )));
            }
        }

        let siblings = match parent_id {
            Some(parent_id) => &self.find(parent_id)?.children,
            None => &self.roots,
        };
        if siblings.iter().any(|s| s.name == name) {
            return Err(FlowError::Validation(format!(
                "Duplicate name '{name}' in siblings."
            )));
        }

        if status == TaskStatus::Active {
            self.check_activation(parent_id)?;
        }

        let task = crate::tree::Task::new(name, status);
        let siblings = match parent_id {
            Some(parent_id) => &mut self.find_mut(parent_id)?.children,
            None => &mut self.roots,
        };
        let index = index.unwrap_or(siblings.len()).min(siblings.len());
        siblings.insert(index, task);
        self.invalidate_ids();
        Ok(())
    }

    /// Update name and/or status with optional anchor verification.
    ///
    /// Status changes run the auto-propagation bubbles: a child turning DONE
    /// promotes a pending parent to ACTIVE, and completes the parent once the
    /// last non-skipped sibling is DONE.
    pub fn update_task(&mut self, id: &str, update: TaskUpdate<'_>) -> Result<()> {
        let task = self.find(id)?;

        if let Some(anchor) = update.context_anchor {
            if task.name != anchor {
                return Err(FlowError::Anchor {
                    expected: anchor.to_string(),
                    actual: task.name.clone(),
                });
            }
        }

        if let Some(name) = update.name {
            validate_name(name)?;
            let siblings = match StatusTree::parent_id(id) {
                Some(parent_id) => &self.find(&parent_id)?.children,
                None => &self.roots,
            };
            if siblings.iter().any(|s| s.id != id && s.name == name) {
                return Err(FlowError::Validation(format!(
                    "Duplicate name '{name}' in siblings."
                )));
            }
        }

        if let Some(status) = update.status {
            let current = self.find(id)?.status;
            if status == TaskStatus::Active && current != TaskStatus::Active {
                self.check_activation_of(id)?;
            }
            if status == TaskStatus::Done {
                self.check_completion(id)?;
            }
            if matches!(status, TaskStatus::Pending | TaskStatus::Active) {
                if let Some(parent_id) = StatusTree::parent_id(id) {
                    let parent = self.find(&parent_id)?;
                    if parent.status == TaskStatus::Done && status == TaskStatus::Pending {
                        return Err(FlowError::State(format!(
                            "Cannot reopen '{}' under Done parent '{}'; reopen the parent first.",
                            self.find(id)?.name,
                            parent.name
                        )));
                    }
                }
            }
        }

        let task = self.find_mut(id)?;
        if let Some(name) = update.name {
            task.name = name.to_string();
        }
        if let Some(status) = update.status {
            task.status = status;
            self.propagate(id)?;
        }
        Ok(())
    }

    /// Remove a task and its subtree. Invalidates virtual ids.
    pub fn remove_task(&mut self, id: &str) -> Result<()> {
        self.find(id)?;
        let indices = StatusTree::id_indices(id)?;
        let (last, ancestors) = indices.split_last().expect("id_indices is non-empty");
        let siblings = if ancestors.is_empty() {
            &mut self.roots
        } else {
            let parent_id = StatusTree::parent_id(id).expect("non-root id has a parent");
            &mut self.find_mut(&parent_id)?.children
        };
        siblings.remove(*last);
        self.invalidate_ids();
        Ok(())
    }

    /// Revert a task and all of its descendants to PENDING.
    ///
    /// DONE ancestors are demoted to ACTIVE so the hierarchy stays coherent.
    /// The whole tree is validated before commit; on violation nothing moves.
    pub fn reset_task(&mut self, id: &str) -> Result<()> {
        self.find(id)?;
        let snapshot = self.clone();

        let task = self.find_mut(id)?;
        set_subtree_pending(task);
        self.demote_done_ancestors(id)?;

        let errors = check_tree(self);
        if !errors.is_empty() {
            *self = snapshot;
            return Err(FlowError::State(format!(
                "reset would violate tree invariants: {}",
                errors.join("; ")
            )));
        }
        Ok(())
    }

    /// Move a DONE task back to ACTIVE, re-opening DONE ancestors.
    pub fn reopen_task(&mut self, id: &str) -> Result<()> {
        let task = self.find(id)?;
        if task.status != TaskStatus::Done {
            return Err(FlowError::State(format!(
                "Cannot reopen '{}': status is {:?}, not Done.",
                task.name, task.status
            )));
        }
        let snapshot = self.clone();

        self.find_mut(id)?.status = TaskStatus::Active;
        self.demote_done_ancestors(id)?;

        let errors = check_tree(self);
        if !errors.is_empty() {
            *self = snapshot;
            return Err(FlowError::State(format!(
                "reopen would violate tree invariants: {}",
                errors.join("; ")
            )));
        }
        Ok(())
    }

    /// Validate activating a child at the given position (add case).
    fn check_activation(&self, parent_id: Option<&str>) -> Result<()> {
        if let Some(parent_id) = parent_id {
            let parent = self.find(parent_id)?;
            if parent.status != TaskStatus::Active {
                return Err(FlowError::State(format!(
                    "Parent '{}' is not active.",
                    parent.name
                )));
            }
        }
        for (active_id, name) in self.active_ids() {
            let is_ancestor = parent_id
                .map(|pid| pid == active_id || pid.starts_with(&format!("{active_id}.")))
                .unwrap_or(false);
            if !is_ancestor {
                return Err(FlowError::State(format!("'{name}' is already active.")));
            }
        }
        Ok(())
    }

    /// Validate activating an existing task (update case): the parent must be
    /// active, and any other active task must lie on the ancestor chain.
    fn check_activation_of(&self, id: &str) -> Result<()> {
        if let Some(parent_id) = StatusTree::parent_id(id) {
            let parent = self.find(&parent_id)?;
            if parent.status != TaskStatus::Active {
                return Err(FlowError::State(format!(
                    "Parent '{}' is not active.",
                    parent.name
                )));
            }
        }
        for (active_id, name) in self.active_ids() {
            if active_id == id {
                continue;
            }
            if !id.starts_with(&format!("{active_id}.")) {
                if StatusTree::parent_id(id).as_deref() == StatusTree::parent_id(&active_id).as_deref() {
                    return Err(FlowError::State(format!(
                        "Sibling '{name}' is already active."
                    )));
                }
                return Err(FlowError::State(format!("'{name}' is already active.")));
            }
        }
        Ok(())
    }

    fn check_completion(&self, id: &str) -> Result<()> {
        let task = self.find(id)?;
        if let Some(open) = first_open_descendant(&task.children) {
            return Err(FlowError::State(format!(
                "Cannot complete '{}' while descendant '{}' is open.",
                task.name, open
            )));
        }
        Ok(())
    }

    /// Auto-propagation bubbles, walking up from the mutated task.
    fn propagate(&mut self, id: &str) -> Result<()> {
        let mut child_id = id.to_string();
        while let Some(parent_id) = StatusTree::parent_id(&child_id) {
            let child_status = self.find(&child_id)?.status;
            let parent = self.find_mut(&parent_id)?;
            let all_closed = parent
                .children
                .iter()
                .all(|c| matches!(c.status, TaskStatus::Done | TaskStatus::Skipped));

            let next = if child_status == TaskStatus::Done
                && all_closed
                && parent.status != TaskStatus::Done
            {
                Some(TaskStatus::Done)
            } else if matches!(child_status, TaskStatus::Done | TaskStatus::Active)
                && parent.status == TaskStatus::Pending
            {
                Some(TaskStatus::Active)
            } else {
                None
            };

            match next {
                Some(status) => {
                    parent.status = status;
                    child_id = parent_id;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn demote_done_ancestors(&mut self, id: &str) -> Result<()> {
        let mut current = StatusTree::parent_id(id);
        while let Some(ancestor_id) = current {
            let ancestor = self.find_mut(&ancestor_id)?;
            if ancestor.status == TaskStatus::Done {
                ancestor.status = TaskStatus::Active;
            }
            current = StatusTree::parent_id(&ancestor_id);
        }
        Ok(())
    }

    /// Dotted ids and names of every active task, in document order.
    fn active_ids(&self) -> Vec<(String, String)> {
        fn walk(tasks: &[crate::tree::Task], out: &mut Vec<(String, String)>) {
            for task in tasks {
                if task.status == TaskStatus::Active {
                    out.push((task.id.clone(), task.name.clone()));
                }
                walk(&task.children, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.roots, &mut out);
        out
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FlowError::Validation("task name must not be empty".to_string()));
    }
    if name.contains('\n') || name.contains('\r') {
        return Err(FlowError::Validation(format!(
            "task name contains a line break: '{}'",
            name.escape_debug()
        )));
    }
    Ok(())
}

fn set_subtree_pending(task: &mut crate::tree::Task) {
    task.status = TaskStatus::Pending;
    for child in &mut task.children {
        set_subtree_pending(child);
    }
}

fn first_open_descendant(tasks: &[crate::tree::Task]) -> Option<String> {
    for task in tasks {
        if matches!(task.status, TaskStatus::Pending | TaskStatus::Active) {
            return Some(task.name.clone());
        }
        if let Some(found) = first_open_descendant(&task.children) {
            return Some(found);
        }
    }
    None
}
