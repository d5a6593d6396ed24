//! Deterministic cursor selection over a single status document.

use crate::tree::{StatusTree, Task, TaskStatus};

/// Find the deepest active task (children win over their active parent).
///
/// Returns `None` when nothing in this document is active.
pub fn deepest_active(tree: &StatusTree) -> Option<&Task> {
    deepest_active_in(&tree.roots)
}

fn deepest_active_in(tasks: &[Task]) -> Option<&Task> {
    for task in tasks {
        if let Some(deep) = deepest_active_in(&task.children) {
            return Some(deep);
        }
        if task.status == TaskStatus::Active {
            return Some(task);
        }
    }
    None
}

/// Smart Resume: the document-order-first pending task.
///
/// Preorder, so a pending parent is selected before its children; the engine
/// activates it and descends on subsequent iterations.
pub fn first_pending(tree: &StatusTree) -> Option<&Task> {
    first_pending_in(&tree.roots)
}

fn first_pending_in(tasks: &[Task]) -> Option<&Task> {
    for task in tasks {
        if task.status == TaskStatus::Pending {
            return Some(task);
        }
        if let Some(found) = first_pending_in(&task.children) {
            return Some(found);
        }
    }
    None
}

/// The current cursor: deepest active, else Smart Resume.
pub fn cursor(tree: &StatusTree) -> Option<&Task> {
    deepest_active(tree).or_else(|| first_pending(tree))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{task, task_with_children, tree};

    #[test]
    fn cursor_returns_deepest_active() {
        let doc = tree(vec![task_with_children(
            "Phase 1",
            TaskStatus::Active,
            vec![task("Task A", TaskStatus::Pending), task("Task B", TaskStatus::Active)],
        )]);
        assert_eq!(cursor(&doc).expect("cursor").name, "Task B");
    }

    #[test]
    fn smart_resume_picks_first_pending_in_document_order() {
        let doc = tree(vec![
            task("Phase 1", TaskStatus::Done),
            task_with_children(
                "Phase 2",
                TaskStatus::Pending,
                vec![task("Task A", TaskStatus::Pending)],
            ),
        ]);
        assert_eq!(cursor(&doc).expect("cursor").name, "Phase 2");
    }

    #[test]
    fn cursor_is_none_when_everything_is_closed() {
        let doc = tree(vec![
            task("A", TaskStatus::Done),
            task("B", TaskStatus::Skipped),
        ]);
        assert!(cursor(&doc).is_none());
    }

    #[test]
    fn active_parent_without_active_child_is_the_cursor() {
        let doc = tree(vec![task_with_children(
            "Phase",
            TaskStatus::Active,
            vec![task("A", TaskStatus::Done)],
        )]);
        assert_eq!(cursor(&doc).expect("cursor").name, "Phase");
    }
}
