//! Cross-node invariants for the status tree.
//!
//! Checked on load and before every save, so every reachable on-disk document
//! either satisfies them or is in a declared tamper state. Violations are
//! stable strings so callers and tests can match on them.

use crate::tree::{StatusTree, Task, TaskStatus};

/// Validate the whole tree. Returns stable error messages (empty on success):
/// - at most one active task per sibling group (single focus);
/// - an active task's ancestors are all active;
/// - a done task's descendants are all done or skipped;
/// - sibling names are unique;
/// - ref paths pass the syntax screen.
pub fn check_tree(tree: &StatusTree) -> Vec<String> {
    let mut errors = Vec::new();
    check_group(&tree.roots, None, &mut errors);
    errors
}

fn check_group(tasks: &[Task], parent_status: Option<TaskStatus>, errors: &mut Vec<String>) {
    let active: Vec<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Active)
        .map(|t| t.name.as_str())
        .collect();
    if active.len() > 1 {
        errors.push(format!(
            "Ambiguous Focus: Multiple active siblings found: {active:?}"
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for task in tasks {
        if !seen.insert(task.name.as_str()) {
            errors.push(format!("Duplicate Task Name: '{}'", task.name));
        }

        match parent_status {
            Some(TaskStatus::Done)
                if !matches!(task.status, TaskStatus::Done | TaskStatus::Skipped) =>
            {
                errors.push(format!(
                    "Logic Conflict: Parent is Done but Child '{}' is {:?}.",
                    task.name, task.status
                ));
            }
            Some(TaskStatus::Pending | TaskStatus::Skipped)
                if task.status == TaskStatus::Active =>
            {
                errors.push(format!(
                    "Logic Conflict: Child '{}' is active but Parent is not.",
                    task.name
                ));
            }
            _ => {}
        }

        if let Some(ref_path) = &task.ref_path {
            if let Err(reason) = super::document::check_ref_syntax(ref_path) {
                errors.push(reason);
            }
        }

        check_group(&task.children, Some(task.status), errors);
    }
}
