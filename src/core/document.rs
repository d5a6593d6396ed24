//! Strict parser and serializer for the `status.md` checklist format.
//!
//! The grammar is deliberately rigid: 4-space indentation, `- [m]` markers,
//! optional ` @ ref` tails, and a `Key: Value` header region. Anything the
//! parser accepts, the serializer reproduces canonically; task names are
//! treated as opaque bytes and are never trimmed or re-wrapped.

use crate::error::{FlowError, Result};
use crate::tree::{StatusTree, Task, TaskStatus};

/// Default nesting cap. Depth is tracked iteratively, so this bounds the
/// recursion performed by later tree walks as well.
pub const DEFAULT_MAX_DEPTH: usize = 64;

const BOM: &str = "\u{feff}";

/// Parse status document bytes with the default depth cap.
pub fn parse(bytes: &[u8]) -> Result<StatusTree> {
    parse_with_depth(bytes, DEFAULT_MAX_DEPTH)
}

/// Parse status document bytes.
///
/// UTF-8 is decoded strictly; a leading BOM is recorded on the tree and
/// re-emitted on save. CRLF input is accepted and normalized to LF on save.
/// HTML comment lines are discarded. The resulting tree is validated against
/// the cross-node invariants and reindexed.
pub fn parse_with_depth(bytes: &[u8], max_depth: usize) -> Result<StatusTree> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| FlowError::Validation("status document is not valid UTF-8".to_string()))?;

    let mut tree = StatusTree::new();
    let text = match text.strip_prefix(BOM) {
        Some(rest) => {
            tree.has_bom = true;
            rest
        }
        None => text,
    };

    // Stack of sibling-index paths for the current ancestor chain; depth is
    // carried here instead of on the host stack.
    let mut path: Vec<usize> = Vec::new();
    let mut levels: Vec<usize> = Vec::new();
    let mut parsing_headers = true;

    for (idx, raw_line) in text.split('\n').enumerate() {
        let line_no = idx + 1;
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);

        if line.trim().is_empty() {
            parsing_headers = false;
            continue;
        }
        if is_comment_line(line) {
            continue;
        }

        if parsing_headers {
            if !looks_like_task(line) {
                match split_header(line) {
                    Some((key, value)) => {
                        tree.set_header(key, value);
                        continue;
                    }
                    None => {
                        return Err(FlowError::Validation(format!(
                            "Line {line_no}: Invalid format."
                        )));
                    }
                }
            }
            parsing_headers = false;
        }

        let parsed = parse_task_line(line, line_no, max_depth)?;
        attach(&mut tree, &mut path, &mut levels, parsed, line_no)?;
    }

    let errors = super::invariants::check_tree(&tree);
    if !errors.is_empty() {
        return Err(FlowError::Validation(errors.join("; ")));
    }

    tree.reindex();
    Ok(tree)
}

/// Serialize a tree to canonical bytes: LF endings, 4-space indentation,
/// canonical markers, headers first. Fails if the tree violates the
/// cross-node invariants or a name would break the line grammar.
pub fn serialize(tree: &StatusTree) -> Result<Vec<u8>> {
    let errors = super::invariants::check_tree(tree);
    if !errors.is_empty() {
        return Err(FlowError::Validation(errors.join("; ")));
    }

    let mut out = String::new();
    if tree.has_bom {
        out.push_str(BOM);
    }
    for (key, value) in &tree.headers {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    if !tree.headers.is_empty() {
        out.push('\n');
    }
    write_tasks(&tree.roots, 0, &mut out)?;
    Ok(out.into_bytes())
}

fn write_tasks(tasks: &[Task], depth: usize, out: &mut String) -> Result<()> {
    for task in tasks {
        if task.name.is_empty() {
            return Err(FlowError::Validation("task name must not be empty".to_string()));
        }
        if task.name.contains('\n') || task.name.contains('\r') {
            return Err(FlowError::Validation(format!(
                "task name contains a line break: '{}'",
                task.name.escape_debug()
            )));
        }
        for _ in 0..depth {
            out.push_str("    ");
        }
        out.push_str("- [");
        out.push(task.status.marker());
        out.push_str("] ");
        out.push_str(&task.name);
        if let Some(ref_path) = &task.ref_path {
            out.push_str(" @ ");
            if ref_path.chars().any(char::is_whitespace) {
                out.push('"');
                out.push_str(ref_path);
                out.push('"');
            } else {
                out.push_str(ref_path);
            }
        }
        out.push('\n');
        write_tasks(&task.children, depth + 1, out)?;
    }
    Ok(())
}

struct ParsedTask {
    level: usize,
    task: Task,
}

fn looks_like_task(line: &str) -> bool {
    line.trim_start().starts_with('-')
}

fn is_comment_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with("<!--") && trimmed.ends_with("-->")
}

fn split_header(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

fn parse_task_line(line: &str, line_no: usize, max_depth: usize) -> Result<ParsedTask> {
    let indent_len = line.len() - line.trim_start_matches([' ', '\t']).len();
    let (indent, body) = line.split_at(indent_len);

    if indent.contains('\t') {
        return Err(FlowError::Validation(format!(
            "Line {line_no}: Tabs are forbidden in indentation."
        )));
    }
    if indent.len() % 4 != 0 {
        return Err(FlowError::Validation(format!(
            "Line {line_no}: Invalid indentation. Must be a multiple of 4."
        )));
    }
    let level = indent.len() / 4;
    if level >= max_depth {
        return Err(FlowError::Validation(format!(
            "Line {line_no}: Nesting depth exceeds the cap of {max_depth}."
        )));
    }

    let Some(marker_body) = body.strip_prefix("- [") else {
        if body.starts_with('-') {
            return Err(FlowError::Validation(format!(
                "Line {line_no}: Missing status marker or invalid format."
            )));
        }
        return Err(FlowError::Validation(format!("Line {line_no}: Invalid format.")));
    };

    let mut chars = marker_body.chars();
    let marker = chars.next().ok_or_else(|| {
        FlowError::Validation(format!("Line {line_no}: Missing status marker or invalid format."))
    })?;
    let rest = chars.as_str();
    let Some(rest) = rest.strip_prefix("] ") else {
        return Err(FlowError::Validation(format!(
            "Line {line_no}: Missing status marker or invalid format."
        )));
    };

    let status = TaskStatus::from_marker(marker).ok_or_else(|| {
        FlowError::Validation(format!("Line {line_no}: Unknown marker '[{marker}]'"))
    })?;

    let (name, ref_path) = split_ref(rest);
    if name.is_empty() {
        return Err(FlowError::Validation(format!("Line {line_no}: Missing task name.")));
    }
    if let Some(ref_path) = &ref_path {
        check_ref_syntax(ref_path)
            .map_err(|reason| FlowError::Validation(format!("Line {line_no}: {reason}")))?;
    }

    let mut task = Task::new(name, status);
    task.ref_path = ref_path;
    Ok(ParsedTask { level, task })
}

/// Split an optional ` @ ref` tail off the task text.
///
/// Only well-formed tails split: a double-quoted path, or a bare token with
/// no whitespace. Everything else stays in the name, untouched.
fn split_ref(rest: &str) -> (String, Option<String>) {
    if let Some(pos) = rest.rfind(" @ ") {
        let name = &rest[..pos];
        let tail = &rest[pos + 3..];
        if let Some(inner) = tail.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
            if !inner.is_empty() && !name.is_empty() {
                return (name.to_string(), Some(inner.to_string()));
            }
        } else if !tail.is_empty()
            && !name.is_empty()
            && !tail.chars().any(char::is_whitespace)
        {
            return (name.to_string(), Some(tail.to_string()));
        }
    }
    (rest.to_string(), None)
}

/// Pure syntax screen for fractal ref paths.
///
/// `SafePath` re-applies these rules before any filesystem access; the parser
/// runs them early so a hostile document fails before any I/O is attempted.
pub fn check_ref_syntax(ref_path: &str) -> std::result::Result<(), String> {
    if ref_path.contains('\0') {
        return Err(format!("Null byte in path '{}'", ref_path.escape_debug()));
    }
    if ref_path.contains("..") {
        return Err(format!("Jailbreak attempt detected in path '{ref_path}'"));
    }
    if ref_path.starts_with("\\\\") || ref_path.starts_with("//") {
        return Err(format!("UNC path forbidden: '{ref_path}'"));
    }
    if ref_path.starts_with('/') || ref_path.starts_with('\\') {
        return Err(format!("Absolute path forbidden: '{ref_path}'"));
    }
    let lower = ref_path.to_ascii_lowercase();
    for protocol in ["http:", "https:", "ftp:", "javascript:", "file:", "data:"] {
        if lower.starts_with(protocol) {
            return Err(format!("Invalid Protocol in path '{ref_path}'"));
        }
    }
    for part in ref_path.split(['/', '\\']) {
        let stem = part.split('.').next().unwrap_or(part);
        if is_reserved_device_name(stem) {
            return Err(format!("Reserved device name forbidden: '{part}'"));
        }
    }
    Ok(())
}

pub(crate) fn is_reserved_device_name(stem: &str) -> bool {
    let upper = stem.to_ascii_uppercase();
    matches!(upper.as_str(), "CON" | "PRN" | "AUX" | "NUL")
        || (upper.len() == 4
            && (upper.starts_with("COM") || upper.starts_with("LPT"))
            && upper.as_bytes()[3].is_ascii_digit()
            && upper.as_bytes()[3] != b'0')
}

fn attach(
    tree: &mut StatusTree,
    path: &mut Vec<usize>,
    levels: &mut Vec<usize>,
    parsed: ParsedTask,
    line_no: usize,
) -> Result<()> {
    let ParsedTask { level, task } = parsed;

    if level == 0 {
        tree.roots.push(task);
        path.clear();
        levels.clear();
        path.push(tree.roots.len() - 1);
        levels.push(0);
        return Ok(());
    }

    while levels.last().is_some_and(|top| *top >= level) {
        levels.pop();
        path.pop();
    }
    if path.is_empty() {
        return Err(FlowError::Validation(format!(
            "Line {line_no}: Orphaned task (indent {level})."
        )));
    }
    if levels.last() != Some(&(level - 1)) {
        return Err(FlowError::Validation(format!(
            "Line {line_no}: Invalid indentation jump."
        )));
    }

    let parent = task_at_path_mut(&mut tree.roots, path);
    if parent.status == TaskStatus::Done && task.status == TaskStatus::Pending {
        return Err(FlowError::Validation(format!(
            "Line {line_no}: Logic Conflict - Parent Done, Child Pending."
        )));
    }
    parent.children.push(task);
    path.push(parent.children.len() - 1);
    levels.push(level);
    Ok(())
}

fn task_at_path_mut<'a>(roots: &'a mut Vec<Task>, path: &[usize]) -> &'a mut Task {
    let (first, rest) = path.split_first().expect("non-empty path");
    let mut task = &mut roots[*first];
    for index in rest {
        task = &mut task.children[*index];
    }
    task
}
