//! The Loom: surgical anchor-based file editing under a strict safety
//! contract.
//!
//! Every operation goes through the caller's path whitelist and the SafePath
//! jail, takes an advisory lock, captures an mtime fence, stages all edits in
//! memory, and only then writes atomically. A failed match, a fence trip, or
//! an encoding problem leaves the file byte-for-byte untouched.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant, SystemTime};

use regex::RegexBuilder;
use tracing::warn;

use crate::error::{FlowError, Result, SecurityError};
use crate::io::config::LoomConfig;
use crate::io::safe_path;

const BOM_UTF8: &[u8] = b"\xef\xbb\xbf";
const LOCK_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Line-based matching, lenient on trailing whitespace and on space/tab
    /// indentation differences. Untouched bytes are preserved exactly.
    Exact,
    /// Linear-time regex over the raw text, bounded by the watchdog budget.
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOp {
    InsertBefore,
    InsertAfter,
    Replace,
}

#[derive(Debug, Clone)]
pub struct Edit {
    pub op: EditOp,
    pub match_mode: MatchMode,
    pub spec: String,
    pub content: String,
    /// Expected number of matches; the whole call aborts on any mismatch.
    pub count: usize,
}

impl Edit {
    pub fn exact(op: EditOp, spec: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            op,
            match_mode: MatchMode::Exact,
            spec: spec.into(),
            content: content.into(),
            count: 1,
        }
    }
}

#[derive(Debug)]
pub struct Loom {
    root: PathBuf,
    allow: Vec<String>,
    config: LoomConfig,
}

impl Loom {
    pub fn new(root: impl Into<PathBuf>, config: LoomConfig, allow: Vec<String>) -> Self {
        Self {
            root: root.into(),
            allow,
            config,
        }
    }

    /// Insert `content` before or after a unique anchor.
    pub fn insert(
        &self,
        path: &str,
        anchor: &str,
        content: &str,
        position: Position,
    ) -> Result<()> {
        let op = match position {
            Position::Before => EditOp::InsertBefore,
            Position::After => EditOp::InsertAfter,
        };
        self.apply(path, &[Edit::exact(op, anchor, content)])
    }

    /// Replace the region between two unique marker lines, keeping both.
    pub fn replace_block(
        &self,
        path: &str,
        start_marker: &str,
        end_marker: &str,
        content: &str,
    ) -> Result<()> {
        self.with_staged(path, |staged, eol| {
            let lines = line_spans(staged);
            let start = find_unique_line(staged, &lines, start_marker)?;
            let end = find_unique_line(staged, &lines, end_marker)?;
            if start >= end {
                return Err(FlowError::Loom(format!(
                    "start marker '{start_marker}' does not precede end marker '{end_marker}'"
                )));
            }
            let from = lines[start].eol_end;
            let to = lines[end].start;
            let block = render_block(content, eol);
            let mut out = String::with_capacity(staged.len());
            out.push_str(&staged[..from]);
            out.push_str(&block);
            out.push_str(&staged[to..]);
            Ok(out)
        })
    }

    /// Append content at end of file, terminating an unterminated last line.
    pub fn append(&self, path: &str, content: &str) -> Result<()> {
        self.with_staged(path, |staged, eol| {
            let mut out = staged.to_string();
            if !out.is_empty() && !out.ends_with('\n') {
                out.push_str(eol);
            }
            out.push_str(&render_block(content, eol));
            Ok(out)
        })
    }

    /// Apply a batch of edits; all succeed together or no bytes change.
    pub fn apply(&self, path: &str, edits: &[Edit]) -> Result<()> {
        self.apply_with_fence_probe(path, edits, || {})
    }

    /// Test seam: `probe` runs after staging, before the fence re-check.
    pub(crate) fn apply_with_fence_probe(
        &self,
        path: &str,
        edits: &[Edit],
        probe: impl FnOnce(),
    ) -> Result<()> {
        self.edit_file(path, probe, |staged, eol, config| {
            let mut out = staged.to_string();
            for edit in edits {
                out = apply_edit(&out, edit, eol, config)?;
            }
            Ok(out)
        })
    }

    fn with_staged(
        &self,
        path: &str,
        stage: impl FnOnce(&str, &str) -> Result<String>,
    ) -> Result<()> {
        self.edit_file(path, || {}, |staged, eol, _| stage(staged, eol))
    }

    fn edit_file(
        &self,
        path: &str,
        probe: impl FnOnce(),
        stage: impl FnOnce(&str, &str, &LoomConfig) -> Result<String>,
    ) -> Result<()> {
        self.check_whitelist(path)?;
        let resolved = safe_path::resolve(&self.root, path)?;
        if !resolved.exists() {
            return Err(FlowError::Loom(format!("File not found: {}", resolved.display())));
        }
        let size = fs::metadata(&resolved)?.len();
        if size > self.config.max_file_bytes {
            return Err(FlowError::Loom(format!(
                "{} is {size} bytes, over the {} byte editing cap",
                resolved.display(),
                self.config.max_file_bytes
            )));
        }

        let _lock = FileLock::acquire(
            &resolved,
            Duration::from_millis(self.config.lock_deadline_ms),
            Duration::from_millis(self.config.lock_stale_ms),
        )?;
        let fence = fs::metadata(&resolved)?.modified()?;

        let bytes = fs::read(&resolved)?;
        let (has_bom, text) = decode(&resolved, &bytes)?;
        let eol = if text.contains("\r\n") { "\r\n" } else { "\n" };

        let staged = stage(text, eol, &self.config)?;

        probe();
        check_fence(&resolved, fence)?;

        let mut out = Vec::with_capacity(staged.len() + 3);
        if has_bom {
            out.extend_from_slice(BOM_UTF8);
        }
        out.extend_from_slice(staged.as_bytes());
        super::write_atomic(&resolved, &out)?;
        Ok(())
    }

    fn check_whitelist(&self, path: &str) -> Result<()> {
        let normalized = Path::new(path);
        for prefix in &self.allow {
            if prefix == "." {
                return Ok(());
            }
            if normalized.starts_with(prefix) {
                return Ok(());
            }
        }
        Err(FlowError::PermissionDenied(normalized.to_path_buf()))
    }
}

fn check_fence(path: &Path, fence: SystemTime) -> Result<()> {
    let now = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|_| FlowError::ContentChanged(path.to_path_buf()))?;
    if now != fence {
        return Err(FlowError::ContentChanged(path.to_path_buf()));
    }
    Ok(())
}

fn decode<'a>(path: &Path, bytes: &'a [u8]) -> Result<(bool, &'a str)> {
    if bytes.starts_with(&[0xff, 0xfe]) || bytes.starts_with(&[0xfe, 0xff]) {
        return Err(FlowError::Encoding(path.to_path_buf()));
    }
    let (has_bom, rest) = match bytes.strip_prefix(BOM_UTF8) {
        Some(rest) => (true, rest),
        None => (false, bytes),
    };
    let text = std::str::from_utf8(rest).map_err(|_| FlowError::Encoding(path.to_path_buf()))?;
    Ok((has_bom, text))
}

fn apply_edit(staged: &str, edit: &Edit, eol: &str, config: &LoomConfig) -> Result<String> {
    match edit.match_mode {
        MatchMode::Exact => apply_exact(staged, edit, eol),
        MatchMode::Regex => apply_regex(staged, edit, eol, config),
    }
}

/// Byte span of one line: content plus its terminator.
#[derive(Debug, Clone, Copy)]
struct LineSpan {
    start: usize,
    end: usize,
    eol_end: usize,
}

fn line_spans(text: &str) -> Vec<LineSpan> {
    let mut spans = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        let end = match text[start..].find('\n') {
            Some(offset) => start + offset,
            None => {
                spans.push(LineSpan {
                    start,
                    end: bytes.len(),
                    eol_end: bytes.len(),
                });
                break;
            }
        };
        let content_end = if end > start && bytes[end - 1] == b'\r' {
            end - 1
        } else {
            end
        };
        spans.push(LineSpan {
            start,
            end: content_end,
            eol_end: end + 1,
        });
        start = end + 1;
    }
    spans
}

/// Lenient normalization: trailing whitespace dropped, leading tabs widened
/// to four spaces so space/tab indentation differences still match.
fn normalize_line(line: &str) -> String {
    let trimmed = line.trim_end();
    let body = trimmed.trim_start_matches([' ', '\t']);
    let lead = &trimmed[..trimmed.len() - body.len()];
    let mut out = String::new();
    for c in lead.chars() {
        match c {
            '\t' => out.push_str("    "),
            c => out.push(c),
        }
    }
    out.push_str(body);
    out
}

fn apply_exact(staged: &str, edit: &Edit, eol: &str) -> Result<String> {
    let lines = line_spans(staged);
    let spec_lines: Vec<String> = edit
        .spec
        .split('\n')
        .map(|l| normalize_line(l.strip_suffix('\r').unwrap_or(l)))
        .collect();
    if spec_lines.is_empty() {
        return Err(FlowError::Loom("empty anchor".to_string()));
    }

    let normalized: Vec<String> = lines
        .iter()
        .map(|span| normalize_line(&staged[span.start..span.end]))
        .collect();

    let mut matches: Vec<(usize, usize)> = Vec::new();
    let window = spec_lines.len();
    if window <= normalized.len() {
        for i in 0..=normalized.len() - window {
            if normalized[i..i + window] == spec_lines[..] {
                matches.push((i, i + window - 1));
            }
        }
    }
    check_count(&edit.spec, matches.len(), edit.count)?;

    let mut out = staged.to_string();
    for (first, last) in matches.into_iter().rev() {
        out = splice_lines(&out, &lines, first, last, edit, eol);
    }
    Ok(out)
}

fn splice_lines(
    text: &str,
    lines: &[LineSpan],
    first: usize,
    last: usize,
    edit: &Edit,
    eol: &str,
) -> String {
    let block = render_block(&edit.content, eol);
    let mut out = String::with_capacity(text.len() + block.len());
    match edit.op {
        EditOp::InsertBefore => {
            let at = lines[first].start;
            out.push_str(&text[..at]);
            out.push_str(&block);
            out.push_str(&text[at..]);
        }
        EditOp::InsertAfter => {
            let span = lines[last];
            if span.eol_end == span.end && span.eol_end == text.len() {
                // Unterminated final line: terminate it, then keep the file's
                // no-trailing-newline shape.
                out.push_str(text);
                out.push_str(eol);
                out.push_str(block.trim_end_matches(eol));
            } else {
                let at = span.eol_end;
                out.push_str(&text[..at]);
                out.push_str(&block);
                out.push_str(&text[at..]);
            }
        }
        EditOp::Replace => {
            let from = lines[first].start;
            let to = lines[last].eol_end;
            let terminated = lines[last].eol_end != lines[last].end;
            out.push_str(&text[..from]);
            if terminated {
                out.push_str(&block);
            } else {
                out.push_str(block.trim_end_matches(eol));
            }
            out.push_str(&text[to..]);
        }
    }
    out
}

fn apply_regex(staged: &str, edit: &Edit, eol: &str, config: &LoomConfig) -> Result<String> {
    let spans = regex_spans(&edit.spec, staged, config)?;
    check_count(&edit.spec, spans.len(), edit.count)?;

    let mut out = staged.to_string();
    for (start, end) in spans.into_iter().rev() {
        let mut next = String::with_capacity(out.len() + edit.content.len() + 2);
        match edit.op {
            EditOp::InsertBefore => {
                next.push_str(&out[..start]);
                next.push_str(&edit.content);
                next.push_str(eol);
                next.push_str(&out[start..]);
            }
            EditOp::InsertAfter => {
                next.push_str(&out[..end]);
                next.push_str(eol);
                next.push_str(&edit.content);
                next.push_str(&out[end..]);
            }
            EditOp::Replace => {
                next.push_str(&out[..start]);
                next.push_str(&edit.content);
                next.push_str(&out[end..]);
            }
        }
        out = next;
    }
    Ok(out)
}

/// Find all match spans under the watchdog budget.
///
/// The engine is linear-time by construction; the watchdog is a second fence
/// against pathological input sizes and patterns.
fn regex_spans(
    pattern: &str,
    text: &str,
    config: &LoomConfig,
) -> Result<Vec<(usize, usize)>> {
    let regex = RegexBuilder::new(pattern)
        .size_limit(1 << 20)
        .build()
        .map_err(|err| SecurityError::RegexRejected(err.to_string()))?;

    let owned = text.to_string();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let spans: Vec<(usize, usize)> = regex
            .find_iter(&owned)
            .map(|m| (m.start(), m.end()))
            .collect();
        let _ = tx.send(spans);
    });
    rx.recv_timeout(Duration::from_millis(config.regex_timeout_ms))
        .map_err(|_| SecurityError::RegexTimeout(config.regex_timeout_ms).into())
}

fn check_count(spec: &str, actual: usize, expected: usize) -> Result<()> {
    if actual == expected {
        return Ok(());
    }
    if actual == 0 {
        return Err(FlowError::Loom(format!("Anchor not found: '{spec}'")));
    }
    if expected == 1 {
        return Err(FlowError::Loom(format!(
            "Ambiguous anchor: '{spec}' found {actual} times."
        )));
    }
    Err(FlowError::Loom(format!(
        "Match count mismatch for '{spec}': expected {expected}, found {actual}."
    )))
}

/// Render content as full lines in the file's EOL style.
fn render_block(content: &str, eol: &str) -> String {
    let mut out = String::with_capacity(content.len() + 2);
    for line in content.split('\n') {
        out.push_str(line.strip_suffix('\r').unwrap_or(line));
        out.push_str(eol);
    }
    if content.ends_with('\n') {
        // split produced a trailing empty line; drop the doubled terminator.
        out.truncate(out.len() - eol.len());
    }
    out
}

fn find_unique_line(text: &str, lines: &[LineSpan], marker: &str) -> Result<usize> {
    let wanted = normalize_line(marker);
    let mut found = None;
    for (index, span) in lines.iter().enumerate() {
        if normalize_line(&text[span.start..span.end]) == wanted {
            if found.is_some() {
                return Err(FlowError::Loom(format!(
                    "Ambiguous anchor: '{marker}' found 2+ times."
                )));
            }
            found = Some(index);
        }
    }
    found.ok_or_else(|| FlowError::Loom(format!("Anchor not found: '{marker}'")))
}

/// Advisory `<path>.lock` with bounded acquisition and stale takeover.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(target: &Path, deadline: Duration, stale: Duration) -> Result<Self> {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = target.with_file_name(format!("{name}.lock"));
        let started = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(
                        file,
                        "{{\"pid\":{},\"acquired_at\":\"{}\"}}",
                        std::process::id(),
                        chrono::Utc::now().to_rfc3339()
                    );
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path, stale) {
                        warn!(lock = %path.display(), "forcibly replacing stale lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= deadline {
                        return Err(FlowError::ResourceBusy(format!(
                            "could not lock {} within {deadline:?}",
                            target.display()
                        )));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn lock_is_stale(path: &Path, stale: Duration) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > stale)
        .unwrap_or(false)
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loom(temp: &tempfile::TempDir) -> Loom {
        Loom::new(temp.path(), LoomConfig::default(), vec![".".to_string()])
    }

    fn write(temp: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = temp.path().join(name);
        fs::write(&path, contents).expect("write fixture");
        path
    }

    #[test]
    fn surgical_insert_after_anchor() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(&temp, "file.txt", b"alpha\nanchor\nomega\n");
        loom(&temp)
            .insert("file.txt", "anchor", "inserted", Position::After)
            .expect("insert");
        assert_eq!(fs::read(&path).expect("read"), b"alpha\nanchor\ninserted\nomega\n");
    }

    #[test]
    fn surgical_insert_before_anchor() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(&temp, "file.txt", b"alpha\nanchor\n");
        loom(&temp)
            .insert("file.txt", "anchor", "inserted", Position::Before)
            .expect("insert");
        assert_eq!(fs::read(&path).expect("read"), b"alpha\ninserted\nanchor\n");
    }

    #[test]
    fn ambiguous_anchor_aborts_without_writing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let before = b"anchor\nmiddle\nanchor\n";
        let path = write(&temp, "file.txt", before);
        let err = loom(&temp)
            .insert("file.txt", "anchor", "x", Position::After)
            .expect_err("should fail");
        assert!(err.to_string().contains("Ambiguous anchor"), "{err}");
        assert_eq!(fs::read(&path).expect("read"), before);
    }

    #[test]
    fn missing_anchor_aborts_without_writing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let before = b"alpha\n";
        let path = write(&temp, "file.txt", before);
        let err = loom(&temp)
            .insert("file.txt", "ghost", "x", Position::After)
            .expect_err("should fail");
        assert!(err.to_string().contains("Anchor not found"), "{err}");
        assert_eq!(fs::read(&path).expect("read"), before);
    }

    #[test]
    fn whitespace_lenient_matching_preserves_file_bytes() {
        let temp = tempfile::tempdir().expect("tempdir");
        // File indents with a tab; the anchor uses spaces.
        let path = write(&temp, "file.txt", b"fn main() {\n\tlet x = 1;\n}\n");
        loom(&temp)
            .insert("file.txt", "    let x = 1;", "\tlet y = 2;", Position::After)
            .expect("insert");
        assert_eq!(
            fs::read(&path).expect("read"),
            b"fn main() {\n\tlet x = 1;\n\tlet y = 2;\n}\n"
        );
    }

    #[test]
    fn crlf_style_is_preserved_for_inserted_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(&temp, "file.txt", b"alpha\r\nanchor\r\n");
        loom(&temp)
            .insert("file.txt", "anchor", "inserted", Position::After)
            .expect("insert");
        assert_eq!(fs::read(&path).expect("read"), b"alpha\r\nanchor\r\ninserted\r\n");
    }

    #[test]
    fn bom_is_preserved() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(&temp, "file.txt", b"\xef\xbb\xbfanchor\n");
        loom(&temp)
            .insert("file.txt", "anchor", "next", Position::After)
            .expect("insert");
        assert_eq!(fs::read(&path).expect("read"), b"\xef\xbb\xbfanchor\nnext\n");
    }

    #[test]
    fn non_utf8_file_is_an_encoding_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(&temp, "file.txt", b"caf\xe9 latin1\n");
        let err = loom(&temp)
            .insert("file.txt", "caf", "x", Position::After)
            .expect_err("should fail");
        assert!(matches!(err, FlowError::Encoding(_)), "{err}");
    }

    #[test]
    fn utf16_bom_is_an_encoding_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(&temp, "file.txt", b"\xff\xfea\x00n\x00");
        let err = loom(&temp)
            .insert("file.txt", "an", "x", Position::After)
            .expect_err("should fail");
        assert!(matches!(err, FlowError::Encoding(_)), "{err}");
    }

    #[test]
    fn path_outside_whitelist_is_denied() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(&temp, "secret.txt", b"data\n");
        let restricted = Loom::new(
            temp.path(),
            LoomConfig::default(),
            vec!["src".to_string()],
        );
        let err = restricted
            .insert("secret.txt", "data", "x", Position::After)
            .expect_err("should fail");
        assert!(matches!(err, FlowError::PermissionDenied(_)), "{err}");
    }

    #[test]
    fn jailbroken_path_is_a_security_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = loom(&temp)
            .insert("../outside.txt", "a", "x", Position::After)
            .expect_err("should fail");
        assert!(matches!(err, FlowError::Security(_)), "{err}");
    }

    #[test]
    fn oversized_file_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(&temp, "big.txt", b"0123456789\n");
        let tight = Loom::new(
            temp.path(),
            LoomConfig {
                max_file_bytes: 4,
                ..LoomConfig::default()
            },
            vec![".".to_string()],
        );
        let err = tight
            .insert("big.txt", "0123", "x", Position::After)
            .expect_err("should fail");
        assert!(err.to_string().contains("editing cap"), "{err}");
    }

    #[test]
    fn optimistic_fence_trips_when_file_changes_mid_edit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(&temp, "file.txt", b"anchor\n");
        let interloper = b"anchor\ntouched by someone else\n";

        let err = loom(&temp)
            .apply_with_fence_probe(
                "file.txt",
                &[Edit::exact(EditOp::InsertAfter, "anchor", "mine")],
                || {
                    std::thread::sleep(Duration::from_millis(20));
                    fs::write(&path, interloper).expect("interloper write");
                },
            )
            .expect_err("fence should trip");

        assert!(matches!(err, FlowError::ContentChanged(_)), "{err}");
        assert_eq!(fs::read(&path).expect("read"), interloper);
    }

    #[test]
    fn replace_block_keeps_markers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            &temp,
            "file.txt",
            b"head\n// BEGIN\nold body\n// END\ntail\n",
        );
        loom(&temp)
            .replace_block("file.txt", "// BEGIN", "// END", "new body\nsecond line")
            .expect("replace");
        assert_eq!(
            fs::read(&path).expect("read"),
            b"head\n// BEGIN\nnew body\nsecond line\n// END\ntail\n"
        );
    }

    #[test]
    fn replace_block_requires_ordered_markers() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(&temp, "file.txt", b"// END\nbody\n// BEGIN\n");
        let err = loom(&temp)
            .replace_block("file.txt", "// BEGIN", "// END", "x")
            .expect_err("should fail");
        assert!(err.to_string().contains("does not precede"), "{err}");
    }

    #[test]
    fn append_terminates_last_line_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(&temp, "file.txt", b"no newline");
        loom(&temp).append("file.txt", "added").expect("append");
        assert_eq!(fs::read(&path).expect("read"), b"no newline\nadded\n");
    }

    #[test]
    fn multi_edit_apply_is_all_or_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let before = b"one\ntwo\nthree\n";
        let path = write(&temp, "file.txt", before);
        let err = loom(&temp)
            .apply(
                "file.txt",
                &[
                    Edit::exact(EditOp::Replace, "two", "TWO"),
                    Edit::exact(EditOp::Replace, "missing", "nope"),
                ],
            )
            .expect_err("second edit should abort the batch");
        assert!(err.to_string().contains("Anchor not found"), "{err}");
        assert_eq!(fs::read(&path).expect("read"), before);
    }

    #[test]
    fn regex_replace_with_expected_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(&temp, "file.txt", b"v1.2 and v3.4\n");
        loom(&temp)
            .apply(
                "file.txt",
                &[Edit {
                    op: EditOp::Replace,
                    match_mode: MatchMode::Regex,
                    spec: r"v\d+\.\d+".to_string(),
                    content: "vNEXT".to_string(),
                    count: 2,
                }],
            )
            .expect("apply");
        assert_eq!(fs::read(&path).expect("read"), b"vNEXT and vNEXT\n");
    }

    #[test]
    fn regex_count_mismatch_aborts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let before = b"v1.2 and v3.4\n";
        let path = write(&temp, "file.txt", before);
        let err = loom(&temp)
            .apply(
                "file.txt",
                &[Edit {
                    op: EditOp::Replace,
                    match_mode: MatchMode::Regex,
                    spec: r"v\d+\.\d+".to_string(),
                    content: "vNEXT".to_string(),
                    count: 1,
                }],
            )
            .expect_err("should fail");
        assert!(err.to_string().contains("found 2"), "{err}");
        assert_eq!(fs::read(&path).expect("read"), before);
    }

    #[test]
    fn invalid_regex_is_a_security_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(&temp, "file.txt", b"text\n");
        let err = loom(&temp)
            .apply(
                "file.txt",
                &[Edit {
                    op: EditOp::Replace,
                    match_mode: MatchMode::Regex,
                    spec: "(unclosed".to_string(),
                    content: "x".to_string(),
                    count: 1,
                }],
            )
            .expect_err("should fail");
        assert!(matches!(err, FlowError::Security(SecurityError::RegexRejected(_))), "{err}");
    }

    #[test]
    fn stale_lock_is_replaced() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(&temp, "file.txt", b"anchor\n");
        let lock_path = path.with_file_name("file.txt.lock");
        fs::write(&lock_path, "{\"pid\":0}").expect("plant lock");

        let config = LoomConfig {
            lock_deadline_ms: 200,
            lock_stale_ms: 0,
            ..LoomConfig::default()
        };
        let fresh = Loom::new(temp.path(), config, vec![".".to_string()]);
        // Zero staleness window: the planted lock is immediately stale.
        std::thread::sleep(Duration::from_millis(5));
        fresh
            .insert("file.txt", "anchor", "after", Position::After)
            .expect("insert");
        assert!(!lock_path.exists());
    }

    #[test]
    fn live_lock_times_out_as_resource_busy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(&temp, "file.txt", b"anchor\n");
        let lock_path = path.with_file_name("file.txt.lock");
        fs::write(&lock_path, "{\"pid\":0}").expect("plant lock");

        let config = LoomConfig {
            lock_deadline_ms: 100,
            lock_stale_ms: 60_000,
            ..LoomConfig::default()
        };
        let blocked = Loom::new(temp.path(), config, vec![".".to_string()]);
        let err = blocked
            .insert("file.txt", "anchor", "after", Position::After)
            .expect_err("should time out");
        assert!(matches!(err, FlowError::ResourceBusy(_)), "{err}");
        fs::remove_file(&lock_path).expect("cleanup");
    }

    #[test]
    fn lock_is_released_after_edit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(&temp, "file.txt", b"anchor\n");
        loom(&temp)
            .insert("file.txt", "anchor", "x", Position::After)
            .expect("insert");
        assert!(!path.with_file_name("file.txt.lock").exists());
    }
}

