//! Per-task workflow state: atomic persistence, crash recovery, GC.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::Result;

/// Workflow-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Per-step status: `READY → IN_PROGRESS → {COMPLETED | WAITING | ERROR |
/// INTERRUPTED | FATAL}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Ready,
    InProgress,
    Completed,
    Waiting,
    Error,
    Interrupted,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SHA-256 of the serialized exports, for auditing without the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_digest: Option<String>,
}

impl StepRecord {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Ready,
            attempts: 0,
            started_at: None,
            completed_at: None,
            error: None,
            export_digest: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub task_id: String,
    pub status: RunStatus,
    pub current_step_index: usize,
    pub steps_history: BTreeMap<String, StepRecord>,
    pub context_cache: Map<String, Value>,
    /// Set on sub-workflow states (`<parent>#<step>`), pointing at the parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<String>,
}

impl WorkflowState {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: RunStatus::Pending,
            current_step_index: 0,
            steps_history: BTreeMap::new(),
            context_cache: Map::new(),
            parent_ref: None,
        }
    }

    pub fn step_mut(&mut self, step_id: &str) -> &mut StepRecord {
        self.steps_history
            .entry(step_id.to_string())
            .or_insert_with(|| StepRecord::new(step_id))
    }
}

#[derive(Debug)]
pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", sanitize(task_id)))
    }

    /// Load state, treating corrupt or truncated files as absent.
    pub fn load(&self, task_id: &str) -> Result<Option<WorkflowState>> {
        let path = self.path_for(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        match serde_json::from_str(&contents) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    %err,
                    "corrupt state file; starting fresh"
                );
                Ok(None)
            }
        }
    }

    /// Two-phase save. If the main write fails (e.g. disk full) a compact
    /// crash dump goes to stderr and `<id>.crash.json`; the previous state
    /// file is never unlinked.
    pub fn save(&self, state: &WorkflowState) -> Result<()> {
        let path = self.path_for(&state.task_id);
        let mut buf = serde_json::to_string_pretty(state)?;
        buf.push('\n');
        match super::write_atomic(&path, buf.as_bytes()) {
            Ok(()) => {
                debug!(task_id = %state.task_id, status = ?state.status, "state persisted");
                Ok(())
            }
            Err(err) => {
                self.panic_save(state);
                Err(err)
            }
        }
    }

    fn panic_save(&self, state: &WorkflowState) {
        let dump = serde_json::to_string(state).unwrap_or_else(|_| {
            format!(
                "{{\"task_id\":\"{}\",\"status\":\"UNSERIALIZABLE\"}}",
                state.task_id
            )
        });
        eprintln!("flowrun: state save failed; crash dump: {dump}");
        let crash_path = self
            .state_dir
            .join(format!("{}.crash.json", sanitize(&state.task_id)));
        if let Err(err) = fs::write(&crash_path, &dump) {
            eprintln!("flowrun: crash dump write also failed: {err}");
        }
    }

    /// Delete the state chain for a task: `<id>.json` plus every nested
    /// `<id>#<sub>.json`.
    pub fn gc(&self, task_id: &str) -> Result<()> {
        if !self.state_dir.exists() {
            return Ok(());
        }
        let base = sanitize(task_id);
        let nested_prefix = format!("{base}#");
        for entry in fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if stem == base || stem.starts_with(&nested_prefix) {
                debug!(file = %name, "garbage-collecting state");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Keep task ids filesystem-safe; virtual ids are dotted digits plus `#`.
fn sanitize(task_id: &str) -> String {
    task_id.replace(['/', '\\'], "_")
}

pub fn export_digest(exports: &Map<String, Value>) -> String {
    let bytes = serde_json::to_vec(exports).unwrap_or_default();
    super::integrity::sha256_hex(&bytes)
}
