//! Append-only JSONL event sink with rotation and blob spillover.
//!
//! Events are product artifacts (unlike `tracing` diagnostics): every append
//! is flushed and fsync'd, oversized payloads spill to `artifacts/`, and the
//! log rotates with numeric suffixes once it crosses the size threshold.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub ts: String,
    pub task_id: String,
    pub step_id: String,
    pub kind: String,
    pub payload: Value,
    /// Blobs referenced by preserved events survive garbage collection.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub preserve: bool,
}

/// An event as emitted by an atom, before the engine stamps identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    pub kind: String,
    pub payload: Value,
    #[serde(default)]
    pub preserve: bool,
}

impl EventDraft {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            preserve: false,
        }
    }
}

#[derive(Debug)]
pub struct EventLog {
    logs_dir: PathBuf,
    artifacts_dir: PathBuf,
    rotate_bytes: u64,
    inline_cap: usize,
    writer: Mutex<()>,
}

impl EventLog {
    pub fn new(
        logs_dir: impl Into<PathBuf>,
        artifacts_dir: impl Into<PathBuf>,
        rotate_bytes: u64,
        inline_cap: usize,
    ) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            artifacts_dir: artifacts_dir.into(),
            rotate_bytes,
            inline_cap,
            writer: Mutex::new(()),
        }
    }

    /// Append one event, spilling oversized payloads to a blob file.
    pub fn emit(
        &self,
        task_id: &str,
        step_id: &str,
        draft: EventDraft,
    ) -> Result<Event> {
        let payload = self.stage_payload(draft.payload);
        let event = Event {
            id: Uuid::new_v4().to_string(),
            ts: chrono::Utc::now().to_rfc3339(),
            task_id: task_id.to_string(),
            step_id: step_id.to_string(),
            kind: draft.kind,
            payload,
            preserve: draft.preserve,
        };

        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                // Never let a logging failure take the engine down.
                let fallback = json!({
                    "id": event.id,
                    "ts": event.ts,
                    "task_id": event.task_id,
                    "step_id": event.step_id,
                    "kind": event.kind,
                    "payload": {"truncated": true, "reason": err.to_string()},
                });
                fallback.to_string()
            }
        };

        let _guard = self.writer.lock().expect("event log mutex");
        fs::create_dir_all(&self.logs_dir)?;
        self.rotate_if_needed()?;
        let path = self.logs_dir.join(EVENTS_FILE);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_all()?;
        Ok(event)
    }

    /// Inline small payloads; larger ones become `{"ref": "blob_<uuid>.json"}`.
    fn stage_payload(&self, payload: Value) -> Value {
        let serialized = match serde_json::to_string(&payload) {
            Ok(s) => s,
            Err(err) => {
                return json!({"truncated": true, "reason": err.to_string()});
            }
        };
        if serialized.len() <= self.inline_cap {
            return payload;
        }

        let blob_name = format!("blob_{}.json", Uuid::new_v4());
        let blob_path = self.artifacts_dir.join(&blob_name);
        let write = fs::create_dir_all(&self.artifacts_dir)
            .and_then(|()| fs::write(&blob_path, serialized.as_bytes()));
        match write {
            Ok(()) => json!({"ref": blob_name}),
            Err(err) => {
                warn!(%err, "blob write failed; event carries an error payload");
                json!({
                    "error": "blob write failed",
                    "original_size": serialized.len(),
                    "details": err.to_string(),
                })
            }
        }
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let path = self.logs_dir.join(EVENTS_FILE);
        let Ok(meta) = fs::metadata(&path) else {
            return Ok(());
        };
        if meta.len() <= self.rotate_bytes {
            return Ok(());
        }
        let mut suffix = 1;
        loop {
            let rotated = self.logs_dir.join(format!("{EVENTS_FILE}.{suffix}"));
            if !rotated.exists() {
                fs::rename(&path, &rotated)?;
                return Ok(());
            }
            suffix += 1;
        }
    }

    /// Delete blobs referenced by a finished task's events unless the event
    /// was emitted with `preserve`.
    pub fn gc_blobs(&self, task_id: &str) -> Result<usize> {
        let mut removed = 0;
        for event in self.read_events()? {
            if event.task_id != task_id && !event.task_id.starts_with(&format!("{task_id}#")) {
                continue;
            }
            if event.preserve {
                continue;
            }
            let Some(blob) = event.payload.get("ref").and_then(Value::as_str) else {
                continue;
            };
            let blob_path = self.artifacts_dir.join(blob);
            if blob_path.exists() {
                fs::remove_file(blob_path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// All events across the live file and rotated segments, oldest first.
    pub fn read_events(&self) -> Result<Vec<Event>> {
        let mut files: Vec<PathBuf> = Vec::new();
        if self.logs_dir.exists() {
            for entry in fs::read_dir(&self.logs_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(EVENTS_FILE) {
                    files.push(entry.path());
                }
            }
        }
        files.sort_by_key(|p| rotation_rank(p));

        let mut events = Vec::new();
        for file in files {
            for line in fs::read_to_string(&file)?.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(line) {
                    Ok(event) => events.push(event),
                    Err(err) => warn!(%err, "skipping unreadable event line"),
                }
            }
        }
        Ok(events)
    }
}

/// Rotated segments come before the live file, lowest suffix (oldest) first.
fn rotation_rank(path: &Path) -> u64 {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    name.strip_prefix(EVENTS_FILE)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(temp: &tempfile::TempDir) -> EventLog {
        EventLog::new(
            temp.path().join("logs"),
            temp.path().join("artifacts"),
            10 * 1024 * 1024,
            8192,
        )
    }

    #[test]
    fn small_payload_is_embedded_inline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let events = log(&temp);
        let event = events
            .emit("1", "step-1", EventDraft::new("step.started", json!({"n": 1})))
            .expect("emit");
        assert_eq!(event.payload, json!({"n": 1}));

        let contents =
            fs::read_to_string(temp.path().join("logs").join(EVENTS_FILE)).expect("read");
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("step.started"));
    }

    #[test]
    fn oversized_payload_spills_to_blob() {
        let temp = tempfile::tempdir().expect("tempdir");
        let events = log(&temp);
        let big = "x".repeat(9000);
        let event = events
            .emit("1", "step-1", EventDraft::new("step.output", json!({"data": big})))
            .expect("emit");

        let blob = event.payload["ref"].as_str().expect("blob ref");
        assert!(blob.starts_with("blob_") && blob.ends_with(".json"), "{blob}");
        let blob_path = temp.path().join("artifacts").join(blob);
        assert!(blob_path.exists());
        let stored: Value =
            serde_json::from_str(&fs::read_to_string(blob_path).expect("read")).expect("json");
        assert_eq!(stored["data"].as_str().expect("data").len(), 9000);
    }

    #[test]
    fn payload_at_cap_stays_inline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let events = EventLog::new(
            temp.path().join("logs"),
            temp.path().join("artifacts"),
            1024,
            100,
        );
        // {"data":"xx...x"} serializes to exactly 100 bytes with 89 x's.
        let payload = json!({"data": "x".repeat(89)});
        let event = events
            .emit("1", "s", EventDraft::new("k", payload.clone()))
            .expect("emit");
        assert_eq!(event.payload, payload);
    }

    #[test]
    fn log_rotates_past_threshold() {
        let temp = tempfile::tempdir().expect("tempdir");
        let events = EventLog::new(
            temp.path().join("logs"),
            temp.path().join("artifacts"),
            512,
            8192,
        );
        for i in 0..20 {
            events
                .emit("1", "s", EventDraft::new("tick", json!({"i": i, "pad": "y".repeat(64)})))
                .expect("emit");
        }
        assert!(temp.path().join("logs").join("events.jsonl.1").exists());
        assert_eq!(events.read_events().expect("read").len(), 20);
    }

    #[test]
    fn gc_deletes_unpreserved_blobs_for_the_task() {
        let temp = tempfile::tempdir().expect("tempdir");
        let events = log(&temp);
        let big = "x".repeat(9000);

        let doomed = events
            .emit("1", "s", EventDraft::new("out", json!({"data": big.clone()})))
            .expect("emit");
        let kept = events
            .emit(
                "1",
                "s",
                EventDraft {
                    kind: "out".to_string(),
                    payload: json!({"data": big.clone()}),
                    preserve: true,
                },
            )
            .expect("emit");
        let foreign = events
            .emit("2", "s", EventDraft::new("out", json!({"data": big})))
            .expect("emit");

        let removed = events.gc_blobs("1").expect("gc");
        assert_eq!(removed, 1);

        let blob = |e: &Event| {
            temp.path()
                .join("artifacts")
                .join(e.payload["ref"].as_str().expect("ref"))
        };
        assert!(!blob(&doomed).exists());
        assert!(blob(&kept).exists());
        assert!(blob(&foreign).exists());
    }

    #[test]
    fn gc_covers_nested_sub_task_events() {
        let temp = tempfile::tempdir().expect("tempdir");
        let events = log(&temp);
        let big = "x".repeat(9000);
        let nested = events
            .emit("1#deploy", "s", EventDraft::new("out", json!({"data": big})))
            .expect("emit");

        assert_eq!(events.gc_blobs("1").expect("gc"), 1);
        let blob = temp
            .path()
            .join("artifacts")
            .join(nested.payload["ref"].as_str().expect("ref"));
        assert!(!blob.exists());
    }
}
