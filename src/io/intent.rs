//! Write-ahead intent locks: crash detection and retry accounting.
//!
//! Before dispatching a step the engine writes `state/<task>.intent.lock`.
//! A lock found on boot means the previous run died inside that step: if the
//! owning PID is still alive another engine owns the task and we refuse to
//! proceed; a dead owner increments the attempt counter feeding the circuit
//! breaker.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRecord {
    pub task_id: String,
    pub step_id: String,
    pub attempt_n: u32,
    pub pid: u32,
    pub started_at: String,
}

pub fn lock_path(state_dir: &Path, task_id: &str) -> PathBuf {
    state_dir.join(format!("{task_id}.intent.lock"))
}

/// Acquire the intent lock for `(task_id, step_id)`.
///
/// Returns the record that was written, with `attempt_n` continuing the count
/// of a crashed predecessor on the same step. A live foreign owner is
/// `ResourceBusy`; a corrupt lock is stolen.
pub fn acquire(state_dir: &Path, task_id: &str, step_id: &str) -> Result<IntentRecord> {
    let path = lock_path(state_dir, task_id);
    let mut attempt_n = 1;

    if let Some(existing) = read_record(&path) {
        if existing.pid != std::process::id() {
            if pid_alive(existing.pid) {
                return Err(FlowError::ResourceBusy(format!(
                    "task {task_id} is locked by live pid {}",
                    existing.pid
                )));
            }
            warn!(
                %task_id,
                pid = existing.pid,
                attempt = existing.attempt_n,
                "recovering intent lock from dead process"
            );
        }
        if existing.task_id == task_id && existing.step_id == step_id {
            attempt_n = existing.attempt_n + 1;
        }
    }

    let record = IntentRecord {
        task_id: task_id.to_string(),
        step_id: step_id.to_string(),
        attempt_n,
        pid: std::process::id(),
        started_at: chrono::Utc::now().to_rfc3339(),
    };
    let mut buf = serde_json::to_string(&record)?;
    buf.push('\n');
    super::write_atomic(&path, buf.as_bytes())?;
    Ok(record)
}

/// Remove the lock after the step reached a terminal state.
pub fn release(state_dir: &Path, task_id: &str) -> Result<()> {
    let path = lock_path(state_dir, task_id);
    if path.exists() {
        fs::remove_file(&path)?;
    }
    Ok(())
}

/// Read the current record; a corrupt or unreadable lock counts as absent.
pub fn read_record(path: &Path) -> Option<IntentRecord> {
    let contents = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(record) => Some(record),
        Err(_) => {
            warn!(path = %path.display(), "corrupt intent lock; stealing");
            None
        }
    }
}

/// Liveness probe: signal 0 reaches any process we can see.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Without a cheap probe, assume dead so recovery can proceed; the
    // per-file advisory locks still guard concurrent edits.
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_first_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let record = acquire(temp.path(), "1.2", "step-1").expect("acquire");
        assert_eq!(record.attempt_n, 1);
        assert_eq!(record.pid, std::process::id());
        assert!(lock_path(temp.path(), "1.2").exists());
    }

    #[test]
    fn reacquire_by_same_pid_and_step_increments_attempts() {
        let temp = tempfile::tempdir().expect("tempdir");
        acquire(temp.path(), "1", "step-1").expect("first");
        let second = acquire(temp.path(), "1", "step-1").expect("second");
        assert_eq!(second.attempt_n, 2);
    }

    #[test]
    fn dead_pid_lock_is_recovered_with_incremented_attempts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stale = IntentRecord {
            task_id: "1".to_string(),
            step_id: "step-1".to_string(),
            attempt_n: 2,
            pid: u32::MAX - 1,
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        let path = lock_path(temp.path(), "1");
        std::fs::create_dir_all(temp.path()).expect("dir");
        std::fs::write(&path, serde_json::to_string(&stale).expect("json")).expect("write");

        let record = acquire(temp.path(), "1", "step-1").expect("acquire");
        assert_eq!(record.attempt_n, 3);
    }

    #[test]
    fn live_foreign_pid_refuses() {
        let temp = tempfile::tempdir().expect("tempdir");
        // PID 1 is always alive on unix.
        if !pid_alive(1) {
            return;
        }
        let foreign = IntentRecord {
            task_id: "1".to_string(),
            step_id: "step-1".to_string(),
            attempt_n: 1,
            pid: 1,
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        let path = lock_path(temp.path(), "1");
        std::fs::write(&path, serde_json::to_string(&foreign).expect("json")).expect("write");

        let err = acquire(temp.path(), "1", "step-1").expect_err("should refuse");
        assert!(matches!(err, FlowError::ResourceBusy(_)), "{err}");
    }

    #[test]
    fn different_step_resets_attempts() {
        let temp = tempfile::tempdir().expect("tempdir");
        acquire(temp.path(), "1", "step-1").expect("first");
        let next = acquire(temp.path(), "1", "step-2").expect("second");
        assert_eq!(next.attempt_n, 1);
    }

    #[test]
    fn corrupt_lock_is_stolen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = lock_path(temp.path(), "1");
        std::fs::write(&path, "not json").expect("write");
        let record = acquire(temp.path(), "1", "step-1").expect("acquire");
        assert_eq!(record.attempt_n, 1);
    }

    #[test]
    fn release_removes_the_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        acquire(temp.path(), "1", "step-1").expect("acquire");
        release(temp.path(), "1").expect("release");
        assert!(!lock_path(temp.path(), "1").exists());
        // Releasing again is a no-op.
        release(temp.path(), "1").expect("re-release");
    }
}
