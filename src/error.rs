//! Typed error taxonomy shared across the crate.
//!
//! Components return `FlowError` so the CLI can map failures onto stable exit
//! codes. `anyhow` is used only at the binary boundary for context chains.

use std::path::PathBuf;

use thiserror::Error;

/// Security violations are fatal for the operation and never retried.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("null byte in path")]
    NullByte,
    #[error("absolute paths are forbidden: {0}")]
    AbsolutePath(String),
    #[error("path traversal detected: {0}")]
    Traversal(String),
    #[error("UNC paths are forbidden: {0}")]
    UncPath(String),
    #[error("invalid protocol in path: {0}")]
    Protocol(String),
    #[error("reserved device name forbidden: {0}")]
    ReservedName(String),
    #[error("path too long ({0} bytes)")]
    PathTooLong(usize),
    #[error("symlink loop while resolving {0}")]
    SymlinkLoop(PathBuf),
    #[error("{path} resolves outside {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },
    #[error("{0} crosses a filesystem boundary")]
    DeviceCrossing(PathBuf),
    #[error("regex exceeded the {0} ms budget")]
    RegexTimeout(u64),
    #[error("regex rejected: {0}")]
    RegexRejected(String),
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("security: {0}")]
    Security(#[from] SecurityError),

    /// Grammar or invariant breach in a status document or a mutation.
    #[error("validation: {0}")]
    Validation(String),

    /// Sidecar hash mismatch. Recoverable via accept/decline.
    #[error("integrity mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// CRUD precondition not met; no mutation was applied.
    #[error("state: {0}")]
    State(String),

    #[error("anchor mismatch: expected '{expected}', got '{actual}'")]
    Anchor { expected: String, actual: String },

    #[error("task id '{0}' not found")]
    Id(String),

    #[error("virtual ids are stale after a mutation; reload the tree")]
    StaleId,

    /// A lock could not be acquired within its deadline.
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// The optimistic mtime fence tripped; no bytes were written.
    #[error("content changed during operation: {0}")]
    ContentChanged(PathBuf),

    #[error("config: {0}")]
    Config(String),

    /// Atom returned a value incompatible with the result contract.
    #[error("contract violation: {0}")]
    Contract(String),

    /// Circuit breaker tripped for a task step.
    #[error("task {task_id} step {step_id} failed {attempts} times; giving up")]
    FatalRetryExceeded {
        task_id: String,
        step_id: String,
        attempts: u32,
    },

    #[error("{0} is not valid UTF-8")]
    Encoding(PathBuf),

    #[error("path outside the caller's whitelist: {0}")]
    PermissionDenied(PathBuf),

    /// Loom contract failure (missing anchor, ambiguous match, oversized file).
    #[error("loom: {0}")]
    Loom(String),

    #[error("no project root found starting from {0}")]
    RootNotFound(PathBuf),

    #[error("invalid root: {0}")]
    InvalidRoot(String),

    #[error("interrupted by signal")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = FlowError> = std::result::Result<T, E>;

impl FlowError {
    /// Stable exit code for the CLI (see `exit_codes`).
    pub fn exit_code(&self) -> i32 {
        use crate::exit_codes;
        match self {
            FlowError::Integrity { .. } => exit_codes::TAMPER,
            FlowError::Validation(_) | FlowError::State(_) => exit_codes::INVALID_STATE,
            FlowError::Interrupted => exit_codes::INTERRUPTED,
            _ => exit_codes::ERROR,
        }
    }
}
