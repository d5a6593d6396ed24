//! Stable exit codes for the CLI.

/// Command succeeded.
pub const OK: i32 = 0;
/// User or configuration error, or a step failed.
pub const ERROR: i32 = 1;
/// Status document failed validation or a CRUD precondition was violated.
pub const INVALID_STATE: i32 = 2;
/// Integrity sidecar mismatch (tamper detected).
pub const TAMPER: i32 = 3;
/// Interrupted by SIGINT/SIGTERM after a clean state flush.
pub const INTERRUPTED: i32 = 130;
