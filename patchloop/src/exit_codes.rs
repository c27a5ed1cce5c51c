//! Stable exit codes for `patchloop` CLI commands.

/// Command succeeded (or the task completed).
pub const OK: i32 = 0;
/// Command failed due to invalid config, arguments, storage or other errors.
pub const INVALID: i32 = 1;
/// The task ran to a terminal `failed` state.
pub const TASK_FAILED: i32 = 3;
