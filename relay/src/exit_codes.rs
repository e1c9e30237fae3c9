//! Stable exit codes for relay CLI commands.

/// Command succeeded and the task can keep running.
pub const OK: i32 = 0;
/// Command failed due to invalid layout/config/task identity or other errors.
pub const INVALID: i32 = 1;
/// Every roadmap item has a checkpoint (task complete).
pub const COMPLETE: i32 = 2;
/// The task is escalated and waiting on an operator resolution.
pub const ESCALATED: i32 = 3;
/// The engine could not write its own ledger; the last sprint is unrecorded.
pub const FAULT: i32 = 4;
