//! Stable exit codes for agent CLI commands.

/// Command succeeded; for `agent run`, the task reached `Succeeded`.
pub const OK: i32 = 0;
/// Invalid configuration, unusable workspace, or a run aborted before it started.
pub const INVALID: i32 = 1;
/// The run ended `Failed` (round budget exhausted or a provider outage).
pub const FAILED: i32 = 2;
/// The run hit its wall-clock deadline.
pub const TIMED_OUT: i32 = 3;
