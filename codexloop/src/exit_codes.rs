//! Stable exit codes for codexloop CLI commands.

/// Command succeeded, or a loop stopped normally.
pub const OK: i32 = 0;
/// A task failed, or the command hit a configuration or agent error.
pub const FAILED: i32 = 1;
/// Ctrl-C, or the agent process was killed by a signal.
pub const INTERRUPTED: i32 = 130;
