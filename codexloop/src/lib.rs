//! Convergence loops around an external coding agent.
//!
//! Three drivers share one agent backend:
//!
//! - [`task`]: run a task, verify the result, and feed failures back until a
//!   check passes or the iteration bound is reached.
//! - [`repeat`]: resend a prompt until a completion promise appears, the
//!   bound is reached, or the on-disk state file is removed.
//! - [`batch`]: run a task file once per line of a list file with bounded
//!   concurrency, recording status in the file itself.
//!
//! The layering follows the usual split:
//!
//! - **[`core`]**: Pure, deterministic logic (bounds, promises, progress,
//!   verdict parsing, status lines). No I/O.
//! - **[`io`]**: Side-effecting operations (processes, the agent backend,
//!   state/list/task files, prompts, config).

pub mod batch;
pub mod core;
pub mod estimate;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod metrics;
pub mod repeat;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
