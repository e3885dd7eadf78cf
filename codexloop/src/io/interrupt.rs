//! Ctrl-C handling.
//!
//! SIGINT reaches the whole foreground process group, so the agent child
//! usually dies with it. The handler only records the request; the loops see
//! it (or the child's signal exit) as [`AgentError::Interrupted`] and unwind
//! normally, which lets state-file guards and tear-down run. A second Ctrl-C
//! exits at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use tracing::warn;

use super::agent::AgentError;
use crate::exit_codes;

static PROCESS_FLAG: LazyLock<InterruptFlag> = LazyLock::new(InterruptFlag::new);

/// Shared "stop requested" flag.
///
/// Loops default to the process-wide flag set by [`install_handler`]; tests
/// hand them a private one.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag raised by Ctrl-C.
    pub fn process() -> Self {
        PROCESS_FLAG.clone()
    }

    /// Returns true when the flag was already raised.
    pub fn raise(&self) -> bool {
        self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` once the flag is raised.
    pub fn check(&self) -> Result<(), AgentError> {
        if self.is_raised() {
            Err(AgentError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Route SIGINT to the process flag instead of terminating immediately.
pub fn install_handler() -> Result<()> {
    let flag = InterruptFlag::process();
    ctrlc::set_handler(move || {
        if flag.raise() {
            std::process::exit(exit_codes::INTERRUPTED);
        }
        warn!("interrupt received, cleaning up (press Ctrl-C again to quit now)");
    })
    .context("install Ctrl-C handler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_is_shared_between_clones() {
        let flag = InterruptFlag::new();
        let other = flag.clone();
        assert!(flag.check().is_ok());
        assert!(!other.raise());
        assert!(other.raise());
        assert!(matches!(flag.check(), Err(AgentError::Interrupted)));
    }

    #[test]
    fn private_flags_are_independent() {
        let flag = InterruptFlag::new();
        flag.raise();
        assert!(!InterruptFlag::new().is_raised());
    }
}
