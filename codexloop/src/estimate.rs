//! Stateless remaining-effort estimates used for progress display.

use anyhow::Result;
use tracing::{debug, instrument};

use crate::core::verdict::{Estimate, parse_estimate};
use crate::io::agent::{AgentFactory, ask};
use crate::io::prompt::PromptEngine;

/// Asks a fresh agent session how much work is left.
///
/// Every failure, including the agent call, comes back as an error. Callers
/// treat errors as "no progress line this round"; an interrupted agent can be
/// recognised by downcasting to [`crate::io::agent::AgentError`].
pub struct Estimator<'a> {
    factory: &'a dyn AgentFactory,
    prompts: PromptEngine,
}

impl<'a> Estimator<'a> {
    pub fn new(factory: &'a dyn AgentFactory) -> Self {
        Self {
            factory,
            prompts: PromptEngine::new(),
        }
    }

    #[instrument(skip_all, fields(prior_total = ?prior_total))]
    pub fn estimate(
        &self,
        task: &str,
        output: Option<&str>,
        check_output: Option<&str>,
        prior_total: Option<f64>,
    ) -> Result<Estimate> {
        let prompt = self
            .prompts
            .estimate(task, output, check_output, prior_total)?;
        let reply = ask(self.factory, &prompt)?;
        let estimate = parse_estimate(&reply)?;
        debug!(remaining = estimate.remaining, "estimator replied");
        Ok(estimate)
    }
}
