//! Stateless completion checks.

use tracing::{debug, instrument};

use crate::core::verdict::{Verdict, parse_verdict};
use crate::io::agent::{AgentError, AgentFactory, ask};
use crate::io::prompt::PromptEngine;

/// Asks a fresh agent session whether a task is done.
///
/// Malformed replies never escape as errors: they become a failing [`Verdict`]
/// whose reason describes what was wrong. Only the agent call itself can fail.
pub struct Verifier<'a> {
    factory: &'a dyn AgentFactory,
    prompts: PromptEngine,
}

impl<'a> Verifier<'a> {
    pub fn new(factory: &'a dyn AgentFactory) -> Self {
        Self {
            factory,
            prompts: PromptEngine::new(),
        }
    }

    #[instrument(skip_all, fields(custom = instructions.is_some()))]
    pub fn verify(
        &self,
        task: &str,
        instructions: Option<&str>,
        output: &str,
    ) -> Result<Verdict, AgentError> {
        let prompt = self.prompts.check(task, instructions, output)?;
        let reply = ask(self.factory, &prompt)?;
        let verdict = parse_verdict(&reply);
        debug!(success = verdict.success, "verifier replied");
        Ok(verdict)
    }
}
