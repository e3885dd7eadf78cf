//! Stateless figures-of-merit extraction for science runs.

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::verdict::{MetricsReport, parse_metrics};
use crate::io::agent::{AgentFactory, ask};
use crate::io::prompt::PromptEngine;

/// Asks a fresh agent session which figures of merit an iteration improved.
///
/// Like [`crate::estimate::Estimator`], every failure is an error and an
/// interrupted agent can be recovered by downcasting.
pub struct MetricsExtractor<'a> {
    factory: &'a dyn AgentFactory,
    prompts: PromptEngine,
}

impl<'a> MetricsExtractor<'a> {
    pub fn new(factory: &'a dyn AgentFactory) -> Self {
        Self {
            factory,
            prompts: PromptEngine::new(),
        }
    }

    #[instrument(skip_all, fields(has_previous = previous_best.is_some()))]
    pub fn extract(
        &self,
        task: &str,
        output: &str,
        previous_best: Option<&MetricsReport>,
    ) -> Result<MetricsReport> {
        let previous = previous_best
            .map(serde_json::to_string_pretty)
            .transpose()
            .context("serialize previous best metrics")?;
        let prompt = self.prompts.metrics(task, output, previous.as_deref())?;
        let reply = ask(self.factory, &prompt)?;
        let report = parse_metrics(&reply)?;
        debug!(
            new_improvement = report.new_improvement,
            metrics = report.metrics.len(),
            "metrics extracted"
        );
        Ok(report)
    }
}
