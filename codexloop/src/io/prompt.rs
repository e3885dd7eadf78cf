//! Built-in prompts, rendered from embedded minijinja templates.

use anyhow::Result;
use minijinja::{Environment, context};

const CHECK_TEMPLATE: &str = include_str!("prompts/check.md");
const ESTIMATE_TEMPLATE: &str = include_str!("prompts/estimate.md");
const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");
const SUCCESS_TEMPLATE: &str = include_str!("prompts/success.md");
const FAILURE_TEMPLATE: &str = include_str!("prompts/failure.md");
const LOGBOOK_TEMPLATE: &str = include_str!("prompts/logbook.md");
const METRICS_TEMPLATE: &str = include_str!("prompts/metrics.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("check", CHECK_TEMPLATE)
            .expect("check template should be valid");
        env.add_template("estimate", ESTIMATE_TEMPLATE)
            .expect("estimate template should be valid");
        env.add_template("fix", FIX_TEMPLATE)
            .expect("fix template should be valid");
        env.add_template("success", SUCCESS_TEMPLATE)
            .expect("success template should be valid");
        env.add_template("failure", FAILURE_TEMPLATE)
            .expect("failure template should be valid");
        env.add_template("logbook", LOGBOOK_TEMPLATE)
            .expect("logbook template should be valid");
        env.add_template("metrics", METRICS_TEMPLATE)
            .expect("metrics template should be valid");
        Self { env }
    }

    /// Verification request. Without `instructions` the task itself is the yardstick.
    pub fn check(&self, task: &str, instructions: Option<&str>, output: &str) -> Result<String> {
        let template = self.env.get_template("check")?;
        Ok(template.render(context! {
            task => task.trim(),
            instructions => non_blank(instructions),
            output => non_blank(Some(output)),
        })?)
    }

    pub fn estimate(
        &self,
        task: &str,
        output: Option<&str>,
        check_output: Option<&str>,
        prior_total: Option<f64>,
    ) -> Result<String> {
        let template = self.env.get_template("estimate")?;
        Ok(template.render(context! {
            task => task.trim(),
            output => non_blank(output),
            check_output => non_blank(check_output),
            prior_total => prior_total,
        })?)
    }

    pub fn fix(&self, reason: &str) -> Result<String> {
        let template = self.env.get_template("fix")?;
        Ok(template.render(context! { reason => reason.trim() })?)
    }

    pub fn success(&self) -> Result<String> {
        Ok(self.env.get_template("success")?.render(context! {})?)
    }

    pub fn failure(&self, reason: Option<&str>) -> Result<String> {
        let template = self.env.get_template("failure")?;
        Ok(template.render(context! { reason => non_blank(reason) })?)
    }

    /// Science-style repeat prompt; iterations after the first point at LOGBOOK.md.
    pub fn logbook(&self, task: &str, iteration: u32) -> Result<String> {
        let template = self.env.get_template("logbook")?;
        Ok(template.render(context! {
            task => task.trim(),
            iteration => iteration,
        })?)
    }

    /// Figures-of-merit extraction. `previous_best` is the JSON of the best report so far.
    pub fn metrics(
        &self,
        task: &str,
        output: &str,
        previous_best: Option<&str>,
    ) -> Result<String> {
        let template = self.env.get_template("metrics")?;
        Ok(template.render(context! {
            task => task.trim(),
            output => output.trim(),
            previous_best => non_blank(previous_best),
        })?)
    }
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|s| !s.is_empty())
}
