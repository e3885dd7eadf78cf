//! Checker-driven retry loop.
//!
//! A [`TaskLoop`] sends the task prompt to a working session, then alternates
//! verification and fix prompts until the checker is satisfied or the
//! iteration bound runs out:
//!
//! ```text
//! set-up -> initial run -> check -> (fix -> check)* -> success | failure -> tear-down
//! ```
//!
//! Tear-down runs on every exit path once set-up has been attempted, including
//! set-up failures and agent errors. Progress estimation is best-effort and
//! never changes how the loop ends.

use std::time::Instant;

use anyhow::{Result, bail};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::bound::IterationBound;
use crate::core::progress::{EstimateState, Finish, ProgressLine};
use crate::core::verdict::Verdict;
use crate::estimate::Estimator;
use crate::io::agent::{Agent, AgentError, AgentFactory, ask};
use crate::io::config::TaskConfig;
use crate::io::interrupt::InterruptFlag;
use crate::io::prompt::PromptEngine;
use crate::verify::Verifier;

/// Check text that turns verification off.
pub const SKIP_CHECK_SENTINEL: &str = "None";

/// How a task's completion is verified.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CheckPolicy {
    /// Verify against the task prompt itself.
    #[default]
    Auto,
    /// Verify using these instructions.
    Custom(String),
    /// Succeed after the first reply without verifying.
    Skip,
}

impl CheckPolicy {
    /// Interpret optional check text: blank is `Auto`, the trimmed sentinel is `Skip`.
    pub fn from_text(text: Option<&str>) -> Self {
        match text.map(str::trim) {
            None | Some("") => CheckPolicy::Auto,
            Some(SKIP_CHECK_SENTINEL) => CheckPolicy::Skip,
            Some(_) => CheckPolicy::Custom(text.unwrap_or_default().to_string()),
        }
    }
}

/// Everything needed to run one task. Not modified once a loop starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    pub prompt: String,
    pub check: CheckPolicy,
    pub set_up: Option<String>,
    pub tear_down: Option<String>,
    pub on_success: Option<String>,
    pub on_failure: Option<String>,
    pub max_iterations: IterationBound,
}

impl TaskDefinition {
    pub fn new(prompt: impl Into<String>) -> Result<Self> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            bail!("task prompt must not be empty");
        }
        Ok(Self {
            prompt,
            check: CheckPolicy::Auto,
            set_up: None,
            tear_down: None,
            on_success: None,
            on_failure: None,
            max_iterations: TaskConfig::default().max_iterations,
        })
    }

    pub fn with_check(mut self, check: CheckPolicy) -> Self {
        self.check = check;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: IterationBound) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

/// Outcome of a finished loop. Produced exactly once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub success: bool,
    /// The agent's own account: what it did, or why it could not finish.
    pub summary: String,
    pub iterations: u32,
    pub max_iterations: IterationBound,
    /// Last verifier reason when the task failed.
    pub reason: Option<String>,
    pub session_id: Option<String>,
}

impl TaskResult {
    /// `Err(TaskFailed)` for failed outcomes, so callers can use `?`.
    pub fn into_result(self) -> Result<TaskResult, TaskFailed> {
        if self.success {
            Ok(self)
        } else {
            Err(TaskFailed { result: self })
        }
    }
}

#[derive(Debug, Error)]
#[error("{}", describe_failure(.result))]
pub struct TaskFailed {
    pub result: TaskResult,
}

fn describe_failure(result: &TaskResult) -> String {
    format!(
        "task failed after {} iteration(s): {}",
        result.iterations,
        result.summary.trim()
    )
}

/// Result of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Verification is off; the task counts as done.
    Skipped,
    Verdict(Verdict),
}

/// Preparation and cleanup around a run.
pub trait SetUp {
    fn set_up(&mut self) -> Result<(), AgentError> {
        Ok(())
    }

    fn tear_down(&mut self) -> Result<(), AgentError> {
        Ok(())
    }
}

pub trait Checker {
    /// Judge the latest reply from the working session.
    fn check(&mut self, output: &str) -> Result<CheckOutcome, AgentError>;
}

/// Follow-ups after the terminal transition.
pub trait Hooks {
    fn on_success(&mut self, _result: &TaskResult) -> Result<(), AgentError> {
        Ok(())
    }

    fn on_failure(&mut self, _result: &TaskResult) -> Result<(), AgentError> {
        Ok(())
    }
}

// Borrowed capabilities, so a caller can inspect its task after the loop ends.
impl<T: SetUp> SetUp for &mut T {
    fn set_up(&mut self) -> Result<(), AgentError> {
        (**self).set_up()
    }

    fn tear_down(&mut self) -> Result<(), AgentError> {
        (**self).tear_down()
    }
}

impl<T: Checker> Checker for &mut T {
    fn check(&mut self, output: &str) -> Result<CheckOutcome, AgentError> {
        (**self).check(output)
    }
}

impl<T: Hooks> Hooks for &mut T {
    fn on_success(&mut self, result: &TaskResult) -> Result<(), AgentError> {
        (**self).on_success(result)
    }

    fn on_failure(&mut self, result: &TaskResult) -> Result<(), AgentError> {
        (**self).on_failure(result)
    }
}

/// [`SetUp`], [`Checker`] and [`Hooks`] driven by a [`TaskDefinition`].
///
/// Hook texts are sent as stateless prompts; checks go through a [`Verifier`].
pub struct PromptTask<'a> {
    definition: TaskDefinition,
    factory: &'a dyn AgentFactory,
    verifier: Verifier<'a>,
}

impl<'a> PromptTask<'a> {
    pub fn new(definition: TaskDefinition, factory: &'a dyn AgentFactory) -> Self {
        Self {
            definition,
            factory,
            verifier: Verifier::new(factory),
        }
    }

    pub fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    fn run_hook(&self, name: &str, text: Option<&str>) -> Result<(), AgentError> {
        let Some(text) = text else {
            return Ok(());
        };
        info!(hook = name, "running hook prompt");
        let reply = ask(self.factory, text)?;
        debug!(hook = name, bytes = reply.len(), "hook replied");
        Ok(())
    }
}

impl SetUp for PromptTask<'_> {
    fn set_up(&mut self) -> Result<(), AgentError> {
        self.run_hook("set_up", self.definition.set_up.as_deref())
    }

    fn tear_down(&mut self) -> Result<(), AgentError> {
        self.run_hook("tear_down", self.definition.tear_down.as_deref())
    }
}

impl Checker for PromptTask<'_> {
    fn check(&mut self, output: &str) -> Result<CheckOutcome, AgentError> {
        let instructions = match &self.definition.check {
            CheckPolicy::Skip => return Ok(CheckOutcome::Skipped),
            CheckPolicy::Auto => None,
            CheckPolicy::Custom(text) => Some(text.as_str()),
        };
        self.verifier
            .verify(&self.definition.prompt, instructions, output)
            .map(CheckOutcome::Verdict)
    }
}

impl Hooks for PromptTask<'_> {
    fn on_success(&mut self, _result: &TaskResult) -> Result<(), AgentError> {
        self.run_hook("on_success", self.definition.on_success.as_deref())
    }

    fn on_failure(&mut self, _result: &TaskResult) -> Result<(), AgentError> {
        self.run_hook("on_failure", self.definition.on_failure.as_deref())
    }
}

/// Transcript events reported while a loop runs.
#[derive(Debug, Clone, Copy)]
pub enum TaskEvent<'e> {
    /// A reply from the working session (initial run or fix).
    Reply(&'e str),
    Verdict(&'e Verdict),
    Progress(&'e ProgressLine),
}

/// Progress estimation settings.
pub struct ProgressOptions<'a> {
    pub estimator: Estimator<'a>,
    /// Consecutive estimator failures before estimation is switched off (0 = never).
    pub failure_limit: u32,
}

/// The checker-driven retry state machine.
pub struct TaskLoop<'a, T> {
    prompt: String,
    max_iterations: IterationBound,
    task: T,
    session: Box<dyn Agent + Send>,
    progress: Option<ProgressOptions<'a>>,
    prompts: PromptEngine,
    interrupt: InterruptFlag,
}

impl<'a, T> TaskLoop<'a, T>
where
    T: SetUp + Checker + Hooks,
{
    /// `session` is the working session; it keeps context across fix rounds.
    pub fn new(
        prompt: impl Into<String>,
        max_iterations: IterationBound,
        task: T,
        session: Box<dyn Agent + Send>,
    ) -> Result<Self> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            bail!("task prompt must not be empty");
        }
        Ok(Self {
            prompt,
            max_iterations,
            task,
            session,
            progress: None,
            prompts: PromptEngine::new(),
            interrupt: InterruptFlag::process(),
        })
    }

    pub fn with_progress(mut self, estimator: Estimator<'a>, failure_limit: u32) -> Self {
        self.progress = Some(ProgressOptions {
            estimator,
            failure_limit,
        });
        self
    }

    /// Stop flag checked before every prompt to the working session.
    /// Defaults to the process-wide Ctrl-C flag.
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Run to a terminal state, reporting transcript events to `on_event`.
    ///
    /// Agent failures end the run with an error after tear-down. A failed task
    /// is not an error: it is a [`TaskResult`] with `success == false`.
    #[instrument(skip_all, fields(max_iterations = %self.max_iterations))]
    pub fn run(
        mut self,
        mut on_event: impl FnMut(TaskEvent<'_>),
    ) -> Result<TaskResult, AgentError> {
        let started = Instant::now();
        let mut tracker = self.progress.take().map(ProgressTracker::new);

        let outcome = self
            .task
            .set_up()
            .and_then(|()| self.drive(started, tracker.as_mut(), &mut on_event));

        // Tear-down runs no matter how the attempt ended.
        let tear_down = self.task.tear_down();
        match (outcome, tear_down) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(_), Err(err)) => {
                warn!(err = %err, "tear-down failed");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(tear_down_err)) => {
                warn!(err = %tear_down_err, "tear-down failed after an earlier error");
                Err(err)
            }
        }
    }

    fn drive(
        &mut self,
        started: Instant,
        mut tracker: Option<&mut ProgressTracker<'a>>,
        on_event: &mut impl FnMut(TaskEvent<'_>),
    ) -> Result<TaskResult, AgentError> {
        if let Some(tracker) = tracker.as_deref_mut() {
            tracker.estimate(&self.prompt, None, None)?;
        }

        let prompt = self.prompt.clone();
        let mut output = self.invoke(&prompt)?;
        on_event(TaskEvent::Reply(&output));
        let mut iteration = 1;

        loop {
            let verdict = match self.task.check(&output)? {
                CheckOutcome::Skipped => {
                    debug!(iteration, "verification skipped");
                    if let Some(tracker) = tracker.as_deref_mut() {
                        let line = tracker.terminal_line(
                            iteration,
                            self.max_iterations,
                            started,
                            "verification skipped",
                            Finish::Succeeded,
                        );
                        on_event(TaskEvent::Progress(&line));
                    }
                    return self.succeed(iteration);
                }
                CheckOutcome::Verdict(verdict) => verdict,
            };
            on_event(TaskEvent::Verdict(&verdict));
            info!(iteration, success = verdict.success, "check finished");

            let finish = if verdict.success {
                Some(Finish::Succeeded)
            } else if self.max_iterations.reached(iteration) {
                Some(Finish::Failed)
            } else {
                None
            };

            if let Some(tracker) = tracker.as_deref_mut() {
                let estimate =
                    tracker.estimate(&self.prompt, Some(&output), Some(&verdict.reason))?;
                let line = match (finish, estimate) {
                    (Some(finish), summary) => Some(tracker.terminal_line(
                        iteration,
                        self.max_iterations,
                        started,
                        summary.as_deref().unwrap_or(&verdict.reason),
                        finish,
                    )),
                    (None, Some(summary)) => {
                        Some(tracker.line(iteration, self.max_iterations, started, &summary))
                    }
                    (None, None) => None,
                };
                if let Some(line) = line {
                    on_event(TaskEvent::Progress(&line));
                }
            }

            match finish {
                Some(Finish::Succeeded) => return self.succeed(iteration),
                Some(Finish::Failed) => return self.fail(iteration, verdict.reason),
                None => {}
            }

            let fix = self.prompts.fix(&verdict.reason)?;
            output = self.invoke(&fix)?;
            on_event(TaskEvent::Reply(&output));
            iteration += 1;
        }
    }

    fn succeed(&mut self, iteration: u32) -> Result<TaskResult, AgentError> {
        let prompt = self.prompts.success()?;
        let summary = self.invoke(&prompt)?;
        let result = self.result(true, summary, iteration, None);
        info!(iterations = iteration, "task succeeded");
        self.task.on_success(&result)?;
        Ok(result)
    }

    fn fail(&mut self, iteration: u32, reason: String) -> Result<TaskResult, AgentError> {
        let prompt = self.prompts.failure(Some(&reason))?;
        let summary = self.invoke(&prompt)?;
        let result = self.result(false, summary, iteration, Some(reason));
        info!(iterations = iteration, "task failed");
        self.task.on_failure(&result)?;
        Ok(result)
    }

    fn invoke(&mut self, prompt: &str) -> Result<String, AgentError> {
        self.interrupt.check()?;
        self.session.invoke(prompt)
    }

    fn result(
        &self,
        success: bool,
        summary: String,
        iterations: u32,
        reason: Option<String>,
    ) -> TaskResult {
        TaskResult {
            success,
            summary,
            iterations,
            max_iterations: self.max_iterations,
            reason,
            session_id: self.session.session_id().map(str::to_string),
        }
    }
}

/// Estimator calls plus the bookkeeping that turns them into progress lines.
struct ProgressTracker<'a> {
    options: ProgressOptions<'a>,
    state: EstimateState,
    consecutive_failures: u32,
    disabled: bool,
}

impl<'a> ProgressTracker<'a> {
    fn new(options: ProgressOptions<'a>) -> Self {
        Self {
            options,
            state: EstimateState::new(),
            consecutive_failures: 0,
            disabled: false,
        }
    }

    /// Summary of a fresh estimate, or `None` when this round has no estimate.
    ///
    /// Only an interrupted agent escapes as an error.
    fn estimate(
        &mut self,
        task: &str,
        output: Option<&str>,
        check_output: Option<&str>,
    ) -> Result<Option<String>, AgentError> {
        if self.disabled {
            return Ok(None);
        }
        let result = self
            .options
            .estimator
            .estimate(task, output, check_output, self.state.total());
        match result {
            Ok(estimate) => {
                self.consecutive_failures = 0;
                self.state.observe(estimate.remaining);
                Ok(Some(estimate.summary))
            }
            Err(err) => {
                if err
                    .downcast_ref::<AgentError>()
                    .is_some_and(AgentError::is_interrupted)
                {
                    return Err(AgentError::Interrupted);
                }
                self.consecutive_failures += 1;
                debug!(
                    err = %format!("{err:#}"),
                    failures = self.consecutive_failures,
                    "estimate failed"
                );
                let limit = self.options.failure_limit;
                if limit > 0 && self.consecutive_failures >= limit {
                    warn!(
                        failures = self.consecutive_failures,
                        "estimator keeps failing, progress estimates disabled for this run"
                    );
                    self.disabled = true;
                }
                Ok(None)
            }
        }
    }

    fn line(
        &self,
        iteration: u32,
        bound: IterationBound,
        started: Instant,
        summary: &str,
    ) -> ProgressLine {
        ProgressLine {
            iteration,
            bound,
            elapsed: started.elapsed(),
            summary: summary.to_string(),
            fraction_done: self.state.fraction_done(),
            finish: None,
        }
    }

    fn terminal_line(
        &self,
        iteration: u32,
        bound: IterationBound,
        started: Instant,
        summary: &str,
        finish: Finish,
    ) -> ProgressLine {
        ProgressLine {
            finish: Some(finish),
            ..self.line(iteration, bound, started, summary)
        }
    }
}
