//! Fixed-prompt repeat loop with a completion promise and file-based cancel.
//!
//! The loop keeps its state in `.codexloop/repeat-loop.local.md`. That file is
//! both the progress record and the cancel switch: it is polled before each
//! invocation, after each reply, and before the next state write, so a cancel
//! takes effect within one agent round trip. A Ctrl-C ends the loop with
//! [`AgentError::Interrupted`] once the running agent call returns, and the
//! state file is removed on the way out.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tracing::{info, instrument, warn};

use crate::core::bound::IterationBound;
use crate::core::promise::promise_matches;
use crate::core::verdict::MetricsReport;
use crate::io::agent::{Agent, AgentError, AgentFactory};
use crate::io::config::CONFIG_DIR;
use crate::io::interrupt::InterruptFlag;
use crate::io::logbook::{append_entry, logbook_path};
use crate::io::loop_state::{
    LoopState, STATE_FILE, remove_loop_state, state_path, utc_timestamp, write_loop_state,
};
use crate::io::prompt::PromptEngine;
use crate::metrics::MetricsExtractor;

/// Appended to every prompt sent by a repeat loop.
pub const PROMPT_SUFFIX: &str = "\nIf there are multiple paths forward, use your own best judgement \
to decide which to try first. Do not ask the user to choose an option: you have explicit \
permission to pick the best one yourself.\n";

/// Whether iterations share conversational context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// A new session every iteration.
    #[default]
    Fresh,
    /// One session for the whole loop.
    Reuse,
}

#[derive(Debug, Clone)]
pub struct RepeatConfig {
    pub workdir: PathBuf,
    pub max_iterations: IterationBound,
    pub completion_promise: Option<String>,
    pub session: SessionMode,
}

impl RepeatConfig {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            max_iterations: IterationBound::UNLIMITED,
            completion_promise: None,
            session: SessionMode::Fresh,
        }
    }
}

/// What to send each iteration and what to do with the reply.
pub trait RepeatPlan {
    /// Prompt recorded in the state file.
    fn recorded_prompt(&self) -> &str;

    fn prompt(&mut self, iteration: u32) -> Result<String>;

    /// Called with every reply. A returned line announces a new best result.
    fn after_iteration(&mut self, _iteration: u32, _reply: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Sends the same prompt every time.
#[derive(Debug, Clone)]
pub struct FixedPrompt {
    prompt: String,
}

impl FixedPrompt {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

impl RepeatPlan for FixedPrompt {
    fn recorded_prompt(&self) -> &str {
        &self.prompt
    }

    fn prompt(&mut self, _iteration: u32) -> Result<String> {
        Ok(self.prompt.clone())
    }
}

/// Science-style plan: later iterations are pointed at `LOGBOOK.md`, and every
/// reply is appended to it under a timestamped header.
///
/// With a [`MetricsExtractor`] attached, each reply is also mined for figures
/// of merit. Reports flagged as an improvement become the new best and are
/// announced; extraction failures are logged and otherwise ignored.
pub struct LogbookPlan<'a> {
    task: String,
    first_prompt: String,
    logbook: PathBuf,
    prompts: PromptEngine,
    metrics: Option<MetricsExtractor<'a>>,
    best: Option<MetricsReport>,
}

impl<'a> LogbookPlan<'a> {
    pub fn new(task: &str, workdir: &Path) -> Result<Self> {
        if task.trim().is_empty() {
            bail!("science task must not be empty");
        }
        let prompts = PromptEngine::new();
        let first_prompt = prompts.logbook(task, 1)?;
        Ok(Self {
            task: task.trim().to_string(),
            first_prompt,
            logbook: logbook_path(workdir),
            prompts,
            metrics: None,
            best: None,
        })
    }

    pub fn with_metrics(mut self, extractor: MetricsExtractor<'a>) -> Self {
        self.metrics = Some(extractor);
        self
    }

    /// Best report seen so far.
    pub fn best(&self) -> Option<&MetricsReport> {
        self.best.as_ref()
    }

    fn track_metrics(&mut self, reply: &str) -> Result<Option<String>> {
        let Some(extractor) = &self.metrics else {
            return Ok(None);
        };
        match extractor.extract(&self.task, reply, self.best.as_ref()) {
            Ok(report) if report.new_improvement => {
                let announcement = report.announcement();
                info!(metrics = report.metrics.len(), "new best metrics");
                self.best = Some(report);
                Ok(Some(announcement))
            }
            Ok(_) => Ok(None),
            Err(err) => {
                if err
                    .downcast_ref::<AgentError>()
                    .is_some_and(AgentError::is_interrupted)
                {
                    return Err(err);
                }
                warn!(err = %format!("{err:#}"), "metrics extraction failed");
                Ok(None)
            }
        }
    }
}

impl RepeatPlan for LogbookPlan<'_> {
    fn recorded_prompt(&self) -> &str {
        &self.first_prompt
    }

    fn prompt(&mut self, iteration: u32) -> Result<String> {
        self.prompts.logbook(&self.task, iteration)
    }

    fn after_iteration(&mut self, iteration: u32, reply: &str) -> Result<Option<String>> {
        append_entry(&self.logbook, iteration, &utc_timestamp(), reply)?;
        self.track_metrics(reply)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A reply contained the completion promise.
    Promise,
    MaxIterations,
    /// The state file disappeared.
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatOutcome {
    pub stop: StopReason,
    /// Iterations whose agent call completed.
    pub iterations: u32,
    pub last_reply: Option<String>,
}

/// Transcript events reported while a loop runs.
#[derive(Debug, Clone, Copy)]
pub enum RepeatEvent<'e> {
    Banner(&'e str),
    /// Status line printed before each invocation.
    Iteration(u32, &'e str),
    Reply(&'e str),
    /// A plan reported a new best result.
    NewBest(&'e str),
    Stopped(StopReason, &'e str),
}

pub struct RepeatLoop<'a, P> {
    plan: P,
    factory: &'a dyn AgentFactory,
    config: RepeatConfig,
    interrupt: InterruptFlag,
}

impl<'a, P: RepeatPlan> RepeatLoop<'a, P> {
    pub fn new(plan: P, factory: &'a dyn AgentFactory, config: RepeatConfig) -> Result<Self> {
        if plan.recorded_prompt().trim().is_empty() {
            bail!("prompt must not be empty");
        }
        Ok(Self {
            plan,
            factory,
            config,
            interrupt: InterruptFlag::process(),
        })
    }

    /// Defaults to the process-wide Ctrl-C flag.
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Run until the promise appears, the bound is reached, or the state file is removed.
    ///
    /// Errors (including an interrupted agent) end the loop after the state file
    /// has been cleaned up.
    #[instrument(skip_all, fields(max_iterations = %self.config.max_iterations))]
    pub fn run(mut self, mut on_event: impl FnMut(RepeatEvent<'_>)) -> Result<RepeatOutcome> {
        let path = state_path(&self.config.workdir);
        let started_at = utc_timestamp();
        let mut iteration = 1;
        self.write_state(&path, iteration, &started_at)?;
        let mut guard = StateGuard::new(&path);

        on_event(RepeatEvent::Banner(&self.banner()));

        let mut session: Option<Box<dyn Agent + Send>> = None;
        let mut last_reply: Option<String> = None;
        let mut completed = 0;

        loop {
            self.interrupt.check()?;
            if !path.exists() {
                return Ok(self.canceled(&mut guard, completed, last_reply, &mut on_event));
            }

            on_event(RepeatEvent::Iteration(iteration, &self.status_line(iteration)));
            let prompt = format!("{}{PROMPT_SUFFIX}", self.plan.prompt(iteration)?);
            let agent = match (self.config.session, &mut session) {
                (SessionMode::Reuse, Some(agent)) => agent,
                (_, slot) => slot.insert(self.factory.session(None)),
            };
            let reply = agent.invoke(&prompt)?;
            completed = iteration;
            on_event(RepeatEvent::Reply(&reply));
            if let Some(line) = self.plan.after_iteration(iteration, &reply)? {
                on_event(RepeatEvent::NewBest(&line));
            }
            info!(iteration, "repeat iteration finished");
            self.interrupt.check()?;

            let fulfilled = promise_matches(&reply, self.config.completion_promise.as_deref());
            last_reply = Some(reply);

            if !path.exists() {
                return Ok(self.canceled(&mut guard, completed, last_reply, &mut on_event));
            }
            if fulfilled {
                let promise = self.config.completion_promise.as_deref().unwrap_or_default();
                let message = format!("Detected <promise>{promise}</promise>.");
                return Ok(self.stop(
                    StopReason::Promise,
                    &message,
                    completed,
                    last_reply,
                    &mut on_event,
                ));
            }
            if self.config.max_iterations.reached(iteration) {
                let message = format!("Max iterations ({}) reached.", self.config.max_iterations);
                return Ok(self.stop(
                    StopReason::MaxIterations,
                    &message,
                    completed,
                    last_reply,
                    &mut on_event,
                ));
            }
            if !path.exists() {
                return Ok(self.canceled(&mut guard, completed, last_reply, &mut on_event));
            }

            iteration += 1;
            self.write_state(&path, iteration, &started_at)?;
        }
    }

    fn write_state(&self, path: &Path, iteration: u32, started_at: &str) -> Result<()> {
        write_loop_state(
            path,
            &LoopState {
                iteration,
                max_iterations: self.config.max_iterations,
                completion_promise: self.config.completion_promise.clone(),
                started_at: started_at.to_string(),
                prompt: self.plan.recorded_prompt().to_string(),
            },
        )
    }

    fn canceled(
        &self,
        guard: &mut StateGuard,
        completed: u32,
        last_reply: Option<String>,
        on_event: &mut impl FnMut(RepeatEvent<'_>),
    ) -> RepeatOutcome {
        guard.disarm();
        self.stop(
            StopReason::Canceled,
            "Loop canceled: state file removed.",
            completed,
            last_reply,
            on_event,
        )
    }

    fn stop(
        &self,
        stop: StopReason,
        message: &str,
        iterations: u32,
        last_reply: Option<String>,
        on_event: &mut impl FnMut(RepeatEvent<'_>),
    ) -> RepeatOutcome {
        info!(?stop, iterations, "repeat loop stopped");
        on_event(RepeatEvent::Stopped(stop, message));
        RepeatOutcome {
            stop,
            iterations,
            last_reply,
        }
    }

    fn status_line(&self, iteration: u32) -> String {
        match &self.config.completion_promise {
            Some(promise) => format!(
                "Iteration {iteration} | To stop: output <promise>{promise}</promise> \
                 (ONLY when the statement is TRUE, do not lie to exit)"
            ),
            None => format!(
                "Iteration {iteration} | No completion promise set, the loop runs until \
                 canceled or the iteration bound is reached"
            ),
        }
    }

    fn banner(&self) -> String {
        let state_file = format!("{CONFIG_DIR}/{STATE_FILE}");
        let promise_label = match &self.config.completion_promise {
            Some(promise) => format!("{promise} (ONLY output it when it is TRUE)"),
            None => "none (runs until canceled or the bound is reached)".to_string(),
        };
        let mut lines = vec![
            "Repeat loop started.".to_string(),
            String::new(),
            "Iteration: 1".to_string(),
            format!("Max iterations: {}", self.config.max_iterations),
            format!("Completion promise: {promise_label}"),
            String::new(),
            "The loop sends the SAME PROMPT every iteration.".to_string(),
            format!("Cancel by deleting {state_file} or running `codexloop repeat --cancel`."),
            format!("To monitor: head -10 {state_file}"),
            String::new(),
            self.plan.recorded_prompt().to_string(),
        ];
        if let Some(promise) = &self.config.completion_promise {
            lines.extend([
                String::new(),
                "To complete this loop, output this EXACT text:".to_string(),
                format!("  <promise>{promise}</promise>"),
                String::new(),
                "Rules:".to_string(),
                "  - Use the <promise> tags exactly as shown".to_string(),
                "  - The statement MUST be completely and unequivocally TRUE".to_string(),
                "  - Never output a false promise to escape the loop, even when stuck"
                    .to_string(),
            ]);
        }
        lines.join("\n")
    }
}

/// Removes the state file when the loop exits, unless a cancel already did.
struct StateGuard {
    path: PathBuf,
    armed: bool,
}

impl StateGuard {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = remove_loop_state(&self.path) {
            warn!(err = %err, path = %self.path.display(), "failed to remove loop state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::agent::AgentError;
    use crate::test_support::{ScriptedFactory, metrics_json};

    fn config(workdir: &Path) -> RepeatConfig {
        RepeatConfig {
            max_iterations: IterationBound::new(5),
            completion_promise: Some("done".to_string()),
            ..RepeatConfig::new(workdir)
        }
    }

    #[test]
    fn stops_on_promise_and_removes_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let factory = ScriptedFactory::new(["working", "all set <promise> done\n</promise>"]);
        let repeat = RepeatLoop::new(FixedPrompt::new("go"), &factory, config(temp.path()))
            .expect("loop");

        let outcome = repeat.run(|_| {}).expect("run");
        assert_eq!(outcome.stop, StopReason::Promise);
        assert_eq!(outcome.iterations, 2);
        assert!(!state_path(temp.path()).exists());
        assert_eq!(factory.sessions(), vec![None::<String>, None]);
        assert!(factory.prompts()[0].ends_with(PROMPT_SUFFIX));
    }

    #[test]
    fn promise_beats_bound_on_last_iteration() {
        let temp = tempfile::tempdir().expect("tempdir");
        let factory = ScriptedFactory::new(["<promise>done</promise>"]);
        let cfg = RepeatConfig {
            max_iterations: IterationBound::new(1),
            ..config(temp.path())
        };
        let outcome = RepeatLoop::new(FixedPrompt::new("go"), &factory, cfg)
            .expect("loop")
            .run(|_| {})
            .expect("run");
        assert_eq!(outcome.stop, StopReason::Promise);
    }

    #[test]
    fn reuse_mode_opens_one_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let factory = ScriptedFactory::new(["a", "b", "c"]);
        let cfg = RepeatConfig {
            max_iterations: IterationBound::new(3),
            completion_promise: None,
            session: SessionMode::Reuse,
            ..RepeatConfig::new(temp.path())
        };
        let outcome = RepeatLoop::new(FixedPrompt::new("go"), &factory, cfg)
            .expect("loop")
            .run(|_| {})
            .expect("run");
        assert_eq!(outcome.stop, StopReason::MaxIterations);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.last_reply.as_deref(), Some("c"));
        assert_eq!(factory.sessions().len(), 1);
    }

    #[test]
    fn agent_error_cleans_up_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let factory = ScriptedFactory::from_results([Err(AgentError::Interrupted)]);
        let err = RepeatLoop::new(FixedPrompt::new("go"), &factory, config(temp.path()))
            .expect("loop")
            .run(|_| {})
            .unwrap_err();
        assert!(
            err.downcast_ref::<AgentError>()
                .is_some_and(AgentError::is_interrupted)
        );
        assert!(!state_path(temp.path()).exists());
    }

    #[test]
    fn banner_spells_out_promise() {
        let temp = tempfile::tempdir().expect("tempdir");
        let factory = ScriptedFactory::new(["<promise>done</promise>"]);
        let mut banner = String::new();
        let mut statuses = Vec::new();
        RepeatLoop::new(FixedPrompt::new("go"), &factory, config(temp.path()))
            .expect("loop")
            .run(|event| match event {
                RepeatEvent::Banner(text) => banner = text.to_string(),
                RepeatEvent::Iteration(n, line) => statuses.push((n, line.to_string())),
                _ => {}
            })
            .expect("run");
        assert!(banner.contains("Max iterations: 5"));
        assert!(banner.contains("  <promise>done</promise>"));
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].1.starts_with("Iteration 1 | To stop"));
    }

    #[test]
    fn logbook_plan_appends_each_reply() {
        let temp = tempfile::tempdir().expect("tempdir");
        let factory = ScriptedFactory::new(["tried A", "tried B"]);
        let plan = LogbookPlan::new("speed up the parser", temp.path()).expect("plan");
        let cfg = RepeatConfig {
            max_iterations: IterationBound::new(2),
            completion_promise: None,
            ..RepeatConfig::new(temp.path())
        };
        RepeatLoop::new(plan, &factory, cfg)
            .expect("loop")
            .run(|_| {})
            .expect("run");

        let log = std::fs::read_to_string(logbook_path(temp.path())).expect("logbook");
        assert!(log.starts_with("## Iteration 1 - "));
        assert!(log.contains("tried A\n\n## Iteration 2 - "));
        let prompts = factory.prompts();
        assert!(!prompts[0].contains("This is iteration"));
        assert!(prompts[1].contains("This is iteration 2."));
    }

    #[test]
    fn logbook_plan_announces_new_best_and_remembers_it() {
        let temp = tempfile::tempdir().expect("tempdir");
        let factory = ScriptedFactory::new([
            "tried A: 41 MB/s".to_string(),
            metrics_json(
                true,
                "Cached the lexer tables.",
                &[("throughput", "41 MB/s", Some(12.5))],
            ),
            "tried B: slower".to_string(),
            metrics_json(false, "Regressed.", &[("throughput", "30 MB/s", None)]),
            "tried C".to_string(),
            "not json".to_string(),
        ]);
        let plan = LogbookPlan::new("speed up the parser", temp.path())
            .expect("plan")
            .with_metrics(MetricsExtractor::new(&factory));
        let cfg = RepeatConfig {
            max_iterations: IterationBound::new(3),
            completion_promise: None,
            ..RepeatConfig::new(temp.path())
        };
        let mut announcements = Vec::new();
        let outcome = RepeatLoop::new(plan, &factory, cfg)
            .expect("loop")
            .run(|event| {
                if let RepeatEvent::NewBest(line) = event {
                    announcements.push(line.to_string());
                }
            })
            .expect("run");

        assert_eq!(outcome.stop, StopReason::MaxIterations);
        assert_eq!(
            announcements,
            ["New best: throughput=41 MB/s (+12.50%)\nCached the lexer tables."]
        );
        let prompts = factory.prompts();
        assert!(prompts[1].contains("PREVIOUS BEST METRICS:\nNone"));
        assert!(prompts[3].contains("\"value\": \"41 MB/s\""));
        assert!(prompts[5].contains("\"value\": \"41 MB/s\""));
        factory.assert_drained();
    }

    #[test]
    fn interrupt_stops_loop_and_removes_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let interrupt = InterruptFlag::new();
        let raised = interrupt.clone();
        let factory = ScriptedFactory::responding(move |_| {
            raised.raise();
            Ok("working".to_string())
        });
        let err = RepeatLoop::new(FixedPrompt::new("go"), &factory, config(temp.path()))
            .expect("loop")
            .with_interrupt(interrupt)
            .run(|_| {})
            .unwrap_err();
        assert!(
            err.downcast_ref::<AgentError>()
                .is_some_and(AgentError::is_interrupted)
        );
        assert_eq!(factory.prompts().len(), 1);
        assert!(!state_path(temp.path()).exists());
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let factory = ScriptedFactory::new(Vec::<String>::new());
        let repeat = RepeatLoop::new(FixedPrompt::new("  "), &factory, config(temp.path()));
        assert!(repeat.is_err());
    }
}
