//! Bounded-concurrency task runs over a shared list file.
//!
//! The list file is the work queue: unmarked lines are pending, and every
//! claim or result is written back to it immediately. A rerun therefore picks
//! up exactly the lines that never started; `reset_list` returns finished
//! lines to the queue.
//!
//! After a Ctrl-C no new items are claimed. Items whose run was interrupted go
//! back to pending, and the run ends with [`AgentError::Interrupted`] once every
//! worker has stopped.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::thread;

use anyhow::{Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::status_line::{
    Marker, is_pending, marker_of, running_line, terminal_line, terminal_summary,
};
use crate::estimate::Estimator;
use crate::io::agent::{AgentError, AgentFactory};
use crate::io::config::TaskConfig;
use crate::io::interrupt::InterruptFlag;
use crate::io::list_file::ListFile;
use crate::io::task_file::TaskFile;
use crate::task::{PromptTask, TaskEvent, TaskLoop, TaskResult};

/// What one item run reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub success: bool,
    pub summary: String,
    pub iterations: Option<u32>,
    pub max_iterations: Option<u32>,
}

impl ItemOutcome {
    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            iterations: None,
            max_iterations: None,
        }
    }
}

impl From<TaskResult> for ItemOutcome {
    fn from(result: TaskResult) -> Self {
        Self {
            success: result.success,
            summary: result.summary,
            iterations: Some(result.iterations),
            max_iterations: Some(result.max_iterations.get()),
        }
    }
}

/// Executes one batch item. Shared by every worker thread.
pub trait ItemRunner: Sync {
    fn run_item(&self, item: &str) -> Result<ItemOutcome>;

    /// Iteration bound shown in turn counts when a run ends without a result.
    fn turn_limit(&self) -> Option<u32> {
        None
    }
}

impl<F> ItemRunner for F
where
    F: Fn(&str) -> Result<ItemOutcome> + Sync,
{
    fn run_item(&self, item: &str) -> Result<ItemOutcome> {
        self(item)
    }
}

/// Runs a task file for each item, each with its own working session.
pub struct TaskFileRunner<'a> {
    task_file: TaskFile,
    factory: &'a dyn AgentFactory,
    config: TaskConfig,
    interrupt: InterruptFlag,
}

impl<'a> TaskFileRunner<'a> {
    /// Fails when the task file has no `{{item}}` placeholder.
    pub fn new(
        task_file: TaskFile,
        factory: &'a dyn AgentFactory,
        config: TaskConfig,
    ) -> Result<Self> {
        if !task_file.uses_item() {
            bail!("task file must use {{{{item}}}} to run over a list");
        }
        Ok(Self {
            task_file,
            factory,
            config,
            interrupt: InterruptFlag::process(),
        })
    }

    /// Flag handed to every item's task loop. Defaults to the Ctrl-C flag.
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }
}

impl ItemRunner for TaskFileRunner<'_> {
    #[instrument(skip(self))]
    fn run_item(&self, item: &str) -> Result<ItemOutcome> {
        let definition = self
            .task_file
            .to_definition(Some(item), self.config.max_iterations)?;
        let task = PromptTask::new(definition.clone(), self.factory);
        let mut task_loop = TaskLoop::new(
            definition.prompt,
            definition.max_iterations,
            task,
            self.factory.session(None),
        )?
        .with_interrupt(self.interrupt.clone());
        if self.config.progress {
            task_loop = task_loop.with_progress(
                Estimator::new(self.factory),
                self.config.estimator_failure_limit,
            );
        }
        let result = task_loop.run(|event| {
            if let TaskEvent::Progress(line) = event {
                debug!(item, progress = %line, "item progress");
            }
        })?;
        Ok(result.into())
    }

    fn turn_limit(&self) -> Option<u32> {
        Some(
            self.task_file
                .max_iterations
                .unwrap_or(self.config.max_iterations)
                .get(),
        )
    }
}

/// Live counters, reported with every event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl fmt::Display for Counts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}, {}: {}, {}: {}",
            Marker::Running.as_char(),
            self.running,
            Marker::Succeeded.as_char(),
            self.succeeded,
            Marker::Failed.as_char(),
            self.failed
        )
    }
}

/// Events emitted while the list lock is held, so they arrive in file order.
#[derive(Debug, Clone, Copy)]
pub enum BatchEvent<'e> {
    Started { item: &'e str, counts: Counts },
    /// `line` is the terminal line as written to the file.
    Finished { line: &'e str, counts: Counts },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub item: String,
    pub success: bool,
    /// Summary column as written to the file, turn counts included.
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub succeeded: usize,
    pub failed: usize,
    /// Lines that already carried a marker when the run started.
    pub skipped: usize,
    /// In completion order.
    pub results: Vec<ItemReport>,
}

pub struct BatchRunner<R> {
    list_path: PathBuf,
    runner: R,
    concurrency: Option<usize>,
    interrupt: InterruptFlag,
}

impl<R: ItemRunner> BatchRunner<R> {
    /// `concurrency` of `None` runs every pending item at once.
    pub fn new(
        list_path: impl Into<PathBuf>,
        runner: R,
        concurrency: Option<usize>,
    ) -> Result<Self> {
        if concurrency == Some(0) {
            bail!("concurrency must be >= 1");
        }
        Ok(Self {
            list_path: list_path.into(),
            runner,
            concurrency,
            interrupt: InterruptFlag::process(),
        })
    }

    /// Defaults to the process-wide Ctrl-C flag.
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    #[instrument(
        skip_all,
        fields(list = %self.list_path.display(), concurrency = ?self.concurrency)
    )]
    pub fn run(&self, on_event: impl Fn(BatchEvent<'_>) + Sync) -> Result<BatchResult> {
        let list = ListFile::read(&self.list_path)?;
        let queue: VecDeque<(usize, String)> = list
            .lines
            .iter()
            .enumerate()
            .filter(|(_, line)| is_pending(line))
            .map(|(index, line)| (index, line.clone()))
            .collect();
        let skipped = list
            .lines
            .iter()
            .filter(|line| marker_of(line).is_some())
            .count();

        if queue.is_empty() {
            info!(skipped, "no pending items");
            return Ok(BatchResult {
                skipped,
                ..BatchResult::default()
            });
        }

        let workers = self.concurrency.unwrap_or(queue.len()).min(queue.len());
        info!(pending = queue.len(), skipped, workers, "starting batch");
        let shared = Mutex::new(Shared {
            list,
            queue,
            counts: Counts::default(),
            results: Vec::new(),
        });

        let errors: Vec<anyhow::Error> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| scope.spawn(|| self.work(&shared, &on_event)))
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| match handle.join() {
                    Ok(result) => result.err(),
                    Err(_) => Some(anyhow!("batch worker panicked")),
                })
                .collect()
        });
        if let Some(err) = errors.into_iter().next() {
            return Err(err);
        }
        if self.interrupt.is_raised() {
            warn!("batch interrupted, unfinished items left pending");
            return Err(AgentError::Interrupted.into());
        }

        let shared = shared
            .into_inner()
            .map_err(|_| anyhow!("batch state lock poisoned"))?;
        Ok(BatchResult {
            succeeded: shared.counts.succeeded,
            failed: shared.counts.failed,
            skipped,
            results: shared.results,
        })
    }

    /// Claim and run items until the queue is empty or an interrupt arrives.
    fn work(
        &self,
        shared: &Mutex<Shared>,
        on_event: &(impl Fn(BatchEvent<'_>) + Sync),
    ) -> Result<()> {
        loop {
            let (index, item) = {
                let mut state = lock(shared)?;
                if self.interrupt.is_raised() {
                    return Ok(());
                }
                let Some((index, item)) = state.queue.pop_front() else {
                    return Ok(());
                };
                state.list.lines[index] = running_line(&item);
                state.list.write(&self.list_path)?;
                state.counts.running += 1;
                on_event(BatchEvent::Started {
                    item: &item,
                    counts: state.counts,
                });
                (index, item)
            };

            let Some(outcome) = self.run_one(&item) else {
                let mut state = lock(shared)?;
                state.list.lines[index] = item;
                state.list.write(&self.list_path)?;
                state.counts.running -= 1;
                return Ok(());
            };
            let summary = terminal_summary(
                &outcome.summary,
                outcome.iterations,
                outcome.max_iterations.or_else(|| self.runner.turn_limit()),
            );
            let line = terminal_line(&item, outcome.success, &summary);

            let mut state = lock(shared)?;
            state.list.lines[index] = line.clone();
            state.list.write(&self.list_path)?;
            state.counts.running -= 1;
            if outcome.success {
                state.counts.succeeded += 1;
            } else {
                state.counts.failed += 1;
            }
            state.results.push(ItemReport {
                item,
                success: outcome.success,
                summary,
            });
            on_event(BatchEvent::Finished {
                line: &line,
                counts: state.counts,
            });
        }
    }

    /// Errors and panics become failed outcomes carrying their message.
    /// `None` means the item was interrupted and should stay pending.
    fn run_one(&self, item: &str) -> Option<ItemOutcome> {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.runner.run_item(item))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err))
                if err
                    .downcast_ref::<AgentError>()
                    .is_some_and(AgentError::is_interrupted) =>
            {
                info!(item, "item interrupted");
                return None;
            }
            Ok(Err(err)) => {
                warn!(item, err = %format!("{err:#}"), "item failed with an error");
                ItemOutcome::failed(format!("{err:#}"))
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(item, message, "item panicked");
                ItemOutcome::failed(format!("panicked: {message}"))
            }
        };
        Some(outcome)
    }
}

struct Shared {
    list: ListFile,
    queue: VecDeque<(usize, String)>,
    counts: Counts,
    results: Vec<ItemReport>,
}

fn lock(shared: &Mutex<Shared>) -> Result<MutexGuard<'_, Shared>> {
    shared
        .lock()
        .map_err(|_| anyhow!("batch state lock poisoned"))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn outcome(success: bool, summary: &str) -> ItemOutcome {
        ItemOutcome {
            success,
            summary: summary.to_string(),
            iterations: Some(1),
            max_iterations: Some(3),
        }
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let runner = |_: &str| -> Result<ItemOutcome> { Ok(outcome(true, "ok")) };
        assert!(BatchRunner::new("list.txt", runner, Some(0)).is_err());
    }

    #[test]
    fn marks_results_and_keeps_blank_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("items.txt");
        fs::write(&path, "a\n\n✅ b | done [turns: 1/3]\nc").expect("write");

        let runner =
            |item: &str| -> Result<ItemOutcome> { Ok(outcome(item == "a", "multi\nline")) };
        let result = BatchRunner::new(&path, runner, Some(1))
            .expect("runner")
            .run(|_| {})
            .expect("run");

        assert_eq!((result.succeeded, result.failed, result.skipped), (1, 1, 1));
        let text = fs::read_to_string(&path).expect("read");
        assert_eq!(
            text,
            concat!(
                "✅ a | multi line [turns: 1/3]\n\n",
                "✅ b | done [turns: 1/3]\n",
                "❌ c | multi line [turns: 1/3]"
            )
        );
        let order: Vec<_> = result.results.iter().map(|r| r.item.as_str()).collect();
        assert_eq!(order, ["a", "c"]);
    }

    #[test]
    fn errors_and_panics_fail_only_their_item() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("items.txt");
        fs::write(&path, "boom\npanic\nfine\n").expect("write");

        let runner = |item: &str| -> Result<ItemOutcome> {
            match item {
                "boom" => Err(anyhow!("agent exited with code 2")),
                "panic" => panic!("worker exploded"),
                _ => Ok(outcome(true, "ok")),
            }
        };
        let result = BatchRunner::new(&path, runner, Some(3))
            .expect("runner")
            .run(|_| {})
            .expect("run");

        assert_eq!((result.succeeded, result.failed), (1, 2));
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("❌ boom | agent exited with code 2 [turns: ?/?]\n"));
        assert!(text.contains("❌ panic | panicked: worker exploded [turns: ?/?]\n"));
        assert!(text.contains("✅ fine | ok [turns: 1/3]\n"));
    }

    #[test]
    fn interrupted_item_goes_back_to_pending() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("items.txt");
        fs::write(&path, "a\nb\nc\n").expect("write");

        let interrupt = InterruptFlag::new();
        let runner = |item: &str| -> Result<ItemOutcome> {
            match item {
                "a" => Ok(outcome(true, "ok")),
                _ => {
                    interrupt.raise();
                    Err(AgentError::Interrupted.into())
                }
            }
        };
        let started = Mutex::new(Vec::new());
        let err = BatchRunner::new(&path, runner, Some(1))
            .expect("runner")
            .with_interrupt(interrupt.clone())
            .run(|event| {
                if let BatchEvent::Started { item, .. } = event {
                    started.lock().expect("lock").push(item.to_string());
                }
            })
            .unwrap_err();

        assert!(
            err.downcast_ref::<AgentError>()
                .is_some_and(AgentError::is_interrupted)
        );
        assert_eq!(*started.lock().expect("lock"), ["a", "b"]);
        let text = fs::read_to_string(&path).expect("read");
        assert_eq!(text, "✅ a | ok [turns: 1/3]\nb\nc\n");
    }

    #[test]
    fn counts_render_with_markers() {
        let counts = Counts {
            running: 2,
            succeeded: 1,
            failed: 0,
        };
        assert_eq!(counts.to_string(), "⏳: 2, ✅: 1, ❌: 0");
    }
}
