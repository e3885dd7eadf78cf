//! Drive a coding agent until its work converges.
//!
//! `task` verifies and retries, `repeat`/`science` resend a prompt until a
//! completion promise or the state file says stop, and `foreach` runs a task
//! file over every line of a list file.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use codexloop::batch::{BatchEvent, BatchRunner, TaskFileRunner};
use codexloop::core::bound::IterationBound;
use codexloop::core::status_line::running_line;
use codexloop::estimate::Estimator;
use codexloop::exit_codes;
use codexloop::io::agent::{AgentError, AgentFactory, CodexFactory};
use codexloop::io::config::{ConfigStore, RunnerConfig};
use codexloop::io::interrupt;
use codexloop::io::list_file::{ResetScope, reset_list};
use codexloop::io::loop_state::cancel_repeat_loop;
use codexloop::io::task_file::{create_task_file, load_task_file};
use codexloop::metrics::MetricsExtractor;
use codexloop::repeat::{
    FixedPrompt, LogbookPlan, RepeatConfig, RepeatEvent, RepeatLoop, RepeatPlan, SessionMode,
};
use codexloop::task::{CheckPolicy, PromptTask, TaskDefinition, TaskEvent, TaskLoop};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "codexloop",
    version,
    about = "Drive a coding agent until the work converges"
)]
struct Cli {
    /// Working directory for the agent, loop state, and config.
    #[arg(long, global = true, value_name = "DIR")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one prompt and print the reply.
    Run {
        /// Prompt text, or `-` (or nothing) to read stdin.
        prompt: Option<String>,
        /// Resume an earlier conversation.
        #[arg(long)]
        thread_id: Option<String>,
        /// Print `thread_id=<token>` to stderr after the reply.
        #[arg(long)]
        print_thread_id: bool,
    },
    /// Run a task, verify it, and retry with feedback until it passes.
    Task {
        /// Prompt text, or `-` (or nothing) to read stdin.
        #[arg(conflicts_with = "file")]
        prompt: Option<String>,
        /// Load the task from a TOML task file.
        #[arg(short = 'f', long, value_name = "FILE")]
        file: Option<PathBuf>,
        /// Value substituted for `{{item}}` in the task file.
        #[arg(long, requires = "file")]
        item: Option<String>,
        /// How to verify the work. `None` skips verification.
        #[arg(long, conflicts_with = "file")]
        check: Option<String>,
        /// Iteration bound (0 = unlimited).
        #[arg(long, conflicts_with = "file")]
        max_iterations: Option<u32>,
        /// Hide agent replies and verdicts.
        #[arg(short, long)]
        quiet: bool,
    },
    /// Resend a prompt until a completion promise appears or the loop is canceled.
    Repeat(RepeatArgs),
    /// Like `repeat`, keeping a logbook of every iteration in LOGBOOK.md.
    Science(RepeatArgs),
    /// Run a task file for each pending line of a list file.
    Foreach {
        /// List file, one item per line. Status is written back in place.
        list: PathBuf,
        /// Task file using `{{item}}`.
        task_file: PathBuf,
        /// Maximum concurrent items (default: all pending).
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
        /// Return failed lines to the queue first.
        #[arg(long, conflicts_with = "retry_all")]
        retry_failed: bool,
        /// Return every finished or stale line to the queue first.
        #[arg(long)]
        retry_all: bool,
    },
    /// Write a commented task file template.
    Create {
        /// Destination (`.toml` is appended when missing).
        file: PathBuf,
    },
}

#[derive(Args)]
struct RepeatArgs {
    /// Prompt text, or `-` (or nothing) to read stdin.
    #[arg(conflicts_with = "cancel")]
    prompt: Option<String>,
    /// Iteration bound (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_iterations: u32,
    /// Stop once a reply contains `<promise>TEXT</promise>`.
    #[arg(long, value_name = "TEXT")]
    completion_promise: Option<String>,
    /// Keep one agent session across iterations.
    #[arg(long)]
    reuse: bool,
    /// Cancel the active loop in the working directory.
    #[arg(long)]
    cancel: bool,
}

fn main() {
    codexloop::logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    interrupt::install_handler()?;
    let workdir = cli.cwd.clone().unwrap_or_else(|| PathBuf::from("."));
    if !workdir.is_dir() {
        bail!("working directory does not exist: {}", workdir.display());
    }
    let store = ConfigStore::new();
    let config = store.for_workdir(&workdir)?;
    let factory = CodexFactory::new(config.agent.clone(), cli.cwd.clone());

    match cli.command {
        Command::Run {
            prompt,
            thread_id,
            print_thread_id,
        } => cmd_run(&factory, prompt, thread_id, print_thread_id),
        Command::Task {
            prompt,
            file,
            item,
            check,
            max_iterations,
            quiet,
        } => {
            let definition = match file {
                Some(path) => load_task_file(&path)?
                    .to_definition(item.as_deref(), config.task.max_iterations)?,
                None => TaskDefinition::new(read_prompt(prompt)?)?
                    .with_check(CheckPolicy::from_text(check.as_deref()))
                    .with_max_iterations(
                        max_iterations
                            .map(IterationBound::new)
                            .unwrap_or(config.task.max_iterations),
                    ),
            };
            cmd_task(&factory, &config, definition, quiet)
        }
        Command::Repeat(args) => cmd_repeat(&factory, &workdir, args, false),
        Command::Science(args) => cmd_repeat(&factory, &workdir, args, true),
        Command::Foreach {
            list,
            task_file,
            concurrency,
            retry_failed,
            retry_all,
        } => {
            let retry = match (retry_failed, retry_all) {
                (_, true) => Some(ResetScope::All),
                (true, false) => Some(ResetScope::Failed),
                (false, false) => None,
            };
            cmd_foreach(&factory, &config, &list, &task_file, concurrency, retry)
        }
        Command::Create { file } => {
            let written = create_task_file(&file)?;
            println!("Created {}", written.display());
            Ok(exit_codes::OK)
        }
    }
}

/// Interrupted agents exit 130 like the signal would; everything else is 1.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<AgentError>() {
        Some(agent_err) if agent_err.is_interrupted() => exit_codes::INTERRUPTED,
        _ => exit_codes::FAILED,
    }
}

/// `-` or a missing argument means the prompt comes from stdin.
fn read_prompt(arg: Option<String>) -> Result<String> {
    let prompt = match arg {
        Some(text) if text != "-" => text,
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read prompt from stdin")?;
            buf
        }
    };
    if prompt.trim().is_empty() {
        bail!("prompt must not be empty");
    }
    Ok(prompt)
}

fn cmd_run(
    factory: &dyn AgentFactory,
    prompt: Option<String>,
    thread_id: Option<String>,
    print_thread_id: bool,
) -> Result<i32> {
    let prompt = read_prompt(prompt)?;
    let mut session = factory.session(thread_id);
    let reply = session.invoke(&prompt)?;
    println!("{}", reply.trim_end());
    if print_thread_id && let Some(id) = session.session_id() {
        eprintln!("thread_id={id}");
    }
    Ok(exit_codes::OK)
}

fn cmd_task(
    factory: &dyn AgentFactory,
    config: &RunnerConfig,
    definition: TaskDefinition,
    quiet: bool,
) -> Result<i32> {
    let task = PromptTask::new(definition.clone(), factory);
    let mut task_loop = TaskLoop::new(
        definition.prompt,
        definition.max_iterations,
        task,
        factory.session(None),
    )?;
    if config.task.progress {
        task_loop = task_loop.with_progress(
            Estimator::new(factory),
            config.task.estimator_failure_limit,
        );
    }

    let result = task_loop.run(|event| match event {
        TaskEvent::Reply(text) if !quiet => println!("{}", text.trim_end()),
        TaskEvent::Verdict(verdict) if !quiet => {
            let label = if verdict.success { "passed" } else { "failed" };
            println!("check {label}: {}", verdict.reason);
        }
        TaskEvent::Progress(line) => println!("{line}"),
        _ => {}
    })?;

    println!("{}", result.summary.trim_end());
    info!(
        success = result.success,
        iterations = result.iterations,
        "task finished"
    );
    Ok(if result.success {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_repeat(
    factory: &dyn AgentFactory,
    workdir: &Path,
    args: RepeatArgs,
    science: bool,
) -> Result<i32> {
    if args.cancel {
        println!("{}", cancel_repeat_loop(workdir)?);
        return Ok(exit_codes::OK);
    }
    let prompt = read_prompt(args.prompt)?;
    let mut config = RepeatConfig::new(workdir);
    config.max_iterations = IterationBound::new(args.max_iterations);
    config.completion_promise = args.completion_promise;
    if args.reuse {
        config.session = SessionMode::Reuse;
    }

    if science {
        let plan =
            LogbookPlan::new(&prompt, workdir)?.with_metrics(MetricsExtractor::new(factory));
        run_repeat(plan, factory, config)
    } else {
        run_repeat(FixedPrompt::new(prompt), factory, config)
    }
}

fn run_repeat(
    plan: impl RepeatPlan,
    factory: &dyn AgentFactory,
    config: RepeatConfig,
) -> Result<i32> {
    let outcome = RepeatLoop::new(plan, factory, config)?.run(|event| match event {
        RepeatEvent::Banner(text) => println!("{text}"),
        RepeatEvent::Iteration(_, line) => println!("{line}"),
        RepeatEvent::Reply(text) => println!("{}", text.trim_end()),
        RepeatEvent::NewBest(text) => println!("{text}"),
        RepeatEvent::Stopped(_, message) => println!("{message}"),
    })?;
    info!(stop = ?outcome.stop, iterations = outcome.iterations, "repeat loop finished");
    Ok(exit_codes::OK)
}

fn cmd_foreach(
    factory: &dyn AgentFactory,
    config: &RunnerConfig,
    list: &Path,
    task_file: &Path,
    concurrency: Option<usize>,
    retry: Option<ResetScope>,
) -> Result<i32> {
    if let Some(scope) = retry {
        let reset = reset_list(list, scope)?;
        println!("Reset {reset} line(s) in {}", list.display());
    }
    let runner = TaskFileRunner::new(load_task_file(task_file)?, factory, config.task.clone())?;
    let batch = BatchRunner::new(list, runner, concurrency.or(config.batch.concurrency))?;

    let result = batch.run(|event| match event {
        BatchEvent::Started { item, counts } => println!("{} ({counts})", running_line(item)),
        BatchEvent::Finished { line, counts } => println!("{line} ({counts})"),
    })?;

    println!(
        "Done: {} succeeded, {} failed, {} skipped",
        result.succeeded, result.failed, result.skipped
    );
    Ok(if result.failed == 0 {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_task_with_file_and_item() {
        let cli = Cli::parse_from(["codexloop", "task", "-f", "port.toml", "--item", "parser"]);
        match cli.command {
            Command::Task { file, item, .. } => {
                assert_eq!(file, Some(PathBuf::from("port.toml")));
                assert_eq!(item.as_deref(), Some("parser"));
            }
            _ => panic!("expected task command"),
        }
    }

    #[test]
    fn item_requires_file() {
        assert!(Cli::try_parse_from(["codexloop", "task", "do it", "--item", "x"]).is_err());
    }

    #[test]
    fn retry_flags_conflict() {
        let parsed = Cli::try_parse_from([
            "codexloop",
            "foreach",
            "list.txt",
            "task.toml",
            "--retry-failed",
            "--retry-all",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn global_cwd_after_subcommand() {
        let cli = Cli::parse_from(["codexloop", "repeat", "--cancel", "--cwd", "/tmp/work"]);
        assert_eq!(cli.cwd, Some(PathBuf::from("/tmp/work")));
        assert!(matches!(cli.command, Command::Repeat(RepeatArgs { cancel: true, .. })));
    }

    #[test]
    fn interrupted_agent_maps_to_130() {
        let err = anyhow::Error::new(AgentError::Interrupted).context("iteration 2");
        assert_eq!(exit_code_for(&err), exit_codes::INTERRUPTED);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), exit_codes::FAILED);
    }
}
