//! Agent backend abstraction.
//!
//! The [`Agent`] trait decouples the loops from the process that does the
//! work (currently `codex exec`). Tests use scripted agents that return
//! predetermined replies without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::config::AgentConfig;
use super::interrupt::InterruptFlag;
use super::process::run_command;

/// Why an agent invocation produced no usable reply.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent exited with code {code}{}", stderr_suffix(.stderr))]
    Exit { code: i32, stderr: String },

    #[error("agent timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("agent was interrupted")]
    Interrupted,

    #[error("agent returned no message. Raw output:\n{raw}")]
    NoMessage { raw: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, AgentError::Interrupted)
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!("\n{stderr}")
    }
}

/// One conversational session with the agent.
pub trait Agent {
    /// Send a prompt and block until the agent's reply is available.
    fn invoke(&mut self, prompt: &str) -> Result<String, AgentError>;

    /// Token that lets a later session resume this conversation.
    fn session_id(&self) -> Option<&str> {
        None
    }
}

/// Creates sessions. Shared across worker threads by batch runs.
pub trait AgentFactory: Send + Sync {
    /// A new session, optionally resuming an earlier conversation.
    fn session(&self, resume: Option<String>) -> Box<dyn Agent + Send>;
}

/// Stateless call: fresh session, single prompt.
pub fn ask(factory: &dyn AgentFactory, prompt: &str) -> Result<String, AgentError> {
    factory.session(None).invoke(prompt)
}

/// Session backed by `codex exec --json`.
#[derive(Debug, Clone)]
pub struct CodexAgent {
    config: Arc<AgentConfig>,
    workdir: Option<PathBuf>,
    thread_id: Option<String>,
}

impl CodexAgent {
    pub fn new(
        config: Arc<AgentConfig>,
        workdir: Option<PathBuf>,
        thread_id: Option<String>,
    ) -> Self {
        Self {
            config,
            workdir,
            thread_id,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(self.config.resolved_bin());
        cmd.arg("exec")
            .arg("--json")
            .arg("--color")
            .arg("never")
            .arg("--skip-git-repo-check")
            .arg(if self.config.yolo {
                "--yolo"
            } else {
                "--full-auto"
            })
            .args(&self.config.flags);
        if let Some(dir) = &self.workdir {
            cmd.arg("--cd").arg(dir).current_dir(dir);
        }
        match &self.thread_id {
            Some(thread_id) => {
                cmd.arg("resume").arg(thread_id).arg("-");
            }
            None => {
                cmd.arg("-");
            }
        }
        cmd
    }
}

impl Agent for CodexAgent {
    #[instrument(skip_all, fields(resume = self.thread_id.is_some()))]
    fn invoke(&mut self, prompt: &str) -> Result<String, AgentError> {
        info!(workdir = ?self.workdir, "starting codex exec");
        let limits = self.config.limits();
        let output = run_command(self.command(), Some(prompt.as_bytes()), limits)
            .map_err(|err| AgentError::Other(err.context("run codex exec")))?;

        if output.timed_out {
            return Err(AgentError::TimedOut {
                secs: limits.timeout.as_secs(),
            });
        }
        if output.killed_by_signal() {
            warn!("codex exec killed by signal");
            return Err(AgentError::Interrupted);
        }
        // A child that traps SIGINT exits non-zero instead of dying by signal.
        if !output.status.success() && InterruptFlag::process().is_raised() {
            warn!("codex exec ended after Ctrl-C");
            return Err(AgentError::Interrupted);
        }
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!(exit_code = code, "codex exec failed");
            return Err(AgentError::Exit {
                code,
                stderr: output.stderr_lossy().trim().to_string(),
            });
        }

        let parsed = parse_event_stream(&output.stdout_lossy())?;
        if let Some(thread_id) = parsed.thread_id {
            self.thread_id = Some(thread_id);
        }
        debug!(bytes = parsed.message.len(), "codex exec completed");
        Ok(parsed.message)
    }

    fn session_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }
}

/// Factory producing [`CodexAgent`] sessions in one working directory.
#[derive(Debug, Clone)]
pub struct CodexFactory {
    config: Arc<AgentConfig>,
    workdir: Option<PathBuf>,
}

impl CodexFactory {
    pub fn new(config: AgentConfig, workdir: Option<PathBuf>) -> Self {
        Self {
            config: Arc::new(config),
            workdir,
        }
    }
}

impl AgentFactory for CodexFactory {
    fn session(&self, resume: Option<String>) -> Box<dyn Agent + Send> {
        Box::new(CodexAgent::new(
            Arc::clone(&self.config),
            self.workdir.clone(),
            resume,
        ))
    }
}

/// Reply text and session token recovered from the JSONL event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStream {
    pub message: String,
    pub thread_id: Option<String>,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    thread_id: Option<String>,
    item: Option<StreamItem>,
}

#[derive(Deserialize)]
struct StreamItem {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

/// Collect agent messages (joined by a blank line) and the latest thread id.
pub fn parse_event_stream(stdout: &str) -> Result<ParsedStream, AgentError> {
    let mut thread_id = None;
    let mut messages = Vec::new();
    let mut raw_lines = Vec::new();

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(event) = serde_json::from_str::<StreamEvent>(line) else {
            raw_lines.push(line);
            continue;
        };
        match event.kind.as_str() {
            "thread.started" => {
                if let Some(id) = event.thread_id {
                    thread_id = Some(id);
                }
            }
            "item.completed" => {
                if let Some(item) = event.item
                    && item.kind == "agent_message"
                    && let Some(text) = item.text
                {
                    messages.push(text);
                }
            }
            _ => {}
        }
    }

    if messages.is_empty() {
        let raw = if raw_lines.is_empty() {
            stdout.trim().to_string()
        } else {
            raw_lines.join("\n")
        };
        return Err(AgentError::NoMessage { raw });
    }

    Ok(ParsedStream {
        message: messages.join("\n\n"),
        thread_id,
    })
}
