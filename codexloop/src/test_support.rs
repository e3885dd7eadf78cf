//! Scripted agents for driving loops without spawning processes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;

use crate::io::agent::{Agent, AgentError, AgentFactory};

pub type Reply = Result<String, AgentError>;

type Responder = Box<dyn Fn(&str) -> Reply + Send + Sync>;

enum Source {
    Queue(VecDeque<Reply>),
    Responder(Responder),
}

struct Script {
    source: Source,
    prompts: Vec<String>,
    resumed: Vec<Option<String>>,
}

/// Factory whose sessions all answer from one shared script.
///
/// Replies are consumed in call order across every session the factory has
/// handed out. An exhausted queue answers with an error instead of panicking.
#[derive(Clone)]
pub struct ScriptedFactory {
    script: Arc<Mutex<Script>>,
}

impl ScriptedFactory {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_results(replies.into_iter().map(|reply| Ok(reply.into())))
    }

    pub fn from_results<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Reply>,
    {
        Self::with_source(Source::Queue(replies.into_iter().collect()))
    }

    /// Answer every prompt with `respond(prompt)`. Useful when calls interleave.
    pub fn responding(respond: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        Self::with_source(Source::Responder(Box::new(respond)))
    }

    fn with_source(source: Source) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                source,
                prompts: Vec::new(),
                resumed: Vec::new(),
            })),
        }
    }

    /// Every prompt received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.script).prompts.clone()
    }

    /// Resume token passed to each session, one entry per session opened.
    pub fn sessions(&self) -> Vec<Option<String>> {
        lock(&self.script).resumed.clone()
    }

    pub fn remaining(&self) -> usize {
        match &lock(&self.script).source {
            Source::Queue(queue) => queue.len(),
            Source::Responder(_) => 0,
        }
    }

    /// Panic if scripted replies were left unused.
    pub fn assert_drained(&self) {
        let remaining = self.remaining();
        assert_eq!(remaining, 0, "{remaining} scripted replies were never used");
    }
}

impl AgentFactory for ScriptedFactory {
    fn session(&self, resume: Option<String>) -> Box<dyn Agent + Send> {
        let index = {
            let mut script = lock(&self.script);
            script.resumed.push(resume.clone());
            script.resumed.len()
        };
        Box::new(ScriptedAgent {
            script: Arc::clone(&self.script),
            session_id: resume.or_else(|| Some(format!("scripted-{index}"))),
        })
    }
}

/// One session handed out by a [`ScriptedFactory`].
pub struct ScriptedAgent {
    script: Arc<Mutex<Script>>,
    session_id: Option<String>,
}

impl Agent for ScriptedAgent {
    fn invoke(&mut self, prompt: &str) -> Result<String, AgentError> {
        let mut script = lock(&self.script);
        script.prompts.push(prompt.to_string());
        match &mut script.source {
            Source::Queue(queue) => queue.pop_front().unwrap_or_else(|| {
                Err(AgentError::Other(anyhow!(
                    "scripted agent has no reply left for prompt: {prompt}"
                )))
            }),
            Source::Responder(respond) => respond(prompt),
        }
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Verifier reply JSON.
pub fn verdict_json(success: bool, reason: &str) -> String {
    serde_json::json!({ "success": success, "reason": reason }).to_string()
}

/// Estimator reply JSON.
pub fn estimate_json(remaining: f64, summary: &str) -> String {
    serde_json::json!({ "remaining": remaining, "summary": summary }).to_string()
}

/// Metrics extractor reply JSON; each metric is `(name, value, improvement_pct)`.
pub fn metrics_json(
    new_improvement: bool,
    summary: &str,
    metrics: &[(&str, &str, Option<f64>)],
) -> String {
    let metrics: Vec<_> = metrics
        .iter()
        .map(|(name, value, pct)| {
            serde_json::json!({ "name": name, "value": value, "improvement_pct": pct })
        })
        .collect();
    serde_json::json!({
        "new_improvement": new_improvement,
        "summary": summary,
        "metrics": metrics,
    })
    .to_string()
}
