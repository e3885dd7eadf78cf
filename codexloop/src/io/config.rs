//! Configuration stored under `.codexloop/config.toml`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::process::ProcessLimits;
use crate::core::bound::IterationBound;

pub const CONFIG_DIR: &str = ".codexloop";
pub const CONFIG_FILE: &str = "config.toml";
/// Environment override for the agent executable.
pub const BIN_ENV: &str = "CODEX_BIN";

/// Loop configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    pub agent: AgentConfig,
    pub task: TaskConfig,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable. `CODEX_BIN` wins when set.
    pub bin: String,
    /// Pass `--yolo` (true) or `--full-auto` (false).
    pub yolo: bool,
    /// Extra arguments appended after the fixed ones.
    pub flags: Vec<String>,
    /// Wall-clock limit for a single invocation.
    pub timeout_secs: u64,
    /// Truncate captured agent output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bin: "codex".to_string(),
            yolo: true,
            flags: Vec::new(),
            timeout_secs: 2 * 60 * 60,
            output_limit_bytes: 10_000_000,
        }
    }
}

impl AgentConfig {
    pub fn limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
        }
    }

    /// Executable to run, honoring the environment override.
    pub fn resolved_bin(&self) -> String {
        std::env::var(BIN_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| self.bin.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskConfig {
    /// Iteration bound for task loops when none is given (0 = unlimited).
    pub max_iterations: IterationBound,
    /// Emit estimator-driven progress lines.
    pub progress: bool,
    /// Stop estimating after this many consecutive estimator failures (0 = never).
    pub estimator_failure_limit: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_iterations: IterationBound::new(10),
            progress: true,
            estimator_failure_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatchConfig {
    /// Worker limit. Absent means one worker per pending item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.bin.trim().is_empty() {
            return Err(anyhow!("agent.bin must not be empty"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.batch.concurrency == Some(0) {
            return Err(anyhow!("batch.concurrency must be >= 1"));
        }
        Ok(())
    }
}

/// Canonical config path for a working directory.
pub fn config_path(workdir: &Path) -> PathBuf {
    workdir.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

/// Loaded configs keyed by path, each read from disk at most once.
///
/// Callers own the store and pass it where needed instead of relying on a
/// process-wide cache.
#[derive(Debug, Default)]
pub struct ConfigStore {
    loaded: Mutex<HashMap<PathBuf, Arc<RunnerConfig>>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the config at `path`, loading it on first use.
    pub fn get(&self, path: &Path) -> Result<Arc<RunnerConfig>> {
        let mut loaded = self
            .loaded
            .lock()
            .map_err(|_| anyhow!("config store lock poisoned"))?;
        if let Some(cfg) = loaded.get(path) {
            return Ok(Arc::clone(cfg));
        }
        debug!(path = %path.display(), "loading config");
        let cfg = Arc::new(load_config(path)?);
        loaded.insert(path.to_path_buf(), Arc::clone(&cfg));
        Ok(cfg)
    }

    /// Config for a working directory (`<workdir>/.codexloop/config.toml`).
    pub fn for_workdir(&self, workdir: &Path) -> Result<Arc<RunnerConfig>> {
        self.get(&config_path(workdir))
    }
}
