//! Persisted state for repeat loops (`.codexloop/repeat-loop.local.md`).
//!
//! The file doubles as the cancellation channel: deleting it asks a running
//! loop to stop at its next poll.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::config::CONFIG_DIR;
use crate::core::bound::IterationBound;

pub const STATE_FILE: &str = "repeat-loop.local.md";

/// Snapshot written before every iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    pub iteration: u32,
    pub max_iterations: IterationBound,
    pub completion_promise: Option<String>,
    /// UTC, `%Y-%m-%dT%H:%M:%SZ`.
    pub started_at: String,
    pub prompt: String,
}

impl LoopState {
    /// Frontmatter block, blank line, verbatim prompt.
    pub fn render(&self) -> String {
        let promise = match &self.completion_promise {
            Some(text) => format!("\"{text}\""),
            None => "null".to_string(),
        };
        [
            "---".to_string(),
            "active: true".to_string(),
            format!("iteration: {}", self.iteration),
            format!("max_iterations: {}", self.max_iterations.get()),
            format!("completion_promise: {promise}"),
            format!("started_at: \"{}\"", self.started_at),
            "---".to_string(),
            String::new(),
            self.prompt.clone(),
        ]
        .join("\n")
    }
}

/// Current UTC time as `%Y-%m-%dT%H:%M:%SZ`.
pub fn utc_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// State file location for a working directory.
pub fn state_path(workdir: &Path) -> PathBuf {
    workdir.join(CONFIG_DIR).join(STATE_FILE)
}

/// Atomically write the state file (temp file + rename).
pub fn write_loop_state(path: &Path, state: &LoopState) -> Result<()> {
    debug!(path = %path.display(), iteration = state.iteration, "writing loop state");
    super::write_atomic(path, &state.render())
}

/// Read the frontmatter fields of a state file as raw `(key, value)` pairs.
pub fn read_state_fields(path: &Path) -> Result<Vec<(String, String)>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(parse_frontmatter(&contents))
}

/// Remove the state file. Returns false when it was already gone.
pub fn remove_loop_state(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

/// Cancel a running loop by deleting its state file.
pub fn cancel_repeat_loop(workdir: &Path) -> Result<String> {
    let path = state_path(workdir);
    if !path.exists() {
        return Ok("No active loop state found.".to_string());
    }

    let iteration = match read_state_fields(&path) {
        Ok(fields) => fields
            .iter()
            .find(|(key, _)| key == "iteration")
            .and_then(|(_, value)| value.parse::<u32>().ok()),
        Err(err) => {
            warn!(err = %err, "could not read loop state before cancel");
            None
        }
    };

    remove_loop_state(&path)?;
    Ok(match iteration {
        Some(n) => format!("Canceled loop at iteration {n}."),
        None => "Canceled loop.".to_string(),
    })
}

fn parse_frontmatter(contents: &str) -> Vec<(String, String)> {
    let mut lines = contents.lines();
    if lines.next().map(str::trim) != Some("---") {
        return Vec::new();
    }
    lines
        .take_while(|line| line.trim() != "---")
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LoopState {
        LoopState {
            iteration: 3,
            max_iterations: IterationBound::new(10),
            completion_promise: Some("done".to_string()),
            started_at: "2026-01-02T03:04:05Z".to_string(),
            prompt: "fix the build\nthen stop".to_string(),
        }
    }

    #[test]
    fn render_is_stable() {
        let expected = "---\nactive: true\niteration: 3\nmax_iterations: 10\ncompletion_promise: \"done\"\nstarted_at: \"2026-01-02T03:04:05Z\"\n---\n\nfix the build\nthen stop";
        assert_eq!(sample().render(), expected);
    }

    #[test]
    fn missing_promise_renders_null() {
        let state = LoopState {
            completion_promise: None,
            ..sample()
        };
        assert!(state.render().contains("completion_promise: null\n"));
    }

    #[test]
    fn write_replaces_and_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = state_path(temp.path());
        write_loop_state(&path, &sample()).expect("write");
        let next = LoopState {
            iteration: 4,
            ..sample()
        };
        write_loop_state(&path, &next).expect("rewrite");

        let fields = read_state_fields(&path).expect("fields");
        assert!(fields.contains(&("iteration".to_string(), "4".to_string())));
        let entries: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn cancel_reports_iteration_and_removes_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = state_path(temp.path());
        write_loop_state(&path, &sample()).expect("write");

        let message = cancel_repeat_loop(temp.path()).expect("cancel");
        assert_eq!(message, "Canceled loop at iteration 3.");
        assert!(!path.exists());

        let again = cancel_repeat_loop(temp.path()).expect("cancel again");
        assert_eq!(again, "No active loop state found.");
    }

    #[test]
    fn cancel_without_frontmatter_still_removes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = state_path(temp.path());
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "garbage").expect("write");
        assert_eq!(cancel_repeat_loop(temp.path()).expect("cancel"), "Canceled loop.");
        assert!(!path.exists());
    }

    #[test]
    fn timestamp_has_utc_shape() {
        let stamp = utc_timestamp();
        assert_eq!(stamp.len(), 20);
        assert!(stamp.ends_with('Z'));
        assert_eq!(&stamp[10..11], "T");
    }

    #[test]
    fn remove_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = state_path(temp.path());
        assert!(!remove_loop_state(&path).expect("remove missing"));
    }
}
