//! Append-only run log (`LOGBOOK.md`) written by science-style repeat loops.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const LOGBOOK_FILE: &str = "LOGBOOK.md";

pub fn logbook_path(workdir: &Path) -> PathBuf {
    workdir.join(LOGBOOK_FILE)
}

/// `## Iteration N - <timestamp>`, blank line, reply, blank line.
pub fn render_entry(iteration: u32, timestamp: &str, reply: &str) -> String {
    format!("## Iteration {iteration} - {timestamp}\n\n{}\n\n", reply.trim_end())
}

/// Append one entry. Existing content is never rewritten.
pub fn append_entry(path: &Path, iteration: u32, timestamp: &str, reply: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(render_entry(iteration, timestamp, reply).as_bytes())
        .with_context(|| format!("append to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_accumulate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = logbook_path(temp.path());
        append_entry(&path, 1, "2026-01-01T00:00:00Z", "first\n\n").expect("append");
        append_entry(&path, 2, "2026-01-01T01:00:00Z", "second").expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(
            text,
            "## Iteration 1 - 2026-01-01T00:00:00Z\n\nfirst\n\n## Iteration 2 - 2026-01-01T01:00:00Z\n\nsecond\n\n"
        );
    }
}
