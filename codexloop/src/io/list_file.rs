//! Batch list files: one item per line, status tracked in place.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::status_line::{Marker, marker_of, strip_status};

/// Lines of a list file plus whether the file ended with a newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFile {
    pub lines: Vec<String>,
    pub ends_with_newline: bool,
}

impl ListFile {
    pub fn parse(data: &str) -> Self {
        Self {
            lines: data.lines().map(str::to_string).collect(),
            ends_with_newline: data.ends_with('\n'),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Ok(Self::parse(&data))
    }

    pub fn render(&self) -> String {
        let mut text = self.lines.join("\n");
        if self.ends_with_newline {
            text.push('\n');
        }
        text
    }

    /// Rewrite the whole file in place and flush it.
    ///
    /// The file is truncated rather than renamed so `tail -f` keeps following it.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path).with_context(|| format!("open {}", path.display()))?;
        file.write_all(self.render().as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        file.flush()
            .with_context(|| format!("flush {}", path.display()))?;
        Ok(())
    }
}

/// Which finished lines a reset returns to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Only `❌` lines.
    Failed,
    /// Every marked line, including stale `⏳` lines from an interrupted run.
    All,
}

impl ResetScope {
    fn applies_to(self, marker: Marker) -> bool {
        match self {
            ResetScope::Failed => marker == Marker::Failed,
            ResetScope::All => true,
        }
    }
}

/// Strip status from the lines selected by `scope`. Returns how many lines changed.
///
/// The file is only rewritten when something changed.
pub fn reset_list(path: &Path, scope: ResetScope) -> Result<usize> {
    let mut list = ListFile::read(path)?;
    let mut reset = 0;
    for line in &mut list.lines {
        let Some(marker) = marker_of(line) else {
            continue;
        };
        if !scope.applies_to(marker) {
            continue;
        }
        let stripped = strip_status(line);
        if stripped != *line {
            *line = stripped;
            reset += 1;
        }
    }
    if reset > 0 {
        debug!(path = %path.display(), reset, ?scope, "resetting list lines");
        list.write(path)?;
    }
    Ok(reset)
}
