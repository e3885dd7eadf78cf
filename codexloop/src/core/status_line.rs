//! Grammar of batch list lines.
//!
//! A line is one item. Pending lines carry no marker; claimed lines start with
//! a single status character; finished lines append ` | summary [turns: U/T]`.

use super::progress::single_line;

/// Status marker at the start of a claimed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Running,
    Succeeded,
    Failed,
}

impl Marker {
    pub const ALL: [Marker; 3] = [Marker::Running, Marker::Succeeded, Marker::Failed];

    pub fn as_char(self) -> char {
        match self {
            Marker::Running => '⏳',
            Marker::Succeeded => '✅',
            Marker::Failed => '❌',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|marker| marker.as_char() == c)
    }

    pub fn terminal(success: bool) -> Self {
        if success {
            Marker::Succeeded
        } else {
            Marker::Failed
        }
    }
}

/// Marker at the start of `line`, if any.
pub fn marker_of(line: &str) -> Option<Marker> {
    line.chars().next().and_then(Marker::from_char)
}

/// True for lines that should be claimed by the next run.
pub fn is_pending(line: &str) -> bool {
    !line.trim().is_empty() && marker_of(line).is_none()
}

pub fn running_line(item: &str) -> String {
    format!("{} {item}", Marker::Running.as_char())
}

/// `[turns: U/T]`, with `?` standing in for unknown counts.
pub fn format_turns(used: Option<u32>, total: Option<u32>) -> String {
    let show = |value: Option<u32>| value.map_or_else(|| "?".to_string(), |v| v.to_string());
    format!("[turns: {}/{}]", show(used), show(total))
}

/// Summary column of a terminal line: single-lined summary plus turn counts.
pub fn terminal_summary(summary: &str, used: Option<u32>, total: Option<u32>) -> String {
    let summary = single_line(summary);
    let turns = format_turns(used, total);
    if summary.is_empty() {
        turns
    } else {
        format!("{summary} {turns}")
    }
}

pub fn terminal_line(item: &str, success: bool, summary: &str) -> String {
    format!("{} {item} | {summary}", Marker::terminal(success).as_char())
}

/// Strip marker, summary and turn suffix, restoring the bare item text.
pub fn strip_status(line: &str) -> String {
    let mut rest = line;
    if marker_of(rest).is_some() {
        let mut chars = rest.chars();
        chars.next();
        rest = chars.as_str();
        rest = rest.strip_prefix(' ').unwrap_or(rest);
    }
    match rest.find('|') {
        Some(pipe) => rest[..pipe].trim_end().to_string(),
        None => rest.to_string(),
    }
}
