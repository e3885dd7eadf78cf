//! Progress bookkeeping for task loops.
//!
//! Estimates only size the progress display. Nothing here gates termination.

use std::fmt;
use std::time::Duration;

use super::bound::IterationBound;

pub const SUCCESS_MARK: &str = "✅";
pub const FAILURE_MARK: &str = "❌";

/// Running effort estimate.
///
/// `total` is the running maximum of every `remaining` value observed, so the
/// scale never shrinks when a later estimate turns out larger.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EstimateState {
    total: Option<f64>,
    remaining: Option<f64>,
}

impl EstimateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a remaining-effort observation and return the updated total.
    pub fn observe(&mut self, remaining: f64) -> f64 {
        let remaining = if remaining.is_finite() {
            remaining.max(0.0)
        } else {
            0.0
        };
        let total = match self.total {
            Some(total) => total.max(remaining),
            None => remaining,
        };
        self.total = Some(total);
        self.remaining = Some(remaining);
        total
    }

    pub fn total(&self) -> Option<f64> {
        self.total
    }

    pub fn remaining(&self) -> Option<f64> {
        self.remaining
    }

    /// Completed share of the estimated total in `[0, 1]`.
    pub fn fraction_done(&self) -> Option<f64> {
        let total = self.total?;
        let remaining = self.remaining?;
        if total <= 0.0 {
            return Some(1.0);
        }
        Some(((total - remaining) / total).clamp(0.0, 1.0))
    }
}

/// Terminal state attached to the final progress line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    Succeeded,
    Failed,
}

/// One rendered progress line: `[iteration/bound @ elapsed]: summary`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressLine {
    pub iteration: u32,
    pub bound: IterationBound,
    pub elapsed: Duration,
    pub summary: String,
    pub fraction_done: Option<f64>,
    pub finish: Option<Finish>,
}

impl fmt::Display for ProgressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{} @ {}]: {}",
            self.iteration,
            self.bound.short_label(),
            format_elapsed(self.elapsed),
            single_line(&self.summary)
        )?;
        match self.finish {
            Some(Finish::Succeeded) => write!(f, " {SUCCESS_MARK}"),
            Some(Finish::Failed) => write!(f, " {FAILURE_MARK}"),
            None => Ok(()),
        }
    }
}

/// Render a duration as `Ns`, `MmSSs`, or `HhMMm`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Replace line breaks so a summary fits on one line.
pub fn single_line(text: &str) -> String {
    text.trim().replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_never_decreases() {
        let observations = [5.0, 3.0, 8.0, 1.0, 0.0, 2.5];
        let mut state = EstimateState::new();
        let mut last_total = 0.0;
        for remaining in observations {
            let total = state.observe(remaining);
            assert!(total >= last_total, "{total} < {last_total}");
            assert!(total >= remaining);
            last_total = total;
        }
        assert_eq!(state.total(), Some(8.0));
        assert_eq!(state.remaining(), Some(2.5));
    }

    #[test]
    fn negative_and_nan_are_clamped() {
        let mut state = EstimateState::new();
        assert_eq!(state.observe(-4.0), 0.0);
        assert_eq!(state.observe(f64::NAN), 0.0);
        assert_eq!(state.fraction_done(), Some(1.0));
    }

    #[test]
    fn fraction_done_tracks_remaining() {
        let mut state = EstimateState::new();
        assert_eq!(state.fraction_done(), None);
        state.observe(4.0);
        state.observe(1.0);
        assert_eq!(state.fraction_done(), Some(0.75));
    }

    #[test]
    fn elapsed_formats() {
        assert_eq!(format_elapsed(Duration::from_secs(7)), "7s");
        assert_eq!(format_elapsed(Duration::from_secs(65)), "1m05s");
        assert_eq!(format_elapsed(Duration::from_secs(3720)), "1h02m");
    }

    #[test]
    fn terminal_line_carries_marker() {
        let mut line = ProgressLine {
            iteration: 2,
            bound: IterationBound::new(5),
            elapsed: Duration::from_secs(3),
            summary: "tests\npass".to_string(),
            fraction_done: None,
            finish: None,
        };
        assert_eq!(line.to_string(), "[2/5 @ 3s]: tests pass");
        line.finish = Some(Finish::Failed);
        assert_eq!(line.to_string(), "[2/5 @ 3s]: tests pass ❌");
        line.bound = IterationBound::UNLIMITED;
        line.finish = Some(Finish::Succeeded);
        assert_eq!(line.to_string(), "[2/∞ @ 3s]: tests pass ✅");
    }
}
