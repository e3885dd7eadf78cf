//! Iteration bounds shared by the task and repeat loops.

use std::fmt;

use anyhow::{Error, anyhow};
use serde::{Deserialize, Serialize};

/// Upper bound on loop iterations. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u32")]
pub struct IterationBound(u32);

impl IterationBound {
    pub const UNLIMITED: Self = Self(0);

    pub fn new(limit: u32) -> Self {
        Self(limit)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_unlimited(self) -> bool {
        self.0 == 0
    }

    /// True when `iteration` (1-indexed) is the last one allowed.
    pub fn reached(self, iteration: u32) -> bool {
        !self.is_unlimited() && iteration >= self.0
    }

    /// Compact label for progress lines (`∞` when unlimited).
    pub fn short_label(self) -> String {
        if self.is_unlimited() {
            "∞".to_string()
        } else {
            self.0.to_string()
        }
    }
}

impl TryFrom<i64> for IterationBound {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < 0 {
            return Err(anyhow!("max_iterations must be >= 0 (got {value})"));
        }
        let limit =
            u32::try_from(value).map_err(|_| anyhow!("max_iterations too large (got {value})"))?;
        Ok(Self(limit))
    }
}

impl From<IterationBound> for u32 {
    fn from(bound: IterationBound) -> Self {
        bound.0
    }
}

impl fmt::Display for IterationBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            f.write_str("unlimited")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_bound_is_rejected() {
        let err = IterationBound::try_from(-1).unwrap_err();
        assert!(err.to_string().contains("must be >= 0"));
    }

    #[test]
    fn zero_is_unlimited_and_never_reached() {
        let bound = IterationBound::try_from(0).expect("bound");
        assert!(bound.is_unlimited());
        assert!(!bound.reached(1));
        assert!(!bound.reached(u32::MAX));
        assert_eq!(bound.to_string(), "unlimited");
        assert_eq!(bound.short_label(), "∞");
    }

    #[test]
    fn bound_is_reached_at_limit() {
        let bound = IterationBound::new(3);
        assert!(!bound.reached(2));
        assert!(bound.reached(3));
        assert_eq!(bound.short_label(), "3");
    }

    #[test]
    fn deserializes_from_toml_integer() {
        #[derive(Deserialize)]
        struct Doc {
            max_iterations: IterationBound,
        }
        let doc: Doc = toml::from_str("max_iterations = 4").expect("parse");
        assert_eq!(doc.max_iterations, IterationBound::new(4));
        assert!(toml::from_str::<Doc>("max_iterations = -2").is_err());
    }
}
