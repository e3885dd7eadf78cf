//! Parsing of structured verifier, estimator and metrics replies.
//!
//! Replies are free text from the agent. We locate the JSON object (optionally
//! inside a Markdown fence), check it against the embedded schema, then
//! deserialize it.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const VERDICT_SCHEMA: &str = include_str!("../../schemas/verdict.schema.json");
const ESTIMATE_SCHEMA: &str = include_str!("../../schemas/estimate.schema.json");
const METRICS_SCHEMA: &str = include_str!("../../schemas/metrics.schema.json");

static VERDICT_VALIDATOR: LazyLock<Validator> =
    LazyLock::new(|| compile_schema(VERDICT_SCHEMA).expect("verdict schema should be valid"));
static ESTIMATE_VALIDATOR: LazyLock<Validator> =
    LazyLock::new(|| compile_schema(ESTIMATE_SCHEMA).expect("estimate schema should be valid"));
static METRICS_VALIDATOR: LazyLock<Validator> =
    LazyLock::new(|| compile_schema(METRICS_SCHEMA).expect("metrics schema should be valid"));

/// Completion judgment produced by the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub success: bool,
    pub reason: String,
}

impl Verdict {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
        }
    }
}

/// Remaining-effort judgment produced by the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub remaining: f64,
    pub summary: String,
}

/// One figure of merit as reported by the metrics extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    /// Absolute value, kept as text so units survive.
    pub value: String,
    /// Percent change against the baseline, when the agent reported one.
    #[serde(default)]
    pub improvement_pct: Option<f64>,
}

/// Figures of merit extracted from one science iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub new_improvement: bool,
    pub summary: String,
    pub metrics: Vec<Metric>,
}

impl MetricsReport {
    /// Transcript text for a new best result:
    /// `New best: name=value (+x.xx%); other=value` followed by the summary.
    pub fn announcement(&self) -> String {
        let rendered: Vec<String> = self
            .metrics
            .iter()
            .map(|metric| match metric.improvement_pct {
                Some(pct) => format!("{}={} ({pct:+.2}%)", metric.name, metric.value),
                None => format!("{}={}", metric.name, metric.value),
            })
            .collect();
        let mut parts = Vec::new();
        if !rendered.is_empty() {
            parts.push(format!("New best: {}", rendered.join("; ")));
        }
        if !self.summary.is_empty() {
            parts.push(self.summary.clone());
        }
        if parts.is_empty() {
            "New best metrics detected.".to_string()
        } else {
            parts.join("\n")
        }
    }
}

/// Parse a verifier reply. Malformed replies become a failed verdict whose
/// reason describes the problem; this never errors.
pub fn parse_verdict(reply: &str) -> Verdict {
    match parse_structured::<Verdict>(reply, &VERDICT_VALIDATOR) {
        Ok(verdict) => verdict,
        Err(err) => Verdict::fail(format!(
            "verifier reply was not a valid {{success, reason}} object: {err:#}\nreply: {}",
            reply.trim()
        )),
    }
}

/// Parse an estimator reply, failing on any parse or schema problem.
pub fn parse_estimate(reply: &str) -> Result<Estimate> {
    parse_structured(reply, &ESTIMATE_VALIDATOR).context("parse estimator reply")
}

/// Parse a metrics reply. Names, values and the summary come back on one line each.
pub fn parse_metrics(reply: &str) -> Result<MetricsReport> {
    let mut report: MetricsReport =
        parse_structured(reply, &METRICS_VALIDATOR).context("parse metrics reply")?;
    report.summary = collapse_whitespace(&report.summary);
    for metric in &mut report.metrics {
        metric.name = collapse_whitespace(&metric.name);
        metric.value = collapse_whitespace(&metric.value);
    }
    Ok(report)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_structured<T: DeserializeOwned>(reply: &str, validator: &Validator) -> Result<T> {
    let raw = extract_json_object(reply).ok_or_else(|| anyhow!("no JSON object in reply"))?;
    let value: Value = serde_json::from_str(raw).context("parse json")?;
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed: {}", messages.join("; "));
    }
    serde_json::from_value(value).context("deserialize reply")
}

/// Slice the outermost `{ … }` span out of a reply.
pub fn extract_json_object(reply: &str) -> Option<&str> {
    let body = strip_code_fence(reply.trim());
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (end > start).then(|| &body[start..=end])
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest)
}

fn compile_schema(raw: &str) -> Result<Validator> {
    let schema: Value = serde_json::from_str(raw).context("parse schema json")?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_verdict() {
        let verdict = parse_verdict(r#"{"success": true, "reason": "all tests pass"}"#);
        assert_eq!(verdict, Verdict::pass("all tests pass"));
    }

    #[test]
    fn parses_fenced_verdict_with_prose() {
        let reply = "```json\n{\"success\": false, \"reason\": \"README not updated\"}\n```";
        assert_eq!(parse_verdict(reply), Verdict::fail("README not updated"));
    }

    #[test]
    fn garbage_becomes_negative_verdict() {
        let verdict = parse_verdict("looks good to me!");
        assert!(!verdict.success);
        assert!(verdict.reason.contains("no JSON object"));
        assert!(verdict.reason.contains("looks good to me!"));
    }

    #[test]
    fn wrong_types_become_negative_verdict() {
        let verdict = parse_verdict(r#"{"success": "yes", "reason": "ok"}"#);
        assert!(!verdict.success);
        assert!(verdict.reason.contains("schema validation failed"));
    }

    #[test]
    fn extra_keys_are_rejected() {
        let verdict = parse_verdict(r#"{"success": true, "reason": "ok", "score": 3}"#);
        assert!(!verdict.success);
    }

    #[test]
    fn parses_estimate() {
        let estimate = parse_estimate(r#"{"remaining": 2.5, "summary": "writing tests"}"#)
            .expect("estimate");
        assert_eq!(estimate.remaining, 2.5);
        assert_eq!(estimate.summary, "writing tests");
    }

    #[test]
    fn estimate_rejects_negative_remaining() {
        let err = parse_estimate(r#"{"remaining": -1, "summary": "x"}"#).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn estimate_rejects_missing_summary() {
        assert!(parse_estimate(r#"{"remaining": 3}"#).is_err());
    }

    #[test]
    fn parses_metrics_and_tidies_text() {
        let reply = r#"Here you go:
{"new_improvement": true,
 "summary": "Cached the\n  lexer tables.",
 "metrics": [
   {"name": " throughput ", "value": "41 MB/s", "improvement_pct": 12.5},
   {"name": "p99", "value": "3 ms", "improvement_pct": null},
   {"name": "rss", "value": "80 MB"}
 ]}"#;
        let report = parse_metrics(reply).expect("metrics");
        assert!(report.new_improvement);
        assert_eq!(report.summary, "Cached the lexer tables.");
        assert_eq!(report.metrics[0].name, "throughput");
        assert_eq!(report.metrics[0].improvement_pct, Some(12.5));
        assert_eq!(report.metrics[1].improvement_pct, None);
        assert_eq!(report.metrics[2].improvement_pct, None);
    }

    #[test]
    fn metrics_reject_blank_values_and_text_percentages() {
        let blank = r#"{"new_improvement": true, "summary": "s",
            "metrics": [{"name": "speed", "value": "  "}]}"#;
        assert!(parse_metrics(blank).is_err());
        let text_pct = r#"{"new_improvement": true, "summary": "s",
            "metrics": [{"name": "speed", "value": "2x", "improvement_pct": "10%"}]}"#;
        let err = parse_metrics(text_pct).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
        assert!(parse_metrics(r#"{"new_improvement": true, "summary": "s"}"#).is_err());
    }

    #[test]
    fn announcement_lists_metrics_then_summary() {
        let report = MetricsReport {
            new_improvement: true,
            summary: "Cached the lexer tables.".to_string(),
            metrics: vec![
                Metric {
                    name: "throughput".to_string(),
                    value: "41 MB/s".to_string(),
                    improvement_pct: Some(12.5),
                },
                Metric {
                    name: "p99".to_string(),
                    value: "3 ms".to_string(),
                    improvement_pct: Some(-0.333),
                },
                Metric {
                    name: "rss".to_string(),
                    value: "80 MB".to_string(),
                    improvement_pct: None,
                },
            ],
        };
        assert_eq!(
            report.announcement(),
            "New best: throughput=41 MB/s (+12.50%); p99=3 ms (-0.33%); rss=80 MB\n\
             Cached the lexer tables."
        );
    }

    #[test]
    fn empty_announcement_falls_back() {
        let report = MetricsReport {
            new_improvement: true,
            summary: String::new(),
            metrics: Vec::new(),
        };
        assert_eq!(report.announcement(), "New best metrics detected.");
    }
}
