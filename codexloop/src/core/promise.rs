//! Completion-promise detection for repeat loops.
//!
//! A reply fulfils the promise when the first `<promise>…</promise>` tag
//! encloses text that, after collapsing whitespace runs and trimming, equals
//! the configured target exactly (case-sensitive).

use std::sync::LazyLock;

use regex::Regex;

static PROMISE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<promise>(.*?)</promise>").expect("promise pattern should be valid")
});

/// Return true when `reply` contains a promise tag matching `target`.
pub fn promise_matches(reply: &str, target: Option<&str>) -> bool {
    let Some(target) = target else {
        return false;
    };
    extract_promise(reply).is_some_and(|found| found == target)
}

/// Extract and normalize the first promise tag body, if any.
pub fn extract_promise(reply: &str) -> Option<String> {
    let caps = PROMISE_RE.captures(reply)?;
    Some(collapse_whitespace(caps.get(1)?.as_str()))
}

/// Collapse internal whitespace runs to single spaces and trim the ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
