//! # Generalization rules
//!
//! Turns concrete observations into keys that collide for similar situations:
//!
//! - numeric values are bucketed (`zero` / `low` / `medium` / `high`),
//! - free-text log lines have volatile tokens (numbers, hex, paths, quoted
//!   strings) replaced with placeholders,
//! - issue types and messages are mapped to broad categories through a fixed,
//!   ordered substring table.
//!
//! Every function here is idempotent: generalizing an already generalized
//! value returns it unchanged. The legacy cleanup pass relies on that.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::Attempt;

/// Longest generalized log line kept as a pattern key.
pub const MAX_LOG_KEY_CHARS: usize = 120;

// ---------------------------------------------------------------------------
// Numeric buckets
// ---------------------------------------------------------------------------

/// Map a number to its semantic bucket.
pub fn bucket(value: f64) -> &'static str {
    if value.is_nan() {
        "unknown"
    } else if value < 0.0 {
        "negative"
    } else if value == 0.0 {
        "zero"
    } else if value <= 10.0 {
        "low"
    } else if value <= 100.0 {
        "medium"
    } else {
        "high"
    }
}

/// Generalize one state value. Numbers (including numeric strings) are
/// bucketed; other strings pass through unchanged.
pub fn generalize_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Number(n) => bucket(n.as_f64().unwrap_or(f64::NAN)).to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "none".to_string(),
        serde_json::Value::String(s) => generalize_text_value(s),
        serde_json::Value::Array(_) => "list".to_string(),
        serde_json::Value::Object(_) => "object".to_string(),
    }
}

fn generalize_text_value(s: &str) -> String {
    match s.trim().parse::<f64>() {
        Ok(n) if n.is_finite() => bucket(n).to_string(),
        _ => s.to_string(),
    }
}

/// Canonical `k=bucket` form of a state map, keys in sorted order.
pub fn generalize_state(state: &BTreeMap<String, serde_json::Value>) -> String {
    state
        .iter()
        .map(|(k, v)| format!("{}={}", k, generalize_value(v)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Re-generalize a stored state key (legacy entries kept raw numbers).
pub fn regeneralize_state(key: &str) -> String {
    let mut pairs: Vec<(String, String)> = key
        .split(',')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), generalize_text_value(v)),
            None => (pair.to_string(), String::new()),
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| if v.is_empty() { k } else { format!("{}={}", k, v) })
        .collect::<Vec<_>>()
        .join(",")
}

/// Split a generalized state key back into its pairs.
pub fn state_pairs(key: &str) -> Vec<&str> {
    key.split(',').filter(|p| !p.is_empty()).collect()
}

// ---------------------------------------------------------------------------
// Log redaction
// ---------------------------------------------------------------------------

static HEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-f]+").expect("hex regex"));
static QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[^"]*"|'[^']*'"#).expect("quoted regex"));
static PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S*[/\\]\S*").expect("path regex"));
static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("digits regex"));
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("spaces regex"));

/// Redact volatile tokens from a log line so that repeats of the same failure
/// share one key.
pub fn generalize_log(message: &str) -> String {
    let lower = message.to_lowercase();
    let s = HEX.replace_all(&lower, "<hex>");
    let s = QUOTED.replace_all(&s, "<str>");
    let s = PATH.replace_all(&s, "<path>");
    let s = DIGITS.replace_all(&s, "<n>");
    let s = SPACES.replace_all(&s, " ");
    let truncated: String = s.trim().chars().take(MAX_LOG_KEY_CHARS).collect();
    truncated.trim_end().to_string()
}

// ---------------------------------------------------------------------------
// Category table
// ---------------------------------------------------------------------------

/// Ordered `(substring, category)` rules. The first rule whose substring
/// occurs in the lowercased `issue_type + " " + error_message` wins.
pub const CATEGORY_RULES: &[(&str, &str)] = &[
    ("circular", "circular_dependency"),
    ("deadlock", "circular_dependency"),
    ("cycle", "circular_dependency"),
    ("hang", "blocking_operation"),
    ("blocking", "blocking_operation"),
    ("freeze", "blocking_operation"),
    ("timeout", "timeout_handling"),
    ("timed out", "timeout_handling"),
    ("race", "initialization_race_condition"),
    ("init", "initialization_race_condition"),
    ("startup", "initialization_race_condition"),
    ("bracket", "syntax_error"),
    ("syntax", "syntax_error"),
    ("parse", "syntax_error"),
    ("out of memory", "resource_exhaustion"),
    ("memory", "resource_exhaustion"),
    ("leak", "resource_exhaustion"),
    ("disk", "resource_exhaustion"),
    ("connection", "connectivity_failure"),
    ("network", "connectivity_failure"),
    ("refused", "connectivity_failure"),
    ("permission", "access_control"),
    ("denied", "access_control"),
    ("unauthorized", "access_control"),
];

/// Abstract category for an issue, if any rule matches.
pub fn categorize(issue_type: &str, error_message: Option<&str>) -> Option<&'static str> {
    let text = format!("{} {}", issue_type, error_message.unwrap_or("")).to_lowercase();
    CATEGORY_RULES
        .iter()
        .find(|(needle, _)| text.contains(needle))
        .map(|(_, category)| *category)
}

// ---------------------------------------------------------------------------
// Attempt context
// ---------------------------------------------------------------------------

/// The generalized context stored alongside a pattern observation.
pub fn attempt_context(attempt: &Attempt) -> BTreeMap<String, String> {
    let mut ctx = BTreeMap::new();
    if let Some(t) = attempt.issue_type() {
        ctx.insert("issue_type".to_string(), t.to_string());
    }
    if let Some(m) = attempt.fix_method() {
        ctx.insert("fix_method".to_string(), m.to_string());
    }
    if let Some(c) = attempt.component.as_deref() {
        ctx.insert("component".to_string(), c.to_string());
    }
    if let Some(state) = attempt.state.as_ref().filter(|s| !s.is_empty()) {
        ctx.insert("state".to_string(), generalize_state(state));
    }
    if let Some(msg) = attempt.error_message.as_deref() {
        ctx.insert("error".to_string(), generalize_log(msg));
    }
    ctx.insert("duration".to_string(), bucket(attempt.duration_ms as f64 / 1000.0).to_string());
    ctx.insert("result".to_string(), attempt.result.to_string());
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(-3.0, "negative")]
    #[case(0.0, "zero")]
    #[case(0.5, "low")]
    #[case(10.0, "low")]
    #[case(11.0, "medium")]
    #[case(100.0, "medium")]
    #[case(100.5, "high")]
    #[case(f64::NAN, "unknown")]
    fn test_bucket(#[case] value: f64, #[case] expected: &str) {
        assert_eq!(bucket(value), expected);
    }

    #[test]
    fn test_generalize_value_passes_categorical_through() {
        assert_eq!(generalize_value(&json!("PowerShell")), "PowerShell");
        assert_eq!(generalize_value(&json!(true)), "true");
        assert_eq!(generalize_value(&json!(42)), "medium");
        assert_eq!(generalize_value(&json!("7")), "low");
    }

    #[test]
    fn test_similar_states_collide() {
        let a: BTreeMap<String, serde_json::Value> =
            [("cpu".to_string(), json!(71)), ("mode".to_string(), json!("boot"))].into();
        let b: BTreeMap<String, serde_json::Value> =
            [("cpu".to_string(), json!(93)), ("mode".to_string(), json!("boot"))].into();
        assert_eq!(generalize_state(&a), generalize_state(&b));
        assert_eq!(generalize_state(&a), "cpu=medium,mode=boot");
    }

    #[test]
    fn test_regeneralize_state_buckets_legacy_numbers() {
        assert_eq!(regeneralize_state("mode=boot,cpu=71"), "cpu=medium,mode=boot");
        assert_eq!(regeneralize_state("cpu=medium,mode=boot"), "cpu=medium,mode=boot");
    }

    #[test]
    fn test_generalize_log_redacts_volatile_tokens() {
        let g = generalize_log("Error 404 at 0x7FFE in C:/app/main.ps1: 'foo' not found");
        assert_eq!(g, "error <n> at <hex> in <path> <str> not found");
    }

    #[test]
    fn test_generalize_log_same_failure_collides() {
        assert_eq!(
            generalize_log("timeout after 3000ms on worker 7"),
            generalize_log("Timeout after 12ms on worker 12"),
        );
    }

    #[test]
    fn test_generalize_log_is_idempotent() {
        let inputs = [
            "Error 404 at 0x7ffe in /var/log/x.log",
            "it's \"quoted\" and 'single' text 12",
            &"long line ".repeat(40),
        ];
        for input in inputs {
            let once = generalize_log(input);
            assert_eq!(generalize_log(&once), once, "input: {}", input);
        }
    }

    #[test]
    fn test_generalize_log_truncates() {
        let g = generalize_log(&"word ".repeat(100));
        assert!(g.chars().count() <= MAX_LOG_KEY_CHARS);
    }

    #[rstest]
    #[case("init_hang", None, Some("blocking_operation"))]
    #[case("service_startup", None, Some("initialization_race_condition"))]
    #[case("syntax_error", Some("missing closing bracket"), Some("syntax_error"))]
    #[case("crash", Some("circular import detected"), Some("circular_dependency"))]
    #[case("unknown_thing", None, None)]
    fn test_categorize(
        #[case] issue_type: &str,
        #[case] message: Option<&str>,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(categorize(issue_type, message), expected);
    }

    #[test]
    fn test_attempt_context_is_generalized() {
        use crate::types::{Attempt, Outcome};
        let state: BTreeMap<String, serde_json::Value> = [("retries".to_string(), json!(3))].into();
        let a = Attempt::new("i", "t", "m", Outcome::Failure, 0)
            .with_error("failed at line 42")
            .with_state(state);
        let ctx = attempt_context(&a);
        assert_eq!(ctx["state"], "retries=low");
        assert_eq!(ctx["error"], "failed at line <n>");
        assert_eq!(ctx["result"], "failure");
    }
}
