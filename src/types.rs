//! Input records and collaborator seams.
//!
//! [`Attempt`] is the only input to learning. [`Issue`] and the three
//! collaborator traits describe what the engine reads from the surrounding
//! monitoring stack; each has a small in-memory implementation used by tests
//! and the CLI.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one fix attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure => write!(f, "failure"),
        }
    }
}

// ---------------------------------------------------------------------------
// Attempt
// ---------------------------------------------------------------------------

/// Root cause annotation attached to a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisNote {
    pub root_cause: String,
    pub correct_approach: String,
}

/// One completed fix attempt.
///
/// `issue_type` and `fix_method` default to empty strings when absent from
/// the serialized form; empty means "missing" and the learning steps that need
/// the field are skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    #[serde(default)]
    pub issue_id: String,
    #[serde(default)]
    pub issue_type: String,
    #[serde(default)]
    pub fix_method: String,
    #[serde(default)]
    pub fix_details: BTreeMap<String, String>,
    pub result: Outcome,
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<DiagnosisNote>,
}

impl Attempt {
    /// Minimal attempt; the remaining fields are set with struct update syntax
    /// or the `with_*` helpers.
    pub fn new(
        issue_id: impl Into<String>,
        issue_type: impl Into<String>,
        fix_method: impl Into<String>,
        result: Outcome,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            issue_id: issue_id.into(),
            issue_type: issue_type.into(),
            fix_method: fix_method.into(),
            fix_details: BTreeMap::new(),
            result,
            timestamp_ms,
            duration_ms: 0,
            error_message: None,
            component: None,
            state: None,
            diagnosis: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_state(mut self, state: BTreeMap<String, serde_json::Value>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_diagnosis(
        mut self,
        root_cause: impl Into<String>,
        correct_approach: impl Into<String>,
    ) -> Self {
        self.diagnosis = Some(DiagnosisNote {
            root_cause: root_cause.into(),
            correct_approach: correct_approach.into(),
        });
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fix_details.insert(key.into(), value.into());
        self
    }

    /// `None` when the issue type is missing.
    pub fn issue_type(&self) -> Option<&str> {
        non_empty(&self.issue_type)
    }

    /// `None` when the fix method is missing.
    pub fn fix_method(&self) -> Option<&str> {
        non_empty(&self.fix_method)
    }

    pub fn succeeded(&self) -> bool {
        self.result.is_success()
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let t = s.trim();
    if t.is_empty() { None } else { Some(t) }
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

/// A problem reported by the issue detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub issue_type: String,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    #[serde(default)]
    pub first_seen_ms: u64,
}

impl Issue {
    pub fn new(id: impl Into<String>, issue_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            issue_type: issue_type.into(),
            root_cause: None,
            details: BTreeMap::new(),
            first_seen_ms: 0,
        }
    }

    pub fn with_root_cause(mut self, root_cause: impl Into<String>) -> Self {
        self.root_cause = Some(root_cause.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Read side of the issue detector.
pub trait IssueSource: Send + Sync {
    fn get_issue(&self, id: &str) -> Option<Issue>;
    fn active_issues(&self) -> Vec<Issue>;
}

/// Read side of the fix tracker.
pub trait FixTracker: Send + Sync {
    /// Historical success rate of a fix method, `None` if never tracked.
    fn success_rate(&self, method: &str) -> Option<f64>;
}

/// Read side of the rule-compliance tracker.
pub trait ComplianceSource: Send + Sync {
    /// Fraction of compliant checks in `[0, 1]`, `None` before any data.
    fn success_ratio(&self) -> Option<f64>;
}

/// Fixed list of issues.
#[derive(Debug, Clone, Default)]
pub struct StaticIssues {
    issues: Vec<Issue>,
}

impl StaticIssues {
    pub fn new(issues: Vec<Issue>) -> Self {
        Self { issues }
    }
}

impl IssueSource for StaticIssues {
    fn get_issue(&self, id: &str) -> Option<Issue> {
        self.issues.iter().find(|i| i.id == id).cloned()
    }

    fn active_issues(&self) -> Vec<Issue> {
        self.issues.clone()
    }
}

/// Fixed method → rate table.
#[derive(Debug, Clone, Default)]
pub struct StaticFixRates {
    rates: HashMap<String, f64>,
}

impl StaticFixRates {
    pub fn new<I, S>(rates: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self { rates: rates.into_iter().map(|(m, r)| (m.into(), r)).collect() }
    }
}

impl FixTracker for StaticFixRates {
    fn success_rate(&self, method: &str) -> Option<f64> {
        self.rates.get(method).copied()
    }
}

/// Constant compliance ratio.
#[derive(Debug, Clone, Copy)]
pub struct FixedCompliance(pub f64);

impl ComplianceSource for FixedCompliance {
    fn success_ratio(&self) -> Option<f64> {
        Some(self.0.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_display() {
        assert_eq!(Outcome::Success.to_string(), "success");
        assert_eq!(Outcome::Failure.to_string(), "failure");
    }

    #[test]
    fn test_attempt_missing_fields_deserialize_as_absent() {
        let a: Attempt =
            serde_json::from_str(r#"{"issue_id":"i1","result":"failure"}"#).unwrap();
        assert!(a.issue_type().is_none());
        assert!(a.fix_method().is_none());
        assert!(!a.succeeded());
    }

    #[test]
    fn test_attempt_whitespace_issue_type_is_absent() {
        let a = Attempt::new("i1", "   ", "restart", Outcome::Success, 0);
        assert!(a.issue_type().is_none());
        assert_eq!(a.fix_method(), Some("restart"));
    }

    #[test]
    fn test_attempt_builders() {
        let a = Attempt::new("i1", "syntax_error", "fix_quotes", Outcome::Success, 5)
            .with_error("missing closing bracket")
            .with_component("PowerShell")
            .with_duration(1200)
            .with_diagnosis("unescaped quote", "escape the quote")
            .with_detail("chain_signature", "a->b->a");
        assert_eq!(a.component.as_deref(), Some("PowerShell"));
        assert_eq!(a.duration_ms, 1200);
        assert_eq!(a.fix_details.get("chain_signature").map(String::as_str), Some("a->b->a"));
        assert_eq!(a.diagnosis.unwrap().root_cause, "unescaped quote");
    }

    #[test]
    fn test_static_issues_lookup() {
        let src = StaticIssues::new(vec![Issue::new("a", "t1"), Issue::new("b", "t2")]);
        assert_eq!(src.get_issue("b").unwrap().issue_type, "t2");
        assert!(src.get_issue("zzz").is_none());
        assert_eq!(src.active_issues().len(), 2);
    }

    #[test]
    fn test_static_fix_rates() {
        let t = StaticFixRates::new([("restart", 0.5)]);
        assert_eq!(t.success_rate("restart"), Some(0.5));
        assert_eq!(t.success_rate("other"), None);
    }

    #[test]
    fn test_fixed_compliance_clamped() {
        assert_eq!(FixedCompliance(1.7).success_ratio(), Some(1.0));
    }
}
