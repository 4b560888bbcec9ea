//! # Stage: Misdiagnosis Memory
//!
//! ## Responsibility
//! Remembers symptom families that are commonly misdiagnosed, how much time
//! each wrong approach has cost, and which fix methods already failed for an
//! issue type, so callers can be warned before repeating them.
//!
//! Symptom families come from the fixed [`SYMPTOM_FAMILIES`] table. A family
//! becomes a stored [`MisdiagnosisPattern`] on the first failure that matches
//! it; from then on it is updated in place and never deleted.
//!
//! ## Guarantees
//! - Matching is case-insensitive substring matching against a pipe-separated
//!   symptom list; no semantic inference
//! - Failed-method lists are deduplicated and bounded per issue type
//!
//! ## NOT Responsible For
//! - Choosing a fix (the optimizer ranks; this module only warns)

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::types::Attempt;

// ---------------------------------------------------------------------------
// Symptom families
// ---------------------------------------------------------------------------

/// A known way a symptom gets misdiagnosed.
#[derive(Debug, Clone, Copy)]
pub struct SymptomFamily {
    pub key: &'static str,
    /// Pipe-separated, matched case-insensitively as substrings of the error.
    pub symptom: &'static str,
    /// Restricts the family to one issue type (case-insensitive equality).
    pub issue_type: Option<&'static str>,
    /// Restricts the family to one component (case-insensitive equality).
    pub component: Option<&'static str>,
    pub common_misdiagnosis: &'static str,
    pub actual_root_cause: &'static str,
    pub correct_approach: &'static str,
}

/// Families evaluated in order; every matching family is updated.
pub const SYMPTOM_FAMILIES: &[SymptomFamily] = &[
    SymptomFamily {
        key: "powershell_bracket_mismatch",
        symptom: "missing closing bracket|missing closing '}'|missing '}'|unexpected token '}'|missing terminator",
        issue_type: Some("syntax_error"),
        component: Some("PowerShell"),
        common_misdiagnosis: "Add or remove braces until the brackets balance",
        actual_root_cause: "An unescaped quote or here-string terminator ends parsing early; the braces are already balanced",
        correct_approach: "Inspect quoting and escaping on the lines before the reported position",
    },
    SymptomFamily {
        key: "initialization_hang_timeout",
        symptom: "hang|not responding|stuck|timed out waiting|initialization timeout",
        issue_type: None,
        component: None,
        common_misdiagnosis: "Increase the timeout or add retries around initialization",
        actual_root_cause: "A synchronous call during startup waits on a component that is itself still starting",
        correct_approach: "Defer the dependent call until the component signals readiness, asynchronously",
    },
    SymptomFamily {
        key: "circular_dependency_retry",
        symptom: "circular|cyclic|dependency loop|deadlock",
        issue_type: None,
        component: None,
        common_misdiagnosis: "Retry the failing call or reorder module loading",
        actual_root_cause: "Two components wait on each other synchronously",
        correct_approach: "Break the cycle by making one side of the dependency asynchronous",
    },
    SymptomFamily {
        key: "memory_growth_restart",
        symptom: "out of memory|heap|memory usage|allocation failed",
        issue_type: None,
        component: None,
        common_misdiagnosis: "Restart the process or raise the memory limit",
        actual_root_cause: "An unbounded collection keeps growing",
        correct_approach: "Cap the collection and evict the oldest entries",
    },
    SymptomFamily {
        key: "connection_refused_port",
        symptom: "connection refused|econnrefused|failed to connect",
        issue_type: None,
        component: None,
        common_misdiagnosis: "Change the port or firewall rules",
        actual_root_cause: "The dependent service has not finished starting",
        correct_approach: "Wait for the service's readiness signal before connecting",
    },
    SymptomFamily {
        key: "permission_denied_elevation",
        symptom: "access denied|permission denied|unauthorized",
        issue_type: None,
        component: None,
        common_misdiagnosis: "Run the process with elevated privileges",
        actual_root_cause: "The resource is owned by another account or locked by another process",
        correct_approach: "Fix ownership or release the lock instead of elevating",
    },
];

impl SymptomFamily {
    /// Whether the attempt's issue type, component and message fit this family.
    pub fn matches(&self, issue_type: Option<&str>, message: &str, component: Option<&str>) -> bool {
        if let Some(required) = self.issue_type {
            match issue_type {
                Some(t) if t.eq_ignore_ascii_case(required) => {}
                _ => return false,
            }
        }
        if let Some(required) = self.component {
            match component {
                Some(c) if c.eq_ignore_ascii_case(required) => {}
                _ => return false,
            }
        }
        symptom_matches(self.symptom, message)
    }
}

/// Case-insensitive match of any pipe-separated alternative in `symptom`.
pub fn symptom_matches(symptom: &str, text: &str) -> bool {
    let text = text.to_lowercase();
    symptom
        .split('|')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .any(|s| text.contains(&s))
}

// ---------------------------------------------------------------------------
// MisdiagnosisPattern
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MisdiagnosisPattern {
    pub key: String,
    pub symptom: String,
    #[serde(default)]
    pub issue_type: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
    pub common_misdiagnosis: String,
    pub actual_root_cause: String,
    pub correct_approach: String,
    pub frequency: u64,
    pub time_wasted_ms: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
}

impl MisdiagnosisPattern {
    fn from_family(f: &SymptomFamily) -> Self {
        Self {
            key: f.key.to_string(),
            symptom: f.symptom.to_string(),
            issue_type: f.issue_type.map(str::to_string),
            component: f.component.map(str::to_string),
            common_misdiagnosis: f.common_misdiagnosis.to_string(),
            actual_root_cause: f.actual_root_cause.to_string(),
            correct_approach: f.correct_approach.to_string(),
            frequency: 0,
            time_wasted_ms: 0,
            successes: 0,
            failures: 0,
            success_rate: 0.0,
        }
    }

    fn matches(&self, issue_type: Option<&str>, message: &str, component: Option<&str>) -> bool {
        let type_ok = match (&self.issue_type, issue_type) {
            (None, _) => true,
            (Some(req), Some(t)) => t.eq_ignore_ascii_case(req),
            (Some(_), None) => false,
        };
        let component_ok = match (&self.component, component) {
            (None, _) => true,
            (Some(req), Some(c)) => c.eq_ignore_ascii_case(req),
            (Some(_), None) => false,
        };
        type_ok && component_ok && symptom_matches(&self.symptom, message)
    }

    fn recompute_rate(&mut self) {
        let total = self.successes + self.failures;
        self.success_rate = if total == 0 { 0.0 } else { self.successes as f64 / total as f64 };
    }
}

// ---------------------------------------------------------------------------
// Prevention report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MisdiagnosisWarning {
    pub key: String,
    pub common_misdiagnosis: String,
    pub actual_root_cause: String,
    pub correct_approach: String,
    pub frequency: u64,
    pub time_wasted_ms: u64,
    pub success_rate: f64,
}

/// Everything a caller should know before trying a fix.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MisdiagnosisPrevention {
    /// Most time wasted first.
    pub warnings: Vec<MisdiagnosisWarning>,
    /// Methods that already failed for this issue type, oldest first.
    pub failed_methods: Vec<String>,
}

impl MisdiagnosisPrevention {
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty() && self.failed_methods.is_empty()
    }
}

// ---------------------------------------------------------------------------
// MisdiagnosisMemory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MisdiagnosisMemory {
    patterns: BTreeMap<String, MisdiagnosisPattern>,
    failed_methods: BTreeMap<String, VecDeque<String>>,
    #[serde(skip)]
    failed_methods_cap: FailedCap,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FailedCap(usize);

impl Default for FailedCap {
    fn default() -> Self {
        FailedCap(20)
    }
}

impl MisdiagnosisMemory {
    pub fn new(failed_methods_cap: usize) -> Self {
        Self { failed_methods_cap: FailedCap(failed_methods_cap.max(1)), ..Self::default() }
    }

    /// Rebuild from persisted parts.
    pub fn from_parts(
        patterns: BTreeMap<String, MisdiagnosisPattern>,
        failed_methods: BTreeMap<String, VecDeque<String>>,
        failed_methods_cap: usize,
    ) -> Self {
        let mut m = Self { patterns, failed_methods, failed_methods_cap: FailedCap(failed_methods_cap.max(1)) };
        for list in m.failed_methods.values_mut() {
            while list.len() > m.failed_methods_cap.0 {
                list.pop_front();
            }
        }
        m
    }

    pub fn patterns(&self) -> &BTreeMap<String, MisdiagnosisPattern> {
        &self.patterns
    }

    pub fn failed_methods(&self) -> &BTreeMap<String, VecDeque<String>> {
        &self.failed_methods
    }

    pub fn get(&self, key: &str) -> Option<&MisdiagnosisPattern> {
        self.patterns.get(key)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Learn from a failed attempt. Returns the keys of the matched records.
    pub fn record_failure(&mut self, attempt: &Attempt) -> Vec<String> {
        if let (Some(t), Some(m)) = (attempt.issue_type(), attempt.fix_method()) {
            let cap = self.failed_methods_cap.0;
            let list = self.failed_methods.entry(t.to_string()).or_default();
            if !list.iter().any(|x| x == m) {
                list.push_back(m.to_string());
                while list.len() > cap {
                    list.pop_front();
                }
            }
        }

        let Some(message) = attempt.error_message.as_deref() else {
            return Vec::new();
        };
        let issue_type = attempt.issue_type();
        let component = attempt.component.as_deref();

        let mut matched = Vec::new();
        for family in SYMPTOM_FAMILIES {
            if !family.matches(issue_type, message, component) {
                continue;
            }
            let record = self
                .patterns
                .entry(family.key.to_string())
                .or_insert_with(|| MisdiagnosisPattern::from_family(family));
            record.frequency += 1;
            record.failures += 1;
            record.time_wasted_ms = record.time_wasted_ms.saturating_add(attempt.duration_ms);
            record.recompute_rate();
            matched.push(record.key.clone());
        }
        matched
    }

    /// Learn from a successful attempt. Only records that already exist are
    /// updated; a diagnosis note overwrites their root cause and approach.
    pub fn record_success(&mut self, attempt: &Attempt) -> Vec<String> {
        let Some(message) = attempt.error_message.as_deref() else {
            return Vec::new();
        };
        let issue_type = attempt.issue_type();
        let component = attempt.component.as_deref();

        let mut matched = Vec::new();
        for record in self.patterns.values_mut() {
            if !record.matches(issue_type, message, component) {
                continue;
            }
            record.successes += 1;
            if let Some(note) = &attempt.diagnosis {
                record.actual_root_cause = note.root_cause.clone();
                record.correct_approach = note.correct_approach.clone();
            }
            record.recompute_rate();
            matched.push(record.key.clone());
        }
        matched
    }

    /// Warnings for a situation about to be diagnosed.
    pub fn get_prevention(
        &self,
        issue_type: &str,
        error_message: &str,
        component: Option<&str>,
    ) -> MisdiagnosisPrevention {
        let issue = Some(issue_type).filter(|t| !t.trim().is_empty());
        let mut warnings: Vec<MisdiagnosisWarning> = self
            .patterns
            .values()
            .filter(|r| r.matches(issue, error_message, component))
            .map(|r| MisdiagnosisWarning {
                key: r.key.clone(),
                common_misdiagnosis: r.common_misdiagnosis.clone(),
                actual_root_cause: r.actual_root_cause.clone(),
                correct_approach: r.correct_approach.clone(),
                frequency: r.frequency,
                time_wasted_ms: r.time_wasted_ms,
                success_rate: r.success_rate,
            })
            .collect();
        warnings.sort_by(|a, b| {
            b.time_wasted_ms.cmp(&a.time_wasted_ms).then_with(|| a.key.cmp(&b.key))
        });

        let failed_methods = self
            .failed_methods
            .get(issue_type)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default();

        MisdiagnosisPrevention { warnings, failed_methods }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Outcome;

    fn mem() -> MisdiagnosisMemory {
        MisdiagnosisMemory::new(20)
    }

    fn bracket_failure() -> Attempt {
        Attempt::new("i1", "syntax_error", "add_brace", Outcome::Failure, 1)
            .with_error("missing closing bracket")
            .with_component("PowerShell")
            .with_duration(60_000)
    }

    #[test]
    fn test_symptom_matches_case_insensitive() {
        assert!(symptom_matches("missing closing bracket|foo", "Line 3: MISSING CLOSING BRACKET"));
        assert!(!symptom_matches("a|b", "nothing here"));
        assert!(!symptom_matches("", "anything"));
    }

    #[test]
    fn test_bracket_failure_matches_family() {
        let mut m = mem();
        let matched = m.record_failure(&bracket_failure());
        assert_eq!(matched, vec!["powershell_bracket_mismatch".to_string()]);
        let r = m.get("powershell_bracket_mismatch").unwrap();
        assert_eq!(r.frequency, 1);
        assert_eq!(r.failures, 1);
        assert_eq!(r.time_wasted_ms, 60_000);
    }

    #[test]
    fn test_bracket_failure_leaves_unrelated_records_untouched() {
        let mut m = mem();
        let hang = Attempt::new("i2", "init_hang", "retry", Outcome::Failure, 1)
            .with_error("service not responding");
        m.record_failure(&hang);
        let before = m.get("initialization_hang_timeout").cloned().unwrap();

        m.record_failure(&bracket_failure());
        m.record_failure(&bracket_failure());

        assert_eq!(m.get("initialization_hang_timeout").unwrap(), &before);
        assert_eq!(m.get("powershell_bracket_mismatch").unwrap().frequency, 2);
        assert!(m.get("memory_growth_restart").is_none());
    }

    #[test]
    fn test_component_filter_blocks_match() {
        let mut m = mem();
        let a = Attempt::new("i", "syntax_error", "x", Outcome::Failure, 1)
            .with_error("missing closing bracket")
            .with_component("bash");
        assert!(m.record_failure(&a).is_empty());
    }

    #[test]
    fn test_failed_methods_deduplicated_and_capped() {
        let mut m = MisdiagnosisMemory::new(3);
        for method in ["a", "b", "a", "c", "d"] {
            m.record_failure(&Attempt::new("i", "t", method, Outcome::Failure, 0));
        }
        let list: Vec<_> = m.failed_methods()["t"].iter().cloned().collect();
        assert_eq!(list, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_failure_without_message_only_tracks_method() {
        let mut m = mem();
        let matched = m.record_failure(&Attempt::new("i", "t", "m", Outcome::Failure, 0));
        assert!(matched.is_empty());
        assert!(m.is_empty());
        assert_eq!(m.failed_methods()["t"].len(), 1);
    }

    #[test]
    fn test_success_with_note_overwrites_root_cause() {
        let mut m = mem();
        m.record_failure(&bracket_failure());
        let ok = Attempt::new("i1", "syntax_error", "escape_quote", Outcome::Success, 2)
            .with_error("missing closing bracket")
            .with_component("PowerShell")
            .with_diagnosis("smart quote pasted from a document", "replace smart quotes");
        m.record_success(&ok);
        let r = m.get("powershell_bracket_mismatch").unwrap();
        assert_eq!(r.actual_root_cause, "smart quote pasted from a document");
        assert_eq!(r.correct_approach, "replace smart quotes");
        assert_eq!(r.successes, 1);
        assert!((r.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_success_does_not_create_records() {
        let mut m = mem();
        let ok = Attempt::new("i", "syntax_error", "x", Outcome::Success, 0)
            .with_error("missing closing bracket")
            .with_component("PowerShell");
        assert!(m.record_success(&ok).is_empty());
        assert!(m.is_empty());
    }

    #[test]
    fn test_prevention_sorted_by_time_wasted() {
        let mut m = mem();
        m.record_failure(
            &Attempt::new("i", "init", "retry", Outcome::Failure, 0)
                .with_error("hang then out of memory")
                .with_duration(10),
        );
        m.record_failure(
            &Attempt::new("i", "init", "restart", Outcome::Failure, 0)
                .with_error("out of memory")
                .with_duration(500),
        );
        let p = m.get_prevention("init", "stuck and out of memory", None);
        assert_eq!(p.warnings.len(), 2);
        assert_eq!(p.warnings[0].key, "memory_growth_restart");
        assert_eq!(p.failed_methods, vec!["retry", "restart"]);
    }

    #[test]
    fn test_prevention_empty_for_unknown() {
        let m = mem();
        assert!(m.get_prevention("t", "all good", None).is_empty());
    }
}
