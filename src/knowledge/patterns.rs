//! # Stage: Pattern Store
//!
//! ## Responsibility
//! Frequency/success-tracked records keyed by `(kind, value)`. Callers pass
//! values that are already generalized (see [`super::generalize`]); the store
//! only counts, appends bounded history, and recomputes rates.
//!
//! ## Guarantees
//! - `successes + failures == frequency` for every pattern, always
//! - Bounded: `recent_solutions` and `recent_contexts` never exceed their caps
//!   (oldest evicted first)
//! - Legacy keys stored before generalization existed can be re-generalized
//!   and merged with [`PatternStore::cleanup_legacy`]
//!
//! ## NOT Responsible For
//! - Deciding which values to record (the engine does that)
//! - Persisting itself (the persistence adapter serializes the whole store)

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::generalize::{generalize_log, regeneralize_state, state_pairs};
use crate::types::Outcome;

// ---------------------------------------------------------------------------
// PatternKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    IssueType,
    FixMethod,
    GeneralizedState,
    GeneralizedLog,
}

impl PatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternKind::IssueType => "issue_type",
            PatternKind::FixMethod => "fix_method",
            PatternKind::GeneralizedState => "generalized_state",
            PatternKind::GeneralizedLog => "generalized_log",
        }
    }

    /// Apply the generalization rule for this kind to a stored value.
    pub fn regeneralize(self, value: &str) -> String {
        match self {
            PatternKind::IssueType | PatternKind::FixMethod => value.to_string(),
            PatternKind::GeneralizedState => regeneralize_state(value),
            PatternKind::GeneralizedLog => generalize_log(value),
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store key for a pattern.
pub fn pattern_key(kind: PatternKind, value: &str) -> String {
    format!("{}:{}", kind, value)
}

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

/// One method tried against a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolutionEntry {
    pub method: String,
    pub result: Outcome,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub kind: PatternKind,
    pub value: String,
    pub frequency: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub recent_solutions: VecDeque<SolutionEntry>,
    pub recent_contexts: VecDeque<BTreeMap<String, String>>,
    #[serde(default)]
    pub last_seen_ms: u64,
}

impl Pattern {
    pub fn new(kind: PatternKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            frequency: 0,
            successes: 0,
            failures: 0,
            success_rate: 0.0,
            recent_solutions: VecDeque::new(),
            recent_contexts: VecDeque::new(),
            last_seen_ms: 0,
        }
    }

    pub fn key(&self) -> String {
        pattern_key(self.kind, &self.value)
    }

    fn recompute_rate(&mut self) {
        self.success_rate = if self.frequency == 0 {
            0.0
        } else {
            self.successes as f64 / self.frequency as f64
        };
    }

    /// Outcomes of the retained recent solutions, oldest first.
    pub fn recent_outcomes(&self) -> Vec<bool> {
        self.recent_solutions.iter().map(|s| s.result.is_success()).collect()
    }

    /// Methods that succeeded among the recent solutions, newest first,
    /// without duplicates.
    pub fn successful_methods(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for s in self.recent_solutions.iter().rev() {
            if s.result.is_success() && !out.contains(&s.method.as_str()) {
                out.push(&s.method);
            }
        }
        out
    }

    /// Issue types seen in the retained contexts, without duplicates.
    pub fn context_issue_types(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for ctx in &self.recent_contexts {
            if let Some(t) = ctx.get("issue_type") {
                if !out.contains(&t.as_str()) {
                    out.push(t);
                }
            }
        }
        out
    }

    /// For generalized-state patterns, the `k=bucket` pairs of the key.
    pub fn state_pairs(&self) -> Vec<&str> {
        state_pairs(&self.value)
    }
}

// ---------------------------------------------------------------------------
// PatternStore
// ---------------------------------------------------------------------------

/// What a single recording contributes to a pattern.
#[derive(Debug, Clone)]
pub struct Observation<'a> {
    pub method: Option<&'a str>,
    pub context: &'a BTreeMap<String, String>,
    pub outcome: Outcome,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternStore {
    patterns: BTreeMap<String, Pattern>,
    #[serde(skip)]
    caps: PatternCaps,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PatternCaps {
    solutions: usize,
    contexts: usize,
}

impl Default for PatternCaps {
    fn default() -> Self {
        Self { solutions: 5, contexts: 5 }
    }
}

impl PatternStore {
    pub fn new(solutions_cap: usize, contexts_cap: usize) -> Self {
        Self {
            patterns: BTreeMap::new(),
            caps: PatternCaps { solutions: solutions_cap.max(1), contexts: contexts_cap.max(1) },
        }
    }

    /// Re-apply caps after deserialization (caps are not serialized).
    pub fn set_caps(&mut self, solutions_cap: usize, contexts_cap: usize) {
        self.caps = PatternCaps { solutions: solutions_cap.max(1), contexts: contexts_cap.max(1) };
        for p in self.patterns.values_mut() {
            truncate_front(&mut p.recent_solutions, self.caps.solutions);
            truncate_front(&mut p.recent_contexts, self.caps.contexts);
        }
    }

    /// Record one observation against `(kind, value)`, creating the pattern on
    /// first sight. Returns the updated pattern.
    pub fn record_outcome(
        &mut self,
        kind: PatternKind,
        value: &str,
        obs: Observation<'_>,
    ) -> &Pattern {
        let caps = self.caps;
        let p = self
            .patterns
            .entry(pattern_key(kind, value))
            .or_insert_with(|| Pattern::new(kind, value));

        p.frequency += 1;
        match obs.outcome {
            Outcome::Success => p.successes += 1,
            Outcome::Failure => p.failures += 1,
        }
        if let Some(method) = obs.method {
            p.recent_solutions.push_back(SolutionEntry {
                method: method.to_string(),
                result: obs.outcome,
                timestamp_ms: obs.timestamp_ms,
            });
            truncate_front(&mut p.recent_solutions, caps.solutions);
        }
        p.recent_contexts.push_back(obs.context.clone());
        truncate_front(&mut p.recent_contexts, caps.contexts);
        p.last_seen_ms = p.last_seen_ms.max(obs.timestamp_ms);
        p.recompute_rate();
        p
    }

    pub fn get(&self, kind: PatternKind, value: &str) -> Option<&Pattern> {
        self.patterns.get(&pattern_key(kind, value))
    }

    pub fn success_rate(&self, kind: PatternKind, value: &str) -> Option<f64> {
        self.get(kind, value).map(|p| p.success_rate)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.values()
    }

    pub fn of_kind(&self, kind: PatternKind) -> impl Iterator<Item = &Pattern> {
        self.patterns.values().filter(move |p| p.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Insert a pattern verbatim (used by loaders and tests that seed history).
    pub fn insert(&mut self, pattern: Pattern) {
        self.patterns.insert(pattern.key(), pattern);
    }

    /// Re-generalize every stored key and merge entries that now collide.
    ///
    /// Counters are summed. Recent lists are concatenated, ordered by
    /// timestamp and re-capped keeping the newest; on equal timestamps the
    /// entry from the pattern with the higher success rate is kept. Returns
    /// how many entries were folded into another.
    pub fn cleanup_legacy(&mut self) -> usize {
        let caps = self.caps;
        let old = std::mem::take(&mut self.patterns);
        let mut merged_count = 0;

        for (_, mut p) in old {
            // Repair counters that disagree with frequency.
            if p.successes + p.failures != p.frequency {
                p.frequency = p.successes + p.failures;
            }
            p.value = p.kind.regeneralize(&p.value);
            let key = p.key();
            match self.patterns.remove(&key) {
                None => {
                    p.recompute_rate();
                    self.patterns.insert(key, p);
                }
                Some(existing) => {
                    merged_count += 1;
                    let merged = merge_patterns(existing, p, caps);
                    self.patterns.insert(key, merged);
                }
            }
        }
        merged_count
    }
}

fn merge_patterns(a: Pattern, b: Pattern, caps: PatternCaps) -> Pattern {
    // `hi` wins timestamp ties.
    let (lo, hi) = if b.success_rate > a.success_rate { (a, b) } else { (b, a) };

    let mut solutions: Vec<(u64, u8, SolutionEntry)> = Vec::new();
    solutions.extend(lo.recent_solutions.into_iter().map(|s| (s.timestamp_ms, 0, s)));
    solutions.extend(hi.recent_solutions.into_iter().map(|s| (s.timestamp_ms, 1, s)));
    solutions.sort_by_key(|(ts, rank, _)| (*ts, *rank));

    let mut contexts: VecDeque<BTreeMap<String, String>> = lo.recent_contexts;
    contexts.extend(hi.recent_contexts);

    let mut out = Pattern {
        kind: hi.kind,
        value: hi.value,
        frequency: lo.frequency + hi.frequency,
        successes: lo.successes + hi.successes,
        failures: lo.failures + hi.failures,
        success_rate: 0.0,
        recent_solutions: solutions.into_iter().map(|(_, _, s)| s).collect(),
        recent_contexts: contexts,
        last_seen_ms: lo.last_seen_ms.max(hi.last_seen_ms),
    };
    truncate_front(&mut out.recent_solutions, caps.solutions);
    truncate_front(&mut out.recent_contexts, caps.contexts);
    out.recompute_rate();
    out
}

fn truncate_front<T>(list: &mut VecDeque<T>, cap: usize) {
    while list.len() > cap {
        list.pop_front();
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

#[cfg(test)]
pub fn make_pattern(kind: PatternKind, value: &str, frequency: u64, successes: u64) -> Pattern {
    let mut p = Pattern::new(kind, value);
    p.frequency = frequency;
    p.successes = successes;
    p.failures = frequency - successes;
    p.recompute_rate();
    p
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store() -> PatternStore {
        PatternStore::new(5, 5)
    }

    fn obs<'a>(
        method: &'a str,
        ctx: &'a BTreeMap<String, String>,
        outcome: Outcome,
        ts: u64,
    ) -> Observation<'a> {
        Observation { method: Some(method), context: ctx, outcome, timestamp_ms: ts }
    }

    #[test]
    fn test_record_creates_pattern() {
        let mut s = store();
        let ctx = BTreeMap::new();
        s.record_outcome(PatternKind::IssueType, "init_hang", obs("a", &ctx, Outcome::Failure, 1));
        let p = s.get(PatternKind::IssueType, "init_hang").unwrap();
        assert_eq!(p.frequency, 1);
        assert_eq!(p.failures, 1);
        assert_eq!(p.success_rate, 0.0);
    }

    #[test]
    fn test_success_rate_recomputed() {
        let mut s = store();
        let ctx = BTreeMap::new();
        s.record_outcome(PatternKind::FixMethod, "m", obs("m", &ctx, Outcome::Failure, 1));
        s.record_outcome(PatternKind::FixMethod, "m", obs("m", &ctx, Outcome::Success, 2));
        assert!((s.success_rate(PatternKind::FixMethod, "m").unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_recent_lists_capped_oldest_evicted() {
        let mut s = store();
        let ctx = BTreeMap::new();
        for i in 0..8 {
            s.record_outcome(
                PatternKind::IssueType,
                "t",
                obs(&format!("m{}", i), &ctx, Outcome::Failure, i),
            );
        }
        let p = s.get(PatternKind::IssueType, "t").unwrap();
        assert_eq!(p.recent_solutions.len(), 5);
        assert_eq!(p.recent_contexts.len(), 5);
        assert_eq!(p.recent_solutions.front().unwrap().method, "m3");
        assert_eq!(p.recent_solutions.back().unwrap().method, "m7");
    }

    #[test]
    fn test_successful_methods_newest_first_dedup() {
        let mut s = store();
        let ctx = BTreeMap::new();
        s.record_outcome(PatternKind::IssueType, "t", obs("a", &ctx, Outcome::Success, 1));
        s.record_outcome(PatternKind::IssueType, "t", obs("b", &ctx, Outcome::Failure, 2));
        s.record_outcome(PatternKind::IssueType, "t", obs("c", &ctx, Outcome::Success, 3));
        s.record_outcome(PatternKind::IssueType, "t", obs("a", &ctx, Outcome::Success, 4));
        let p = s.get(PatternKind::IssueType, "t").unwrap();
        assert_eq!(p.successful_methods(), vec!["a", "c"]);
    }

    #[test]
    fn test_context_issue_types() {
        let mut s = store();
        let ctx: BTreeMap<String, String> =
            [("issue_type".to_string(), "disk_full".to_string())].into();
        s.record_outcome(PatternKind::GeneralizedState, "disk=high", obs("x", &ctx, Outcome::Failure, 1));
        s.record_outcome(PatternKind::GeneralizedState, "disk=high", obs("x", &ctx, Outcome::Failure, 2));
        let p = s.get(PatternKind::GeneralizedState, "disk=high").unwrap();
        assert_eq!(p.context_issue_types(), vec!["disk_full"]);
    }

    #[test]
    fn test_cleanup_merges_legacy_state_keys() {
        let mut s = store();
        let mut a = make_pattern(PatternKind::GeneralizedState, "cpu=71", 4, 1);
        a.recent_solutions.push_back(SolutionEntry {
            method: "restart".into(),
            result: Outcome::Failure,
            timestamp_ms: 10,
        });
        let mut b = make_pattern(PatternKind::GeneralizedState, "cpu=93", 6, 6);
        b.recent_solutions.push_back(SolutionEntry {
            method: "throttle".into(),
            result: Outcome::Success,
            timestamp_ms: 10,
        });
        s.insert(a);
        s.insert(b);

        let merged = s.cleanup_legacy();
        assert_eq!(merged, 1);
        assert_eq!(s.len(), 1);
        let p = s.get(PatternKind::GeneralizedState, "cpu=medium").unwrap();
        assert_eq!(p.frequency, 10);
        assert_eq!(p.successes, 7);
        assert_eq!(p.failures, 3);
        assert!((p.success_rate - 0.7).abs() < 1e-9);
        // tie on timestamp: higher-rate side's method is newest
        assert_eq!(p.recent_solutions.back().unwrap().method, "throttle");
    }

    #[test]
    fn test_cleanup_recaps_merged_lists() {
        let mut s = store();
        let mut a = make_pattern(PatternKind::GeneralizedLog, "Failed at 12", 4, 0);
        let mut b = make_pattern(PatternKind::GeneralizedLog, "failed at 99", 4, 0);
        for i in 0..4 {
            let e = |m: &str| SolutionEntry { method: m.into(), result: Outcome::Failure, timestamp_ms: i };
            a.recent_solutions.push_back(e("a"));
            b.recent_solutions.push_back(e("b"));
            a.recent_contexts.push_back(BTreeMap::new());
            b.recent_contexts.push_back(BTreeMap::new());
        }
        s.insert(a);
        s.insert(b);
        s.cleanup_legacy();
        let p = s.get(PatternKind::GeneralizedLog, "failed at <n>").unwrap();
        assert_eq!(p.recent_solutions.len(), 5);
        assert_eq!(p.recent_contexts.len(), 5);
        assert_eq!(p.frequency, 8);
    }

    #[test]
    fn test_cleanup_leaves_generalized_store_unchanged() {
        let mut s = store();
        let ctx = BTreeMap::new();
        s.record_outcome(PatternKind::GeneralizedState, "cpu=low", obs("a", &ctx, Outcome::Success, 1));
        s.record_outcome(PatternKind::IssueType, "Init_Hang", obs("a", &ctx, Outcome::Success, 1));
        let before = s.clone();
        assert_eq!(s.cleanup_legacy(), 0);
        assert_eq!(s, before);
    }

    #[test]
    fn test_cleanup_repairs_inconsistent_counters() {
        let mut s = store();
        let mut p = make_pattern(PatternKind::IssueType, "t", 5, 2);
        p.frequency = 9;
        s.insert(p);
        s.cleanup_legacy();
        let p = s.get(PatternKind::IssueType, "t").unwrap();
        assert_eq!(p.frequency, p.successes + p.failures);
    }

    #[test]
    fn test_serde_transparent_map() {
        let mut s = store();
        let ctx = BTreeMap::new();
        s.record_outcome(PatternKind::IssueType, "t", obs("a", &ctx, Outcome::Success, 1));
        let json = serde_json::to_value(&s).unwrap();
        assert!(json.get("issue_type:t").is_some());
    }

    proptest! {
        #[test]
        fn prop_counters_consistent_and_lists_bounded(
            ops in proptest::collection::vec((0u8..4, any::<bool>(), 0u8..6), 0..200)
        ) {
            let mut s = PatternStore::new(5, 5);
            let ctx = BTreeMap::new();
            for (kind, ok, v) in ops {
                let kind = match kind {
                    0 => PatternKind::IssueType,
                    1 => PatternKind::FixMethod,
                    2 => PatternKind::GeneralizedState,
                    _ => PatternKind::GeneralizedLog,
                };
                let outcome = if ok { Outcome::Success } else { Outcome::Failure };
                let value = format!("v{}", v);
                s.record_outcome(kind, &value, Observation {
                    method: Some("m"),
                    context: &ctx,
                    outcome,
                    timestamp_ms: 0,
                });
            }
            for p in s.iter() {
                prop_assert_eq!(p.successes + p.failures, p.frequency);
                prop_assert!(p.recent_solutions.len() <= 5);
                prop_assert!(p.recent_contexts.len() <= 5);
            }
        }
    }
}
