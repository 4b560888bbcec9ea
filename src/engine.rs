//! # Learning Engine
//!
//! The single owner of every knowledge store. All learning enters through
//! [`LearningEngine::learn_from_attempt`], which fans out in a fixed order:
//!
//! ```text
//! Attempt ──► MisdiagnosisMemory        (always)
//!        ──► PatternStore + Generalized (issue type, method, state, log)
//!        ──► success: Correlator + SolutionOptimizer
//!            failure: SolutionOptimizer attempt count
//!        ──► ChainDetector mitigation    (when fix_details names a chain)
//! ```
//!
//! Each touched store is written to the key/value backend right after it is
//! mutated. A failed write is logged and broadcast as
//! [`EngineEvent::PersistenceFailed`]; it never rolls back the in-memory state
//! and never reaches the caller.
//!
//! The engine is a plain owned struct. Share it between foreground recording
//! and the background [`crate::monitor::ConfidenceMonitor`] as a
//! [`SharedEngine`]; the mutex serializes both so a scoring pass always reads
//! a consistent view.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::confidence::adjust::AutoAdjuster;
use crate::confidence::scorer::{self, ScoringInputs};
use crate::confidence::{ConfidenceHistory, ConfidenceReport, SampleSizes};
use crate::error::{LearnError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::knowledge::chains::{ChainCaps, ChainDetection, ChainDetector, ChainKind, Mitigation, Operation, SIGNATURE_SEPARATOR};
use crate::knowledge::correlator::{Correlator, CorrelatorCaps};
use crate::knowledge::generalize::{attempt_context, categorize, generalize_log, generalize_state, state_pairs};
use crate::knowledge::misdiagnosis::{MisdiagnosisMemory, MisdiagnosisPrevention};
use crate::knowledge::optimizer::{RankedMethod, SolutionOptimizer};
use crate::knowledge::patterns::{pattern_key, Observation, PatternKind, PatternStore};
use crate::knowledge::{elect_solution, loosely_matches, CategoryObservation, GeneralizedStore};
use crate::persistence::adapter::*;
use crate::persistence::{KeyValueStore, MemoryStore};
use crate::types::{Attempt, ComplianceSource, FixTracker, Issue, IssueSource};

/// Engine handle shared between callers and the background monitor.
pub type SharedEngine = Arc<Mutex<LearningEngine>>;

/// `fix_details` key naming the chain a fix was applied to.
pub const DETAIL_CHAIN_SIGNATURE: &str = "chain_signature";
/// Optional `fix_details` key naming the chain kind.
pub const DETAIL_CHAIN_KIND: &str = "chain_kind";

/// Issue type substrings that route `get_best_solution` to the chain detector.
pub const CHAIN_HINTS: &[&str] = &["hang", "circular", "loop", "blocking", "sync"];

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// What one call to `learn_from_attempt` touched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LearnSummary {
    pub misdiagnosis_matches: Vec<String>,
    pub patterns_touched: Vec<String>,
    pub category: Option<String>,
    pub causal_chain_len: Option<usize>,
    pub cross_issue_links: Vec<String>,
    pub mitigation_recorded: Option<String>,
    /// Learning steps skipped for missing input, by name.
    pub skipped: Vec<&'static str>,
}

/// Which evidence produced a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SolutionSource {
    GeneralizedPattern,
    PatternStore,
    ChainDetector,
    SolutionRanking,
}

impl std::fmt::Display for SolutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolutionSource::GeneralizedPattern => write!(f, "generalized_pattern"),
            SolutionSource::PatternStore       => write!(f, "pattern_store"),
            SolutionSource::ChainDetector      => write!(f, "chain_detector"),
            SolutionSource::SolutionRanking    => write!(f, "solution_ranking"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolutionRecommendation {
    pub method: String,
    pub confidence: f64,
    pub source: SolutionSource,
    /// The issue type's ranked alternatives, best first.
    pub alternatives: Vec<RankedMethod>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// Generalized state the prediction is based on.
    pub pattern: String,
    pub likelihood: f64,
    pub issue_types: Vec<String>,
    pub suggested_method: Option<String>,
}

/// What `load()` found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<&'static str>,
    pub absent: Vec<&'static str>,
    /// Keys whose values did not parse; those stores start empty.
    pub corrupt: Vec<&'static str>,
    /// Legacy pattern entries folded into their generalized key.
    pub merged_legacy_patterns: usize,
}

// ---------------------------------------------------------------------------
// LearningEngine
// ---------------------------------------------------------------------------

pub struct LearningEngine {
    config: EngineConfig,
    patterns: PatternStore,
    misdiagnosis: MisdiagnosisMemory,
    correlator: Correlator,
    optimizer: SolutionOptimizer,
    chains: ChainDetector,
    generalized: GeneralizedStore,
    confidence: ConfidenceHistory,
    adjuster: AutoAdjuster,
    persistence: Persistence,
    issues: Option<Arc<dyn IssueSource>>,
    fix_tracker: Option<Arc<dyn FixTracker>>,
    compliance: Option<Arc<dyn ComplianceSource>>,
    events: EventBus,
}

impl std::fmt::Debug for LearningEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearningEngine")
            .field("patterns", &self.patterns.len())
            .field("misdiagnosis", &self.misdiagnosis.len())
            .field("causal_chains", &self.correlator.chains().len())
            .field("rankings", &self.optimizer.len())
            .field("chain_records", &self.chains.len())
            .finish_non_exhaustive()
    }
}

impl LearningEngine {
    /// Empty engine writing to `store`. Call [`load`](Self::load) to restore
    /// earlier state.
    pub fn new(config: EngineConfig, store: Box<dyn KeyValueStore>) -> Self {
        let caps = &config.caps;
        Self {
            patterns: PatternStore::new(caps.recent_solutions, caps.recent_contexts),
            misdiagnosis: MisdiagnosisMemory::new(caps.failed_methods),
            correlator: Correlator::new(correlator_caps(&config)),
            optimizer: SolutionOptimizer::new(caps.alternatives),
            chains: ChainDetector::new(chain_caps(&config), config.default_chain_confidence),
            generalized: GeneralizedStore::new(caps.generalized_members),
            confidence: ConfidenceHistory::new(caps.confidence_history, caps.masking_warnings),
            adjuster: AutoAdjuster::new(),
            persistence: Persistence::new(store),
            issues: None,
            fix_tracker: None,
            compliance: None,
            events: EventBus::default(),
            config,
        }
    }

    /// Engine over a fresh [`MemoryStore`].
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(config, Box::new(MemoryStore::new()))
    }

    pub fn with_issue_source(mut self, issues: Arc<dyn IssueSource>) -> Self {
        self.issues = Some(issues);
        self
    }

    pub fn with_fix_tracker(mut self, tracker: Arc<dyn FixTracker>) -> Self {
        self.fix_tracker = Some(tracker);
        self
    }

    pub fn with_compliance(mut self, compliance: Arc<dyn ComplianceSource>) -> Self {
        self.compliance = Some(compliance);
        self
    }

    pub fn into_shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // -- accessors ----------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn patterns(&self) -> &PatternStore {
        &self.patterns
    }

    pub fn misdiagnosis(&self) -> &MisdiagnosisMemory {
        &self.misdiagnosis
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn optimizer(&self) -> &SolutionOptimizer {
        &self.optimizer
    }

    pub fn chains(&self) -> &ChainDetector {
        &self.chains
    }

    pub fn generalized(&self) -> &GeneralizedStore {
        &self.generalized
    }

    pub fn confidence_history(&self) -> &ConfidenceHistory {
        &self.confidence
    }

    pub fn adjuster(&self) -> &AutoAdjuster {
        &self.adjuster
    }

    pub fn store(&self) -> &dyn KeyValueStore {
        self.persistence.store()
    }

    pub fn into_store(self) -> Box<dyn KeyValueStore> {
        self.persistence.into_store()
    }

    /// Engine-wide success rate of a fix method: the fix tracker's figure
    /// when it has one, otherwise the engine's own fix-method pattern.
    pub fn method_rate(&self, method: &str) -> f64 {
        engine_rate(self.fix_tracker.as_deref(), &self.patterns, method)
    }

    // -----------------------------------------------------------------------
    // Learning
    // -----------------------------------------------------------------------

    /// Learn from one completed fix attempt.
    pub fn learn_from_attempt(&mut self, attempt: &Attempt) -> LearnSummary {
        let mut summary = LearnSummary::default();
        let success = attempt.succeeded();

        // 1. misdiagnosis memory, regardless of outcome
        summary.misdiagnosis_matches = if success {
            self.misdiagnosis.record_success(attempt)
        } else {
            self.misdiagnosis.record_failure(attempt)
        };
        self.persist(&[KEY_MISDIAGNOSIS, KEY_FAILED_METHODS]);
        for key in &summary.misdiagnosis_matches {
            self.events.publish(EngineEvent::MisdiagnosisMatched { key: key.clone(), outcome: attempt.result });
        }

        // 2. patterns
        self.record_patterns(attempt, &mut summary);

        // 3. outcome-specific stores
        match (attempt.issue_type(), attempt.fix_method()) {
            (Some(issue_type), Some(method)) if success => {
                let rate = self.method_rate(method);
                if let Some(root) = self.resolve_root(attempt, issue_type) {
                    let active = self.issues.as_ref().map(|s| s.active_issues()).unwrap_or_default();
                    let c = self.correlator.record_success(&root, &active, method, rate, attempt.timestamp_ms);
                    summary.causal_chain_len = Some(c.chain_len);
                    summary.cross_issue_links = c.links_touched;
                    self.persist(&[KEY_CAUSAL_CHAINS, KEY_CROSS_ISSUE_LINKS]);
                }
                self.optimizer.record_success(issue_type, method, rate);
                self.persist(&[KEY_SOLUTION_RANKINGS]);
            }
            (Some(issue_type), method) if !success => {
                let rate = method.map(|m| self.method_rate(m));
                self.optimizer.record_failure(issue_type, method, rate);
                self.persist(&[KEY_SOLUTION_RANKINGS]);
            }
            (None, _) => summary.skipped.push("solution_ranking"),
            (Some(_), None) => summary.skipped.push("correlation"),
            _ => {}
        }

        // 4. chain mitigation
        self.record_chain_mitigation(attempt, &mut summary);

        tracing::debug!(
            target: "learning::engine",
            issue_id = %attempt.issue_id,
            outcome = %attempt.result,
            patterns = summary.patterns_touched.len(),
            misdiagnosis = summary.misdiagnosis_matches.len(),
            skipped = ?summary.skipped,
            "attempt learned"
        );
        self.events.publish(EngineEvent::Learned {
            issue_id: attempt.issue_id.clone(),
            issue_type: attempt.issue_type().map(str::to_string),
            fix_method: attempt.fix_method().map(str::to_string),
            outcome: attempt.result,
        });
        summary
    }

    fn record_patterns(&mut self, attempt: &Attempt, summary: &mut LearnSummary) {
        let context = attempt_context(attempt);
        let method = attempt.fix_method();
        let obs = Observation { method, context: &context, outcome: attempt.result, timestamp_ms: attempt.timestamp_ms };

        let mut targets: Vec<(PatternKind, String)> = Vec::with_capacity(4);
        match attempt.issue_type() {
            Some(t) => targets.push((PatternKind::IssueType, t.to_string())),
            None => summary.skipped.push("issue_type_pattern"),
        }
        if let Some(m) = method {
            targets.push((PatternKind::FixMethod, m.to_string()));
        }
        if let Some(state) = attempt.state.as_ref().filter(|s| !s.is_empty()) {
            targets.push((PatternKind::GeneralizedState, generalize_state(state)));
        }
        if let Some(msg) = attempt.error_message.as_deref() {
            let key = generalize_log(msg);
            if !key.is_empty() {
                targets.push((PatternKind::GeneralizedLog, key));
            }
        }

        for (kind, value) in &targets {
            let p = self.patterns.record_outcome(*kind, value, obs.clone());
            summary.patterns_touched.push(p.key());
        }
        if !targets.is_empty() {
            self.persist(&[KEY_PATTERNS]);
        }

        let Some(issue_type) = attempt.issue_type() else { return };
        let Some(category) = categorize(issue_type, attempt.error_message.as_deref()) else { return };
        let instance = pattern_key(PatternKind::IssueType, issue_type);
        self.generalized.record(
            category,
            CategoryObservation {
                instance: &instance,
                component: attempt.component.as_deref(),
                solution: method.filter(|_| attempt.succeeded()),
                success: attempt.succeeded(),
            },
        );
        // rates moved for this attempt's method, successes and failures alike
        let (tracker, patterns) = (self.fix_tracker.as_deref(), &self.patterns);
        self.generalized.elect(category, |m| engine_rate(tracker, patterns, m));
        summary.category = Some(category.to_string());
        self.persist(&[KEY_GENERALIZED]);
    }

    /// The issue a successful attempt resolved: the detector's record when
    /// available, otherwise one synthesized from the attempt.
    fn resolve_root(&self, attempt: &Attempt, issue_type: &str) -> Option<Issue> {
        if let Some(issue) = self.issues.as_ref().and_then(|s| s.get_issue(&attempt.issue_id)) {
            return Some(issue);
        }
        if attempt.issue_id.trim().is_empty() {
            return None;
        }
        let mut issue = Issue::new(attempt.issue_id.clone(), issue_type);
        issue.root_cause = attempt.diagnosis.as_ref().map(|d| d.root_cause.clone());
        issue.details = attempt
            .fix_details
            .iter()
            .filter(|(k, _)| k.as_str() != DETAIL_CHAIN_SIGNATURE && k.as_str() != DETAIL_CHAIN_KIND)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        issue.first_seen_ms = attempt.timestamp_ms;
        Some(issue)
    }

    fn record_chain_mitigation(&mut self, attempt: &Attempt, summary: &mut LearnSummary) {
        let Some(signature) = attempt.fix_details.get(DETAIL_CHAIN_SIGNATURE).filter(|s| !s.trim().is_empty()) else {
            return;
        };
        let Some(method) = attempt.fix_method() else {
            summary.skipped.push("chain_mitigation");
            return;
        };
        let kind = attempt
            .fix_details
            .get(DETAIL_CHAIN_KIND)
            .and_then(|k| ChainKind::parse(k))
            .unwrap_or_else(|| infer_chain_kind(signature));

        self.chains.record_mitigation(kind, signature, method, attempt.succeeded(), attempt.timestamp_ms);
        let frequency = self.chains.get(kind, signature).map(|r| r.frequency).unwrap_or(0);
        self.persist(&[chain_key(kind)]);
        self.events.publish(EngineEvent::ChainRecorded { kind, signature: signature.clone(), frequency });
        summary.mitigation_recorded = Some(signature.clone());
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Best known fix for an issue type, trying evidence from most to least
    /// specific: generalized patterns, issue-type patterns, chain mitigations
    /// (for hang/loop-like types), then the solution ranking.
    pub fn get_best_solution(&self, issue_type: &str) -> Option<SolutionRecommendation> {
        let issue_type = issue_type.trim();
        if issue_type.is_empty() {
            return None;
        }
        let alternatives = self
            .optimizer
            .ranking(issue_type)
            .map(|r| r.alternatives.clone())
            .unwrap_or_default();
        let recommend = |method: &str, confidence: f64, source| SolutionRecommendation {
            method: method.to_string(),
            confidence,
            source,
            alternatives: alternatives.clone(),
        };

        if let Some((method, rate)) = self.best_generalized(issue_type) {
            return Some(recommend(method, rate, SolutionSource::GeneralizedPattern));
        }
        if let Some((method, rate)) = self.best_from_patterns(issue_type) {
            return Some(recommend(method, rate, SolutionSource::PatternStore));
        }
        let lower = issue_type.to_lowercase();
        if CHAIN_HINTS.iter().any(|h| lower.contains(h)) {
            let kind = if lower.contains("circular") || lower.contains("loop") {
                ChainKind::CircularDependency
            } else {
                ChainKind::BlockingChain
            };
            let Mitigation { method, confidence, .. } = self.chains.best_mitigation(kind);
            return Some(recommend(&method, confidence, SolutionSource::ChainDetector));
        }
        self.optimizer
            .best(issue_type)
            .map(|(method, rate)| recommend(method, rate, SolutionSource::SolutionRanking))
    }

    /// Elected at lookup time from current rates, so a stored winner whose
    /// method has since been failing does not outlive the evidence.
    fn best_generalized(&self, issue_type: &str) -> Option<(&str, f64)> {
        let category = categorize(issue_type, None);
        self.generalized
            .iter()
            .filter(|g| loosely_matches(&g.category, issue_type) || Some(g.category.as_str()) == category)
            .filter_map(|g| {
                elect_solution(g.candidates().map(|m| (m, self.method_rate(m)))).map(|(m, r)| (m, r, g.attempts))
            })
            .max_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.2.cmp(&b.2))
            })
            .map(|(m, rate, _)| (m, rate))
    }

    fn best_from_patterns(&self, issue_type: &str) -> Option<(&str, f64)> {
        let mut candidates: Vec<_> = self
            .patterns
            .of_kind(PatternKind::IssueType)
            .filter(|p| loosely_matches(&p.value, issue_type))
            .collect();
        // exact match first, then most frequent
        candidates.sort_by(|a, b| {
            let exact_a = a.value.eq_ignore_ascii_case(issue_type);
            let exact_b = b.value.eq_ignore_ascii_case(issue_type);
            exact_b.cmp(&exact_a).then(b.frequency.cmp(&a.frequency))
        });

        for p in candidates {
            let mut best: Option<(&str, f64)> = None;
            // newest first, so a tie keeps the most recent method
            for method in p.successful_methods() {
                let rate = self.method_rate(method);
                if best.map_or(true, |(_, r)| rate > r) {
                    best = Some((method, rate));
                }
            }
            if best.is_some() {
                return best;
            }
        }
        None
    }

    pub fn get_misdiagnosis_prevention(
        &self,
        issue_type: &str,
        error_message: &str,
        component: Option<&str>,
    ) -> MisdiagnosisPrevention {
        self.misdiagnosis.get_prevention(issue_type, error_message, component)
    }

    /// Generalized states that most resemble `current_state` and have failed
    /// before, most likely first.
    pub fn predict_issues(&self, current_state: &BTreeMap<String, serde_json::Value>) -> Vec<Prediction> {
        let current = generalize_state(current_state);
        let current_pairs: BTreeSet<&str> = state_pairs(&current).into_iter().collect();
        if current_pairs.is_empty() {
            return Vec::new();
        }

        let mut predictions: Vec<Prediction> = self
            .patterns
            .of_kind(PatternKind::GeneralizedState)
            .filter(|p| p.failures > 0 && p.frequency > 0)
            .filter_map(|p| {
                let pairs: BTreeSet<&str> = p.state_pairs().into_iter().collect();
                let shared = pairs.intersection(&current_pairs).count();
                if shared == 0 {
                    return None;
                }
                let overlap = shared as f64 / pairs.len().max(current_pairs.len()) as f64;
                let failure_rate = p.failures as f64 / p.frequency as f64;
                let issue_types: Vec<String> = p.context_issue_types().into_iter().map(str::to_string).collect();
                let suggested_method = issue_types
                    .first()
                    .and_then(|t| self.get_best_solution(t))
                    .map(|r| r.method);
                Some(Prediction {
                    pattern: p.value.clone(),
                    likelihood: failure_rate * overlap,
                    issue_types,
                    suggested_method,
                })
            })
            .collect();

        predictions.sort_by(|a, b| {
            b.likelihood
                .partial_cmp(&a.likelihood)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pattern.cmp(&b.pattern))
        });
        predictions.truncate(self.config.max_predictions);
        predictions
    }

    /// Scan a call sequence for a closed loop; a hit is recorded and persisted.
    pub fn detect_circular_dependency<S: AsRef<str>>(&mut self, sequence: &[S]) -> Option<ChainDetection> {
        let detection = self.chains.detect_circular_dependency(sequence, now_ms())?;
        self.after_detection(&detection);
        Some(detection)
    }

    /// Find two or more blocking operations in a trace; a hit is recorded and
    /// persisted.
    pub fn detect_blocking_chain(&mut self, operations: &[Operation]) -> Option<ChainDetection> {
        let detection = self.chains.detect_blocking_chain(operations, now_ms())?;
        self.after_detection(&detection);
        Some(detection)
    }

    fn after_detection(&mut self, d: &ChainDetection) {
        self.persist(&[chain_key(d.kind)]);
        self.events.publish(EngineEvent::ChainRecorded {
            kind: d.kind,
            signature: d.signature.clone(),
            frequency: d.frequency,
        });
    }

    // -----------------------------------------------------------------------
    // Confidence
    // -----------------------------------------------------------------------

    pub fn sample_sizes(&self) -> SampleSizes {
        SampleSizes {
            patterns: self.patterns.len(),
            causal_chains: self.correlator.chains().len(),
            cross_issue_links: self.correlator.links().len(),
            solution_rankings: self.optimizer.len(),
            misdiagnosis_patterns: self.misdiagnosis.len(),
            chain_records: self.chains.len(),
            generalized_patterns: self.generalized.len(),
        }
    }

    fn scoring_inputs(&self) -> ScoringInputs<'_> {
        ScoringInputs {
            patterns: &self.patterns,
            correlator: &self.correlator,
            optimizer: &self.optimizer,
            compliance: self.compliance.as_ref().and_then(|c| c.success_ratio()),
            sample_sizes: self.sample_sizes(),
        }
    }

    /// Current confidence, computed without recording anything.
    pub fn get_confidence(&self) -> ConfidenceReport {
        self.get_confidence_at(now_ms())
    }

    pub fn get_confidence_at(&self, now_ms: u64) -> ConfidenceReport {
        let inputs = self.scoring_inputs();
        let eval = scorer::evaluate(&inputs, &self.confidence.overall_values(), &self.config.masking, now_ms);
        let retained = self.confidence.preview_warnings(&eval.warnings);
        let recent = tail(&retained, self.config.caps.snapshot_warnings);
        ConfidenceReport {
            snapshot: eval.into_snapshot(now_ms, inputs.sample_sizes, recent),
            masking_warnings: retained,
            directives: self.adjuster.active(),
            history_len: self.confidence.snapshots().len(),
        }
    }

    /// One background scoring pass: compute, retain the snapshot and
    /// warnings, refresh directives, persist, and broadcast.
    pub fn run_scoring_cycle(&mut self, now_ms: u64) -> ConfidenceReport {
        let inputs = self.scoring_inputs();
        let sizes = inputs.sample_sizes;
        let eval = scorer::evaluate(&inputs, &self.confidence.overall_values(), &self.config.masking, now_ms);
        let new_warnings = eval.warnings.clone();
        let (overall, factors) = (eval.overall, eval.factors);

        self.confidence.retain_warnings(&new_warnings);
        let retained: Vec<_> = self.confidence.warnings().iter().cloned().collect();
        let snapshot = eval.into_snapshot(now_ms, sizes, tail(&retained, self.config.caps.snapshot_warnings));
        self.confidence.push_snapshot(snapshot.clone());
        let directives = self.adjuster.refresh(&factors, overall, &self.config.adjustment, now_ms);

        self.persist(&[KEY_CONFIDENCE_HISTORY, KEY_MASKING_WARNINGS, KEY_ADJUSTMENTS]);

        for warning in &new_warnings {
            tracing::warn!(
                target: "learning::confidence",
                source = %warning.source,
                rule = %warning.rule,
                reason = %warning.reason,
                "masking detected"
            );
            self.events.publish(EngineEvent::MaskingDetected { warning: warning.clone() });
        }
        for directive in &directives {
            self.events.publish(EngineEvent::Adjustment { directive: directive.clone() });
        }
        tracing::info!(
            target: "learning::confidence",
            overall = %format!("{:.1}", overall),
            masking = snapshot.masking_detected,
            directives = directives.len(),
            "confidence cycle complete"
        );
        self.events.publish(EngineEvent::ConfidenceUpdated {
            overall,
            masking_detected: snapshot.masking_detected,
        });

        ConfidenceReport {
            snapshot,
            masking_warnings: retained,
            directives,
            history_len: self.confidence.snapshots().len(),
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Write every store. Unchanged stores are not rewritten. Returns the
    /// first backend error after attempting every key.
    pub fn save(&mut self) -> Result<()> {
        let mut first_err = None;
        for key in ALL_KEYS {
            if let Err(e) = self.write_key(key) {
                tracing::warn!(target: "learning::persistence", key, error = %e, "save failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Replace in-memory state with what the backend holds.
    ///
    /// Absent keys start empty; unparseable values start that store empty
    /// with a warning; a backend read failure aborts the load. Legacy,
    /// un-generalized pattern keys are merged and the result written back.
    pub fn load(&mut self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let caps = self.config.caps.clone();

        let mut patterns: PatternStore = self.read_key(KEY_PATTERNS, &mut report)?;
        patterns.set_caps(caps.recent_solutions, caps.recent_contexts);
        let misdiagnosis = self.read_key(KEY_MISDIAGNOSIS, &mut report)?;
        let failed = self.read_key(KEY_FAILED_METHODS, &mut report)?;
        let chains = self.read_key(KEY_CAUSAL_CHAINS, &mut report)?;
        let links = self.read_key(KEY_CROSS_ISSUE_LINKS, &mut report)?;
        let rankings = self.read_key(KEY_SOLUTION_RANKINGS, &mut report)?;
        let circular = self.read_key(KEY_CIRCULAR, &mut report)?;
        let blocking = self.read_key(KEY_BLOCKING, &mut report)?;
        let mut generalized: GeneralizedStore = self.read_key(KEY_GENERALIZED, &mut report)?;
        generalized.set_cap(caps.generalized_members);
        let history = self.read_key(KEY_CONFIDENCE_HISTORY, &mut report)?;
        let warnings = self.read_key(KEY_MASKING_WARNINGS, &mut report)?;
        let adjuster = self.read_key(KEY_ADJUSTMENTS, &mut report)?;

        report.merged_legacy_patterns = patterns.cleanup_legacy();

        self.patterns = patterns;
        self.misdiagnosis = MisdiagnosisMemory::from_parts(misdiagnosis, failed, caps.failed_methods);
        self.correlator = Correlator::from_parts(chains, links, correlator_caps(&self.config));
        self.optimizer = SolutionOptimizer::from_rankings(rankings, caps.alternatives);
        self.chains = ChainDetector::from_parts(
            circular,
            blocking,
            chain_caps(&self.config),
            self.config.default_chain_confidence,
        );
        self.generalized = generalized;
        self.confidence = ConfidenceHistory::from_parts(history, warnings, caps.confidence_history, caps.masking_warnings);
        self.adjuster = adjuster;

        if report.merged_legacy_patterns > 0 {
            tracing::info!(
                target: "learning::persistence",
                merged = report.merged_legacy_patterns,
                "legacy pattern keys merged"
            );
            self.persist(&[KEY_PATTERNS]);
        }
        tracing::info!(
            target: "learning::persistence",
            loaded = report.loaded.len(),
            absent = report.absent.len(),
            corrupt = report.corrupt.len(),
            "state loaded"
        );
        Ok(report)
    }

    fn read_key<T>(&mut self, key: &'static str, report: &mut LoadReport) -> Result<T>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        let loaded = self.persistence.read::<T>(key)?;
        match &loaded {
            Loaded::Present(_) => report.loaded.push(key),
            Loaded::Absent => report.absent.push(key),
            Loaded::Corrupt(reason) => {
                let err = LearnError::CorruptValue { key: key.to_string(), reason: reason.clone() };
                tracing::warn!(
                    target: "learning::persistence",
                    error = %err,
                    "starting this store empty"
                );
                report.corrupt.push(key);
            }
        }
        Ok(loaded.into_value())
    }

    fn write_key(&mut self, key: &str) -> Result<bool> {
        let p = &mut self.persistence;
        match key {
            KEY_PATTERNS => p.write(key, &self.patterns),
            KEY_MISDIAGNOSIS => p.write(key, self.misdiagnosis.patterns()),
            KEY_FAILED_METHODS => p.write(key, self.misdiagnosis.failed_methods()),
            KEY_CAUSAL_CHAINS => p.write(key, self.correlator.chains()),
            KEY_CROSS_ISSUE_LINKS => p.write(key, self.correlator.links()),
            KEY_SOLUTION_RANKINGS => p.write(key, self.optimizer.rankings()),
            KEY_CIRCULAR => p.write(key, self.chains.circular()),
            KEY_BLOCKING => p.write(key, self.chains.blocking()),
            KEY_GENERALIZED => p.write(key, &self.generalized),
            KEY_CONFIDENCE_HISTORY => p.write(key, self.confidence.snapshots()),
            KEY_MASKING_WARNINGS => p.write(key, self.confidence.warnings()),
            KEY_ADJUSTMENTS => p.write(key, &self.adjuster),
            _ => Ok(false),
        }
    }

    /// Best-effort write after a mutation.
    fn persist(&mut self, keys: &[&'static str]) {
        for key in keys {
            if let Err(e) = self.write_key(key) {
                tracing::warn!(
                    target: "learning::persistence",
                    key,
                    error = %e,
                    "write failed; in-memory state kept"
                );
                self.events.publish(EngineEvent::PersistenceFailed { key: key.to_string(), error: e.to_string() });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The fix tracker's rate when it has one, else the fix-method pattern's.
fn engine_rate(tracker: Option<&dyn FixTracker>, patterns: &PatternStore, method: &str) -> f64 {
    tracker
        .and_then(|t| t.success_rate(method))
        .or_else(|| patterns.success_rate(PatternKind::FixMethod, method))
        .filter(|r| r.is_finite())
        .map(|r| r.clamp(0.0, 1.0))
        .unwrap_or(0.0)
}

fn correlator_caps(config: &EngineConfig) -> CorrelatorCaps {
    CorrelatorCaps {
        chain_links: config.caps.chain_links,
        related_issues: config.caps.related_issues,
        common_solutions: config.caps.common_solutions,
    }
}

fn chain_caps(config: &EngineConfig) -> ChainCaps {
    ChainCaps { steps: config.caps.chain_steps, solutions: config.caps.chain_solutions }
}

fn chain_key(kind: ChainKind) -> &'static str {
    match kind {
        ChainKind::CircularDependency => KEY_CIRCULAR,
        ChainKind::BlockingChain => KEY_BLOCKING,
    }
}

/// A signature that starts and ends on the same step is a cycle.
fn infer_chain_kind(signature: &str) -> ChainKind {
    let steps: Vec<&str> = signature.split(SIGNATURE_SEPARATOR).collect();
    match (steps.first(), steps.last()) {
        (Some(first), Some(last)) if steps.len() >= 3 && first == last => ChainKind::CircularDependency,
        _ => ChainKind::BlockingChain,
    }
}

fn tail<T: Clone>(list: &[T], n: usize) -> Vec<T> {
    list[list.len().saturating_sub(n)..].to_vec()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Outcome, StaticFixRates, StaticIssues};
    use serde_json::json;

    fn make_engine() -> LearningEngine {
        LearningEngine::in_memory(EngineConfig::default())
    }

    fn success(id: &str, issue_type: &str, method: &str) -> Attempt {
        Attempt::new(id, issue_type, method, Outcome::Success, 1_000)
    }

    fn failure(id: &str, issue_type: &str, method: &str) -> Attempt {
        Attempt::new(id, issue_type, method, Outcome::Failure, 1_000)
    }

    #[test]
    fn test_learn_records_issue_type_and_method_patterns() {
        let mut e = make_engine();
        let s = e.learn_from_attempt(&success("i1", "db_timeout", "retry"));
        assert!(s.patterns_touched.contains(&"issue_type:db_timeout".to_string()));
        assert!(s.patterns_touched.contains(&"fix_method:retry".to_string()));
        assert_eq!(s.category.as_deref(), Some("timeout_handling"));
        assert_eq!(e.patterns().len(), 2);
    }

    #[test]
    fn test_missing_issue_type_skips_only_dependent_steps() {
        let mut e = make_engine();
        let attempt = Attempt::new("i1", "", "add_brace", Outcome::Failure, 0)
            .with_error("missing closing bracket");
        let s = e.learn_from_attempt(&attempt);
        assert!(s.skipped.contains(&"issue_type_pattern"));
        assert!(s.skipped.contains(&"solution_ranking"));
        // method and log patterns still recorded
        assert!(s.patterns_touched.contains(&"fix_method:add_brace".to_string()));
        assert!(e.optimizer().is_empty());
    }

    #[test]
    fn test_state_and_log_are_generalized() {
        let mut e = make_engine();
        let mut state = BTreeMap::new();
        state.insert("queue".to_string(), json!(250));
        state.insert("workers".to_string(), json!(0));
        let attempt = failure("i1", "queue_stall", "restart")
            .with_state(state)
            .with_error("worker 17 stuck at 0xdeadbeef");
        let s = e.learn_from_attempt(&attempt);
        assert!(s.patterns_touched.contains(&"generalized_state:queue=high,workers=zero".to_string()));
        assert!(s.patterns_touched.contains(&"generalized_log:worker <n> stuck at <hex>".to_string()));
    }

    #[test]
    fn test_success_builds_causal_chain_from_issue_source() {
        let issues = StaticIssues::new(vec![
            Issue::new("root", "init_hang").with_root_cause("sync_startup"),
            Issue::new("other", "db_timeout").with_root_cause("sync_startup"),
        ]);
        let mut e = make_engine().with_issue_source(Arc::new(issues));
        let s = e.learn_from_attempt(&success("root", "init_hang", "defer_init"));
        assert_eq!(s.causal_chain_len, Some(2));
        assert_eq!(s.cross_issue_links, vec!["db_timeout|init_hang".to_string()]);
    }

    #[test]
    fn test_chain_mitigation_recorded_from_details() {
        let mut e = make_engine();
        let attempt = success("i1", "startup_loop", "lazy_init").with_detail(DETAIL_CHAIN_SIGNATURE, "a->b->a");
        let s = e.learn_from_attempt(&attempt);
        assert_eq!(s.mitigation_recorded.as_deref(), Some("a->b->a"));
        let m = e.chains().mitigation_for(ChainKind::CircularDependency, "a->b->a");
        assert_eq!(m.method, "lazy_init");
        assert!(m.from_history);
    }

    #[test]
    fn test_chain_kind_inference() {
        assert_eq!(infer_chain_kind("a->b->a"), ChainKind::CircularDependency);
        assert_eq!(infer_chain_kind("read_sync->lock"), ChainKind::BlockingChain);
    }

    #[test]
    fn test_best_solution_prefers_higher_rate() {
        let rates = StaticFixRates::new([("fast", 0.9), ("slow", 0.6)]);
        let mut e = make_engine().with_fix_tracker(Arc::new(rates));
        e.learn_from_attempt(&success("i1", "db_timeout", "slow"));
        e.learn_from_attempt(&success("i2", "db_timeout", "fast"));
        let r = e.get_best_solution("db_timeout").unwrap();
        assert_eq!(r.method, "fast");
        assert!((r.confidence - 0.9).abs() < 1e-9);
        let alts: Vec<_> = r.alternatives.iter().map(|a| a.method.as_str()).collect();
        assert_eq!(alts, vec!["fast", "slow"]);
    }

    #[test]
    fn test_best_solution_falls_back_to_chain_default() {
        let e = make_engine();
        let r = e.get_best_solution("event_loop_stall").unwrap();
        assert_eq!(r.source, SolutionSource::ChainDetector);
        assert!((r.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_best_solution_none_for_unknown_type() {
        assert!(make_engine().get_best_solution("quota_exceeded").is_none());
        assert!(make_engine().get_best_solution("  ").is_none());
    }

    #[test]
    fn test_predict_issues_ranks_failing_states() {
        let mut e = make_engine();
        let mut hot = BTreeMap::new();
        hot.insert("cpu".to_string(), json!(95));
        hot.insert("queue".to_string(), json!(500));
        for i in 0..3 {
            e.learn_from_attempt(&failure(&format!("i{}", i), "queue_stall", "restart").with_state(hot.clone()));
        }
        let mut now = BTreeMap::new();
        now.insert("cpu".to_string(), json!(80));
        now.insert("queue".to_string(), json!(300));
        let preds = e.predict_issues(&now);
        assert_eq!(preds.len(), 1);
        assert!((preds[0].likelihood - 1.0).abs() < 1e-9);
        assert_eq!(preds[0].issue_types, vec!["queue_stall".to_string()]);
        assert!(e.predict_issues(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_get_confidence_is_pure() {
        let mut e = make_engine();
        e.learn_from_attempt(&success("i1", "t", "m"));
        let before = e.confidence_history().snapshots().len();
        let _ = e.get_confidence_at(5);
        assert_eq!(e.confidence_history().snapshots().len(), before);
        assert!(e.confidence_history().warnings().is_empty());
    }

    #[test]
    fn test_scoring_cycle_retains_snapshot_and_directives() {
        let mut e = make_engine();
        e.learn_from_attempt(&success("i1", "t", "m"));
        let report = e.run_scoring_cycle(10);
        assert_eq!(report.history_len, 1);
        assert!(report.snapshot.masking_detected);
        assert!(report.snapshot.warnings.len() <= 5);
        assert!(!report.directives.is_empty());
        assert_eq!(report.directives[0].cycles, 1);
        let again = e.run_scoring_cycle(20);
        assert!(again.directives.iter().all(|d| d.cycles == 2));
    }

    #[tokio::test]
    async fn test_events_published() {
        let mut e = make_engine();
        let mut rx = e.subscribe();
        e.learn_from_attempt(&success("i1", "t", "m"));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name(), "learned");
    }
}
