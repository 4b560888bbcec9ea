//! # Confidence
//!
//! One trust score for everything the engine has learned, built from seven
//! factors with fixed weights:
//!
//! | Factor                 | Weight |
//! |------------------------|--------|
//! | pattern recognition    | 0.18   |
//! | causal analysis        | 0.18   |
//! | solution optimization  | 0.22   |
//! | cross-issue learning   | 0.13   |
//! | prediction accuracy    | 0.09   |
//! | data quality           | 0.09   |
//! | compliance             | 0.11   |
//!
//! The weights are a policy decision and are not configurable. Scoring lives
//! in [`scorer`], the anti-masking rules in [`masking`], and the directives
//! issued on low confidence in [`adjust`].

pub mod adjust;
pub mod masking;
pub mod scorer;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use self::adjust::AdjustmentDirective;
use self::masking::MaskingWarning;

// ---------------------------------------------------------------------------
// Factors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    PatternRecognition,
    CausalAnalysis,
    SolutionOptimization,
    CrossIssueLearning,
    PredictionAccuracy,
    DataQuality,
    Compliance,
}

impl Factor {
    pub const ALL: [Factor; 7] = [
        Factor::PatternRecognition,
        Factor::CausalAnalysis,
        Factor::SolutionOptimization,
        Factor::CrossIssueLearning,
        Factor::PredictionAccuracy,
        Factor::DataQuality,
        Factor::Compliance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Factor::PatternRecognition   => "pattern_recognition",
            Factor::CausalAnalysis       => "causal_analysis",
            Factor::SolutionOptimization => "solution_optimization",
            Factor::CrossIssueLearning   => "cross_issue_learning",
            Factor::PredictionAccuracy   => "prediction_accuracy",
            Factor::DataQuality          => "data_quality",
            Factor::Compliance           => "compliance",
        }
    }

    pub fn weight(self) -> f64 {
        WEIGHTS.iter().find(|(f, _)| *f == self).map(|(_, w)| *w).unwrap_or(0.0)
    }
}

impl std::fmt::Display for Factor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed factor weights; they sum to 1.0.
pub const WEIGHTS: [(Factor, f64); 7] = [
    (Factor::PatternRecognition, 0.18),
    (Factor::CausalAnalysis, 0.18),
    (Factor::SolutionOptimization, 0.22),
    (Factor::CrossIssueLearning, 0.13),
    (Factor::PredictionAccuracy, 0.09),
    (Factor::DataQuality, 0.09),
    (Factor::Compliance, 0.11),
];

/// Per-factor scores, each in `[0, 100]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FactorScores {
    pub pattern_recognition: f64,
    pub causal_analysis: f64,
    pub solution_optimization: f64,
    pub cross_issue_learning: f64,
    pub prediction_accuracy: f64,
    pub data_quality: f64,
    pub compliance: f64,
}

impl FactorScores {
    pub fn get(&self, factor: Factor) -> f64 {
        match factor {
            Factor::PatternRecognition   => self.pattern_recognition,
            Factor::CausalAnalysis       => self.causal_analysis,
            Factor::SolutionOptimization => self.solution_optimization,
            Factor::CrossIssueLearning   => self.cross_issue_learning,
            Factor::PredictionAccuracy   => self.prediction_accuracy,
            Factor::DataQuality          => self.data_quality,
            Factor::Compliance           => self.compliance,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Factor, f64)> + '_ {
        Factor::ALL.into_iter().map(move |f| (f, self.get(f)))
    }

    /// Weighted overall confidence, clamped to `[0, 100]`.
    pub fn overall(&self) -> f64 {
        WEIGHTS
            .iter()
            .map(|(f, w)| self.get(*f) * w)
            .sum::<f64>()
            .clamp(0.0, 100.0)
    }
}

/// How much evidence sat behind a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSizes {
    pub patterns: usize,
    pub causal_chains: usize,
    pub cross_issue_links: usize,
    pub solution_rankings: usize,
    pub misdiagnosis_patterns: usize,
    pub chain_records: usize,
    pub generalized_patterns: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceSnapshot {
    pub timestamp_ms: u64,
    pub overall_confidence: f64,
    pub factors: FactorScores,
    pub masking_detected: bool,
    /// Most recent masking warnings at the time of the snapshot.
    pub warnings: Vec<MaskingWarning>,
    pub sample_sizes: SampleSizes,
}

/// What `get_confidence` hands back to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidenceReport {
    pub snapshot: ConfidenceSnapshot,
    /// The full rolling warning list, oldest first.
    pub masking_warnings: Vec<MaskingWarning>,
    pub directives: Vec<AdjustmentDirective>,
    pub history_len: usize,
}

// ---------------------------------------------------------------------------
// Rolling history
// ---------------------------------------------------------------------------

/// Bounded snapshot history and masking-warning list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfidenceHistory {
    snapshots: VecDeque<ConfidenceSnapshot>,
    warnings: VecDeque<MaskingWarning>,
    snapshot_cap: usize,
    warning_cap: usize,
}

impl ConfidenceHistory {
    pub fn new(snapshot_cap: usize, warning_cap: usize) -> Self {
        Self {
            snapshots: VecDeque::new(),
            warnings: VecDeque::new(),
            snapshot_cap: snapshot_cap.max(1),
            warning_cap: warning_cap.max(1),
        }
    }

    pub fn from_parts(
        snapshots: VecDeque<ConfidenceSnapshot>,
        warnings: VecDeque<MaskingWarning>,
        snapshot_cap: usize,
        warning_cap: usize,
    ) -> Self {
        let mut h = Self::new(snapshot_cap, warning_cap);
        h.snapshots = snapshots;
        h.warnings = warnings;
        trim(&mut h.snapshots, h.snapshot_cap);
        trim(&mut h.warnings, h.warning_cap);
        h
    }

    pub fn snapshots(&self) -> &VecDeque<ConfidenceSnapshot> {
        &self.snapshots
    }

    pub fn warnings(&self) -> &VecDeque<MaskingWarning> {
        &self.warnings
    }

    pub fn latest(&self) -> Option<&ConfidenceSnapshot> {
        self.snapshots.back()
    }

    /// Overall confidence of every retained snapshot, oldest first.
    pub fn overall_values(&self) -> Vec<f64> {
        self.snapshots.iter().map(|s| s.overall_confidence).collect()
    }

    pub fn push_snapshot(&mut self, snapshot: ConfidenceSnapshot) {
        self.snapshots.push_back(snapshot);
        trim(&mut self.snapshots, self.snapshot_cap);
    }

    /// Append warnings. A repeat of a retained trigger replaces it, so the
    /// list shows distinct problems with their latest timestamp.
    pub fn retain_warnings(&mut self, new: &[MaskingWarning]) {
        for w in new {
            self.warnings.retain(|old| !old.same_trigger(w));
            self.warnings.push_back(w.clone());
        }
        trim(&mut self.warnings, self.warning_cap);
    }

    /// The retained list as it would look after `retain_warnings(new)`.
    pub fn preview_warnings(&self, new: &[MaskingWarning]) -> Vec<MaskingWarning> {
        let mut copy = self.clone();
        copy.retain_warnings(new);
        copy.warnings.into_iter().collect()
    }
}

fn trim<T>(list: &mut VecDeque<T>, cap: usize) {
    while list.len() > cap {
        list.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::masking::MaskingRule;
    use super::*;

    fn make_snapshot(ts: u64, overall: f64) -> ConfidenceSnapshot {
        ConfidenceSnapshot {
            timestamp_ms: ts,
            overall_confidence: overall,
            factors: FactorScores::default(),
            masking_detected: false,
            warnings: Vec::new(),
            sample_sizes: SampleSizes::default(),
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let sum: f64 = WEIGHTS.iter().map(|(_, w)| w).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_overall_is_weighted_sum() {
        let scores = FactorScores { solution_optimization: 100.0, compliance: 50.0, ..Default::default() };
        assert!((scores.overall() - (22.0 + 5.5)).abs() < 1e-9);
    }

    #[test]
    fn test_all_factors_at_100_gives_100() {
        let s = FactorScores {
            pattern_recognition: 100.0,
            causal_analysis: 100.0,
            solution_optimization: 100.0,
            cross_issue_learning: 100.0,
            prediction_accuracy: 100.0,
            data_quality: 100.0,
            compliance: 100.0,
        };
        assert!((s.overall() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_capped() {
        let mut h = ConfidenceHistory::new(100, 20);
        for i in 0..150 {
            h.push_snapshot(make_snapshot(i, i as f64 / 2.0));
        }
        assert_eq!(h.snapshots().len(), 100);
        assert_eq!(h.snapshots().front().unwrap().timestamp_ms, 50);
    }

    #[test]
    fn test_warnings_capped_and_refreshed() {
        let mut h = ConfidenceHistory::new(100, 20);
        for i in 0..30 {
            h.retain_warnings(&[MaskingWarning::new(i, format!("s{}", i), MaskingRule::SuddenJump, "r")]);
        }
        assert_eq!(h.warnings().len(), 20);

        h.retain_warnings(&[MaskingWarning::new(99, "s15", MaskingRule::SuddenJump, "r")]);
        assert_eq!(h.warnings().len(), 20);
        assert_eq!(h.warnings().back().unwrap().timestamp_ms, 99);
        assert_eq!(h.warnings().iter().filter(|w| w.source == "s15").count(), 1);
    }
}
