//! # Stage: Confidence Scorer
//!
//! ## Responsibility
//! Compute the seven factor scores from the knowledge stores, apply the
//! global masking rules, and assemble a [`ConfidenceSnapshot`].
//!
//! Factor formulas (each averaged over the store's entries, then clamped to
//! `[0, 100]`; an empty store scores 0):
//!
//! - pattern recognition: `min(freq/20, 1)*50 + quality*50`
//! - causal analysis: `min(len/5, 1)*50 + (tagged/len)*50`
//! - solution optimization: `quality(rate, attempts)*60 + min(alts/3, 1)*40`
//! - cross-issue learning: `min(related/5, 1)*50 + min(common/3, 1)*50`
//! - prediction accuracy: average pattern quality * 100
//! - data quality: for each of the four stores with data,
//!   `min(avg_evidence/threshold, 1)*25`, summed
//! - compliance: collaborator ratio * 100, 0 without data
//!
//! ## Guarantees
//! - Pure: scoring never mutates a store
//! - Masking only lowers scores or raises warnings
//!
//! ## NOT Responsible For
//! - Retaining history or warnings (see [`super::ConfidenceHistory`])
//! - Issuing directives (see [`super::adjust`])

use crate::config::MaskingThresholds;
use crate::knowledge::correlator::Correlator;
use crate::knowledge::optimizer::SolutionOptimizer;
use crate::knowledge::patterns::PatternStore;

use super::masking::{assess_quality, confidence_rise, MaskingRule, MaskingWarning};
use super::{ConfidenceSnapshot, Factor, FactorScores, SampleSizes};

/// Frequency at which a pattern's evidence counts as complete.
pub const PATTERN_FREQUENCY_TARGET: f64 = 20.0;
/// Chain length at which a causal chain counts as complete.
pub const CHAIN_LENGTH_TARGET: f64 = 5.0;
/// Alternatives needed for a full ranking bonus.
pub const ALTERNATIVES_TARGET: f64 = 3.0;
/// Related issues needed for a full cross-issue bonus.
pub const RELATED_TARGET: f64 = 5.0;
/// Common solutions needed for a full cross-issue bonus.
pub const COMMON_SOLUTIONS_TARGET: f64 = 3.0;
/// Average ranking attempts at which a ranking store counts as well fed.
pub const RANKING_ATTEMPTS_TARGET: f64 = 10.0;
/// Contribution of each store to the data quality factor.
pub const DATA_QUALITY_PER_STORE: f64 = 25.0;

/// Borrowed view of the stores a scoring pass reads.
#[derive(Debug, Clone, Copy)]
pub struct ScoringInputs<'a> {
    pub patterns: &'a PatternStore,
    pub correlator: &'a Correlator,
    pub optimizer: &'a SolutionOptimizer,
    pub compliance: Option<f64>,
    pub sample_sizes: SampleSizes,
}

/// Result of one scoring pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub factors: FactorScores,
    pub overall: f64,
    /// Every masking trigger of this pass.
    pub warnings: Vec<MaskingWarning>,
}

impl Evaluation {
    pub fn masking_detected(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Freeze into a snapshot carrying `recent_warnings` (already capped).
    pub fn into_snapshot(self, now_ms: u64, sample_sizes: SampleSizes, recent_warnings: Vec<MaskingWarning>) -> ConfidenceSnapshot {
        ConfidenceSnapshot {
            timestamp_ms: now_ms,
            overall_confidence: self.overall,
            masking_detected: self.masking_detected(),
            factors: self.factors,
            warnings: recent_warnings,
            sample_sizes,
        }
    }
}

// ---------------------------------------------------------------------------
// Factors
// ---------------------------------------------------------------------------

fn clamp_score(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn average(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Pattern recognition and prediction accuracy share the per-pattern quality,
/// so they are computed together.
fn pattern_factors(
    patterns: &PatternStore,
    th: &MaskingThresholds,
    now_ms: u64,
    warnings: &mut Vec<MaskingWarning>,
) -> (f64, f64) {
    let mut recognition = Vec::with_capacity(patterns.len());
    let mut qualities = Vec::with_capacity(patterns.len());
    for p in patterns.iter() {
        let assessment = assess_quality(p.success_rate, p.frequency, &p.recent_outcomes(), th);
        for (rule, reason) in assessment.triggered {
            warnings.push(MaskingWarning::new(now_ms, format!("pattern:{}", p.key()), rule, reason));
        }
        let evidence = (p.frequency as f64 / PATTERN_FREQUENCY_TARGET).min(1.0);
        recognition.push(evidence * 50.0 + assessment.quality * 50.0);
        qualities.push(assessment.quality);
    }
    (
        clamp_score(average(recognition.into_iter())),
        clamp_score(average(qualities.into_iter()) * 100.0),
    )
}

fn causal_factor(correlator: &Correlator) -> f64 {
    let scores = correlator.chains().values().filter(|c| !c.is_empty()).map(|c| {
        let len = c.len() as f64;
        (len / CHAIN_LENGTH_TARGET).min(1.0) * 50.0 + (c.tagged_links() as f64 / len) * 50.0
    });
    clamp_score(average(scores))
}

fn solution_factor(
    optimizer: &SolutionOptimizer,
    th: &MaskingThresholds,
    now_ms: u64,
    warnings: &mut Vec<MaskingWarning>,
) -> f64 {
    let mut scores = Vec::with_capacity(optimizer.len());
    for r in optimizer.rankings().values() {
        let assessment = assess_quality(r.success_rate, r.attempts, &[], th);
        for (rule, reason) in assessment.triggered {
            warnings.push(MaskingWarning::new(now_ms, format!("solution:{}", r.issue_type), rule, reason));
        }
        let alts = (r.alternatives.len() as f64 / ALTERNATIVES_TARGET).min(1.0);
        scores.push(assessment.quality * 60.0 + alts * 40.0);
    }
    clamp_score(average(scores.into_iter()))
}

fn cross_issue_factor(correlator: &Correlator) -> f64 {
    let scores = correlator.links().values().map(|l| {
        (l.related_issues.len() as f64 / RELATED_TARGET).min(1.0) * 50.0
            + (l.common_solutions.len() as f64 / COMMON_SOLUTIONS_TARGET).min(1.0) * 50.0
    });
    clamp_score(average(scores))
}

fn data_quality_factor(inputs: &ScoringInputs<'_>) -> f64 {
    let mut stores: Vec<(f64, f64)> = Vec::with_capacity(4);
    if !inputs.patterns.is_empty() {
        let avg = average(inputs.patterns.iter().map(|p| p.frequency as f64));
        stores.push((avg, PATTERN_FREQUENCY_TARGET));
    }
    if !inputs.correlator.chains().is_empty() {
        let avg = average(inputs.correlator.chains().values().map(|c| c.len() as f64));
        stores.push((avg, CHAIN_LENGTH_TARGET));
    }
    if !inputs.correlator.links().is_empty() {
        let avg = average(inputs.correlator.links().values().map(|l| l.related_issues.len() as f64));
        stores.push((avg, RELATED_TARGET));
    }
    if !inputs.optimizer.is_empty() {
        let avg = average(inputs.optimizer.rankings().values().map(|r| r.attempts as f64));
        stores.push((avg, RANKING_ATTEMPTS_TARGET));
    }
    clamp_score(
        stores
            .into_iter()
            .map(|(avg, target)| (avg / target).min(1.0) * DATA_QUALITY_PER_STORE)
            .sum(),
    )
}

/// Entries in the store behind `factor`; `None` when no store backs it.
fn backing_entries(factor: Factor, inputs: &ScoringInputs<'_>) -> Option<usize> {
    match factor {
        Factor::PatternRecognition | Factor::PredictionAccuracy => Some(inputs.patterns.len()),
        Factor::CausalAnalysis => Some(inputs.correlator.chains().len()),
        Factor::SolutionOptimization => Some(inputs.optimizer.len()),
        Factor::CrossIssueLearning => Some(inputs.correlator.links().len()),
        Factor::DataQuality => Some(
            inputs.patterns.len()
                + inputs.correlator.chains().len()
                + inputs.correlator.links().len()
                + inputs.optimizer.len(),
        ),
        Factor::Compliance => None,
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Score every factor and run every masking rule.
///
/// `history` is the overall confidence of earlier snapshots, oldest first.
pub fn evaluate(
    inputs: &ScoringInputs<'_>,
    history: &[f64],
    th: &MaskingThresholds,
    now_ms: u64,
) -> Evaluation {
    let mut warnings = Vec::new();

    let (pattern_recognition, prediction_accuracy) = pattern_factors(inputs.patterns, th, now_ms, &mut warnings);
    let factors = FactorScores {
        pattern_recognition,
        causal_analysis: causal_factor(inputs.correlator),
        solution_optimization: solution_factor(inputs.optimizer, th, now_ms, &mut warnings),
        cross_issue_learning: cross_issue_factor(inputs.correlator),
        prediction_accuracy,
        data_quality: data_quality_factor(inputs),
        compliance: clamp_score(inputs.compliance.map(|r| r.clamp(0.0, 1.0) * 100.0).unwrap_or(0.0)),
    };

    for (factor, score) in factors.iter() {
        let Some(entries) = backing_entries(factor, inputs) else { continue };
        if score > th.suspicious_factor_score && entries < th.suspicious_min_entries {
            warnings.push(MaskingWarning::new(
                now_ms,
                format!("factor:{}", factor),
                MaskingRule::ThinBackingStore,
                format!(
                    "{} scores {:.1} from only {} entries (minimum {})",
                    factor, score, entries, th.suspicious_min_entries
                ),
            ));
        }
    }

    let overall = factors.overall();
    if let Some(rise) = confidence_rise(history, overall, th.jump_lookback) {
        if rise > th.jump_points {
            warnings.push(MaskingWarning::new(
                now_ms,
                "confidence:overall",
                MaskingRule::ConfidenceJump,
                format!(
                    "overall confidence rose {:.1} points over the last {} snapshots",
                    rise, th.jump_lookback
                ),
            ));
        }
    }

    if !warnings.is_empty() {
        tracing::debug!(
            target: "learning::confidence",
            count = warnings.len(),
            overall,
            "masking rules triggered"
        );
    }

    Evaluation { factors, overall, warnings }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
