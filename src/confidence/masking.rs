//! # Stage: Anti-Masking Guard
//!
//! ## Responsibility
//! Decide how much a success rate can be trusted given the evidence behind
//! it. Every rule here can only LOWER a quality value or raise a flag; none
//! of them ever increases a score.
//!
//! Per-record rules (applied by [`assess_quality`]):
//!
//! 1. **Low sample, high rate**: fewer than `min_samples` samples with a rate
//!    above `low_sample_success_rate` caps quality at `low_sample_quality_cap`.
//! 2. **Under-sampled perfect rate**: a rate of 1.0 with fewer than
//!    `perfect_rate_min_samples` samples caps quality at
//!    `perfect_rate_quality_cap`.
//! 3. **Sudden jump**: the last `recent_window` outcomes diverge from the
//!    overall rate by more than `recent_divergence`; quality capped at
//!    `divergence_quality_cap`.
//!
//! Global rules (applied by the scorer over a whole snapshot):
//!
//! 4. **Confidence jump**: overall confidence rose more than `jump_points`
//!    against the snapshot `jump_lookback` positions earlier.
//! 5. **Thin backing store**: a factor above `suspicious_factor_score` while
//!    the store behind it has fewer than `suspicious_min_entries` entries.
//!
//! ## Guarantees
//! - Quality is always in `[0, 1]`
//! - Zero samples means zero quality
//!
//! ## NOT Responsible For
//! - Retaining warnings (the engine keeps the rolling list)

use serde::{Deserialize, Serialize};

use crate::config::MaskingThresholds;

// ---------------------------------------------------------------------------
// Rules + warnings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskingRule {
    LowSampleHighRate,
    UnderSampledPerfectRate,
    SuddenJump,
    ConfidenceJump,
    ThinBackingStore,
}

impl std::fmt::Display for MaskingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaskingRule::LowSampleHighRate       => write!(f, "low_sample_high_rate"),
            MaskingRule::UnderSampledPerfectRate => write!(f, "under_sampled_perfect_rate"),
            MaskingRule::SuddenJump              => write!(f, "sudden_jump"),
            MaskingRule::ConfidenceJump          => write!(f, "confidence_jump"),
            MaskingRule::ThinBackingStore        => write!(f, "thin_backing_store"),
        }
    }
}

/// A single masking trigger, surfaced verbatim in every confidence report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskingWarning {
    pub timestamp_ms: u64,
    /// What was being scored, e.g. `pattern:issue_type:init_hang`.
    pub source: String,
    pub rule: MaskingRule,
    pub reason: String,
}

impl MaskingWarning {
    pub fn new(timestamp_ms: u64, source: impl Into<String>, rule: MaskingRule, reason: impl Into<String>) -> Self {
        Self { timestamp_ms, source: source.into(), rule, reason: reason.into() }
    }

    /// Same trigger on the same source, regardless of when.
    pub fn same_trigger(&self, other: &MaskingWarning) -> bool {
        self.source == other.source && self.rule == other.rule
    }
}

// ---------------------------------------------------------------------------
// Quality
// ---------------------------------------------------------------------------

/// Quality of one success rate plus the rules that fired computing it.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityAssessment {
    pub quality: f64,
    pub triggered: Vec<(MaskingRule, String)>,
}

/// Penalized quality of `rate` observed over `samples` attempts.
///
/// `recent` holds the latest outcomes, oldest first; the sudden-jump rule only
/// runs when at least `recent_window` of them are available.
pub fn assess_quality(rate: f64, samples: u64, recent: &[bool], th: &MaskingThresholds) -> QualityAssessment {
    if samples == 0 || !rate.is_finite() {
        return QualityAssessment { quality: 0.0, triggered: Vec::new() };
    }
    let rate = rate.clamp(0.0, 1.0);
    let mut quality = rate;
    let mut triggered = Vec::new();

    if samples < th.min_samples && rate > th.low_sample_success_rate {
        quality = quality.min(th.low_sample_quality_cap);
        triggered.push((
            MaskingRule::LowSampleHighRate,
            format!(
                "success rate {:.2} over only {} samples (minimum {})",
                rate, samples, th.min_samples
            ),
        ));
    }

    if rate >= 1.0 && samples < th.perfect_rate_min_samples {
        quality = quality.min(th.perfect_rate_quality_cap);
        triggered.push((
            MaskingRule::UnderSampledPerfectRate,
            format!(
                "perfect success rate over {} samples (needs {})",
                samples, th.perfect_rate_min_samples
            ),
        ));
    }

    if let Some(divergence) = recent_divergence(rate, recent, th.recent_window) {
        if divergence > th.recent_divergence {
            quality = quality.min(th.divergence_quality_cap);
            triggered.push((
                MaskingRule::SuddenJump,
                format!(
                    "last {} outcomes diverge {:.2} from overall rate {:.2}",
                    th.recent_window, divergence, rate
                ),
            ));
        }
    }

    QualityAssessment { quality: quality.clamp(0.0, 1.0), triggered }
}

/// Shorthand when the triggered rules are not needed.
pub fn quality(rate: f64, samples: u64, recent: &[bool], th: &MaskingThresholds) -> f64 {
    assess_quality(rate, samples, recent, th).quality
}

/// `|recent rate - overall rate|` over the last `window` outcomes, or `None`
/// when fewer than `window` outcomes exist.
pub fn recent_divergence(rate: f64, recent: &[bool], window: usize) -> Option<f64> {
    if window == 0 || recent.len() < window {
        return None;
    }
    let tail = &recent[recent.len() - window..];
    let recent_rate = tail.iter().filter(|ok| **ok).count() as f64 / window as f64;
    Some((recent_rate - rate).abs())
}

/// Rise of `current` over the value `lookback` positions back in `history`
/// (oldest first, not including `current`). `None` without enough history.
pub fn confidence_rise(history: &[f64], current: f64, lookback: usize) -> Option<f64> {
    if lookback == 0 || history.len() < lookback {
        return None;
    }
    Some(current - history[history.len() - lookback])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn th() -> MaskingThresholds {
        MaskingThresholds::default()
    }

    #[test]
    fn test_zero_samples_zero_quality() {
        assert_eq!(quality(1.0, 0, &[], &th()), 0.0);
    }

    #[rstest]
    #[case(0.9, 5, 0.3)]
    #[case(1.0, 3, 0.2)]
    #[case(1.0, 20, 0.2)]
    #[case(0.75, 60, 0.75)]
    #[case(0.5, 4, 0.5)]
    fn test_caps(#[case] rate: f64, #[case] samples: u64, #[case] expected: f64) {
        assert!((quality(rate, samples, &[], &th()) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_low_sample_and_perfect_both_fire() {
        let a = assess_quality(1.0, 3, &[], &th());
        let rules: Vec<_> = a.triggered.iter().map(|(r, _)| *r).collect();
        assert_eq!(rules, vec![MaskingRule::LowSampleHighRate, MaskingRule::UnderSampledPerfectRate]);
    }

    #[test]
    fn test_sudden_jump_caps_quality() {
        // 45 samples, rate ~0.11, last five all succeeded
        let recent = [true; 5];
        let a = assess_quality(5.0 / 45.0, 45, &recent, &th());
        assert!(a.triggered.iter().any(|(r, _)| *r == MaskingRule::SuddenJump));
        assert!(a.quality <= 0.4);
    }

    #[test]
    fn test_short_recent_window_skips_divergence() {
        assert_eq!(recent_divergence(0.0, &[true, true], 5), None);
    }

    #[test]
    fn test_confidence_rise() {
        let history = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(confidence_rise(&history, 75.0, 3), Some(55.0));
        assert_eq!(confidence_rise(&history[..2], 75.0, 3), None);
    }

    #[test]
    fn test_small_perfect_sample_scores_below_large_imperfect_one() {
        let small = quality(1.0, 3, &[], &th());
        let large = quality(0.75, 60, &[], &th());
        assert!(small < large);
    }

    proptest! {
        #[test]
        fn prop_quality_never_exceeds_rate(rate in 0.0f64..=1.0, samples in 0u64..200) {
            let q = quality(rate, samples, &[], &th());
            prop_assert!(q >= 0.0);
            prop_assert!(q <= rate + 1e-12);
        }
    }
}
