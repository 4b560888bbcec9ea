//! # Engine configuration
//!
//! All tunables live here. Every struct implements `Default` with the values
//! the engine ships with, and deserializes with `#[serde(default)]` so a TOML
//! file only needs to name the fields it overrides:
//!
//! ```toml
//! scoring_interval_secs = 60
//!
//! [masking]
//! min_samples = 20
//! ```
//!
//! The seven confidence factor weights are intentionally NOT configurable; see
//! [`crate::confidence::WEIGHTS`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

// ---------------------------------------------------------------------------
// List caps
// ---------------------------------------------------------------------------

/// Per-entity list caps. Entity counts are unbounded; the lists inside each
/// entity are not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListCaps {
    pub recent_solutions: usize,
    pub recent_contexts: usize,
    pub chain_links: usize,
    pub related_issues: usize,
    pub common_solutions: usize,
    pub alternatives: usize,
    pub chain_steps: usize,
    pub chain_solutions: usize,
    pub failed_methods: usize,
    pub generalized_members: usize,
    pub masking_warnings: usize,
    pub snapshot_warnings: usize,
    pub confidence_history: usize,
}

impl Default for ListCaps {
    fn default() -> Self {
        Self {
            recent_solutions: 5,
            recent_contexts: 5,
            chain_links: 20,
            related_issues: 50,
            common_solutions: 10,
            alternatives: 10,
            chain_steps: 20,
            chain_solutions: 10,
            failed_methods: 20,
            generalized_members: 50,
            masking_warnings: 20,
            snapshot_warnings: 5,
            confidence_history: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Masking thresholds
// ---------------------------------------------------------------------------

/// Anti-masking heuristics. The numbers are empirical; they are kept as named
/// values so deployments can override them without touching the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingThresholds {
    /// Below this many samples a high success rate is not trusted.
    pub min_samples: u64,
    /// Success rate above which a small sample is suspicious.
    pub low_sample_success_rate: f64,
    /// Quality ceiling for a small, high-success sample.
    pub low_sample_quality_cap: f64,
    /// A perfect rate needs at least this many samples.
    pub perfect_rate_min_samples: u64,
    /// Quality ceiling for an under-sampled perfect rate.
    pub perfect_rate_quality_cap: f64,
    /// Number of most recent outcomes compared with the overall rate.
    pub recent_window: usize,
    /// Divergence between recent and overall rate that signals a sudden jump.
    pub recent_divergence: f64,
    /// Quality ceiling when the sudden-jump signature fires.
    pub divergence_quality_cap: f64,
    /// Rise in overall confidence (points) that sets the global flag.
    pub jump_points: f64,
    /// How many snapshots back the rise is measured against.
    pub jump_lookback: usize,
    /// Factor score above which a thin backing store is suspicious.
    pub suspicious_factor_score: f64,
    /// Backing store size below which a very high factor is suspicious.
    pub suspicious_min_entries: usize,
}

impl Default for MaskingThresholds {
    fn default() -> Self {
        Self {
            min_samples: 10,
            low_sample_success_rate: 0.8,
            low_sample_quality_cap: 0.3,
            perfect_rate_min_samples: 50,
            perfect_rate_quality_cap: 0.2,
            recent_window: 5,
            recent_divergence: 0.5,
            divergence_quality_cap: 0.4,
            jump_points: 30.0,
            jump_lookback: 3,
            suspicious_factor_score: 95.0,
            suspicious_min_entries: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Adjustment thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdjustmentThresholds {
    /// Overall confidence below this issues directives.
    pub low: f64,
    /// Overall confidence below this raises directive priority to critical.
    pub critical: f64,
}

impl Default for AdjustmentThresholds {
    fn default() -> Self {
        Self { low: 50.0, critical: 30.0 }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub caps: ListCaps,
    pub masking: MaskingThresholds,
    pub adjustment: AdjustmentThresholds,
    /// Period of the background confidence scoring loop.
    pub scoring_interval_secs: u64,
    /// Confidence attached to the generic mitigation when a chain has no
    /// recorded mitigations yet.
    pub default_chain_confidence: f64,
    /// Maximum predictions returned by `predict_issues`.
    pub max_predictions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            caps: ListCaps::default(),
            masking: MaskingThresholds::default(),
            adjustment: AdjustmentThresholds::default(),
            scoring_interval_secs: 300,
            default_chain_confidence: 0.85,
            max_predictions: 5,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document. Missing fields keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn scoring_interval(&self) -> Duration {
        Duration::from_secs(self.scoring_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_thresholds() {
        let c = EngineConfig::default();
        assert_eq!(c.masking.min_samples, 10);
        assert_eq!(c.masking.perfect_rate_min_samples, 50);
        assert!((c.masking.jump_points - 30.0).abs() < 1e-9);
        assert!((c.adjustment.low - 50.0).abs() < 1e-9);
        assert!((c.adjustment.critical - 30.0).abs() < 1e-9);
        assert_eq!(c.caps.recent_solutions, 5);
        assert_eq!(c.caps.masking_warnings, 20);
        assert_eq!(c.caps.confidence_history, 100);
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let c = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(c, EngineConfig::default());
    }

    #[test]
    fn test_partial_toml_overrides_only_named_fields() {
        let c = EngineConfig::from_toml_str(
            "scoring_interval_secs = 60\n[masking]\nmin_samples = 25\n",
        )
        .unwrap();
        assert_eq!(c.scoring_interval_secs, 60);
        assert_eq!(c.masking.min_samples, 25);
        assert_eq!(c.masking.perfect_rate_min_samples, 50);
        assert_eq!(c.caps, ListCaps::default());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = EngineConfig::from_toml_str("scoring_interval_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, crate::error::LearnError::Config(_)));
    }

    #[test]
    fn test_default_scoring_interval_is_five_minutes() {
        assert_eq!(EngineConfig::default().scoring_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_scoring_interval_never_zero() {
        let c = EngineConfig { scoring_interval_secs: 0, ..EngineConfig::default() };
        assert_eq!(c.scoring_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "max_predictions = 3\n").unwrap();
        let c = EngineConfig::load(&path).unwrap();
        assert_eq!(c.max_predictions, 3);
    }
}
