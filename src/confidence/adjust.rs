//! # Stage: Auto-Adjustment
//!
//! ## Responsibility
//! Turn low confidence into standing directives. When overall confidence is
//! under the `low` threshold, every factor under that threshold gets a
//! directive naming what to collect more of. Priority is `Critical` while
//! overall confidence is also under the `critical` threshold.
//!
//! Directives are not one-shot alerts: an active directive is re-emitted on
//! every scoring cycle, with its cycle count incremented, until its factor
//! climbs back to the `low` threshold.
//!
//! ## NOT Responsible For
//! - Acting on directives (callers and operators do)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::AdjustmentThresholds;

use super::{Factor, FactorScores};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High     => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// What to do about a weak factor.
pub fn action_for(factor: Factor) -> &'static str {
    match factor {
        Factor::PatternRecognition   => "increase pattern collection",
        Factor::CausalAnalysis       => "record root causes on resolved issues to deepen causal chains",
        Factor::SolutionOptimization => "try and record alternative fix methods",
        Factor::CrossIssueLearning   => "correlate related issues across types",
        Factor::PredictionAccuracy   => "gather more outcomes to validate predictions",
        Factor::DataQuality          => "collect more evidence per pattern before trusting it",
        Factor::Compliance           => "improve rule compliance tracking",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentDirective {
    pub factor: Factor,
    pub action: String,
    pub priority: Priority,
    /// Factor score when last issued.
    pub score: f64,
    pub first_issued_ms: u64,
    pub last_issued_ms: u64,
    /// Scoring cycles this directive has been emitted on.
    pub cycles: u64,
}

/// Active directives, keyed by factor name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AutoAdjuster {
    directives: BTreeMap<String, AdjustmentDirective>,
}

impl AutoAdjuster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Vec<AdjustmentDirective> {
        self.directives.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// Run one cycle. Returns every directive emitted this cycle.
    pub fn refresh(
        &mut self,
        factors: &FactorScores,
        overall: f64,
        th: &AdjustmentThresholds,
        now_ms: u64,
    ) -> Vec<AdjustmentDirective> {
        let priority = if overall < th.critical { Priority::Critical } else { Priority::High };
        let mut emitted = Vec::new();

        for (factor, score) in factors.iter() {
            let key = factor.as_str();
            if score >= th.low {
                if self.directives.remove(key).is_some() {
                    tracing::info!(
                        target: "learning::adjust",
                        factor = key,
                        score,
                        "factor recovered; directive retired"
                    );
                }
                continue;
            }

            match self.directives.get_mut(key) {
                Some(d) => {
                    d.cycles += 1;
                    d.last_issued_ms = now_ms;
                    d.score = score;
                    d.priority = priority;
                    emitted.push(d.clone());
                }
                None if overall < th.low => {
                    let d = AdjustmentDirective {
                        factor,
                        action: action_for(factor).to_string(),
                        priority,
                        score,
                        first_issued_ms: now_ms,
                        last_issued_ms: now_ms,
                        cycles: 1,
                    };
                    self.directives.insert(key.to_string(), d.clone());
                    emitted.push(d);
                }
                None => {}
            }
        }
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(v: f64) -> FactorScores {
        FactorScores {
            pattern_recognition: v,
            causal_analysis: v,
            solution_optimization: v,
            cross_issue_learning: v,
            prediction_accuracy: v,
            data_quality: v,
            compliance: v,
        }
    }

    #[test]
    fn test_no_directives_when_confident() {
        let mut a = AutoAdjuster::new();
        let s = scores(80.0);
        assert!(a.refresh(&s, s.overall(), &AdjustmentThresholds::default(), 0).is_empty());
    }

    #[test]
    fn test_critical_priority_below_critical_threshold() {
        let mut a = AutoAdjuster::new();
        let s = scores(20.0);
        let out = a.refresh(&s, s.overall(), &AdjustmentThresholds::default(), 0);
        assert_eq!(out.len(), 7);
        assert!(out.iter().all(|d| d.priority == Priority::Critical));
    }

    #[test]
    fn test_high_priority_between_thresholds() {
        let mut a = AutoAdjuster::new();
        let s = FactorScores { compliance: 0.0, ..scores(45.0) };
        let out = a.refresh(&s, s.overall(), &AdjustmentThresholds::default(), 0);
        assert!(out.iter().all(|d| d.priority == Priority::High));
    }

    #[test]
    fn test_directives_persist_until_factor_recovers() {
        let mut a = AutoAdjuster::new();
        let th = AdjustmentThresholds::default();
        let low = scores(10.0);
        a.refresh(&low, low.overall(), &th, 1);
        let again = a.refresh(&low, low.overall(), &th, 2);
        let pattern = again.iter().find(|d| d.factor == Factor::PatternRecognition).unwrap();
        assert_eq!(pattern.cycles, 2);
        assert_eq!(pattern.first_issued_ms, 1);
        assert_eq!(pattern.last_issued_ms, 2);

        // overall above the threshold, pattern still weak: directive re-emitted
        let mixed = FactorScores { pattern_recognition: 40.0, ..scores(90.0) };
        let out = a.refresh(&mixed, mixed.overall(), &th, 3);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].factor, Factor::PatternRecognition);
        assert_eq!(out[0].cycles, 3);

        let healthy = scores(90.0);
        assert!(a.refresh(&healthy, healthy.overall(), &th, 4).is_empty());
        assert!(a.is_empty());
    }

    #[test]
    fn test_actions_name_the_factor_work() {
        assert_eq!(action_for(Factor::PatternRecognition), "increase pattern collection");
    }
}
