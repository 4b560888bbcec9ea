//! # Stage: Solution Optimizer
//!
//! Per-issue-type ranking of fix methods by empirical success rate.
//!
//! The best solution only changes when a method's rate is strictly higher than
//! the stored best; equal rates keep the incumbent. A failure that drags the
//! best below another alternative hands the top spot to that alternative. Every
//! attempt, successful or not, counts toward `attempts` so the confidence scorer
//! can see how thin the evidence behind a ranking is.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedMethod {
    pub method: String,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionRanking {
    pub issue_type: String,
    pub best_solution: Option<String>,
    pub success_rate: f64,
    /// Sorted by success rate, descending.
    pub alternatives: Vec<RankedMethod>,
    pub attempts: u64,
}

impl SolutionRanking {
    fn new(issue_type: &str) -> Self {
        Self {
            issue_type: issue_type.to_string(),
            best_solution: None,
            success_rate: 0.0,
            alternatives: Vec::new(),
            attempts: 0,
        }
    }

    fn sort_alternatives(&mut self) {
        // Stable sort keeps insertion order between equal rates.
        self.alternatives.sort_by(|a, b| {
            b.success_rate.partial_cmp(&a.success_rate).unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    fn refresh_rate(&mut self, method: &str, rate: f64) -> bool {
        match self.alternatives.iter_mut().find(|a| a.method == method) {
            Some(alt) => {
                alt.success_rate = rate;
                true
            }
            None => false,
        }
    }

    /// Promote the top alternative when it now beats the best.
    fn reelect(&mut self) {
        let Some(top) = self.alternatives.first() else { return };
        if self.best_solution.is_none() || top.success_rate > self.success_rate {
            self.best_solution = Some(top.method.clone());
            self.success_rate = top.success_rate;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolutionOptimizer {
    rankings: BTreeMap<String, SolutionRanking>,
    alternatives_cap: usize,
}

impl SolutionOptimizer {
    pub fn new(alternatives_cap: usize) -> Self {
        Self { rankings: BTreeMap::new(), alternatives_cap: alternatives_cap.max(1) }
    }

    pub fn from_rankings(rankings: BTreeMap<String, SolutionRanking>, alternatives_cap: usize) -> Self {
        let mut o = Self { rankings, alternatives_cap: alternatives_cap.max(1) };
        for r in o.rankings.values_mut() {
            r.sort_alternatives();
            r.alternatives.truncate(o.alternatives_cap);
        }
        o
    }

    pub fn rankings(&self) -> &BTreeMap<String, SolutionRanking> {
        &self.rankings
    }

    pub fn ranking(&self, issue_type: &str) -> Option<&SolutionRanking> {
        self.rankings.get(issue_type)
    }

    pub fn len(&self) -> usize {
        self.rankings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rankings.is_empty()
    }

    /// A method fixed `issue_type`. `rate` is the method's engine-wide rate.
    pub fn record_success(&mut self, issue_type: &str, method: &str, rate: f64) -> &SolutionRanking {
        let cap = self.alternatives_cap;
        let r = self
            .rankings
            .entry(issue_type.to_string())
            .or_insert_with(|| SolutionRanking::new(issue_type));
        r.attempts += 1;

        if !r.refresh_rate(method, rate) {
            r.alternatives.push(RankedMethod { method: method.to_string(), success_rate: rate });
        }

        let take_over = match r.best_solution.as_deref() {
            None => true,
            Some(best) => best == method || rate > r.success_rate,
        };
        if take_over {
            r.best_solution = Some(method.to_string());
            r.success_rate = rate;
        }

        r.sort_alternatives();
        r.reelect();
        if r.alternatives.len() > cap {
            // never drop the current best
            let best = r.best_solution.clone();
            while r.alternatives.len() > cap {
                let idx = r
                    .alternatives
                    .iter()
                    .rposition(|a| Some(&a.method) != best.as_ref())
                    .unwrap_or(r.alternatives.len() - 1);
                r.alternatives.remove(idx);
            }
        }
        r
    }

    /// A method failed on `issue_type`. Failed methods are never added as
    /// alternatives, but an existing entry's rate is refreshed and the best
    /// re-elected.
    pub fn record_failure(&mut self, issue_type: &str, method: Option<&str>, rate: Option<f64>) {
        let r = self
            .rankings
            .entry(issue_type.to_string())
            .or_insert_with(|| SolutionRanking::new(issue_type));
        r.attempts += 1;
        if let (Some(m), Some(rate)) = (method, rate) {
            if r.refresh_rate(m, rate) {
                if r.best_solution.as_deref() == Some(m) {
                    r.success_rate = rate;
                }
                r.sort_alternatives();
                r.reelect();
            }
        }
    }

    /// Best ranked method for an issue type.
    pub fn best(&self, issue_type: &str) -> Option<(&str, f64)> {
        let r = self.rankings.get(issue_type)?;
        r.best_solution.as_deref().map(|m| (m, r.success_rate))
    }
}
