//! # Knowledge stores
//!
//! Everything the engine learns lives in one of these stores. Each is a plain
//! owned struct with `BTreeMap` collections, so serializing the same state
//! twice produces the same bytes.
//!
//! | Module          | Learns                                               |
//! |-----------------|------------------------------------------------------|
//! | [`patterns`]    | frequency/success per issue type, method, state, log |
//! | [`misdiagnosis`]| wrong approaches per symptom family, failed methods  |
//! | [`correlator`]  | causal chains and cross-issue links                  |
//! | [`optimizer`]   | best fix per issue type                              |
//! | [`chains`]      | circular and blocking call chains with mitigations   |
//!
//! [`GeneralizedStore`] (below) folds concrete issues into abstract
//! categories chosen by [`generalize::categorize`].

pub mod chains;
pub mod correlator;
pub mod generalize;
pub mod misdiagnosis;
pub mod optimizer;
pub mod patterns;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Generalized patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralizedPattern {
    pub category: String,
    /// Concrete pattern keys that mapped to this category.
    pub specific_instances: BTreeSet<String>,
    pub general_solution: Option<String>,
    /// Engine-wide rate of `general_solution` at the last election.
    #[serde(default)]
    pub general_solution_rate: f64,
    /// Every method that has fixed an issue in this category.
    #[serde(default)]
    pub candidate_solutions: BTreeSet<String>,
    pub success_rate: f64,
    pub successes: u64,
    pub attempts: u64,
    /// Components the category has been seen on.
    pub applicable_to: BTreeSet<String>,
}

impl GeneralizedPattern {
    fn new(category: &str) -> Self {
        Self {
            category: category.to_string(),
            specific_instances: BTreeSet::new(),
            general_solution: None,
            general_solution_rate: 0.0,
            candidate_solutions: BTreeSet::new(),
            success_rate: 0.0,
            successes: 0,
            attempts: 0,
            applicable_to: BTreeSet::new(),
        }
    }

    /// Candidate methods, the incumbent first.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        let incumbent = self.general_solution.as_deref();
        incumbent
            .into_iter()
            .chain(self.candidate_solutions.iter().map(String::as_str).filter(move |m| Some(*m) != incumbent))
    }
}

/// Pick the general solution from `(method, rate)` pairs listed incumbent
/// first. A challenger must beat the current pick strictly.
pub fn elect_solution<'a, I>(rated: I) -> Option<(&'a str, f64)>
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut best: Option<(&'a str, f64)> = None;
    for (method, rate) in rated {
        if best.map_or(true, |(_, r)| rate > r) {
            best = Some((method, rate));
        }
    }
    best
}

/// One attempt as seen by the generalized store.
#[derive(Debug, Clone, Copy)]
pub struct CategoryObservation<'a> {
    pub instance: &'a str,
    pub component: Option<&'a str>,
    /// The fix method, on success.
    pub solution: Option<&'a str>,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeneralizedStore {
    patterns: BTreeMap<String, GeneralizedPattern>,
    #[serde(skip)]
    members_cap: MembersCap,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MembersCap(usize);

impl Default for MembersCap {
    fn default() -> Self {
        MembersCap(50)
    }
}

impl GeneralizedStore {
    pub fn new(members_cap: usize) -> Self {
        Self { patterns: BTreeMap::new(), members_cap: MembersCap(members_cap.max(1)) }
    }

    pub fn set_cap(&mut self, members_cap: usize) {
        self.members_cap = MembersCap(members_cap.max(1));
        let cap = self.members_cap.0;
        for p in self.patterns.values_mut() {
            cap_set(&mut p.specific_instances, cap);
            cap_set(&mut p.applicable_to, cap);
            cap_set(&mut p.candidate_solutions, cap);
        }
    }

    pub fn record(&mut self, category: &str, obs: CategoryObservation<'_>) -> &GeneralizedPattern {
        let cap = self.members_cap.0;
        let p = self
            .patterns
            .entry(category.to_string())
            .or_insert_with(|| GeneralizedPattern::new(category));

        p.attempts += 1;
        if obs.success {
            p.successes += 1;
        }
        p.success_rate = p.successes as f64 / p.attempts as f64;

        if p.specific_instances.len() < cap || p.specific_instances.contains(obs.instance) {
            p.specific_instances.insert(obs.instance.to_string());
        }
        if let Some(c) = obs.component {
            if p.applicable_to.len() < cap || p.applicable_to.contains(c) {
                p.applicable_to.insert(c.to_string());
            }
        }

        if let Some(method) = obs.solution {
            if p.candidate_solutions.len() < cap || p.candidate_solutions.contains(method) {
                p.candidate_solutions.insert(method.to_string());
            }
            if p.general_solution.is_none() {
                p.general_solution = Some(method.to_string());
            }
        }
        p
    }

    /// Re-run the general-solution election for `category` with current
    /// method rates.
    pub fn elect<F>(&mut self, category: &str, rate_of: F)
    where
        F: Fn(&str) -> f64,
    {
        let Some(p) = self.patterns.get_mut(category) else { return };
        let winner = elect_solution(p.candidates().map(|m| (m, rate_of(m))))
            .map(|(m, r)| (m.to_string(), r));
        if let Some((method, rate)) = winner {
            p.general_solution = Some(method);
            p.general_solution_rate = rate;
        }
    }

    pub fn get(&self, category: &str) -> Option<&GeneralizedPattern> {
        self.patterns.get(category)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GeneralizedPattern> {
        self.patterns.values()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Drop the largest members until the set fits.
fn cap_set(set: &mut BTreeSet<String>, cap: usize) {
    while set.len() > cap {
        set.pop_last();
    }
}

/// `a` equals, contains, or is contained in `b`, ignoring ASCII case.
pub fn loosely_matches(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    a == b || a.contains(&b) || b.contains(&a)
}
