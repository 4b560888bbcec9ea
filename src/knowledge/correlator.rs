//! # Stage: Causal & Cross-Issue Correlator
//!
//! ## Responsibility
//! On every successful fix, links the fixed issue to the currently active
//! issues that look structurally related, and tracks which fix methods worked
//! across pairs of issue types.
//!
//! Relatedness is deliberately cheap and explainable. Checked in this order,
//! first hit wins:
//! 1. `same_root_cause`: both issues carry the same root cause
//! 2. `same_type`: equal issue types
//! 3. `related`: the detail maps share at least one key
//!
//! ## Guarantees
//! - Bounded: chain links, related issues and common solutions are capped
//! - Deduplicated: related issues by id, common solutions by method
//!
//! ## NOT Responsible For
//! - Fetching issues (the engine passes them in from the issue detector)

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::Issue;

// ---------------------------------------------------------------------------
// Relationship
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    SameRootCause,
    SameType,
    Related,
}

impl std::fmt::Display for Relationship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Relationship::SameRootCause => write!(f, "same_root_cause"),
            Relationship::SameType => write!(f, "same_type"),
            Relationship::Related => write!(f, "related"),
        }
    }
}

/// How `other` relates to `root`, if at all.
pub fn relationship(root: &Issue, other: &Issue) -> Option<Relationship> {
    if let (Some(a), Some(b)) = (&root.root_cause, &other.root_cause) {
        if a == b {
            return Some(Relationship::SameRootCause);
        }
    }
    if root.issue_type == other.issue_type {
        return Some(Relationship::SameType);
    }
    if root.details.keys().any(|k| other.details.contains_key(k)) {
        return Some(Relationship::Related);
    }
    None
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub issue_id: String,
    pub issue_type: String,
    /// `None` for the first link, which is the fixed issue itself.
    pub relationship: Option<Relationship>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalChain {
    pub root_issue_id: String,
    pub links: Vec<ChainLink>,
}

impl CausalChain {
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Links that carry a relationship tag.
    pub fn tagged_links(&self) -> usize {
        self.links.iter().filter(|l| l.relationship.is_some()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedIssue {
    pub id: String,
    pub issue_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonSolution {
    pub method: String,
    pub success_rate: f64,
    pub last_used_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossIssueLink {
    /// The two issue types, sorted.
    pub issue_types: (String, String),
    pub related_issues: Vec<RelatedIssue>,
    pub common_solutions: Vec<CommonSolution>,
    pub frequency: u64,
}

/// Key for an unordered pair of issue types.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b { format!("{}|{}", a, b) } else { format!("{}|{}", b, a) }
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelatorCaps {
    pub chain_links: usize,
    pub related_issues: usize,
    pub common_solutions: usize,
}

impl Default for CorrelatorCaps {
    fn default() -> Self {
        Self { chain_links: 20, related_issues: 50, common_solutions: 10 }
    }
}

/// What one successful fix produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrelationSummary {
    pub chain_len: usize,
    pub links_touched: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Correlator {
    chains: BTreeMap<String, CausalChain>,
    links: BTreeMap<String, CrossIssueLink>,
    caps: CorrelatorCaps,
}

impl Correlator {
    pub fn new(caps: CorrelatorCaps) -> Self {
        Self { caps, ..Self::default() }
    }

    pub fn from_parts(
        chains: BTreeMap<String, CausalChain>,
        links: BTreeMap<String, CrossIssueLink>,
        caps: CorrelatorCaps,
    ) -> Self {
        let mut c = Self { chains, links, caps };
        for chain in c.chains.values_mut() {
            chain.links.truncate(caps.chain_links.max(1));
        }
        for link in c.links.values_mut() {
            trim_front(&mut link.related_issues, caps.related_issues);
            trim_front(&mut link.common_solutions, caps.common_solutions);
        }
        c
    }

    pub fn chains(&self) -> &BTreeMap<String, CausalChain> {
        &self.chains
    }

    pub fn links(&self) -> &BTreeMap<String, CrossIssueLink> {
        &self.links
    }

    pub fn chain(&self, root_issue_id: &str) -> Option<&CausalChain> {
        self.chains.get(root_issue_id)
    }

    pub fn link(&self, a: &str, b: &str) -> Option<&CrossIssueLink> {
        self.links.get(&pair_key(a, b))
    }

    /// Record a successful fix of `root` by `method`.
    ///
    /// `active` is the detector's current issue list (the root itself is
    /// skipped if present). `method_rate` is the method's engine-wide success
    /// rate, stored on new common solutions.
    pub fn record_success(
        &mut self,
        root: &Issue,
        active: &[Issue],
        method: &str,
        method_rate: f64,
        now_ms: u64,
    ) -> CorrelationSummary {
        let mut links = vec![ChainLink {
            issue_id: root.id.clone(),
            issue_type: root.issue_type.clone(),
            relationship: None,
            timestamp_ms: now_ms,
        }];
        let mut related: Vec<&Issue> = Vec::new();
        let mut seen: BTreeSet<&str> = BTreeSet::new();

        for other in active {
            if other.id == root.id || !seen.insert(other.id.as_str()) {
                continue;
            }
            if let Some(rel) = relationship(root, other) {
                related.push(other);
                if links.len() < self.caps.chain_links.max(1) {
                    links.push(ChainLink {
                        issue_id: other.id.clone(),
                        issue_type: other.issue_type.clone(),
                        relationship: Some(rel),
                        timestamp_ms: now_ms,
                    });
                }
            }
        }

        let chain_len = links.len();
        self.chains.insert(
            root.id.clone(),
            CausalChain { root_issue_id: root.id.clone(), links },
        );

        let mut touched = Vec::new();
        for other in related {
            let key = self.update_link(root, other, method, method_rate, now_ms);
            if !touched.contains(&key) {
                touched.push(key);
            }
        }

        CorrelationSummary { chain_len, links_touched: touched }
    }

    fn update_link(
        &mut self,
        root: &Issue,
        other: &Issue,
        method: &str,
        method_rate: f64,
        now_ms: u64,
    ) -> String {
        let key = pair_key(&root.issue_type, &other.issue_type);
        let caps = self.caps;
        let link = self.links.entry(key.clone()).or_insert_with(|| {
            let (a, b) = if root.issue_type <= other.issue_type {
                (root.issue_type.clone(), other.issue_type.clone())
            } else {
                (other.issue_type.clone(), root.issue_type.clone())
            };
            CrossIssueLink {
                issue_types: (a, b),
                related_issues: Vec::new(),
                common_solutions: Vec::new(),
                frequency: 0,
            }
        });

        link.frequency += 1;
        for issue in [root, other] {
            if !link.related_issues.iter().any(|r| r.id == issue.id) {
                link.related_issues.push(RelatedIssue {
                    id: issue.id.clone(),
                    issue_type: issue.issue_type.clone(),
                });
            }
        }
        trim_front(&mut link.related_issues, caps.related_issues);

        if !method.is_empty() {
            match link.common_solutions.iter_mut().find(|s| s.method == method) {
                Some(existing) => existing.last_used_ms = now_ms,
                None => {
                    link.common_solutions.push(CommonSolution {
                        method: method.to_string(),
                        success_rate: method_rate,
                        last_used_ms: now_ms,
                    });
                    trim_front(&mut link.common_solutions, caps.common_solutions);
                }
            }
        }
        key
    }
}

fn trim_front<T>(list: &mut Vec<T>, cap: usize) {
    let cap = cap.max(1);
    if list.len() > cap {
        let excess = list.len() - cap;
        list.drain(..excess);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
