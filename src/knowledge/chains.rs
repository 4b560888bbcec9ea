//! # Stage: Cycle & Chain Detector
//!
//! ## Responsibility
//! Recognizes two structural failure shapes in call/operation sequences and
//! remembers which mitigations worked for each exact shape:
//!
//! 1. **Circular dependency**: a window of 3 consecutive steps whose last
//!    step equals its first (`A, B, A`), or failing that a window of 4
//!    (`A, B, C, A`).
//! 2. **Blocking chain**: two or more operations that are explicitly marked
//!    blocking or whose names follow a blocking-call convention.
//!
//! Records are keyed by the chain signature (`a->b->c`), so repeating the
//! same sequence increments frequency instead of creating a new record.
//!
//! ## Guarantees
//! - Bounded: chain length and per-chain solution lists are capped
//! - A detection always carries a mitigation; without history it is the
//!   generic asynchronous break at the configured default confidence
//!
//! ## NOT Responsible For
//! - Producing call sequences (callers trace them)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Step separator inside a chain signature.
pub const SIGNATURE_SEPARATOR: &str = "->";

/// Mitigation suggested for a cycle nobody has fixed before.
pub const DEFAULT_CIRCULAR_MITIGATION: &str = "break_cycle_async";

/// Mitigation suggested for a blocking chain nobody has fixed before.
pub const DEFAULT_BLOCKING_MITIGATION: &str = "convert_blocking_to_async";

/// Lowercased substrings that mark an operation name as blocking.
pub const BLOCKING_CONVENTIONS: &[&str] =
    &["sync", "blocking", "block_on", "wait", "sleep", "join", "lock"];

/// Lowercased substrings that mark a name as non-blocking even if a
/// convention above also matches.
pub const NON_BLOCKING_MARKERS: &[&str] = &["async", "await", "nonblocking", "non_blocking"];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
    CircularDependency,
    BlockingChain,
}

impl ChainKind {
    pub fn default_mitigation(self) -> &'static str {
        match self {
            ChainKind::CircularDependency => DEFAULT_CIRCULAR_MITIGATION,
            ChainKind::BlockingChain => DEFAULT_BLOCKING_MITIGATION,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "circular_dependency" | "circular" => Some(ChainKind::CircularDependency),
            "blocking_chain" | "blocking" => Some(ChainKind::BlockingChain),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChainKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainKind::CircularDependency => write!(f, "circular_dependency"),
            ChainKind::BlockingChain => write!(f, "blocking_chain"),
        }
    }
}

/// One step of an operation trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    /// Explicitly marked synchronous/blocking by the tracer.
    #[serde(default)]
    pub blocking: bool,
}

impl Operation {
    pub fn new(name: impl Into<String>, blocking: bool) -> Self {
        Self { name: name.into(), blocking }
    }

    /// Marked blocking, or named like a blocking call.
    pub fn is_blocking(&self) -> bool {
        self.blocking || is_blocking_name(&self.name)
    }
}

pub fn is_blocking_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    if NON_BLOCKING_MARKERS.iter().any(|m| lower.contains(m)) {
        return false;
    }
    BLOCKING_CONVENTIONS.iter().any(|c| lower.contains(c))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSolution {
    pub method: String,
    pub successes: u64,
    pub attempts: u64,
    pub success_rate: f64,
    pub last_used_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub kind: ChainKind,
    pub chain: Vec<String>,
    pub frequency: u64,
    pub solutions: Vec<ChainSolution>,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
}

impl ChainRecord {
    pub fn signature(&self) -> String {
        self.chain.join(SIGNATURE_SEPARATOR)
    }

    /// Highest success rate; more attempts wins a tie.
    pub fn best_solution(&self) -> Option<&ChainSolution> {
        self.solutions.iter().max_by(|a, b| {
            a.success_rate
                .partial_cmp(&b.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.attempts.cmp(&b.attempts))
        })
    }
}

/// Suggested fix for a detected chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mitigation {
    pub method: String,
    pub confidence: f64,
    /// `false` when this is the generic default, not a recorded success.
    pub from_history: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainDetection {
    pub kind: ChainKind,
    pub chain: Vec<String>,
    pub signature: String,
    pub frequency: u64,
    pub mitigation: Mitigation,
}

// ---------------------------------------------------------------------------
// Detection helpers
// ---------------------------------------------------------------------------

/// The first closed loop in `sequence`, as the exact window of steps.
pub fn find_cycle<S: AsRef<str>>(sequence: &[S]) -> Option<Vec<String>> {
    let steps: Vec<&str> = sequence.iter().map(|s| s.as_ref()).collect();
    for i in 0..steps.len() {
        for width in [3usize, 4] {
            let Some(window) = steps.get(i..i + width) else { continue };
            let closes = window[0] == window[width - 1];
            let distinct = window.iter().any(|s| *s != window[0]);
            if closes && distinct {
                return Some(window.iter().map(|s| s.to_string()).collect());
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// ChainDetector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainCaps {
    pub steps: usize,
    pub solutions: usize,
}

impl Default for ChainCaps {
    fn default() -> Self {
        Self { steps: 20, solutions: 10 }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainDetector {
    circular: BTreeMap<String, ChainRecord>,
    blocking: BTreeMap<String, ChainRecord>,
    caps: ChainCaps,
    default_confidence: f64,
}

impl ChainDetector {
    pub fn new(caps: ChainCaps, default_confidence: f64) -> Self {
        Self {
            circular: BTreeMap::new(),
            blocking: BTreeMap::new(),
            caps,
            default_confidence: default_confidence.clamp(0.0, 1.0),
        }
    }

    pub fn from_parts(
        circular: BTreeMap<String, ChainRecord>,
        blocking: BTreeMap<String, ChainRecord>,
        caps: ChainCaps,
        default_confidence: f64,
    ) -> Self {
        let mut d = Self::new(caps, default_confidence);
        d.circular = circular;
        d.blocking = blocking;
        for r in d.circular.values_mut().chain(d.blocking.values_mut()) {
            if r.solutions.len() > caps.solutions.max(1) {
                let excess = r.solutions.len() - caps.solutions.max(1);
                r.solutions.drain(..excess);
            }
        }
        d
    }

    pub fn circular(&self) -> &BTreeMap<String, ChainRecord> {
        &self.circular
    }

    pub fn blocking(&self) -> &BTreeMap<String, ChainRecord> {
        &self.blocking
    }

    pub fn len(&self) -> usize {
        self.circular.len() + self.blocking.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, kind: ChainKind, signature: &str) -> Option<&ChainRecord> {
        self.map(kind).get(signature)
    }

    fn map(&self, kind: ChainKind) -> &BTreeMap<String, ChainRecord> {
        match kind {
            ChainKind::CircularDependency => &self.circular,
            ChainKind::BlockingChain => &self.blocking,
        }
    }

    fn map_mut(&mut self, kind: ChainKind) -> &mut BTreeMap<String, ChainRecord> {
        match kind {
            ChainKind::CircularDependency => &mut self.circular,
            ChainKind::BlockingChain => &mut self.blocking,
        }
    }

    /// Scan a call sequence for a closed loop and record it.
    pub fn detect_circular_dependency<S: AsRef<str>>(
        &mut self,
        sequence: &[S],
        now_ms: u64,
    ) -> Option<ChainDetection> {
        let chain = find_cycle(sequence)?;
        Some(self.observe(ChainKind::CircularDependency, chain, now_ms))
    }

    /// Filter a trace down to its blocking operations; two or more form a
    /// chain, which is recorded.
    pub fn detect_blocking_chain(
        &mut self,
        operations: &[Operation],
        now_ms: u64,
    ) -> Option<ChainDetection> {
        let chain: Vec<String> = operations
            .iter()
            .filter(|op| op.is_blocking())
            .map(|op| op.name.clone())
            .collect();
        if chain.len() < 2 {
            return None;
        }
        Some(self.observe(ChainKind::BlockingChain, chain, now_ms))
    }

    fn observe(&mut self, kind: ChainKind, mut chain: Vec<String>, now_ms: u64) -> ChainDetection {
        chain.truncate(self.caps.steps.max(2));
        let signature = chain.join(SIGNATURE_SEPARATOR);
        let record = self.map_mut(kind).entry(signature.clone()).or_insert_with(|| ChainRecord {
            kind,
            chain: chain.clone(),
            frequency: 0,
            solutions: Vec::new(),
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
        });
        record.frequency += 1;
        record.last_seen_ms = record.last_seen_ms.max(now_ms);

        let frequency = record.frequency;
        let mitigation = self.mitigation_for(kind, &signature);
        tracing::debug!(
            target: "learning::chains",
            kind = %kind,
            signature = %signature,
            frequency,
            "chain observed"
        );
        ChainDetection { kind, chain, signature, frequency, mitigation }
    }

    /// Best known mitigation for one exact chain.
    pub fn mitigation_for(&self, kind: ChainKind, signature: &str) -> Mitigation {
        match self.map(kind).get(signature).and_then(ChainRecord::best_solution) {
            Some(s) => Mitigation {
                method: s.method.clone(),
                confidence: s.success_rate,
                from_history: true,
            },
            None => self.default_mitigation(kind),
        }
    }

    pub fn default_mitigation(&self, kind: ChainKind) -> Mitigation {
        Mitigation {
            method: kind.default_mitigation().to_string(),
            confidence: self.default_confidence,
            from_history: false,
        }
    }

    /// Best recorded mitigation across every chain of `kind`, or the default.
    pub fn best_mitigation(&self, kind: ChainKind) -> Mitigation {
        self.map(kind)
            .values()
            .filter_map(ChainRecord::best_solution)
            .max_by(|a, b| {
                a.success_rate
                    .partial_cmp(&b.success_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.attempts.cmp(&b.attempts))
            })
            .map(|s| Mitigation { method: s.method.clone(), confidence: s.success_rate, from_history: true })
            .unwrap_or_else(|| self.default_mitigation(kind))
    }

    /// Record the outcome of applying `method` to the chain `signature`. An
    /// unknown signature is registered from its steps.
    pub fn record_mitigation(
        &mut self,
        kind: ChainKind,
        signature: &str,
        method: &str,
        success: bool,
        now_ms: u64,
    ) {
        let caps = self.caps;
        let record = self.map_mut(kind).entry(signature.to_string()).or_insert_with(|| ChainRecord {
            kind,
            chain: signature.split(SIGNATURE_SEPARATOR).map(str::to_string).collect(),
            frequency: 1,
            solutions: Vec::new(),
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
        });
        record.last_seen_ms = record.last_seen_ms.max(now_ms);

        match record.solutions.iter_mut().find(|s| s.method == method) {
            Some(s) => {
                s.attempts += 1;
                if success {
                    s.successes += 1;
                }
                s.success_rate = s.successes as f64 / s.attempts as f64;
                s.last_used_ms = now_ms;
            }
            None => {
                record.solutions.push(ChainSolution {
                    method: method.to_string(),
                    successes: u64::from(success),
                    attempts: 1,
                    success_rate: if success { 1.0 } else { 0.0 },
                    last_used_ms: now_ms,
                });
                if record.solutions.len() > caps.solutions.max(1) {
                    // evict the least recently used
                    if let Some(idx) = record
                        .solutions
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, s)| s.last_used_ms)
                        .map(|(i, _)| i)
                    {
                        record.solutions.remove(idx);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
