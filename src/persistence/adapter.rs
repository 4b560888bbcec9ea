//! Key namespace and typed read/write over a [`KeyValueStore`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::KeyValueStore;
use crate::error::Result;

// ---------------------------------------------------------------------------
// Key constants
// ---------------------------------------------------------------------------

pub const KEY_PATTERNS: &str = "learning.patterns";
pub const KEY_MISDIAGNOSIS: &str = "learning.misdiagnosisPatterns";
pub const KEY_FAILED_METHODS: &str = "learning.failedMethods";
pub const KEY_CAUSAL_CHAINS: &str = "learning.causalChains";
pub const KEY_CROSS_ISSUE_LINKS: &str = "learning.crossIssueLinks";
pub const KEY_SOLUTION_RANKINGS: &str = "learning.solutionRankings";
pub const KEY_CIRCULAR: &str = "learning.circularDependencies";
pub const KEY_BLOCKING: &str = "learning.blockingChains";
pub const KEY_GENERALIZED: &str = "learning.generalizedPatterns";
pub const KEY_CONFIDENCE_HISTORY: &str = "learning.confidenceHistory";
pub const KEY_MASKING_WARNINGS: &str = "learning.maskingWarnings";
pub const KEY_ADJUSTMENTS: &str = "learning.adjustments";

/// Every key the engine owns, in save order.
pub const ALL_KEYS: [&str; 12] = [
    KEY_PATTERNS,
    KEY_MISDIAGNOSIS,
    KEY_FAILED_METHODS,
    KEY_CAUSAL_CHAINS,
    KEY_CROSS_ISSUE_LINKS,
    KEY_SOLUTION_RANKINGS,
    KEY_CIRCULAR,
    KEY_BLOCKING,
    KEY_GENERALIZED,
    KEY_CONFIDENCE_HISTORY,
    KEY_MASKING_WARNINGS,
    KEY_ADJUSTMENTS,
];

// ---------------------------------------------------------------------------
// Loaded
// ---------------------------------------------------------------------------

/// Outcome of reading one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
    Absent,
    Present(T),
    /// The stored value did not parse; the reason is the parser's message.
    Corrupt(String),
}

impl<T: Default> Loaded<T> {
    /// The value, or an empty store when absent or corrupt.
    pub fn into_value(self) -> T {
        match self {
            Loaded::Present(v) => v,
            Loaded::Absent | Loaded::Corrupt(_) => T::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Typed JSON access to the backend.
///
/// Remembers the last value written or read per key and skips writes that
/// would store identical bytes, so an append-only backend does not grow on
/// no-op saves.
pub struct Persistence {
    store: Box<dyn KeyValueStore>,
    last_written: BTreeMap<String, String>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("cached_keys", &self.last_written.len())
            .finish_non_exhaustive()
    }
}

impl Persistence {
    pub fn new(store: Box<dyn KeyValueStore>) -> Self {
        Self { store, last_written: BTreeMap::new() }
    }

    pub fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    pub fn into_store(self) -> Box<dyn KeyValueStore> {
        self.store
    }

    /// Serialize and store `value`. Returns `false` when the bytes match the
    /// last write and nothing was sent to the backend.
    pub fn write<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<bool> {
        let raw = serde_json::to_string(value)?;
        if self.last_written.get(key) == Some(&raw) {
            return Ok(false);
        }
        self.store.put(key, &raw)?;
        self.last_written.insert(key.to_string(), raw);
        Ok(true)
    }

    /// Read and parse one key. Backend failures propagate; parse failures
    /// come back as [`Loaded::Corrupt`].
    pub fn read<T: DeserializeOwned>(&mut self, key: &str) -> Result<Loaded<T>> {
        let Some(raw) = self.store.get(key)? else {
            return Ok(Loaded::Absent);
        };
        match serde_json::from_str::<T>(&raw) {
            Ok(v) => {
                self.last_written.insert(key.to_string(), raw);
                Ok(Loaded::Present(v))
            }
            Err(e) => Ok(Loaded::Corrupt(e.to_string())),
        }
    }
}
