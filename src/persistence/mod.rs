//! # Stage: Persistence
//!
//! ## Responsibility
//! Move the engine's stores in and out of a flat key/value namespace
//! (`learning.patterns`, `learning.causalChains`, ...). Each key holds the
//! JSON form of exactly one store.
//!
//! The backend is abstracted behind [`KeyValueStore`] so the engine can run
//! against SQLite in production and an in-memory map in tests:
//!
//! - [`MemoryStore`]: shared `BTreeMap`, cheap to clone and inspect
//! - [`sqlite::SqliteStore`]: append-only `kv_log` table, latest row wins
//!
//! ## Guarantees
//! - Deterministic: every store serializes from `BTreeMap`s, so saving the
//!   same state twice writes the same bytes
//! - A key that is absent loads as an empty store
//!
//! ## NOT Responsible For
//! - Deciding when to write (the engine writes after each mutation)

pub mod adapter;
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::{LearnError, Result};

// ---------------------------------------------------------------------------
// KeyValueStore trait
// ---------------------------------------------------------------------------

/// Minimal key/value operations the engine needs from a backend.
pub trait KeyValueStore: Send {
    /// Latest value written under `key`.
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&mut self, key: &str, value: &str) -> Result<()>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Box<S> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        (**self).put(key, value)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory backend. Clones share the same map, so a test can hand one
/// clone to an engine and inspect what it wrote through another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every key and its latest value.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        match self.inner.lock() {
            Ok(map) => map.clone(),
            Err(_) => BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let map = self
            .inner
            .lock()
            .map_err(|_| LearnError::Storage("memory store lock poisoned".into()))?;
        Ok(map.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| LearnError::Storage("memory store lock poisoned".into()))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
