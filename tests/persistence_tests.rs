//! Persistence round-trips through the engine: MemoryStore and SQLite
//! backends, legacy pattern cleanup, corrupt values, and failing stores.

use std::collections::BTreeMap;

use diagnostic_learning::knowledge::patterns::{Pattern, PatternKind, PatternStore};
use diagnostic_learning::persistence::adapter::{ALL_KEYS, KEY_ADJUSTMENTS, KEY_PATTERNS};
use diagnostic_learning::*;
use serde_json::json;

fn make_engine(store: impl KeyValueStore + 'static) -> LearningEngine {
    LearningEngine::new(EngineConfig::default(), Box::new(store))
}

/// Feed a representative mix through every learning path.
fn make_history(e: &mut LearningEngine) {
    let mut state = BTreeMap::new();
    state.insert("cpu".to_string(), json!(97));
    state.insert("queue".to_string(), json!(3));
    for i in 0..4u64 {
        e.learn_from_attempt(
            &Attempt::new(format!("h{}", i), "init_hang", "add_retry", Outcome::Failure, 100 + i)
                .with_error("initialization timeout after 30000 ms")
                .with_state(state.clone())
                .with_duration(1_500),
        );
    }
    e.learn_from_attempt(
        &Attempt::new("h9", "init_hang", "defer_init", Outcome::Success, 200)
            .with_error("initialization timeout after 30000 ms")
            .with_detail("chain_signature", "boot->db->boot"),
    );
    e.learn_from_attempt(
        &Attempt::new("s1", "syntax_error", "add_brace", Outcome::Failure, 300)
            .with_component("PowerShell")
            .with_error("missing closing bracket"),
    );
    e.detect_circular_dependency(&["A", "B", "C", "A"]);
    e.detect_blocking_chain(&[Operation::new("read_sync", true), Operation::new("lock_wait", true)]);
    e.run_scoring_cycle(1_000);
    e.run_scoring_cycle(2_000);
}

// ---------------------------------------------------------------------------
// Round trips
// ---------------------------------------------------------------------------

#[test]
fn test_memory_save_load_save_is_byte_identical() {
    let first = MemoryStore::new();
    let mut e = make_engine(first.clone());
    make_history(&mut e);
    e.save().unwrap();
    let saved = first.snapshot();
    assert_eq!(saved.len(), ALL_KEYS.len());

    // seed a second store with the same bytes and round-trip through a new engine
    let mut second = MemoryStore::new();
    for (k, v) in &saved {
        second.put(k, v).unwrap();
    }
    let mut reloaded = make_engine(second.clone());
    let report = reloaded.load().unwrap();
    assert_eq!(report.loaded.len(), ALL_KEYS.len());
    assert!(report.corrupt.is_empty());
    assert_eq!(report.merged_legacy_patterns, 0);
    reloaded.save().unwrap();

    assert_eq!(second.snapshot(), saved);
}

#[test]
fn test_reloaded_engine_answers_like_the_original() {
    let store = MemoryStore::new();
    let mut e = make_engine(store.clone());
    make_history(&mut e);
    let best = e.get_best_solution("init_hang");
    let prevention = e.get_misdiagnosis_prevention("syntax_error", "missing closing bracket", Some("PowerShell"));
    let confidence = e.get_confidence_at(5_000);
    drop(e);

    let mut reloaded = make_engine(store);
    reloaded.load().unwrap();
    assert_eq!(reloaded.get_best_solution("init_hang"), best);
    assert_eq!(
        reloaded.get_misdiagnosis_prevention("syntax_error", "missing closing bracket", Some("PowerShell")),
        prevention
    );
    assert_eq!(reloaded.get_confidence_at(5_000), confidence);
}

#[test]
fn test_sqlite_reload_writes_nothing_new() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learning.db");
    {
        let mut e = make_engine(SqliteStore::open(&path).unwrap());
        make_history(&mut e);
        e.save().unwrap();
    }

    let observer = SqliteStore::open(&path).unwrap();
    let revisions: Vec<usize> = ALL_KEYS.iter().map(|k| observer.revisions(k).unwrap()).collect();
    let values: Vec<Option<String>> = ALL_KEYS.iter().map(|k| observer.get(k).unwrap()).collect();

    let mut reloaded = make_engine(SqliteStore::open(&path).unwrap());
    reloaded.load().unwrap();
    reloaded.save().unwrap();

    let after: Vec<usize> = ALL_KEYS.iter().map(|k| observer.revisions(k).unwrap()).collect();
    assert_eq!(after, revisions);
    let after_values: Vec<Option<String>> = ALL_KEYS.iter().map(|k| observer.get(k).unwrap()).collect();
    assert_eq!(after_values, values);
}

#[test]
fn test_sqlite_compact_keeps_loadable_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learning.db");
    {
        let mut e = make_engine(SqliteStore::open(&path).unwrap());
        make_history(&mut e);
    }
    let mut s = SqliteStore::open(&path).unwrap();
    assert!(s.revisions(KEY_PATTERNS).unwrap() > 1);
    assert!(s.compact().unwrap() > 0);
    assert_eq!(s.revisions(KEY_PATTERNS).unwrap(), 1);

    let mut reloaded = make_engine(s);
    let report = reloaded.load().unwrap();
    assert!(report.corrupt.is_empty());
    assert_eq!(reloaded.get_best_solution("init_hang").unwrap().method, "defer_init");
}

// ---------------------------------------------------------------------------
// Load edge cases
// ---------------------------------------------------------------------------

#[test]
fn test_absent_keys_load_empty() {
    let mut e = make_engine(MemoryStore::new());
    let report = e.load().unwrap();
    assert_eq!(report.absent.len(), ALL_KEYS.len());
    assert!(e.patterns().is_empty());
    assert!(e.confidence_history().snapshots().is_empty());
}

#[test]
fn test_legacy_pattern_keys_merge_on_load() {
    let mut legacy = PatternStore::new(5, 5);
    for (raw, successes, failures) in [("cpu=95", 1u64, 1u64), ("cpu=80", 0, 2)] {
        let mut p = Pattern::new(PatternKind::GeneralizedState, raw);
        p.successes = successes;
        p.failures = failures;
        p.frequency = successes + failures;
        legacy.insert(p);
    }
    let mut store = MemoryStore::new();
    store.put(KEY_PATTERNS, &serde_json::to_string(&legacy).unwrap()).unwrap();

    let mut e = make_engine(store.clone());
    let report = e.load().unwrap();
    assert_eq!(report.merged_legacy_patterns, 1);

    let merged = e.patterns().get(PatternKind::GeneralizedState, "cpu=medium").unwrap();
    assert_eq!(merged.frequency, 4);
    assert_eq!(merged.successes, 1);
    assert!((merged.success_rate - 0.25).abs() < 1e-9);
    assert_eq!(e.patterns().len(), 1);

    // the cleaned store was written back
    let written = store.snapshot();
    assert!(written[KEY_PATTERNS].contains("cpu=medium"));
    assert!(!written[KEY_PATTERNS].contains("cpu=95"));
}

#[test]
fn test_corrupt_value_starts_that_store_empty() {
    let seed = MemoryStore::new();
    let mut e = make_engine(seed.clone());
    make_history(&mut e);
    e.save().unwrap();
    drop(e);

    let mut raw = seed.clone();
    raw.put(KEY_ADJUSTMENTS, "{ this is not json").unwrap();

    let mut reloaded = make_engine(seed);
    let report = reloaded.load().unwrap();
    assert_eq!(report.corrupt, vec![KEY_ADJUSTMENTS]);
    assert!(reloaded.adjuster().is_empty());
    // siblings unaffected
    assert!(!reloaded.patterns().is_empty());
    assert!(!reloaded.misdiagnosis().is_empty());
}

// ---------------------------------------------------------------------------
// Failing backends
// ---------------------------------------------------------------------------

/// Backend that can be told to fail reads and writes.
struct FlakyStore {
    fail_reads: bool,
    fail_writes: bool,
}

impl KeyValueStore for FlakyStore {
    fn get(&self, _key: &str) -> Result<Option<String>> {
        if self.fail_reads {
            Err(LearnError::Storage("disk unavailable".into()))
        } else {
            Ok(None)
        }
    }

    fn put(&mut self, _key: &str, _value: &str) -> Result<()> {
        if self.fail_writes {
            Err(LearnError::Storage("disk full".into()))
        } else {
            Ok(())
        }
    }
}

#[test]
fn test_write_failures_do_not_break_learning() {
    let mut e = make_engine(FlakyStore { fail_reads: false, fail_writes: true });
    let mut rx = e.subscribe();
    e.learn_from_attempt(&Attempt::new("i1", "db_timeout", "retry", Outcome::Success, 1));

    assert_eq!(e.patterns().len(), 2);
    assert_eq!(e.get_best_solution("db_timeout").unwrap().method, "retry");

    let mut failed_keys = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        if let EngineEvent::PersistenceFailed { key, .. } = ev {
            failed_keys.push(key);
        }
    }
    assert!(failed_keys.contains(&KEY_PATTERNS.to_string()));
    assert!(e.save().is_err());
}

#[test]
fn test_read_failure_during_load_propagates() {
    let mut e = make_engine(FlakyStore { fail_reads: true, fail_writes: false });
    let err = e.load().unwrap_err();
    assert!(matches!(err, LearnError::Storage(_)));
}
