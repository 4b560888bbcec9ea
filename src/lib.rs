//! # diagnostic-learning
//!
//! A self-learning diagnostic engine for a monitoring stack. Every completed
//! fix attempt is fed to [`LearningEngine::learn_from_attempt`]; the engine
//! turns the stream into:
//!
//! - recurring patterns over issue types, fix methods, system states, and
//!   redacted log lines
//! - a memory of symptom families that are routinely misdiagnosed
//! - causal chains and cross-issue links between co-occurring issues
//! - ranked fixes per issue type
//! - circular and blocking call chains with mitigations
//! - a 0-100 confidence score that refuses to look good on thin or
//!   suspicious data
//!
//! All state lives in one explicit [`LearningEngine`] and is written to a
//! [`KeyValueStore`] after every mutation, so learning survives restarts.
//!
//! ```rust,ignore
//! use diagnostic_learning::{Attempt, EngineConfig, LearningEngine, Outcome, SqliteStore};
//!
//! let store = SqliteStore::open("learning.db")?;
//! let mut engine = LearningEngine::new(EngineConfig::default(), Box::new(store));
//! engine.load()?;
//! engine.learn_from_attempt(&Attempt::new("i-17", "init_hang", "defer_init", Outcome::Success, now));
//! let best = engine.get_best_solution("init_hang");
//! ```

pub mod cli;
pub mod config;
pub mod confidence;
pub mod engine;
pub mod error;
pub mod events;
pub mod knowledge;
pub mod monitor;
pub mod persistence;
pub mod types;

pub use config::EngineConfig;
pub use confidence::{ConfidenceReport, ConfidenceSnapshot};
pub use engine::{LearningEngine, Prediction, SharedEngine, SolutionRecommendation, SolutionSource};
pub use error::{LearnError, Result};
pub use events::EngineEvent;
pub use knowledge::chains::{ChainDetection, ChainKind, Operation};
pub use knowledge::misdiagnosis::MisdiagnosisPrevention;
pub use monitor::ConfidenceMonitor;
pub use persistence::sqlite::SqliteStore;
pub use persistence::{KeyValueStore, MemoryStore};
pub use types::{Attempt, ComplianceSource, FixTracker, Issue, IssueSource, Outcome};
