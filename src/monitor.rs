//! # Confidence Monitor
//!
//! Background task that runs [`LearningEngine::run_scoring_cycle`] on a fixed
//! interval ([`crate::config::EngineConfig::scoring_interval`], five minutes by
//! default):
//!
//! ```text
//! tick ──► lock SharedEngine ──► run_scoring_cycle ──► MonitorStatus
//!                                      │
//!                                      └──► EngineEvent broadcast
//! ```
//!
//! Each cycle runs entirely under the engine lock with no `.await` inside, so
//! a cycle is never observed half-applied and stopping the task can only
//! happen between cycles.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use diagnostic_learning::{ConfidenceMonitor, EngineConfig, LearningEngine};
//!
//! let engine = LearningEngine::in_memory(EngineConfig::default()).into_shared();
//! let mut monitor = ConfidenceMonitor::new(engine.clone(), std::time::Duration::from_secs(30));
//! monitor.start();
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::confidence::ConfidenceReport;
use crate::engine::{now_ms, SharedEngine};

/// Counters readable while the loop runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorStatus {
    pub cycles_run: u64,
    /// Cycles whose snapshot flagged masking.
    pub masking_cycles: u64,
    pub last_overall: Option<f64>,
    pub last_run_ms: Option<u64>,
    pub running: bool,
}

pub struct ConfidenceMonitor {
    engine: SharedEngine,
    interval: Duration,
    status: Arc<Mutex<MonitorStatus>>,
    handle: Option<JoinHandle<()>>,
}

impl ConfidenceMonitor {
    pub fn new(engine: SharedEngine, interval: Duration) -> Self {
        Self {
            engine,
            interval: interval.max(Duration::from_millis(1)),
            status: Arc::new(Mutex::new(MonitorStatus::default())),
            handle: None,
        }
    }

    pub fn status_handle(&self) -> Arc<Mutex<MonitorStatus>> {
        Arc::clone(&self.status)
    }

    pub fn status_snapshot(&self) -> MonitorStatus {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the scoring loop. Calling it while already running is a no-op.
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let status = Arc::clone(&self.status);
        let period = self.interval;

        if let Ok(mut s) = status.lock() {
            s.running = true;
        }
        tracing::info!(target: "learning::monitor", interval_ms = period.as_millis() as u64, "confidence monitor started");

        self.handle = Some(tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                run_cycle(&engine, &status);
            }
        }));
    }

    /// Stop the loop. The in-flight cycle, if any, has already completed
    /// because cycles never yield.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::info!(target: "learning::monitor", "confidence monitor stopped");
        }
        if let Ok(mut s) = self.status.lock() {
            s.running = false;
        }
    }

    /// Run one cycle on the caller's thread.
    ///
    /// This is `pub` so tests can drive cycles without spawning tasks.
    pub fn run_once(&self) -> Option<ConfidenceReport> {
        run_cycle(&self.engine, &self.status)
    }
}

impl Drop for ConfidenceMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn run_cycle(engine: &SharedEngine, status: &Arc<Mutex<MonitorStatus>>) -> Option<ConfidenceReport> {
    let now = now_ms();
    let report = match engine.lock() {
        Ok(mut e) => e.run_scoring_cycle(now),
        Err(_) => {
            tracing::error!(target: "learning::monitor", "engine lock poisoned; skipping cycle");
            return None;
        }
    };
    if let Ok(mut s) = status.lock() {
        s.cycles_run += 1;
        if report.snapshot.masking_detected {
            s.masking_cycles += 1;
        }
        s.last_overall = Some(report.snapshot.overall_confidence);
        s.last_run_ms = Some(now);
    }
    Some(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
