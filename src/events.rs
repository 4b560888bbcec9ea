//! # Engine events
//!
//! Typed notifications published on a `tokio::sync::broadcast` channel.
//! Subscribers call [`EventBus::subscribe`] (or `LearningEngine::subscribe`);
//! a slow receiver sees `RecvError::Lagged` instead of blocking the engine.
//! Publishing with no subscribers is not an error.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::confidence::adjust::AdjustmentDirective;
use crate::confidence::masking::MaskingWarning;
use crate::knowledge::chains::ChainKind;
use crate::types::Outcome;

/// Capacity of the broadcast ring.
pub const EVENT_CHANNEL_CAP: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// An attempt went through the learning pipeline.
    Learned {
        issue_id: String,
        issue_type: Option<String>,
        fix_method: Option<String>,
        outcome: Outcome,
    },
    /// A known misdiagnosis family matched an attempt.
    MisdiagnosisMatched { key: String, outcome: Outcome },
    /// A circular or blocking chain was recorded or observed again.
    ChainRecorded { kind: ChainKind, signature: String, frequency: u64 },
    MaskingDetected { warning: MaskingWarning },
    Adjustment { directive: AdjustmentDirective },
    ConfidenceUpdated { overall: f64, masking_detected: bool },
    /// A write to the key/value store failed; in-memory state is unaffected.
    PersistenceFailed { key: String, error: String },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::Learned { .. }             => "learned",
            EngineEvent::MisdiagnosisMatched { .. } => "misdiagnosis_matched",
            EngineEvent::ChainRecorded { .. }       => "chain_recorded",
            EngineEvent::MaskingDetected { .. }     => "masking_detected",
            EngineEvent::Adjustment { .. }          => "adjustment",
            EngineEvent::ConfidenceUpdated { .. }   => "confidence_updated",
            EngineEvent::PersistenceFailed { .. }   => "persistence_failed",
        }
    }
}

impl std::fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Sender side of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAP)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::ConfidenceUpdated { overall: 10.0, masking_detected: false });
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::PersistenceFailed { key: "k".into(), error: "e".into() });
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name(), "persistence_failed");
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let ev = EngineEvent::ChainRecorded {
            kind: ChainKind::CircularDependency,
            signature: "a->b->a".into(),
            frequency: 2,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "chain_recorded");
        assert_eq!(v["kind"], "circular_dependency");
    }
}
