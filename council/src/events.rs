//! Event Multiplexer (C6): the tagged event envelope streamed to callers,
//! and the bounded channel that merges concurrent per-model token streams
//! into one ordered sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::CouncilError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliberationEvent {
    Stage1Start,
    Stage1Token { model: String, delta: String, tokens_per_second: f64 },
    Stage1ModelComplete { model: String, elapsed_seconds: f64 },
    Stage1Complete,

    Stage2RoundStart { round: u32, max_rounds: u32 },
    Stage2Token { model: String, delta: String },
    Stage2ModelComplete { model: String, elapsed_seconds: f64 },
    Stage2RefinementStart { round: u32 },
    Stage2RefinementToken { model: String, delta: String },
    Stage2RoundComplete { round: u32, refinement_triggered: bool },
    Stage2Complete,

    Stage3Start,
    Stage3Token { delta: String },
    Stage3Complete,

    Error { kind: String, message: String },
}

/// A timestamped envelope around a `DeliberationEvent`. Stage/model/round
/// context lives in the payload variants above; `timestamp` is stamped at
/// emission time by the multiplexer, not by the producing task, so ordering
/// across models reflects arrival order (§4.6: no cross-model ordering is
/// guaranteed, only per-model monotonicity and total-ordered stage
/// boundaries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: DeliberationEvent,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event: DeliberationEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }
}

impl From<&CouncilError> for DeliberationEvent {
    fn from(err: &CouncilError) -> Self {
        DeliberationEvent::Error {
            kind: err.kind_str().to_string(),
            message: err.to_string(),
        }
    }
}

/// The sending half handed to stage tasks; serializes emission onto the
/// bounded channel so the multiplexer never interleaves two envelopes mid
/// construction.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<EventEnvelope>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<EventEnvelope>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, event: DeliberationEvent) {
        let _ = self.tx.send(EventEnvelope::new(event)).await;
    }
}

/// Construct a request-scoped event channel with the shared bounded
/// capacity (§5 backpressure: a full channel naturally throttles token
/// production by blocking the producing model task on emit).
pub fn new_channel() -> (EventSender, mpsc::Receiver<EventEnvelope>) {
    let (tx, rx) = mpsc::channel(council_core::limits::EVENT_CHANNEL_CAPACITY);
    (EventSender::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_boundary_ordering() {
        let (sender, mut rx) = new_channel();
        sender.emit(DeliberationEvent::Stage1Start).await;
        sender
            .emit(DeliberationEvent::Stage1Token {
                model: "m".into(),
                delta: "hi".into(),
                tokens_per_second: 10.0,
            })
            .await;
        sender.emit(DeliberationEvent::Stage1Complete).await;
        drop(sender);

        let mut seen = Vec::new();
        while let Some(env) = rx.recv().await {
            seen.push(env.event);
        }
        assert!(matches!(seen[0], DeliberationEvent::Stage1Start));
        assert!(matches!(seen.last().unwrap(), DeliberationEvent::Stage1Complete));
    }

    #[test]
    fn test_error_conversion_preserves_kind() {
        let err = CouncilError::Timeout(30);
        let event: DeliberationEvent = (&err).into();
        match event {
            DeliberationEvent::Error { kind, .. } => assert_eq!(kind, "timeout"),
            _ => panic!("expected error event"),
        }
    }
}
