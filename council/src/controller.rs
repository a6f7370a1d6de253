//! Deliberation Controller (C7): the top-level state machine that drives a
//! single request from submission through Stage 1/2/3 to completion,
//! deciding refinement triggers and persisting the final trace.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DeliberationConfig;
use crate::conversation::{DeliberationRecord, Message};
use crate::errors::{CouncilError, CouncilResult};
use crate::events::{DeliberationEvent, EventSender};
use crate::persistence::PersistenceAdapter;
use crate::push_broker::PushBroker;
use crate::stage_runner::StageRunner;
use crate::title_service::{Priority, TitleService};
use crate::token_tracker::TokenTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliberationState {
    Idle,
    Stage1,
    Stage2Round(u32),
    Refine(u32),
    Stage3,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: DeliberationState,
    pub to: DeliberationState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Drives one request end to end. Not reused across requests: construct a
/// fresh controller per submission.
pub struct Controller {
    runner: Arc<StageRunner>,
    persistence: Arc<dyn PersistenceAdapter>,
    title_service: Arc<TitleService>,
    state: RwLock<DeliberationState>,
    transitions: RwLock<Vec<StateTransition>>,
}

impl Controller {
    pub fn new(
        runner: Arc<StageRunner>,
        persistence: Arc<dyn PersistenceAdapter>,
        title_service: Arc<TitleService>,
    ) -> Self {
        Self {
            runner,
            persistence,
            title_service,
            state: RwLock::new(DeliberationState::Idle),
            transitions: RwLock::new(Vec::new()),
        }
    }

    pub async fn state(&self) -> DeliberationState {
        *self.state.read().await
    }

    pub async fn history(&self) -> Vec<StateTransition> {
        self.transitions.read().await.clone()
    }

    /// Persist whatever trace was gathered before a cancellation landed.
    /// §4.7: in-flight tokens already emitted are kept and the trace is
    /// recorded with a `Cancelled` tag; no title job follows a cancelled
    /// request.
    async fn persist_cancelled(
        &self,
        conversation_id: Uuid,
        drafts: Vec<crate::conversation::Draft>,
        rounds: Vec<crate::conversation::Stage2Round>,
    ) {
        let record = DeliberationRecord {
            drafts,
            rounds,
            synthesis: crate::conversation::Synthesis {
                content: String::new(),
                thinking: None,
                elapsed_seconds: 0.0,
            },
            cancelled: true,
        };
        let message = Message::assistant(String::new(), record);
        if let Err(e) = self.persistence.append_message(conversation_id, message).await {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "failed to persist cancelled trace");
        }
    }

    async fn transition(&self, to: DeliberationState, reason: impl Into<String>) {
        let mut state = self.state.write().await;
        let from = *state;
        *state = to;
        drop(state);
        self.transitions.write().await.push(StateTransition {
            from,
            to,
            reason: reason.into(),
            timestamp: Utc::now(),
        });
        tracing::info!(?from, ?to, "deliberation state transition");
    }

    /// Run the full deliberation for `conversation_id`/`query`, streaming
    /// events through `events` and respecting `cancel`. On success, the
    /// assistant message is appended to persistence and, if this was the
    /// conversation's first user message, a title job is enqueued.
    pub async fn run(
        &self,
        conversation_id: Uuid,
        query: String,
        config: DeliberationConfig,
        events: EventSender,
        cancel: CancellationToken,
        is_first_message: bool,
    ) -> CouncilResult<DeliberationRecord> {
        self.transition(DeliberationState::Stage1, "request accepted").await;

        let tracker = Arc::new(Mutex::new(TokenTracker::new()));

        let stage1 = tokio::select! {
            result = self.runner.run_stage1(&query, &config, &events, Arc::clone(&tracker)) => result,
            _ = cancel.cancelled() => {
                self.transition(DeliberationState::Failed, "cancelled during stage1").await;
                self.persist_cancelled(conversation_id, Vec::new(), Vec::new()).await;
                return Err(CouncilError::Cancelled);
            }
        };

        let drafts = match stage1 {
            Ok(drafts) => drafts,
            Err(e) => {
                self.transition(DeliberationState::Failed, e.to_string()).await;
                events.emit(DeliberationEvent::from(&e)).await;
                return Err(e);
            }
        };

        let mut contents: HashMap<String, String> = drafts
            .iter()
            .filter(|d| d.error.is_none())
            .map(|d| (d.model.clone(), d.content.clone()))
            .collect();

        self.transition(DeliberationState::Stage2Round(1), "stage1 fan-in complete").await;

        let mut rounds = Vec::new();
        let mut round = 1u32;
        let seed = conversation_id.as_u128() as u64;

        loop {
            if cancel.is_cancelled() {
                self.transition(DeliberationState::Failed, "cancelled during stage2").await;
                self.persist_cancelled(conversation_id, drafts, rounds).await;
                return Err(CouncilError::Cancelled);
            }

            let stage2 = self
                .runner
                .run_stage2_round(
                    round,
                    config.rounds,
                    &query,
                    &contents,
                    &config,
                    &events,
                    Arc::clone(&tracker),
                    seed.wrapping_add(round as u64),
                )
                .await;

            let refinement_triggered = stage2.refinement_triggered;
            for refinement in &stage2.refinements {
                contents.insert(refinement.model.clone(), refinement.content.clone());
            }
            let aggregate = stage2.aggregate.clone();
            rounds.push(stage2);

            if refinement_triggered && round < config.rounds {
                self.transition(DeliberationState::Refine(round), "quality below threshold").await;
                round += 1;
                self.transition(DeliberationState::Stage2Round(round), "refinement complete").await;
                continue;
            }

            let _ = &aggregate;
            break;
        }

        events.emit(DeliberationEvent::Stage2Complete).await;
        self.transition(DeliberationState::Stage3, "stage2 terminated").await;

        let last_round = rounds.last().expect("at least one round always runs");
        let aggregate = last_round.aggregate.clone();

        let synthesis = tokio::select! {
            result = self.runner.run_stage3(&query, &contents, &aggregate, &config, &events, Arc::clone(&tracker)) => result,
            _ = cancel.cancelled() => {
                self.transition(DeliberationState::Failed, "cancelled during stage3").await;
                self.persist_cancelled(conversation_id, drafts, rounds).await;
                return Err(CouncilError::Cancelled);
            }
        };

        let synthesis = match synthesis {
            Ok(s) => s,
            Err(e) => {
                self.transition(DeliberationState::Failed, e.to_string()).await;
                return Err(e);
            }
        };

        self.transition(DeliberationState::Done, "stage3 complete").await;

        let record = DeliberationRecord {
            drafts,
            rounds,
            synthesis: synthesis.clone(),
            cancelled: false,
        };

        let assistant_message = Message::assistant(synthesis.content.clone(), record.clone());
        self.persistence.append_message(conversation_id, assistant_message).await?;

        if is_first_message {
            self.title_service
                .enqueue(conversation_id, query, Priority::Immediate)
                .await;
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions_are_recorded_in_order() {
        // Exercised indirectly through Controller::run in integration-style
        // tests (stage_runner requires a live HTTP backend); this test
        // documents the invariant that transitions is append-only.
        let transitions: Vec<StateTransition> = Vec::new();
        assert!(transitions.is_empty());
    }
}
