//! Title Service (C8): background worker pool that generates conversation
//! titles from the first user message, with a two-class priority queue and
//! idempotent enqueue (P10).

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use council_core::limits::{
    DEFAULT_TITLE_MAX_CONCURRENT, DEFAULT_TITLE_RETRY_ATTEMPTS, DEFAULT_TITLE_TIMEOUT_SECS,
    DEFAULT_TITLE_WORKERS, TITLE_FALLBACK_MAX_CHARS, TITLE_MAX_WORDS, TITLE_RETRY_BASE_DELAY_MS,
};
use council_core::excerpts::truncate_with_ellipsis;

use crate::conversation::is_generic_title;
use crate::model_client::{ChatMessage, ModelClient, ModelEndpoint};
use crate::persistence::PersistenceAdapter;
use crate::push_broker::{PushBroker, TitlePushEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleJobStatus {
    Queued,
    Generating,
    Thinking,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Background,
    Immediate,
}

#[derive(Debug, Clone)]
struct TitleJob {
    conversation_id: Uuid,
    trigger_message: String,
    priority: Priority,
    attempt: u32,
}

struct QueueState {
    queued_ids: HashSet<Uuid>,
    in_flight_ids: HashSet<Uuid>,
    immediate: VecDeque<TitleJob>,
    background: VecDeque<TitleJob>,
}

impl QueueState {
    fn pop_next(&mut self) -> Option<TitleJob> {
        self.immediate.pop_front().or_else(|| self.background.pop_front())
    }
}

/// Configuration knobs for the title service, mirroring the
/// `title_generation` section of the configuration document.
#[derive(Debug, Clone)]
pub struct TitleServiceConfig {
    pub enabled: bool,
    pub workers: usize,
    pub max_concurrent: usize,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub reasoning_hints: Vec<String>,
}

impl Default for TitleServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: DEFAULT_TITLE_WORKERS,
            max_concurrent: DEFAULT_TITLE_MAX_CONCURRENT,
            timeout_secs: DEFAULT_TITLE_TIMEOUT_SECS,
            retry_attempts: DEFAULT_TITLE_RETRY_ATTEMPTS,
            reasoning_hints: vec!["thinking".into(), "reasoning".into(), "o1".into()],
        }
    }
}

pub struct TitleService {
    config: TitleServiceConfig,
    queue: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    concurrency: Arc<Semaphore>,
    client: Arc<ModelClient>,
    chairman: ModelEndpoint,
    persistence: Arc<dyn PersistenceAdapter>,
    broker: PushBroker,
}

impl TitleService {
    pub fn new(
        config: TitleServiceConfig,
        client: Arc<ModelClient>,
        chairman: ModelEndpoint,
        persistence: Arc<dyn PersistenceAdapter>,
        broker: PushBroker,
    ) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            config,
            queue: Arc::new(Mutex::new(QueueState {
                queued_ids: HashSet::new(),
                in_flight_ids: HashSet::new(),
                immediate: VecDeque::new(),
                background: VecDeque::new(),
            })),
            notify: Arc::new(Notify::new()),
            concurrency: Arc::new(Semaphore::new(max_concurrent)),
            client,
            chairman,
            persistence,
            broker,
        }
    }

    /// Enqueue a job for `conversation_id`. A no-op if a job for that
    /// conversation is already queued or in flight (P10).
    pub async fn enqueue(&self, conversation_id: Uuid, trigger_message: String, priority: Priority) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.queue.lock().await;
        if state.queued_ids.contains(&conversation_id) || state.in_flight_ids.contains(&conversation_id) {
            return;
        }
        state.queued_ids.insert(conversation_id);
        let job = TitleJob {
            conversation_id,
            trigger_message,
            priority,
            attempt: 0,
        };
        match priority {
            Priority::Immediate => state.immediate.push_back(job),
            Priority::Background => state.background.push_back(job),
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Scan persisted conversations at startup and background-enqueue every
    /// one whose title is still generic and that has at least one message.
    pub async fn rescan_on_startup(&self) {
        let Ok(conversations) = self.persistence.list_active().await else {
            return;
        };
        for conv in conversations {
            if is_generic_title(&conv.title) && !conv.messages.is_empty() {
                if let Some(first_user) = conv.messages.iter().find(|m| m.role == crate::conversation::Role::User) {
                    self.enqueue(conv.id, first_user.content.clone(), Priority::Background).await;
                }
            }
        }
    }

    /// Spawn `config.workers` background workers draining the queue. Each
    /// worker loops: wait for a job, acquire a concurrency permit, run it.
    pub fn spawn_workers(self: &Arc<Self>) {
        for worker_id in 0..self.config.workers.max(1) {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.worker_loop(worker_id).await;
            });
        }
    }

    async fn worker_loop(&self, worker_id: usize) {
        info!(worker_id, "title worker started");
        loop {
            let job = loop {
                let mut state = self.queue.lock().await;
                if let Some(job) = state.pop_next() {
                    state.queued_ids.remove(&job.conversation_id);
                    state.in_flight_ids.insert(job.conversation_id);
                    break job;
                }
                drop(state);
                self.notify.notified().await;
            };

            let _permit = self.concurrency.acquire().await.expect("semaphore not closed");
            self.run_job(job).await;
        }
    }

    async fn run_job(&self, mut job: TitleJob) {
        self.broker
            .publish(TitlePushEvent {
                conversation_id: job.conversation_id,
                status: TitleJobStatus::Generating,
                title: None,
                thinking_delta: None,
            })
            .await;

        let is_reasoning_model = self
            .config
            .reasoning_hints
            .iter()
            .any(|hint| self.chairman.model.to_lowercase().contains(&hint.to_lowercase()));

        if is_reasoning_model {
            self.broker
                .publish(TitlePushEvent {
                    conversation_id: job.conversation_id,
                    status: TitleJobStatus::Thinking,
                    title: None,
                    thinking_delta: None,
                })
                .await;
        }

        let prompt = format!(
            "Generate a short title (at most {} words) for a conversation that starts with this \
             message. Respond with only the title, no quotes, no trailing punctuation, no \
             boilerplate like 'New Conversation'.\n\nMessage: {}",
            TITLE_MAX_WORDS, job.trigger_message
        );

        let messages = vec![
            ChatMessage::system("You generate concise conversation titles."),
            ChatMessage::user(prompt),
        ];

        let result = self
            .client
            .complete(&self.chairman, &messages, Duration::from_secs(self.config.timeout_secs))
            .await;

        match result {
            Ok(completion) => {
                let title = extract_title(&completion.content, &job.trigger_message);
                if let Err(e) = self.persistence.update_title(job.conversation_id, title.clone()).await {
                    warn!(conversation_id = %job.conversation_id, error = %e, "failed to persist generated title");
                }
                self.finish(job.conversation_id, TitleJobStatus::Complete, Some(title)).await;
                info!(conversation_id = %job.conversation_id, "title generated");
            }
            Err(e) => {
                job.attempt += 1;
                if job.attempt >= self.config.retry_attempts.max(1) {
                    warn!(conversation_id = %job.conversation_id, error = %e, "title generation failed permanently");
                    self.finish(job.conversation_id, TitleJobStatus::Error, None).await;
                } else {
                    let delay = TITLE_RETRY_BASE_DELAY_MS * 2u64.pow(job.attempt - 1);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let mut state = self.queue.lock().await;
                    state.in_flight_ids.remove(&job.conversation_id);
                    state.queued_ids.insert(job.conversation_id);
                    match job.priority {
                        Priority::Immediate => state.immediate.push_back(job),
                        Priority::Background => state.background.push_back(job),
                    }
                    drop(state);
                    self.notify.notify_one();
                }
            }
        }
    }

    async fn finish(&self, conversation_id: Uuid, status: TitleJobStatus, title: Option<String>) {
        let mut state = self.queue.lock().await;
        state.in_flight_ids.remove(&conversation_id);
        drop(state);
        self.broker
            .publish(TitlePushEvent {
                conversation_id,
                status,
                title,
                thinking_delta: None,
            })
            .await;
    }
}

/// Extract a usable title from the chairman's raw response, falling back to
/// a truncated excerpt of the trigger message (§4.8 step 4).
fn extract_title(raw: &str, trigger_message: &str) -> String {
    let without_think = raw.split("</think>").last().unwrap_or(raw);
    let trimmed = without_think
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'')
        .trim();
    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.is_empty() || is_generic_title(&collapsed) || collapsed == "New Conversation" {
        return truncate_with_ellipsis(trigger_message, TITLE_FALLBACK_MAX_CHARS);
    }
    collapsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_title_happy_path() {
        let title = extract_title("Docker rootless setup guide", "how do I install docker");
        assert_eq!(title, "Docker rootless setup guide");
    }

    #[test]
    fn test_extract_title_strips_quotes_and_thinking() {
        let raw = "<think>hmm let me think</think>\"Docker Setup\"";
        let title = extract_title(raw, "how do I install docker");
        assert_eq!(title, "Docker Setup");
    }

    #[test]
    fn test_extract_title_falls_back_on_boilerplate() {
        let title = extract_title(
            "New Conversation",
            "How do I install docker on ubuntu server 22.04 with rootless mode enabled please?",
        );
        assert!(title.ends_with('…'));
        assert!(title.starts_with("How do I install docker"));
    }

    #[test]
    fn test_extract_title_falls_back_on_empty() {
        let title = extract_title("   ", "short message");
        assert_eq!(title, "short message");
    }
}
