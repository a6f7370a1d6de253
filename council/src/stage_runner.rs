//! Stage Runner (C5): executes Stage 1 (parallel draft), Stage 2 (N-round
//! peer ranking + refinement), and Stage 3 (synthesis).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};

use council_core::limits::{DEFAULT_STAGE_TIMEOUT_SECS, DEFAULT_SYNTHESIS_TIMEOUT_SECS, MIN_COUNCIL_RESPONSES};

use crate::anonymizer::AnonLabelMap;
use crate::config::DeliberationConfig;
use crate::conversation::{AggregateRanking, Draft, RankingEntry, RefinementEntry, Stage2Round, Synthesis};
use crate::errors::{CouncilError, CouncilResult};
use crate::events::{DeliberationEvent, EventSender};
use crate::model_client::{ChatMessage, ModelClient, StreamChunk};
use crate::ranking::{aggregate_rankings, parse_ranking};
use crate::token_tracker::TokenTracker;

pub struct StageRunner {
    client: Arc<ModelClient>,
    resolve: Box<dyn Fn(&str) -> crate::model_client::ModelEndpoint + Send + Sync>,
}

impl StageRunner {
    pub fn new(
        client: Arc<ModelClient>,
        resolve: impl Fn(&str) -> crate::model_client::ModelEndpoint + Send + Sync + 'static,
    ) -> Self {
        Self {
            client,
            resolve: Box::new(resolve),
        }
    }

    /// Stage 1: fan out one streaming completion per council model, collect
    /// the drafts. Per §4.5: if at least `MIN_COUNCIL_RESPONSES` succeed,
    /// continue with the successes; otherwise the whole request fails with
    /// `InsufficientCouncil`.
    pub async fn run_stage1(
        &self,
        query: &str,
        config: &DeliberationConfig,
        events: &EventSender,
        tracker: Arc<Mutex<TokenTracker>>,
    ) -> CouncilResult<Vec<Draft>> {
        events.emit(DeliberationEvent::Stage1Start).await;

        let messages = vec![ChatMessage::user(query.to_string())];
        let mut handles = Vec::new();

        for model in &config.council_members {
            let endpoint = (self.resolve)(model);
            let client = Arc::clone(&self.client);
            let messages = messages.clone();
            let events = events.clone();
            let tracker = Arc::clone(&tracker);
            let model_name = model.clone();

            handles.push(tokio::spawn(async move {
                run_single_draft(client, endpoint, messages, events, tracker, model_name).await
            }));
        }

        let mut drafts = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(draft) => drafts.push(draft),
                Err(e) => tracing::warn!(error = %e, "stage1 task panicked"),
            }
        }

        events.emit(DeliberationEvent::Stage1Complete).await;

        let succeeded = drafts.iter().filter(|d| d.error.is_none()).count();
        if succeeded < MIN_COUNCIL_RESPONSES {
            return Err(CouncilError::InsufficientCouncil {
                succeeded,
                attempted: config.council_members.len(),
                required: MIN_COUNCIL_RESPONSES,
            });
        }

        Ok(drafts)
    }

    /// Stage 2: one round of anonymized peer ranking, plus an optional
    /// refinement sub-round when triggered. `contents` holds the current
    /// content per model (Stage-1 drafts for round 1, refined content for
    /// later rounds).
    pub async fn run_stage2_round(
        &self,
        round: u32,
        max_rounds: u32,
        query: &str,
        contents: &HashMap<String, String>,
        config: &DeliberationConfig,
        events: &EventSender,
        tracker: Arc<Mutex<TokenTracker>>,
        seed: u64,
    ) -> Stage2Round {
        events
            .emit(DeliberationEvent::Stage2RoundStart { round, max_rounds })
            .await;

        let live_models: Vec<String> = contents.keys().cloned().collect();
        let anon = AnonLabelMap::new(&live_models, seed);

        let mut handles = Vec::new();
        for ranker in &live_models {
            let view = anon.view_excluding(ranker, contents);
            if view.is_empty() {
                continue;
            }
            let expected_labels = view.len();
            let prompt = build_ranking_prompt(query, &view);
            let endpoint = (self.resolve)(ranker);
            let client = Arc::clone(&self.client);
            let events = events.clone();
            let tracker = Arc::clone(&tracker);
            let ranker_name = ranker.clone();
            let stage_label = format!("stage2_round{round}");

            handles.push(tokio::spawn(async move {
                run_single_ranking(
                    client,
                    endpoint,
                    prompt,
                    events,
                    tracker,
                    ranker_name,
                    stage_label,
                    expected_labels,
                )
                .await
            }));
        }

        let mut rankings = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(entry) = handle.await {
                rankings.push(entry);
            }
        }

        // De-anonymize each ranker's ordering before aggregating so the
        // persisted trace references real model ids, not per-round labels.
        let per_ranker_real: Vec<Vec<crate::ranking::RankedLabel>> = rankings
            .iter()
            .map(|r| {
                r.ordering
                    .iter()
                    .filter_map(|rl| {
                        let model = anon.model_for(&rl.label)?;
                        Some(crate::ranking::RankedLabel {
                            label: model.to_string(),
                            score: rl.score,
                        })
                    })
                    .collect()
            })
            .collect();

        let (ordering, mean_position, mean_quality) = aggregate_rankings(&per_ranker_real);
        let aggregate = AggregateRanking {
            ordering,
            mean_position,
            mean_quality,
        };

        let refinement_triggered = round < max_rounds
            && config.enable_cross_review
            && aggregate
                .mean_quality
                .values()
                .any(|&q| (q as f32) < config.quality_threshold);

        let mut refinements = Vec::new();
        if refinement_triggered {
            events.emit(DeliberationEvent::Stage2RefinementStart { round }).await;
            refinements = self
                .run_refinement(query, contents, &rankings, &anon, events, Arc::clone(&tracker), round)
                .await;
        }

        events
            .emit(DeliberationEvent::Stage2RoundComplete {
                round,
                refinement_triggered,
            })
            .await;

        Stage2Round {
            round,
            rankings,
            aggregate,
            refinement_triggered,
            refinements,
        }
    }

    async fn run_refinement(
        &self,
        query: &str,
        contents: &HashMap<String, String>,
        rankings: &[RankingEntry],
        anon: &AnonLabelMap,
        events: &EventSender,
        tracker: Arc<Mutex<TokenTracker>>,
        round: u32,
    ) -> Vec<RefinementEntry> {
        let mut handles = Vec::new();
        for (model, own_content) in contents {
            let feedback = feedback_directed_at(model, rankings, anon);
            let prompt = build_refinement_prompt(query, own_content, &feedback);
            let endpoint = (self.resolve)(model);
            let client = Arc::clone(&self.client);
            let events = events.clone();
            let tracker = Arc::clone(&tracker);
            let model_name = model.clone();
            let stage_label = format!("stage2_refine{round}");

            handles.push(tokio::spawn(async move {
                run_single_refinement(client, endpoint, prompt, events, tracker, model_name, stage_label).await
            }));
        }

        let mut refinements = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(Some(entry)) = handle.await {
                refinements.push(entry);
            }
        }
        refinements
    }

    /// Stage 3: chairman synthesizes from the final drafts, real model ids,
    /// and aggregate peer scores.
    pub async fn run_stage3(
        &self,
        query: &str,
        final_contents: &HashMap<String, String>,
        aggregate: &AggregateRanking,
        config: &DeliberationConfig,
        events: &EventSender,
        tracker: Arc<Mutex<TokenTracker>>,
    ) -> CouncilResult<Synthesis> {
        events.emit(DeliberationEvent::Stage3Start).await;

        let prompt = build_synthesis_prompt(query, final_contents, aggregate);
        let endpoint = (self.resolve)(&config.chairman);
        let messages = vec![ChatMessage::user(prompt)];

        let (tx, mut rx) = mpsc::channel(32);
        let start = Instant::now();
        {
            let mut t = tracker.lock().await;
            t.begin("stage3", &config.chairman);
        }

        let client = Arc::clone(&self.client);
        let stream_endpoint = endpoint.clone();
        tokio::spawn(async move {
            client
                .complete_stream(stream_endpoint, messages, Duration::from_secs(DEFAULT_SYNTHESIS_TIMEOUT_SECS), tx)
                .await;
        });

        let mut content = String::new();
        let mut thinking: Option<String> = None;
        let mut errored: Option<CouncilError> = None;

        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::ContentDelta(delta) => {
                    {
                        let mut t = tracker.lock().await;
                        t.on_content_delta("stage3", &config.chairman, &delta);
                    }
                    events.emit(DeliberationEvent::Stage3Token { delta: delta.clone() }).await;
                    content.push_str(&delta);
                }
                StreamChunk::ThinkingDelta(_) => {
                    let mut t = tracker.lock().await;
                    t.on_thinking_delta("stage3", &config.chairman);
                }
                StreamChunk::Done { content: c, thinking: th } => {
                    content = c;
                    thinking = th;
                }
                StreamChunk::Error(e) => {
                    errored = Some(e);
                }
            }
        }

        {
            let mut t = tracker.lock().await;
            t.finish("stage3", &config.chairman);
        }

        if let Some(e) = errored {
            events.emit(DeliberationEvent::from(&e)).await;
            return Err(e);
        }

        events.emit(DeliberationEvent::Stage3Complete).await;

        Ok(Synthesis {
            content,
            thinking,
            elapsed_seconds: start.elapsed().as_secs_f64(),
        })
    }
}

async fn run_single_draft(
    client: Arc<ModelClient>,
    endpoint: crate::model_client::ModelEndpoint,
    messages: Vec<ChatMessage>,
    events: EventSender,
    tracker: Arc<Mutex<TokenTracker>>,
    model: String,
) -> Draft {
    let (tx, mut rx) = mpsc::channel(32);
    let start = Instant::now();
    {
        let mut t = tracker.lock().await;
        t.begin("stage1", &model);
    }

    let stream_client = Arc::clone(&client);
    let stream_endpoint = endpoint.clone();
    let join = tokio::spawn(async move {
        stream_client
            .complete_stream(stream_endpoint, messages, Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS), tx)
            .await;
    });

    let mut content = String::new();
    let mut thinking: Option<String> = None;
    let mut error: Option<String> = None;

    while let Some(chunk) = rx.recv().await {
        match chunk {
            StreamChunk::ContentDelta(delta) => {
                {
                    let mut t = tracker.lock().await;
                    t.on_content_delta("stage1", &model, &delta);
                }
                let tps = tracker.lock().await.summary("stage1", &model).tokens_per_second;
                events
                    .emit(DeliberationEvent::Stage1Token {
                        model: model.clone(),
                        delta: delta.clone(),
                        tokens_per_second: tps,
                    })
                    .await;
                content.push_str(&delta);
            }
            StreamChunk::ThinkingDelta(_) => {
                let mut t = tracker.lock().await;
                t.on_thinking_delta("stage1", &model);
            }
            StreamChunk::Done { content: c, thinking: th } => {
                content = c;
                thinking = th;
            }
            StreamChunk::Error(e) => {
                error = Some(e.to_string());
            }
        }
    }

    let _ = join.await;
    let summary = {
        let mut t = tracker.lock().await;
        t.finish("stage1", &model)
    };

    events
        .emit(DeliberationEvent::Stage1ModelComplete {
            model: model.clone(),
            elapsed_seconds: summary.elapsed_seconds,
        })
        .await;

    Draft {
        model,
        content,
        thinking,
        elapsed_seconds: start.elapsed().as_secs_f64(),
        error,
    }
}

async fn run_single_ranking(
    client: Arc<ModelClient>,
    endpoint: crate::model_client::ModelEndpoint,
    prompt: String,
    events: EventSender,
    tracker: Arc<Mutex<TokenTracker>>,
    ranker_model: String,
    stage_label: String,
    expected_labels: usize,
) -> RankingEntry {
    let (tx, mut rx) = mpsc::channel(32);
    let start = Instant::now();
    {
        let mut t = tracker.lock().await;
        t.begin(&stage_label, &ranker_model);
    }

    let messages = vec![ChatMessage::user(prompt)];
    let stream_client = Arc::clone(&client);
    tokio::spawn(async move {
        stream_client
            .complete_stream(endpoint, messages, Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS), tx)
            .await;
    });

    let mut content = String::new();
    while let Some(chunk) = rx.recv().await {
        match chunk {
            StreamChunk::ContentDelta(delta) => {
                {
                    let mut t = tracker.lock().await;
                    t.on_content_delta(&stage_label, &ranker_model, &delta);
                }
                events
                    .emit(DeliberationEvent::Stage2Token {
                        model: ranker_model.clone(),
                        delta: delta.clone(),
                    })
                    .await;
                content.push_str(&delta);
            }
            StreamChunk::ThinkingDelta(_) => {
                let mut t = tracker.lock().await;
                t.on_thinking_delta(&stage_label, &ranker_model);
            }
            StreamChunk::Done { content: c, .. } => content = c,
            StreamChunk::Error(_) => {}
        }
    }

    let summary = {
        let mut t = tracker.lock().await;
        t.finish(&stage_label, &ranker_model)
    };
    events
        .emit(DeliberationEvent::Stage2ModelComplete {
            model: ranker_model.clone(),
            elapsed_seconds: summary.elapsed_seconds,
        })
        .await;

    let parsed = parse_ranking(&content, expected_labels);
    if !parsed.warnings.is_empty() {
        tracing::warn!(
            ranker = %ranker_model,
            warnings = ?parsed.warnings,
            excerpt = %council_core::excerpts::create_excerpt(&content, 400, 200),
            "ranking parse warning"
        );
    }
    RankingEntry {
        ranker_model,
        raw_text: content,
        ordering: parsed.ordering,
        elapsed_seconds: start.elapsed().as_secs_f64(),
        warnings: parsed.warnings,
    }
}

async fn run_single_refinement(
    client: Arc<ModelClient>,
    endpoint: crate::model_client::ModelEndpoint,
    prompt: String,
    events: EventSender,
    tracker: Arc<Mutex<TokenTracker>>,
    model: String,
    stage_label: String,
) -> Option<RefinementEntry> {
    let (tx, mut rx) = mpsc::channel(32);
    let start = Instant::now();
    {
        let mut t = tracker.lock().await;
        t.begin(&stage_label, &model);
    }

    let messages = vec![ChatMessage::user(prompt)];
    tokio::spawn(async move {
        client
            .complete_stream(endpoint, messages, Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS), tx)
            .await;
    });

    let mut content = String::new();
    let mut ok = false;
    while let Some(chunk) = rx.recv().await {
        match chunk {
            StreamChunk::ContentDelta(delta) => {
                events
                    .emit(DeliberationEvent::Stage2RefinementToken {
                        model: model.clone(),
                        delta: delta.clone(),
                    })
                    .await;
                content.push_str(&delta);
                ok = true;
            }
            StreamChunk::Done { content: c, .. } => {
                content = c;
                ok = true;
            }
            _ => {}
        }
    }

    {
        let mut t = tracker.lock().await;
        t.finish(&stage_label, &model);
    }

    ok.then(|| RefinementEntry {
        model,
        content,
        elapsed_seconds: start.elapsed().as_secs_f64(),
    })
}

fn build_ranking_prompt(query: &str, view: &[(&str, &str)]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "You are evaluating anonymized responses to this query:\n\n{query}\n\n"
    ));
    for (label, content) in view {
        out.push_str(&format!("Response {label}:\n{content}\n\n"));
    }
    out.push_str(
        "Give a 1-line feedback and a quality rating (k/5) for each response, then a final \
         section titled \"FINAL RANKING\" listing the responses best-to-worst as \
         \"1. Response X (k/5)\".",
    );
    out
}

fn feedback_directed_at(model: &str, rankings: &[RankingEntry], anon: &AnonLabelMap) -> Vec<String> {
    let Some(own_label) = anon.label_for(model) else {
        return Vec::new();
    };
    rankings
        .iter()
        .filter_map(|r| {
            r.ordering
                .iter()
                .find(|entry| entry.label == own_label)
                .map(|entry| match entry.score {
                    Some(score) => format!("A peer rated your response {score}/5."),
                    None => "A peer ranked your response without an explicit score.".to_string(),
                })
        })
        .collect()
}

fn build_refinement_prompt(query: &str, own_content: &str, feedback: &[String]) -> String {
    format!(
        "Original query:\n{query}\n\nYour previous response:\n{own_content}\n\nPeer feedback:\n{}\n\n\
         Write an improved response that addresses the feedback.",
        feedback.join("\n")
    )
}

fn build_synthesis_prompt(query: &str, final_contents: &HashMap<String, String>, aggregate: &AggregateRanking) -> String {
    let mut out = String::new();
    out.push_str(&format!("Original query:\n{query}\n\n"));
    for model in &aggregate.ordering {
        if let Some(content) = final_contents.get(model) {
            let score = aggregate.mean_quality.get(model).copied().unwrap_or(0.0);
            out.push_str(&format!("{model} (peer score {score:.1}/5):\n{content}\n\n"));
        }
    }
    out.push_str("Synthesize a single best answer from the above, incorporating each model's strongest points.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ranking_prompt_includes_all_labels() {
        let view = vec![("A", "draft a"), ("B", "draft b")];
        let prompt = build_ranking_prompt("what is rust", &view);
        assert!(prompt.contains("Response A"));
        assert!(prompt.contains("Response B"));
        assert!(prompt.contains("FINAL RANKING"));
    }

    #[test]
    fn test_synthesis_prompt_orders_by_aggregate() {
        let mut contents = HashMap::new();
        contents.insert("model-a".to_string(), "draft a".to_string());
        contents.insert("model-b".to_string(), "draft b".to_string());
        let aggregate = AggregateRanking {
            ordering: vec!["model-a".to_string(), "model-b".to_string()],
            mean_position: HashMap::new(),
            mean_quality: HashMap::new(),
        };
        let prompt = build_synthesis_prompt("q", &contents, &aggregate);
        let pos_a = prompt.find("model-a").unwrap();
        let pos_b = prompt.find("model-b").unwrap();
        assert!(pos_a < pos_b);
    }
}
