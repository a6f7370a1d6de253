//! Token Tracker (C2): per-model timing and throughput for a single request.
//!
//! Token counts use a whitespace-word-count proxy rather than a real
//! tokenizer (documented, matching what the UI badge shows).

use std::collections::HashMap;
use std::time::Instant;

/// Timing state for one `(model)` call within a request. Built incrementally
/// as chunks arrive, then finalized once.
#[derive(Debug, Clone)]
pub struct ModelTiming {
    start: Instant,
    first_token_at: Option<Instant>,
    first_content_token_at: Option<Instant>,
    end_at: Option<Instant>,
    content_tokens: u64,
}

impl ModelTiming {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            first_token_at: None,
            first_content_token_at: None,
            end_at: None,
            content_tokens: 0,
        }
    }

    pub fn record_thinking_delta(&mut self) {
        self.first_token_at.get_or_insert_with(Instant::now);
    }

    pub fn record_content_delta(&mut self, delta: &str) {
        let now = Instant::now();
        self.first_token_at.get_or_insert(now);
        self.first_content_token_at.get_or_insert(now);
        self.content_tokens += word_count(delta);
    }

    pub fn finish(&mut self) {
        self.end_at.get_or_insert_with(Instant::now);
    }

    pub fn summary(&self) -> ModelTimingSummary {
        let end = self.end_at.unwrap_or_else(Instant::now);
        let first_content = self.first_content_token_at.unwrap_or(end);
        let elapsed_seconds = end.saturating_duration_since(self.start).as_secs_f64();
        let thinking_seconds = first_content.saturating_duration_since(self.start).as_secs_f64();
        let generation_seconds = end.saturating_duration_since(first_content).as_secs_f64();
        let tokens_per_second = if generation_seconds > f64::EPSILON {
            self.content_tokens as f64 / generation_seconds
        } else {
            self.content_tokens as f64
        };
        ModelTimingSummary {
            elapsed_seconds,
            thinking_seconds,
            content_tokens: self.content_tokens,
            tokens_per_second,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ModelTimingSummary {
    pub elapsed_seconds: f64,
    pub thinking_seconds: f64,
    pub content_tokens: u64,
    pub tokens_per_second: f64,
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Aggregates timing across every model call in a single request, keyed by
/// `(stage_label, model)` so Stage 1 drafting and Stage 2 ranking timings
/// for the same model don't collide.
#[derive(Debug, Default)]
pub struct TokenTracker {
    timings: HashMap<(String, String), ModelTiming>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, stage: &str, model: &str) {
        self.timings
            .insert((stage.to_string(), model.to_string()), ModelTiming::start());
    }

    pub fn on_thinking_delta(&mut self, stage: &str, model: &str) {
        if let Some(t) = self.timings.get_mut(&(stage.to_string(), model.to_string())) {
            t.record_thinking_delta();
        }
    }

    pub fn on_content_delta(&mut self, stage: &str, model: &str, delta: &str) {
        if let Some(t) = self.timings.get_mut(&(stage.to_string(), model.to_string())) {
            t.record_content_delta(delta);
        }
    }

    pub fn finish(&mut self, stage: &str, model: &str) -> ModelTimingSummary {
        let key = (stage.to_string(), model.to_string());
        if let Some(t) = self.timings.get_mut(&key) {
            t.finish();
            t.summary()
        } else {
            ModelTimingSummary::default()
        }
    }

    pub fn summary(&self, stage: &str, model: &str) -> ModelTimingSummary {
        self.timings
            .get(&(stage.to_string(), model.to_string()))
            .map(ModelTiming::summary)
            .unwrap_or_default()
    }
}

/// Human-readable token count, mirroring the UI's compact badge format.
pub fn format_tokens(count: u64) -> String {
    if count >= 1_000_000 {
        format!("{:.1}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.1}k", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn test_format_tokens() {
        assert_eq!(format_tokens(42), "42");
        assert_eq!(format_tokens(1500), "1.5k");
        assert_eq!(format_tokens(2_500_000), "2.5M");
    }

    #[test]
    fn test_timing_basic_flow() {
        let mut t = ModelTiming::start();
        sleep(Duration::from_millis(5));
        t.record_content_delta("hello world");
        sleep(Duration::from_millis(5));
        t.finish();
        let s = t.summary();
        assert_eq!(s.content_tokens, 2);
        assert!(s.elapsed_seconds > 0.0);
        assert!(s.thinking_seconds > 0.0);
    }

    #[test]
    fn test_tracker_keys_by_stage_and_model() {
        let mut tracker = TokenTracker::new();
        tracker.begin("stage1", "model-a");
        tracker.begin("stage2_round1", "model-a");
        tracker.on_content_delta("stage1", "model-a", "one two three");
        let s1 = tracker.finish("stage1", "model-a");
        let s2 = tracker.finish("stage2_round1", "model-a");
        assert_eq!(s1.content_tokens, 3);
        assert_eq!(s2.content_tokens, 0);
    }

    #[test]
    fn test_unknown_key_returns_default() {
        let tracker = TokenTracker::new();
        let s = tracker.summary("nope", "nope");
        assert_eq!(s.content_tokens, 0);
    }
}
