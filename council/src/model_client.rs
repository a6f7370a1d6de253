//! Model Client (C1): streaming and whole-response chat completions against
//! OpenAI-compatible backends.
//!
//! A single client handles every council member, the chairman, and the
//! title-generation chairman call alike: dispatch is by per-model endpoint
//! resolution, not by one subclass per provider.

use std::time::Duration;

use council_core::sse::{SseDecoder, SseFrame};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::{CouncilError, CouncilResult};

/// A single resolved connection target for a model id.
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
}

/// One chat message in the wire sense (role + content only; the
/// conversation-level `Message` in `conversation.rs` carries richer data).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A streamed unit of output. Thinking and content deltas are kept separate
/// so callers never need to re-split a mixed stream.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    ThinkingDelta(String),
    ContentDelta(String),
    Done {
        content: String,
        thinking: Option<String>,
    },
    Error(CouncilError),
}

#[derive(Debug, Default, Clone)]
pub struct CompletionResult {
    pub content: String,
    pub thinking: Option<String>,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct ChatStreamChunk {
    choices: Vec<ChatStreamChoice>,
}

#[derive(Deserialize)]
struct ChatStreamChoice {
    delta: ChatStreamDelta,
}

#[derive(Deserialize, Default)]
struct ChatStreamDelta {
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// Routes raw content deltas through a `<think>...</think>` tag scanner so
/// providers without a structured reasoning field still get their thinking
/// text separated from the final answer (§4.1: thinking/content separation
/// MUST happen either via a structured field or via delimiter matching).
/// Tags may be split across chunk boundaries, so a partial match at the end
/// of a delta is held back until the next `feed` call.
struct ThinkTagRouter {
    in_think: bool,
    carry: String,
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

impl ThinkTagRouter {
    fn new() -> Self {
        Self {
            in_think: false,
            carry: String::new(),
        }
    }

    /// Feed the next raw delta, returning `(content, thinking)` text ready
    /// to emit now. Anything that might be the start of a tag is buffered.
    fn feed(&mut self, delta: &str) -> (String, String) {
        let mut buf = std::mem::take(&mut self.carry);
        buf.push_str(delta);

        let mut content_out = String::new();
        let mut thinking_out = String::new();

        loop {
            let tag = if self.in_think { THINK_CLOSE } else { THINK_OPEN };
            match buf.find(tag) {
                Some(idx) => {
                    let before = buf[..idx].to_string();
                    if self.in_think {
                        thinking_out.push_str(&before);
                    } else {
                        content_out.push_str(&before);
                    }
                    buf = buf[idx + tag.len()..].to_string();
                    self.in_think = !self.in_think;
                }
                None => {
                    let hold = partial_tag_suffix_len(&buf, tag);
                    let split_at = buf.len() - hold;
                    if self.in_think {
                        thinking_out.push_str(&buf[..split_at]);
                    } else {
                        content_out.push_str(&buf[..split_at]);
                    }
                    self.carry = buf[split_at..].to_string();
                    break;
                }
            }
        }

        (content_out, thinking_out)
    }
}

/// Length of the longest suffix of `buf` that is a strict prefix of `tag`
/// (i.e. a tag that might still be completing across the next chunk).
fn partial_tag_suffix_len(buf: &str, tag: &str) -> usize {
    let max = (tag.len() - 1).min(buf.len());
    for len in (1..=max).rev() {
        if buf.is_char_boundary(buf.len() - len) && tag.as_bytes().starts_with(buf[buf.len() - len..].as_bytes()) {
            return len;
        }
    }
    0
}

/// Whole-response counterpart to `ThinkTagRouter`: splits every
/// `<think>...</think>` span out of a complete string into `thinking`,
/// leaving the rest as `content`. Used by `complete()` when the backend
/// has no structured reasoning field.
fn split_think_tags(raw: &str) -> (String, Option<String>) {
    let mut content = String::new();
    let mut thinking = String::new();
    let mut rest = raw;
    while let Some(open) = rest.find(THINK_OPEN) {
        content.push_str(&rest[..open]);
        let after_open = &rest[open + THINK_OPEN.len()..];
        match after_open.find(THINK_CLOSE) {
            Some(close) => {
                thinking.push_str(&after_open[..close]);
                rest = &after_open[close + THINK_CLOSE.len()..];
            }
            None => {
                thinking.push_str(after_open);
                rest = "";
                break;
            }
        }
    }
    content.push_str(rest);
    (content, (!thinking.is_empty()).then_some(thinking))
}

pub struct ModelClient {
    http: reqwest::Client,
}

impl ModelClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(council_core::HTTP_TIMEOUT_SECS))
                .build()
                .expect("reqwest client builds with static config"),
        }
    }

    /// Non-streaming completion; used by the title service, which only
    /// needs a final string.
    pub async fn complete(
        &self,
        endpoint: &ModelEndpoint,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> CouncilResult<CompletionResult> {
        let url = format!("{}/v1/chat/completions", endpoint.base_url.trim_end_matches('/'));
        let body = ChatCompletionRequest {
            model: &endpoint.model,
            messages,
            stream: false,
        };

        let mut req = self.http.post(&url).json(&body).timeout(timeout);
        if let Some(key) = &endpoint.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                CouncilError::Timeout(timeout.as_secs())
            } else {
                CouncilError::BackendUnreachable(e.to_string())
            }
        })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CouncilError::ModelNotLoaded(endpoint.model.clone()));
        }
        if !resp.status().is_success() {
            return Err(CouncilError::ProtocolError(format!(
                "backend returned {}",
                resp.status()
            )));
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| CouncilError::ProtocolError(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CouncilError::ProtocolError("empty choices array".to_string()))?;

        if let Some(reasoning) = choice.message.reasoning_content {
            return Ok(CompletionResult {
                content: choice.message.content.unwrap_or_default(),
                thinking: Some(reasoning),
            });
        }

        let (content, thinking) = split_think_tags(&choice.message.content.unwrap_or_default());
        Ok(CompletionResult { content, thinking })
    }

    /// Streaming completion. Chunks are sent to `tx` as they decode; the
    /// caller drives the receiver. A stream that closes without a terminal
    /// `[DONE]` frame but with at least one content delta is treated as
    /// gracefully truncated rather than an error, per the model client's
    /// stream-termination contract.
    pub async fn complete_stream(
        &self,
        endpoint: ModelEndpoint,
        messages: Vec<ChatMessage>,
        timeout: Duration,
        tx: mpsc::Sender<StreamChunk>,
    ) {
        let url = format!("{}/v1/chat/completions", endpoint.base_url.trim_end_matches('/'));
        let body = ChatCompletionRequest {
            model: &endpoint.model,
            messages: &messages,
            stream: true,
        };

        let mut req = self.http.post(&url).json(&body).timeout(timeout);
        if let Some(key) = &endpoint.api_key {
            req = req.bearer_auth(key);
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                let err = if e.is_timeout() {
                    CouncilError::Timeout(timeout.as_secs())
                } else {
                    CouncilError::BackendUnreachable(e.to_string())
                };
                let _ = tx.send(StreamChunk::Error(err)).await;
                return;
            }
        };

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            let _ = tx
                .send(StreamChunk::Error(CouncilError::ModelNotLoaded(
                    endpoint.model.clone(),
                )))
                .await;
            return;
        }
        if !resp.status().is_success() {
            let _ = tx
                .send(StreamChunk::Error(CouncilError::ProtocolError(format!(
                    "backend returned {}",
                    resp.status()
                ))))
                .await;
            return;
        }

        let mut decoder = SseDecoder::new();
        let mut content = String::new();
        let mut thinking = String::new();
        let mut saw_done = false;
        let mut think_router = ThinkTagRouter::new();
        let mut byte_stream = resp.bytes_stream();

        while let Some(next) = byte_stream.next().await {
            let chunk = match next {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx
                        .send(StreamChunk::Error(CouncilError::ProtocolError(e.to_string())))
                        .await;
                    return;
                }
            };

            for frame in decoder.feed(&chunk) {
                if !self
                    .handle_frame(frame, &mut content, &mut thinking, &tx, &mut saw_done, &mut think_router)
                    .await
                {
                    return;
                }
            }
            if saw_done {
                break;
            }
        }

        if !saw_done {
            for frame in decoder.finish() {
                if !self
                    .handle_frame(frame, &mut content, &mut thinking, &tx, &mut saw_done, &mut think_router)
                    .await
                {
                    return;
                }
            }
        }

        if !saw_done {
            if content.is_empty() {
                let _ = tx
                    .send(StreamChunk::Error(CouncilError::ProtocolError(
                        "stream closed without content".to_string(),
                    )))
                    .await;
            } else {
                let _ = tx
                    .send(StreamChunk::Done {
                        content,
                        thinking: (!thinking.is_empty()).then_some(thinking),
                    })
                    .await;
            }
        }
    }

    /// Returns `false` if the receiver hung up and the caller should stop
    /// pumping the stream.
    async fn handle_frame(
        &self,
        frame: SseFrame,
        content: &mut String,
        thinking: &mut String,
        tx: &mpsc::Sender<StreamChunk>,
        saw_done: &mut bool,
        think_router: &mut ThinkTagRouter,
    ) -> bool {
        match frame {
            SseFrame::Done => {
                *saw_done = true;
                tx.send(StreamChunk::Done {
                    content: content.clone(),
                    thinking: (!thinking.is_empty()).then(|| thinking.clone()),
                })
                .await
                .is_ok()
            }
            SseFrame::Data(payload) => {
                let parsed: Result<ChatStreamChunk, _> = serde_json::from_str(&payload);
                let Ok(parsed) = parsed else {
                    // Malformed frame on the wire: tolerate and continue,
                    // matching the backend's own occasional keep-alive noise.
                    return true;
                };
                let Some(choice) = parsed.choices.into_iter().next() else {
                    return true;
                };
                let has_structured_reasoning = choice.delta.reasoning_content.is_some();
                if let Some(delta) = choice.delta.reasoning_content {
                    if !delta.is_empty() {
                        thinking.push_str(&delta);
                        if tx.send(StreamChunk::ThinkingDelta(delta)).await.is_err() {
                            return false;
                        }
                    }
                }
                if let Some(delta) = choice.delta.content {
                    if delta.is_empty() {
                        return true;
                    }
                    // Providers without a structured reasoning field may
                    // still emit <think>...</think>-delimited reasoning
                    // inline in `content`; route it through the tag scanner
                    // rather than trusting the field split alone.
                    let (content_part, thinking_part) = if has_structured_reasoning {
                        (delta, String::new())
                    } else {
                        think_router.feed(&delta)
                    };
                    if !thinking_part.is_empty() {
                        thinking.push_str(&thinking_part);
                        if tx.send(StreamChunk::ThinkingDelta(thinking_part)).await.is_err() {
                            return false;
                        }
                    }
                    if !content_part.is_empty() {
                        content.push_str(&content_part);
                        if tx.send(StreamChunk::ContentDelta(content_part)).await.is_err() {
                            return false;
                        }
                    }
                }
                true
            }
        }
    }

    /// Fetch `/v1/models` for startup validation (C13).
    pub async fn list_models(&self, base_url: &str, api_key: Option<&str>) -> CouncilResult<Vec<String>> {
        let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
        let mut req = self.http.get(&url);
        if let Some(key) = api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CouncilError::BackendUnreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CouncilError::BackendUnreachable(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }
        #[derive(Deserialize)]
        struct ModelsResponse {
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }
        let parsed: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| CouncilError::ProtocolError(e.to_string()))?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }
}

impl Default for ModelClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_constructors() {
        let m = ChatMessage::user("hi");
        assert_eq!(m.role, "user");
        assert_eq!(m.content, "hi");
    }

    #[test]
    fn test_split_think_tags_whole_response() {
        let (content, thinking) = split_think_tags("<think>reasoning here</think>final answer");
        assert_eq!(content, "final answer");
        assert_eq!(thinking.as_deref(), Some("reasoning here"));
    }

    #[test]
    fn test_split_think_tags_no_tags() {
        let (content, thinking) = split_think_tags("plain answer, no tags");
        assert_eq!(content, "plain answer, no tags");
        assert!(thinking.is_none());
    }

    #[test]
    fn test_think_tag_router_single_chunk() {
        let mut router = ThinkTagRouter::new();
        let (content, thinking) = router.feed("<think>hmm</think>answer");
        assert_eq!(content, "answer");
        assert_eq!(thinking, "hmm");
    }

    #[test]
    fn test_think_tag_router_tag_split_across_deltas() {
        let mut router = ThinkTagRouter::new();
        let (c1, t1) = router.feed("before <thi");
        let (c2, t2) = router.feed("nk>reasoning</thi");
        let (c3, t3) = router.feed("nk>after");
        assert_eq!(format!("{c1}{c2}{c3}"), "before after");
        assert_eq!(format!("{t1}{t2}{t3}"), "reasoning");
    }

    #[test]
    fn test_think_tag_router_passthrough_when_no_tags() {
        let mut router = ThinkTagRouter::new();
        let (content, thinking) = router.feed("just plain streaming text");
        assert_eq!(content, "just plain streaming text");
        assert!(thinking.is_empty());
    }
}
