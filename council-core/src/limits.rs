//! Shared limits and thresholds
//!
//! Centralized constants to prevent drift between the deliberation
//! controller, stage runner, and title service.

/// Minimum council responses required for a Stage 1 fan-out to continue
/// (below this the request fails with `InsufficientCouncil`).
pub const MIN_COUNCIL_RESPONSES: usize = 2;

/// Default number of Stage 2 peer-review rounds when not configured.
pub const DEFAULT_ROUNDS: u32 = 1;

/// Hard cap on Stage 2 rounds, regardless of configuration.
pub const MAX_ROUNDS_CAP: u32 = 10;

/// Default quality threshold (out of 5) below which refinement triggers.
pub const DEFAULT_QUALITY_THRESHOLD: f32 = 1.5;

/// Maximum possible quality rating a ranker can assign.
pub const MAX_QUALITY_SCORE: f32 = 5.0;

/// Default per-call deadline for Stage 1/2 model calls.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 120;

/// Default per-call deadline for the Stage 3 synthesis call (longer: the
/// chairman sees every draft plus peer feedback).
pub const DEFAULT_SYNTHESIS_TIMEOUT_SECS: u64 = 240;

/// Bounded capacity of the per-request event multiplexer channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bounded capacity of a single push-broker subscriber's queue before it
/// is considered lagging and dropped.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// Default concurrent title-generation workers.
pub const DEFAULT_TITLE_WORKERS: usize = 2;

/// Default max concurrent title jobs in flight.
pub const DEFAULT_TITLE_MAX_CONCURRENT: usize = 2;

/// Default title-generation per-job timeout.
pub const DEFAULT_TITLE_TIMEOUT_SECS: u64 = 30;

/// Default title-generation retry attempts before giving up.
pub const DEFAULT_TITLE_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for title-job retry backoff (doubled per attempt).
pub const TITLE_RETRY_BASE_DELAY_MS: u64 = 500;

/// Max characters kept from the triggering user message for the
/// placeholder-fallback title.
pub const TITLE_FALLBACK_MAX_CHARS: usize = 40;

/// Max words accepted in a generated title before it is considered malformed.
pub const TITLE_MAX_WORDS: usize = 5;

/// HTTP timeout for model-backend calls that aren't part of a stream
/// (e.g. `/v1/models` startup validation).
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Excerpt head size (chars), reused for trimming long draft/ranking text
/// before it goes into structured logs.
pub const EXCERPT_HEAD_CHARS: usize = 1200;

/// Excerpt tail size (chars).
pub const EXCERPT_TAIL_CHARS: usize = 800;
