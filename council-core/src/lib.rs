//! Council Core - Shared utilities for the deliberation orchestrator
//!
//! Used by the `council` binary crate:
//!
//! - **sse**: Server-sent-event frame decoding for streaming chat completions
//! - **limits**: Shared constants and thresholds
//! - **excerpts** (feature): Text excerpting and UTF-8 helpers
//!
//! # Feature Flags
//!
//! - `excerpts` - Text excerpting and UTF-8 helpers (lightweight, on by default)

pub mod limits;
pub mod sse;

#[cfg(feature = "excerpts")]
pub mod excerpts;

pub use limits::*;
pub use sse::{SseDecoder, SseFrame};

#[cfg(feature = "excerpts")]
pub use excerpts::{create_excerpt, safe_utf8_slice};
