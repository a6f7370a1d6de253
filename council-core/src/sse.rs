//! Server-sent-event frame decoding for streaming chat-completion responses.
//!
//! Model backends speak `text/event-stream`: each frame is `data: {json}\n\n`,
//! terminated by the literal frame `data: [DONE]`. Bytes arrive from the HTTP
//! body in arbitrary chunk boundaries, so frames must be buffered and split
//! on blank lines rather than assumed to align with chunk edges.

use bytes::Bytes;

/// A single decoded SSE frame, already stripped of the `data: ` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A JSON payload frame, still serialized (caller deserializes into its
    /// own chunk type).
    Data(String),
    /// The terminal `[DONE]` marker.
    Done,
}

/// Incremental decoder: feed raw byte chunks as they arrive, drain complete
/// frames after each feed. Buffers partial frames across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    /// Feed a raw chunk of bytes from the response body and return any
    /// complete frames found. Lone `\r` are tolerated (stripped per-line).
    pub fn feed(&mut self, chunk: &Bytes) -> Vec<SseFrame> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        self.drain_complete_frames()
    }

    fn drain_complete_frames(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();

        // Frames are separated by a blank line. Keep the trailing partial
        // segment (if any) buffered for the next feed.
        while let Some(pos) = self.buf.find("\n\n") {
            let raw_frame: String = self.buf.drain(..pos + 2).collect();
            for line in raw_frame.lines() {
                let line = line.trim_end_matches('\r');
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload == "[DONE]" {
                    frames.push(SseFrame::Done);
                } else if !payload.is_empty() {
                    frames.push(SseFrame::Data(payload.to_string()));
                }
            }
        }

        frames
    }

    /// Flush whatever remains in the buffer as a final frame, for backends
    /// that close the stream without a trailing blank line. Returns an
    /// empty vec if nothing usable remains.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.buf.trim().is_empty() {
            self.buf.clear();
            return Vec::new();
        }
        let raw_frame = std::mem::take(&mut self.buf);
        let mut frames = Vec::new();
        for line in raw_frame.lines() {
            let line = line.trim_end_matches('\r');
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                frames.push(SseFrame::Done);
            } else if !payload.is_empty() {
                frames.push(SseFrame::Data(payload.to_string()));
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame() {
        let mut dec = SseDecoder::new();
        let frames = dec.feed(&Bytes::from("data: {\"a\":1}\n\n"));
        assert_eq!(frames, vec![SseFrame::Data("{\"a\":1}".to_string())]);
    }

    #[test]
    fn test_done_marker() {
        let mut dec = SseDecoder::new();
        let frames = dec.feed(&Bytes::from("data: [DONE]\n\n"));
        assert_eq!(frames, vec![SseFrame::Done]);
    }

    #[test]
    fn test_split_across_chunks() {
        let mut dec = SseDecoder::new();
        let mut frames = dec.feed(&Bytes::from("data: {\"a\""));
        assert!(frames.is_empty());
        frames = dec.feed(&Bytes::from(":1}\n\n"));
        assert_eq!(frames, vec![SseFrame::Data("{\"a\":1}".to_string())]);
    }

    #[test]
    fn test_multiple_frames_one_chunk() {
        let mut dec = SseDecoder::new();
        let frames = dec.feed(&Bytes::from("data: {\"a\":1}\n\ndata: {\"a\":2}\n\n"));
        assert_eq!(
            frames,
            vec![
                SseFrame::Data("{\"a\":1}".to_string()),
                SseFrame::Data("{\"a\":2}".to_string()),
            ]
        );
    }

    #[test]
    fn test_crlf_tolerated() {
        let mut dec = SseDecoder::new();
        let frames = dec.feed(&Bytes::from("data: {\"a\":1}\r\n\r\n"));
        assert_eq!(frames, vec![SseFrame::Data("{\"a\":1}".to_string())]);
    }

    #[test]
    fn test_finish_without_trailing_blank_line() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed(&Bytes::from("data: {\"partial\":true}")).is_empty());
        let frames = dec.finish();
        assert_eq!(
            frames,
            vec![SseFrame::Data("{\"partial\":true}".to_string())]
        );
    }

    #[test]
    fn test_empty_lines_ignored() {
        let mut dec = SseDecoder::new();
        let frames = dec.feed(&Bytes::from("\n\ndata: {\"a\":1}\n\n"));
        assert_eq!(frames, vec![SseFrame::Data("{\"a\":1}".to_string())]);
    }
}
