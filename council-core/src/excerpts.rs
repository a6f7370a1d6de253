//! UTF-8 safe text excerpting
//!
//! Used to cap the length of draft/ranking text going into structured logs,
//! and to build the placeholder-fallback conversation title from the raw
//! first user message.

use crate::limits::{EXCERPT_HEAD_CHARS, EXCERPT_TAIL_CHARS};

/// UTF-8 safe byte slicing - finds valid char boundaries.
/// Returns (slice, actual_start, actual_end) where boundaries are adjusted to valid UTF-8.
pub fn safe_utf8_slice(text: &str, start: usize, limit: usize) -> (String, usize, usize) {
    let bytes = text.as_bytes();
    let len = bytes.len();

    if start >= len {
        return (String::new(), len, len);
    }

    let mut actual_start = start.min(len);
    while actual_start < len && !text.is_char_boundary(actual_start) {
        actual_start += 1;
    }

    let mut actual_end = (actual_start + limit).min(len);
    while actual_end > actual_start && !text.is_char_boundary(actual_end) {
        actual_end -= 1;
    }

    let content = text[actual_start..actual_end].to_string();
    (content, actual_start, actual_end)
}

/// Create head+tail excerpt with UTF-8 safe slicing.
pub fn create_excerpt(content: &str, head_chars: usize, tail_chars: usize) -> String {
    let chars: Vec<char> = content.chars().collect();
    let total = chars.len();

    if total <= head_chars + tail_chars + 50 {
        return content.to_string();
    }

    let head: String = chars[..head_chars].iter().collect();
    let tail: String = chars[total - tail_chars..].iter().collect();

    format!(
        "{}\n\n…[truncated {} chars]…\n\n{}",
        head,
        total - head_chars - tail_chars,
        tail
    )
}

/// Truncate to at most `max_chars` characters at a char boundary, appending
/// an ellipsis if truncation occurred. Used for the title-fallback excerpt
/// (first ≤ 40 characters of the triggering user message).
pub fn truncate_with_ellipsis(content: &str, max_chars: usize) -> String {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= max_chars {
        return content.trim().to_string();
    }
    let head: String = chars[..max_chars].iter().collect();
    format!("{}…", head.trim_end())
}

/// Default-sized excerpt using the shared head/tail budget.
pub fn default_excerpt(content: &str) -> String {
    create_excerpt(content, EXCERPT_HEAD_CHARS, EXCERPT_TAIL_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_utf8_slice_basic() {
        let text = "hello world";
        let (slice, start, end) = safe_utf8_slice(text, 0, 5);
        assert_eq!(slice, "hello");
        assert_eq!(start, 0);
        assert_eq!(end, 5);
    }

    #[test]
    fn test_safe_utf8_slice_unicode() {
        let text = "héllo wörld";
        let (slice, _, _) = safe_utf8_slice(text, 0, 20);
        assert_eq!(slice, text);
    }

    #[test]
    fn test_safe_utf8_slice_mid_char() {
        let text = "héllo";
        let (slice, start, _) = safe_utf8_slice(text, 2, 10);
        assert!(text.is_char_boundary(start));
        assert!(!slice.contains("é"));
    }

    #[test]
    fn test_safe_utf8_slice_past_end() {
        let text = "short";
        let (slice, start, end) = safe_utf8_slice(text, 100, 50);
        assert_eq!(slice, "");
        assert_eq!(start, 5);
        assert_eq!(end, 5);
    }

    #[test]
    fn test_create_excerpt_short() {
        let short = "short content";
        assert_eq!(create_excerpt(short, 1200, 800), short);
    }

    #[test]
    fn test_create_excerpt_long() {
        let long = "a".repeat(5000);
        let excerpt = create_excerpt(&long, 100, 50);
        assert!(excerpt.contains("truncated"));
        assert!(excerpt.starts_with(&"a".repeat(100)));
        assert!(excerpt.ends_with(&"a".repeat(50)));
    }

    #[test]
    fn test_truncate_with_ellipsis_short() {
        assert_eq!(truncate_with_ellipsis("hello", 40), "hello");
    }

    #[test]
    fn test_truncate_with_ellipsis_long() {
        let msg = "How do I install docker on ubuntu server 22.04 with rootless mode enabled?";
        let truncated = truncate_with_ellipsis(msg, 40);
        assert!(truncated.ends_with('…'));
        assert!(truncated.chars().count() <= 41);
    }

    #[test]
    fn test_truncate_with_ellipsis_unicode_boundary() {
        let msg = "héllo wörld, this is a longer message with accents";
        let truncated = truncate_with_ellipsis(msg, 10);
        assert!(truncated.ends_with('…'));
    }
}
