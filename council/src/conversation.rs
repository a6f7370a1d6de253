//! Data model: conversations, messages, and the embedded deliberation trace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Literal legacy placeholder title, predating the `Conversation <id8>` form.
pub const LEGACY_PLACEHOLDER_TITLE: &str = "New Conversation";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        Self {
            title: placeholder_title(&id),
            id,
            created_at: Utc::now(),
            deleted: false,
            deleted_at: None,
            messages: Vec::new(),
        }
    }

    pub fn soft_delete(&mut self) {
        if !self.deleted {
            self.deleted = true;
            self.deleted_at = Some(Utc::now());
        }
    }

    pub fn restore(&mut self) {
        self.deleted = false;
        self.deleted_at = None;
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// The placeholder title form: `Conversation <first 8 hex chars of id>`.
pub fn placeholder_title(id: &Uuid) -> String {
    let hex = id.simple().to_string();
    format!("Conversation {}", &hex[..8])
}

/// True iff `title` matches the placeholder pattern (fresh or legacy form).
/// See P9: `Conversation <8 lowercase hex chars>` or the legacy literal.
pub fn is_generic_title(title: &str) -> bool {
    if title == LEGACY_PLACEHOLDER_TITLE {
        return true;
    }
    let Some(suffix) = title.strip_prefix("Conversation ") else {
        return false;
    };
    suffix.len() == 8 && suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliberation: Option<DeliberationRecord>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            created_at: Utc::now(),
            deliberation: None,
        }
    }

    pub fn assistant(content: impl Into<String>, deliberation: DeliberationRecord) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            created_at: Utc::now(),
            deliberation: Some(deliberation),
        }
    }
}

/// A single council model's Stage-1 draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub model: String,
    pub content: String,
    pub thinking: Option<String>,
    pub elapsed_seconds: f64,
    pub error: Option<String>,
}

/// One ranker's parsed output for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingEntry {
    pub ranker_model: String,
    pub raw_text: String,
    pub ordering: Vec<crate::ranking::RankedLabel>,
    pub elapsed_seconds: f64,
    pub warnings: Vec<String>,
}

/// Aggregate ranking for a single round, after de-anonymization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRanking {
    pub ordering: Vec<String>,
    pub mean_position: std::collections::HashMap<String, f64>,
    pub mean_quality: std::collections::HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementEntry {
    pub model: String,
    pub content: String,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage2Round {
    pub round: u32,
    pub rankings: Vec<RankingEntry>,
    pub aggregate: AggregateRanking,
    pub refinement_triggered: bool,
    pub refinements: Vec<RefinementEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synthesis {
    pub content: String,
    pub thinking: Option<String>,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationRecord {
    pub drafts: Vec<Draft>,
    pub rounds: Vec<Stage2Round>,
    pub synthesis: Synthesis,
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_title_is_generic() {
        let c = Conversation::new();
        assert!(is_generic_title(&c.title));
    }

    #[test]
    fn test_legacy_placeholder_is_generic() {
        assert!(is_generic_title("New Conversation"));
    }

    #[test]
    fn test_generated_title_not_generic() {
        assert!(!is_generic_title("Docker rootless install guide"));
    }

    #[test]
    fn test_uppercase_hex_not_generic() {
        // P9 requires lowercase hex specifically.
        assert!(!is_generic_title("Conversation ABCD1234"));
    }

    #[test]
    fn test_soft_delete_restore_roundtrip() {
        let mut c = Conversation::new();
        c.soft_delete();
        assert!(c.deleted);
        assert!(c.deleted_at.is_some());
        c.soft_delete(); // idempotent (P8)
        let first_deleted_at = c.deleted_at;
        c.soft_delete();
        assert_eq!(c.deleted_at, first_deleted_at);
        c.restore();
        assert!(!c.deleted);
        assert!(c.deleted_at.is_none());
    }
}
