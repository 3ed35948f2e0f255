use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Conversation messages
// =============================================================================

/// Author of a chat message sent to the completion backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat-completion message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// =============================================================================
// Search references
// =============================================================================

/// A ranked search result normalized for citation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// 1-based relevance rank; `[citation:N]` refers to this.
    pub position: usize,
    pub url: String,
    pub title: String,
    pub snippet: String,
}

// =============================================================================
// Audit trail
// =============================================================================

/// One executed pipeline stage, recorded for diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    /// Result fields the stage produced.
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

// =============================================================================
// Turns and answers
// =============================================================================

/// The outcome of one pipeline invocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Raw answer text, including literal `[citation:N]` markers.
    pub answer: String,
    pub topic: String,
    pub language: String,
    pub thought: String,
    pub keyphrases: String,
    pub references: Vec<Reference>,
    pub stages: Vec<Stage>,
}

/// A completed exchange kept in conversation history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub inquiry: String,
    pub answer: String,
    pub topic: String,
    pub thought: String,
    pub keyphrases: String,
    pub language: String,
    pub references: Vec<Reference>,
    pub duration_ms: u64,
    pub stages: Vec<Stage>,
}

impl Turn {
    /// Build a history entry from an inquiry and its answer.
    pub fn new(inquiry: impl Into<String>, answer: Answer, duration_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            inquiry: inquiry.into(),
            answer: answer.answer,
            topic: answer.topic,
            thought: answer.thought,
            keyphrases: answer.keyphrases,
            language: answer.language,
            references: answer.references,
            duration_ms,
            stages: answer.stages,
        }
    }
}
