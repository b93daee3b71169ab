//! Data models for conversation threads

use serde::{Deserialize, Serialize};

/// Role of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

/// A single part of a multi-part message body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Message content as delivered by the backend.
///
/// Backends are inconsistent about the shape of message bodies: some return a
/// plain string, some an array of typed parts, some an object wrapping the
/// text. Extraction is total; anything unrecognized yields empty text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    Nested { text: String },
}

impl MessageContent {
    /// Extract plain text from any supported content shape.
    pub fn extract_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
            MessageContent::Nested { text } => text.clone(),
        }
    }
}

/// A counted conversation message.
///
/// Immutable once counted; `token_count` is derived from the content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub token_count: usize,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            token_count: 0,
        }
    }

    pub fn with_token_count(mut self, token_count: usize) -> Self {
        self.token_count = token_count;
        self
    }
}

/// Transient per-turn analysis of a thread; never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadAnalysis {
    pub total_tokens: usize,
    pub message_count: usize,
    pub exceeds_hard_cap: bool,
    pub needs_optimization: bool,
}

impl ThreadAnalysis {
    /// Analyze counted messages against the live budget and hard cap.
    ///
    /// Optimization is only flagged when usage exceeds the live budget AND
    /// the thread has at least `min_messages` messages; short threads are
    /// never worth summarizing.
    pub fn of(
        messages: &[Message],
        live_budget: usize,
        hard_cap: usize,
        min_messages: usize,
    ) -> Self {
        let total_tokens: usize = messages.iter().map(|m| m.token_count).sum();
        let message_count = messages.len();

        Self {
            total_tokens,
            message_count,
            exceeds_hard_cap: total_tokens > hard_cap,
            needs_optimization: total_tokens > live_budget && message_count >= min_messages,
        }
    }
}
