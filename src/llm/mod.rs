//! LLM backend abstraction
//!
//! The pipeline only needs four operations from the remote service: chat
//! completions plus thread-based message storage. Everything is behind a
//! trait so tests can substitute an in-memory fake.

pub mod http;

use crate::error::Result;
use crate::models::{MessageContent, MessageRole};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::{HttpLlmClient, HttpLlmConfig};

/// Listing order for thread messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrder {
    Ascending,
    Descending,
}

impl MessageOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageOrder::Ascending => "asc",
            MessageOrder::Descending => "desc",
        }
    }
}

/// Parameters for a chat completion call
#[derive(Debug, Clone)]
pub struct ChatCompletionParams {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_output_tokens: usize,
}

/// A message as stored by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub role: MessageRole,
    pub content: MessageContent,
}

/// The remote LLM service: completions plus thread storage.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Run a chat completion and return the generated text.
    async fn create_chat_completion(&self, params: &ChatCompletionParams) -> Result<String>;

    /// Create a new empty thread and return its id.
    async fn create_thread(&self) -> Result<String>;

    /// List messages of a thread in the given order.
    async fn list_messages(
        &self,
        thread_id: &str,
        limit: Option<usize>,
        order: MessageOrder,
    ) -> Result<Vec<ThreadMessage>>;

    /// Append a message to a thread.
    async fn append_message(&self, thread_id: &str, role: MessageRole, text: &str) -> Result<()>;
}
