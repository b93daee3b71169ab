//! OpenAI-compatible HTTP backend client

use super::{ChatCompletionParams, LlmBackend, MessageOrder, ThreadMessage};
use crate::error::{ContextError, Result};
use crate::models::MessageRole;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpLlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpLlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// LLM backend over an OpenAI-compatible HTTP API.
///
/// The client does no retrying of its own; failure policy lives in the
/// circuit breakers at the call sites.
pub struct HttpLlmClient {
    client: Client,
    config: HttpLlmConfig,
}

impl HttpLlmClient {
    pub fn new(config: HttpLlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ContextError::Configuration(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ContextError::Backend(format!("HTTP {}: {}", status, body)))
    }
}

#[async_trait]
impl LlmBackend for HttpLlmClient {
    async fn create_chat_completion(&self, params: &ChatCompletionParams) -> Result<String> {
        debug!(model = %params.model, "Requesting chat completion");

        let request = ChatCompletionRequest {
            model: params.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: params.system_prompt.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: params.user_prompt.clone(),
                },
            ],
            max_tokens: Some(params.max_output_tokens),
            temperature: Some(params.temperature),
        };

        let response = self
            .authorized(self.client.post(self.url("/v1/chat/completions")))
            .json(&request)
            .send()
            .await
            .map_err(|e| ContextError::Network(e.to_string()))?;

        let response = Self::check_status(response).await?;
        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ContextError::Backend(format!("Failed to parse response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ContextError::Backend("No choices in response".to_string()))
    }

    async fn create_thread(&self) -> Result<String> {
        let response = self
            .authorized(self.client.post(self.url("/v1/threads")))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| ContextError::Network(e.to_string()))?;

        let response = Self::check_status(response).await?;
        let parsed: ThreadResponse = response
            .json()
            .await
            .map_err(|e| ContextError::Backend(format!("Failed to parse response: {}", e)))?;

        debug!(thread_id = %parsed.id, "Created thread");
        Ok(parsed.id)
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        limit: Option<usize>,
        order: MessageOrder,
    ) -> Result<Vec<ThreadMessage>> {
        let mut request = self
            .client
            .get(self.url(&format!("/v1/threads/{}/messages", thread_id)))
            .query(&[("order", order.as_str())]);
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit.to_string())]);
        }

        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| ContextError::Network(e.to_string()))?;

        let response = Self::check_status(response).await?;
        let parsed: MessageListResponse = response
            .json()
            .await
            .map_err(|e| ContextError::Backend(format!("Failed to parse response: {}", e)))?;

        Ok(parsed.data)
    }

    async fn append_message(&self, thread_id: &str, role: MessageRole, text: &str) -> Result<()> {
        let request = AppendMessageRequest {
            role: role.as_str().to_string(),
            content: text.to_string(),
        };

        let response = self
            .authorized(
                self.client
                    .post(self.url(&format!("/v1/threads/{}/messages", thread_id))),
            )
            .json(&request)
            .send()
            .await
            .map_err(|e| ContextError::Network(e.to_string()))?;

        Self::check_status(response).await?;
        Ok(())
    }
}

// OpenAI-compatible wire types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Serialize)]
struct AppendMessageRequest {
    role: String,
    content: String,
}
