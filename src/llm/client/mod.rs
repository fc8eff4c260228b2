//! LLM client for analysis planning.
//!
//! Supports the OpenAI chat completions API and Google's Gemini
//! generateContent API.

mod config;
pub mod prompts;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use config::{LlmConfig, LlmProvider};

/// Completion backend used by the analyst service.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Provider answering the prompts.
    fn provider(&self) -> LlmProvider;

    /// Send a single-turn prompt and return the model's text reply.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// HTTP client for a hosted LLM provider.
pub struct LlmClient {
    config: LlmConfig,
    client: Client,
}

/// OpenAI chat completions request format.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Gemini generateContent request format.
#[derive(Debug, Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

impl LlmClient {
    /// Create a new LLM client with the given configuration.
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn api_key(&self) -> Result<&str, LlmError> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(LlmError::MissingApiKey(self.config.provider))
    }

    /// Call the OpenAI chat completions API.
    async fn call_openai(&self, prompt: &str) -> Result<String, LlmError> {
        let api_key = self.api_key()?;
        let request = ChatRequest {
            model: self.config.model(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let url = format!("{}/v1/chat/completions", self.config.endpoint());
        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(LlmError::Empty)
    }

    /// Call the Gemini generateContent API.
    async fn call_gemini(&self, prompt: &str) -> Result<String, LlmError> {
        let api_key = self.api_key()?;
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_tokens,
            },
        };

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.endpoint(),
            self.config.model()
        );
        let resp = self
            .client
            .post(&url)
            .query(&[("key", api_key)])
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let gemini: GeminiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let text: String = gemini
            .candidates
            .and_then(|c| c.into_iter().next())
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(text)
    }
}

#[async_trait]
impl LlmBackend for LlmClient {
    fn provider(&self) -> LlmProvider {
        self.config.provider
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        debug!(
            provider = %self.config.provider,
            model = self.config.model(),
            prompt_chars = prompt.len(),
            "Requesting completion"
        );
        match self.config.provider {
            LlmProvider::OpenAI => self.call_openai(prompt).await,
            LlmProvider::Gemini => self.call_gemini(prompt).await,
        }
    }
}

/// Scripted backend that replays canned replies in order.
///
/// Used by tests and for exercising the service without network access.
#[derive(Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply.
    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        self.push(Ok(reply.into()));
        self
    }

    /// Queue a failure.
    pub fn with_error(self, error: LlmError) -> Self {
        self.push(Err(error));
        self
    }

    fn push(&self, reply: Result<String, LlmError>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmBackend for MockLlmClient {
    fn provider(&self) -> LlmProvider {
        LlmProvider::OpenAI
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or(Err(LlmError::Empty))
    }
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Failed to connect to LLM service
    #[error("Connection error: {0}")]
    Connection(String),
    /// API returned an error status
    #[error("API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },
    /// Failed to parse response
    #[error("Parse error: {0}")]
    Parse(String),
    /// Response contained no text
    #[error("LLM returned an empty response")]
    Empty,
    /// No API key configured for the provider
    #[error("No API key configured for provider {0}")]
    MissingApiKey(LlmProvider),
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_openai_request_shape() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer sk-test")
                    .json_body_partial(r#"{"model": "gpt-4o-mini", "max_tokens": 1500}"#);
                then.status(200).json_body(json!({
                    "choices": [{"message": {"role": "assistant", "content": "{\"steps\": []}"}}]
                }));
            })
            .await;

        let config = LlmConfig::default()
            .with_endpoint(&server.base_url())
            .with_api_key("sk-test")
            .with_model("gpt-4o-mini");
        let client = LlmClient::new(config).unwrap();
        let reply = client.complete("plan this").await.unwrap();

        assert_eq!(reply, "{\"steps\": []}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_gemini_joins_parts() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1beta/models/gemini-1.5-pro:generateContent")
                    .query_param("key", "g-key");
                then.status(200).json_body(json!({
                    "candidates": [{"content": {"parts": [{"text": "{\"a\":"}, {"text": " 1}"}]}}]
                }));
            })
            .await;

        let config = LlmConfig {
            provider: LlmProvider::Gemini,
            ..LlmConfig::default()
        }
        .with_endpoint(&server.base_url())
        .with_api_key("g-key");
        let client = LlmClient::new(config).unwrap();

        assert_eq!(client.complete("x").await.unwrap(), "{\"a\": 1}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(429).body("rate limited");
            })
            .await;

        let config = LlmConfig::default()
            .with_endpoint(&server.base_url())
            .with_api_key("sk-test");
        let client = LlmClient::new(config).unwrap();

        match client.complete("x").await {
            Err(LlmError::Api { status, body }) => {
                assert_eq!(status, 429);
                assert_eq!(body, "rate limited");
            }
            other => panic!("expected API error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_key() {
        let client = LlmClient::new(LlmConfig::default()).unwrap();
        assert!(matches!(
            client.complete("x").await,
            Err(LlmError::MissingApiKey(LlmProvider::OpenAI))
        ));
    }

    #[tokio::test]
    async fn test_mock_replays_in_order() {
        let mock = MockLlmClient::new()
            .with_reply("first")
            .with_error(LlmError::Empty);
        assert_eq!(mock.complete("a").await.unwrap(), "first");
        assert!(mock.complete("b").await.is_err());
        assert_eq!(mock.prompts(), vec!["a", "b"]);
    }
}
