//! Client for the OpenAI-compatible embeddings and chat completion API.
//!
//! Handlers and services depend on the [`LlmProvider`] trait so the provider
//! can be swapped (or faked in tests). [`OpenAiClient`] is the production
//! implementation:
//! - `POST {base}/embeddings` in batches, results reordered by `index`
//! - `POST {base}/chat/completions` in JSON-object mode
//! - 429 and 5xx responses are retried with exponential backoff

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Inputs per embeddings request
const EMBED_BATCH_SIZE: usize = 96;

/// Characters of an error body kept for logs
const ERROR_BODY_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider request timed out")]
    Timeout,

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid provider response: {0}")]
    Decode(String),
}

impl LlmError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// A single JSON-mode chat completion
#[derive(Debug, Clone, Default)]
pub struct ChatJsonRequest {
    pub system: String,
    pub user: String,
    pub temperature: Option<f32>,
    pub max_completion_tokens: Option<u32>,
    /// Overrides the client-wide timeout
    pub timeout: Option<Duration>,
    pub request_id: Option<String>,
}

impl ChatJsonRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Embed `texts`, returning one vector per input in input order
    async fn embed(
        &self,
        texts: &[String],
        request_id: Option<&str>,
    ) -> Result<Vec<Vec<f32>>, LlmError>;

    /// Run a chat completion and return the raw message content
    async fn complete_json(&self, request: ChatJsonRequest) -> Result<String, LlmError>;

    async fn health_check(&self) -> Result<(), LlmError>;
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI API client
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    chat_model: String,
    embed_model: String,
    max_retry: Duration,
}

impl OpenAiClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        chat_model: &str,
        embed_model: &str,
        timeout_seconds: u64,
        max_retry_seconds: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        tracing::info!(base_url = base_url, chat_model, embed_model, "LLM client initialized");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            chat_model: chat_model.to_string(),
            embed_model: embed_model.to_string(),
            max_retry: Duration::from_secs(max_retry_seconds),
        })
    }

    /// POST a JSON body, retrying rate limits and server errors.
    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        timeout: Option<Duration>,
        request_id: Option<&str>,
    ) -> Result<serde_json::Value, LlmError> {
        let url = format!("{}{}", self.base_url, path);
        let url = url.as_str();
        let client = &self.client;
        let api_key = self.api_key.as_str();

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_elapsed_time(Some(self.max_retry))
            .build();

        debug!(url = %url, "LLM provider request");

        backoff::future::retry(policy, move || async move {
            let mut req = client.post(url).bearer_auth(api_key).json(body);
            if let Some(timeout) = timeout {
                req = req.timeout(timeout);
            }
            if let Some(rid) = request_id {
                req = req.header("x-request-id", rid);
            }

            let response = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    backoff::Error::permanent(LlmError::Timeout)
                } else {
                    warn!(error = %e, "LLM provider unreachable, retrying");
                    backoff::Error::transient(LlmError::Request(e.to_string()))
                }
            })?;

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|e| backoff::Error::permanent(LlmError::Decode(e.to_string())));
            }

            let text = response.text().await.unwrap_or_default();
            let err = LlmError::Status {
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_CHARS).collect(),
            };

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                warn!(status = %status, "LLM provider busy, retrying");
                Err(backoff::Error::transient(err))
            } else {
                Err(backoff::Error::permanent(err))
            }
        })
        .await
    }

    async fn embed_batch(
        &self,
        batch: &[String],
        request_id: Option<&str>,
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        let body = json!({
            "model": self.embed_model,
            "input": batch,
        });

        let raw = self
            .post_json("/embeddings", &body, None, request_id)
            .await?;
        let mut parsed: EmbeddingResponse =
            serde_json::from_value(raw).map_err(|e| LlmError::Decode(e.to_string()))?;

        if parsed.data.len() != batch.len() {
            return Err(LlmError::Decode(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                parsed.data.len()
            )));
        }

        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl LlmProvider for OpenAiClient {
    #[instrument(skip(self, texts), fields(count = texts.len()))]
    async fn embed(
        &self,
        texts: &[String],
        request_id: Option<&str>,
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            vectors.extend(self.embed_batch(batch, request_id).await?);
        }
        Ok(vectors)
    }

    #[instrument(skip(self, request), fields(model = %self.chat_model))]
    async fn complete_json(&self, request: ChatJsonRequest) -> Result<String, LlmError> {
        let mut body = json!({
            "model": self.chat_model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "response_format": { "type": "json_object" },
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_completion_tokens {
            body["max_completion_tokens"] = json!(max_tokens);
        }

        let raw = self
            .post_json(
                "/chat/completions",
                &body,
                request.timeout,
                request.request_id.as_deref(),
            )
            .await?;

        let parsed: CompletionResponse =
            serde_json::from_value(raw).map_err(|e| LlmError::Decode(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(content.trim().to_string())
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        let url = format!("{}/models", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(LlmError::Status {
                status: response.status().as_u16(),
                body: String::new(),
            })
        }
    }
}
