//! Language-model and embedding providers.
//!
//! Everything a model returns is treated as untrusted input: callers parse it with
//! [`parse_json`] and then run it through their own validation, which yields a
//! [`Validated`] value with an explicit fallback branch.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::LlmConfig;
use crate::metrics::track_llm_operation;
use crate::utils::retry::{retry_async_if, RetryConfig};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM provider is not configured")]
    NotConfigured,

    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Malformed LLM output: {0}")]
    Malformed(String),

    #[error("Embedding count mismatch: requested {expected}, received {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("LLM transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl LlmError {
    /// Rate limits, server errors, timeouts and connection failures are worth repeating.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout(_) | LlmError::Transport(_) => true,
            LlmError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Outcome of validating untrusted model output.
#[derive(Debug, Clone, PartialEq)]
pub enum Validated<T> {
    Valid(T),
    Invalid(String),
}

impl<T> Validated<T> {
    pub fn into_result(self) -> Result<T, String> {
        match self {
            Validated::Valid(value) => Ok(value),
            Validated::Invalid(reason) => Err(reason),
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Returns the raw text of a strict-JSON completion.
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Same order and same length as `texts`, or an error.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}

/// Stand-in used when no API key is configured.
pub struct DisabledProvider;

#[async_trait]
impl LlmProvider for DisabledProvider {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
        Err(LlmError::NotConfigured)
    }
}

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        Err(LlmError::NotConfigured)
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI-compatible HTTP client for chat completions and embeddings.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: String,
    timeout: Duration,
    batch_size: usize,
}

impl OpenAiClient {
    pub fn from_config(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.api_key is not set"))?;
        let timeout = Duration::from_millis(config.timeout_ms);
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            timeout,
            batch_size: config.embedding_batch_size.max(1),
        })
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, LlmError> {
        let request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send();

        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| LlmError::Timeout(self.timeout))??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": batch,
        });
        let response: EmbeddingResponse = self.post_json("/embeddings", &body).await?;
        assemble_batch(batch.len(), response)
    }
}

fn assemble_batch(expected: usize, response: EmbeddingResponse) -> Result<Vec<Vec<f32>>, LlmError> {
    let mut data = response.data;
    if data.len() != expected {
        return Err(LlmError::CountMismatch {
            expected,
            actual: data.len(),
        });
    }
    data.sort_by_key(|datum| datum.index);
    Ok(data.into_iter().map(|datum| datum.embedding).collect())
}

#[async_trait]
impl LlmProvider for OpenAiClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.4,
            "response_format": { "type": "json_object" },
            "messages": [
                ChatMessage { role: "system", content: system_prompt },
                ChatMessage { role: "user", content: user_prompt },
            ],
        });

        let response: ChatResponse =
            track_llm_operation("complete", self.post_json("/chat/completions", &body)).await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| LlmError::Malformed("completion has no content".to_string()))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let embedded = track_llm_operation(
                "embed",
                retry_async_if(
                    RetryConfig::provider(),
                    || self.embed_batch(batch),
                    LlmError::is_retryable,
                ),
            )
            .await?;
            vectors.extend(embedded);
        }

        if vectors.len() != texts.len() {
            return Err(LlmError::CountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            });
        }
        Ok(vectors)
    }
}

/// Builds the provider pair for this process.
pub fn build_providers(
    config: &LlmConfig,
) -> anyhow::Result<(Arc<dyn LlmProvider>, Arc<dyn EmbeddingProvider>)> {
    if !config.is_configured() {
        tracing::warn!("LLM API key not set; selection and generation use deterministic fallbacks");
        return Ok((Arc::new(DisabledProvider), Arc::new(DisabledProvider)));
    }
    let client = Arc::new(OpenAiClient::from_config(config)?);
    tracing::info!("LLM provider configured: model={}", config.model);
    Ok((client.clone(), client))
}

/// Embeds one text and returns its vector, or `None` on any provider failure.
pub async fn embed_one(provider: &dyn EmbeddingProvider, text: &str) -> Option<Vec<f32>> {
    match provider.embed(&[text.to_string()]).await {
        Ok(mut vectors) => vectors.pop(),
        Err(LlmError::NotConfigured) => None,
        Err(e) => {
            tracing::warn!("Embedding failed: {}", e);
            None
        }
    }
}

/// Strips markdown fences and surrounding prose, leaving the outermost JSON object.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

pub fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T, LlmError> {
    let body = extract_json_object(raw)
        .ok_or_else(|| LlmError::Malformed("no JSON object in output".to_string()))?;
    serde_json::from_str(body).map_err(|e| LlmError::Malformed(e.to_string()))
}
