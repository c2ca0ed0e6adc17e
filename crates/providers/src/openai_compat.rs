//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenRouter, OpenAI, Ollama, vLLM and any endpoint exposing
//! `/chat/completions` and `/embeddings`.
//!
//! Supports:
//! - Chat completions (non-streaming) with optional `citations`
//! - Batched embeddings (one vector per input, in input order)
//! - Model listing and health checks
//!
//! A single call is made per `complete`; retries and backoff belong to
//! [`crate::GenerationClient`].

use async_trait::async_trait;
use nestling_config::ProviderConfig;
use nestling_core::embedding::Embedder;
use nestling_core::error::{IndexError, ProviderError};
use nestling_core::message::Message;
use nestling_core::provider::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Retry hint used when a 429 carries no `Retry-After` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// An OpenAI-compatible LLM and embedding provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    embedding_model: String,
    embedding_batch_size: usize,
    http_referer: Option<String>,
    app_title: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        // Request timeouts are owned by the caller's deadline; this is only a backstop.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            embedding_model: "openai/text-embedding-3-small".into(),
            embedding_batch_size: 20,
            http_referer: None,
            app_title: None,
            client,
        }
    }

    /// Create an OpenRouter provider (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    /// Build from the `[provider]` config section.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            ProviderError::NotConfigured(
                "no API key (set provider.api_key, NESTLING_API_KEY or OPENROUTER_API_KEY)".into(),
            )
        })?;
        let name = if config.base_url.contains("openrouter.ai") {
            "openrouter"
        } else {
            "openai-compat"
        };
        let mut provider = Self::new(name, config.base_url.clone(), api_key)
            .with_embedding_model(config.embedding_model.clone(), config.embedding_batch_size);
        provider.http_referer = config.http_referer.clone();
        provider.app_title = Some(config.app_title.clone());
        Ok(provider)
    }

    /// Set the embedding model and the number of inputs sent per call.
    pub fn with_embedding_model(mut self, model: impl Into<String>, batch_size: usize) -> Self {
        self.embedding_model = model.into();
        self.embedding_batch_size = batch_size.max(1);
        self
    }

    /// OpenRouter app attribution headers (`HTTP-Referer`, `X-Title`).
    pub fn with_attribution(mut self, referer: impl Into<String>, title: impl Into<String>) -> Self {
        self.http_referer = Some(referer.into());
        self.app_title = Some(title.into());
        self
    }

    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().into(),
                content: Some(m.content.clone()),
            })
            .collect()
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if let Some(referer) = &self.http_referer {
            builder = builder.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.app_title {
            builder = builder.header("X-Title", title);
        }
        builder
    }

    /// Send a request and map transport and status failures.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status().as_u16();
        if status == 200 {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        warn!(provider = %self.name, status, body = %body, "Provider returned error");
        Err(classify_status(status, body, retry_after))
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": inputs,
            "encoding_format": "float",
        });

        debug!(
            provider = %self.name,
            model = %self.embedding_model,
            count = inputs.len(),
            "Sending embedding request"
        );

        let response = self.send(self.post("embeddings").json(&body)).await?;
        let api_resp: EmbeddingApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse embedding response: {e}"),
            })?;

        let mut data = api_resp.data;
        data.sort_by_key(|d| d.index);
        if data.len() != inputs.len() {
            return Err(ProviderError::ApiError {
                status_code: 200,
                message: format!("expected {} embeddings, got {}", inputs.len(), data.len()),
            });
        }
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Map a reqwest transport error.
fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Map a non-200 HTTP status to a provider error.
fn classify_status(status: u16, body: String, retry_after: Option<u64>) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        401 | 403 => ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ),
        // OpenRouter answers 402 when the account is out of credits.
        402 => ProviderError::QuotaExhausted(body),
        404 => ProviderError::ModelNotFound(body),
        400 | 413 | 422 => ProviderError::InvalidRequest(body),
        408 | 504 => ProviderError::Timeout(format!("upstream timeout (status {status})")),
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

#[async_trait]
impl nestling_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": false,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self.send(self.post("chat/completions").json(&body)).await?;

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        let choice =
            api_response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::ApiError {
                    status_code: 200,
                    message: "No choices in response".into(),
                })?;

        let usage = api_response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ProviderResponse {
            content: choice.message.content.unwrap_or_default(),
            citations: api_response.citations,
            usage,
            model: api_response.model.unwrap_or(request.model),
        })
    }

    async fn list_models(&self) -> std::result::Result<Vec<String>, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Ok(Vec::new());
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let models = body["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        Ok(models)
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(transport_error)?;

        Ok(response.status().is_success())
    }
}

#[async_trait]
impl Embedder for OpenAiCompatProvider {
    fn model(&self) -> &str {
        &self.embedding_model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.embedding_batch_size) {
            let batch_vectors = self
                .embed_batch(batch)
                .await
                .map_err(|e| IndexError::EmbeddingFailed(e.to_string()))?;
            vectors.extend(batch_vectors);
        }
        Ok(vectors)
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
    /// Present for search-grounded models on OpenRouter.
    #[serde(default)]
    citations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// --- Embedding API types ---

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestling_core::Provider;

    #[test]
    fn openrouter_constructor() {
        let provider = OpenAiCompatProvider::openrouter("sk-test");
        assert_eq!(provider.name(), "openrouter");
        assert!(provider.base_url.contains("openrouter.ai"));
        assert_eq!(provider.embedding_batch_size, 20);
    }

    #[test]
    fn from_config_requires_api_key() {
        let config = ProviderConfig::default();
        assert!(matches!(
            OpenAiCompatProvider::from_config(&config),
            Err(ProviderError::NotConfigured(_))
        ));

        let config = ProviderConfig {
            api_key: Some("sk-or-test".into()),
            embedding_batch_size: 8,
            ..ProviderConfig::default()
        };
        let provider = OpenAiCompatProvider::from_config(&config).unwrap();
        assert_eq!(provider.name(), "openrouter");
        assert_eq!(provider.embedding_batch_size, 8);
        assert_eq!(provider.app_title.as_deref(), Some("Nestling"));
    }

    #[test]
    fn message_conversion() {
        let messages = vec![Message::system("You are helpful"), Message::user("Hello")];
        let api_messages = OpenAiCompatProvider::to_api_messages(&messages);
        assert_eq!(api_messages.len(), 2);
        assert_eq!(api_messages[0].role, "system");
        assert_eq!(api_messages[1].role, "user");
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(429, String::new(), Some(12)),
            ProviderError::RateLimited { retry_after_secs: 12 }
        ));
        assert!(matches!(
            classify_status(429, String::new(), None),
            ProviderError::RateLimited { retry_after_secs: DEFAULT_RETRY_AFTER_SECS }
        ));
        assert!(matches!(
            classify_status(402, "no credits".into(), None),
            ProviderError::QuotaExhausted(_)
        ));
        assert!(matches!(
            classify_status(400, "context too long".into(), None),
            ProviderError::InvalidRequest(_)
        ));
        let upstream = classify_status(503, "overloaded".into(), None);
        assert!(upstream.is_retryable());
        assert!(!classify_status(401, String::new(), None).is_retryable());
    }

    #[test]
    fn parse_completion_with_citations() {
        let data = r#"{
            "model": "perplexity/sonar",
            "choices": [{"message": {"role": "assistant", "content": "Blocks are great."}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 4, "total_tokens": 14},
            "citations": ["https://example.org/play"]
        }"#;
        let parsed: ApiResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.citations, vec!["https://example.org/play"]);
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("Blocks are great."));
    }

    #[test]
    fn parse_completion_without_citations() {
        let data = r#"{"choices": [{"message": {"role": "assistant", "content": "ok"}}]}"#;
        let parsed: ApiResponse = serde_json::from_str(data).unwrap();
        assert!(parsed.citations.is_empty());
        assert!(parsed.model.is_none());
        assert!(parsed.usage.is_none());
    }

    #[test]
    fn parse_embedding_response() {
        let data = r#"{
            "data": [
                {"embedding": [0.4, 0.5, 0.6], "index": 1},
                {"embedding": [0.1, 0.2, 0.3], "index": 0}
            ],
            "model": "text-embedding-3-small",
            "usage": {"prompt_tokens": 8, "total_tokens": 8}
        }"#;
        let mut parsed: EmbeddingApiResponse = serde_json::from_str(data).unwrap();
        parsed.data.sort_by_key(|d| d.index);
        assert_eq!(parsed.data[0].embedding, vec![0.1, 0.2, 0.3]);
        assert_eq!(parsed.data[1].embedding, vec![0.4, 0.5, 0.6]);
    }
}
