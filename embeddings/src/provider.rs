//! Embedding providers.
//!
//! Supports an Ollama server and any OpenAI compatible `/embeddings`
//! endpoint behind one trait.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Embedding;
use crate::error::{EmbeddingError, Result};

/// Default timeout for one HTTP embedding call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Request for generating embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Text to embed.
    pub text: String,

    /// Model to use (provider-specific).
    pub model: Option<String>,

    /// Dimensions for the output (if supported by provider).
    pub dimensions: Option<usize>,

    /// Language of the text, passed along as a hint.
    pub language: Option<String>,
}

impl EmbeddingRequest {
    /// Create a new embedding request.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
            dimensions: None,
            language: None,
        }
    }

    /// Set the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the output dimensions.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Attach a language hint.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Response from embedding generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// The generated embedding.
    pub embedding: Embedding,

    /// Model used to generate the embedding.
    pub model: String,

    /// Dimension of the embedding.
    pub dimension: usize,

    /// Token usage (if available).
    pub tokens_used: Option<u64>,
}

impl EmbeddingResponse {
    /// Build a response, rejecting empty or non-finite vectors.
    pub fn validated(embedding: Embedding, model: impl Into<String>) -> Result<Self> {
        if embedding.is_empty() {
            return Err(EmbeddingError::MalformedResponse(
                "empty embedding".to_string(),
            ));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::MalformedResponse(
                "embedding contains non-finite values".to_string(),
            ));
        }
        let dimension = embedding.len();
        Ok(Self {
            embedding,
            model: model.into(),
            dimension,
            tokens_used: None,
        })
    }
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Get the default model for this provider.
    fn default_model(&self) -> &str;

    /// Get the default embedding dimension.
    fn default_dimension(&self) -> usize;

    /// Generate an embedding for the given text.
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse>;

    /// Generate embeddings for multiple texts.
    async fn embed_batch(&self, requests: Vec<EmbeddingRequest>) -> Result<Vec<EmbeddingResponse>> {
        // Default implementation: process sequentially
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.embed(request).await?);
        }
        Ok(results)
    }

    /// Check if the provider is available (API key set, etc.).
    fn is_available(&self) -> bool;
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Map a non-success HTTP status onto the error taxonomy.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);
        return Err(EmbeddingError::RateLimited {
            retry_after_secs: retry_after,
        });
    }

    let message = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(EmbeddingError::Server {
            status: status.as_u16(),
            message,
        })
    } else {
        Err(EmbeddingError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

/// Ollama embedding provider (`POST /api/embeddings`).
pub struct OllamaProvider {
    /// Server base URL.
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    /// Default model.
    default_model: String,

    /// Dimension produced by the default model.
    dimension: usize,
}

impl OllamaProvider {
    /// Create a provider for a local Ollama server.
    pub fn new() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            client: http_client(DEFAULT_TIMEOUT),
            default_model: "nomic-embed-text".to_string(),
            dimension: 768,
        }
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the default model and the dimension it produces.
    pub fn with_model(mut self, model: impl Into<String>, dimension: usize) -> Self {
        self.default_model = model.into();
        self.dimension = dimension;
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Option<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn default_dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        if request.text.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let model = request.model.unwrap_or_else(|| self.default_model.clone());

        debug!("Generating embedding with model: {model}");

        let body = serde_json::json!({
            "model": model,
            "prompt": request.text,
        });

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let bytes = response.bytes().await?;
        let parsed: OllamaEmbeddingResponse = serde_json::from_slice(&bytes)?;
        let embedding = parsed.embedding.ok_or_else(|| {
            EmbeddingError::MalformedResponse("no embedding in response".to_string())
        })?;

        EmbeddingResponse::validated(embedding, model)
    }

    fn is_available(&self) -> bool {
        !self.base_url.is_empty()
    }
}

/// OpenAI compatible embedding provider.
pub struct OpenAIProvider {
    /// API key.
    api_key: Option<String>,

    /// API base URL.
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    /// Default model.
    default_model: String,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider.
    pub fn new() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: http_client(DEFAULT_TIMEOUT),
            default_model: "text-embedding-3-small".to_string(),
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the default model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    async fn post(&self, body: &serde_json::Value) -> Result<OpenAIEmbeddingResponse> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(EmbeddingError::ProviderNotConfigured)?;

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .json(body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn default_dimension(&self) -> usize {
        match self.default_model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        }
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        if request.text.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let model = request.model.unwrap_or_else(|| self.default_model.clone());

        debug!("Generating embedding with model: {model}");

        let mut body = serde_json::json!({
            "input": request.text,
            "model": model
        });
        if let Some(dims) = request.dimensions {
            body["dimensions"] = serde_json::json!(dims);
        }

        let result = self.post(&body).await?;
        let tokens_used = result.usage.as_ref().map(|u| u.total_tokens);
        let embedding = result
            .data
            .into_iter()
            .next()
            .ok_or_else(|| {
                EmbeddingError::MalformedResponse("no embedding in response".to_string())
            })?
            .embedding;

        let mut response = EmbeddingResponse::validated(embedding, result.model)?;
        response.tokens_used = tokens_used;
        Ok(response)
    }

    async fn embed_batch(&self, requests: Vec<EmbeddingRequest>) -> Result<Vec<EmbeddingResponse>> {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };
        let model = first
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let texts: Vec<&str> = requests.iter().map(|r| r.text.as_str()).collect();

        debug!(
            "Generating batch embeddings for {} texts with model: {model}",
            texts.len()
        );

        let body = serde_json::json!({
            "input": texts,
            "model": model
        });
        let result = self.post(&body).await?;

        if result.data.len() != requests.len() {
            return Err(EmbeddingError::MalformedResponse(format!(
                "expected {} embeddings, got {}",
                requests.len(),
                result.data.len()
            )));
        }

        let mut data = result.data;
        data.sort_by_key(|item| item.index);
        data.into_iter()
            .map(|item| EmbeddingResponse::validated(item.embedding, result.model.clone()))
            .collect()
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
    model: String,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_embedding_request() {
        let request = EmbeddingRequest::new("Hello world")
            .with_model("text-embedding-3-small")
            .with_dimensions(512)
            .with_language("python");

        assert_eq!(request.text, "Hello world");
        assert_eq!(request.model, Some("text-embedding-3-small".to_string()));
        assert_eq!(request.dimensions, Some(512));
        assert_eq!(request.language.as_deref(), Some("python"));
    }

    #[test]
    fn test_openai_provider_default_dimensions() {
        let provider = OpenAIProvider::new().with_model("text-embedding-3-large");
        assert_eq!(provider.default_dimension(), 3072);
        assert_eq!(OllamaProvider::new().default_dimension(), 768);
    }

    #[tokio::test]
    async fn test_ollama_embed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_partial_json(serde_json::json!({"model": "nomic-embed-text"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"embedding": [0.1, 0.2, 0.3]})),
            )
            .mount(&server)
            .await;

        let provider = OllamaProvider::new().with_base_url(server.uri());
        let response = provider.embed(EmbeddingRequest::new("fn main")).await.unwrap();

        assert_eq!(response.embedding, vec![0.1, 0.2, 0.3]);
        assert_eq!(response.dimension, 3);
        assert_eq!(response.model, "nomic-embed-text");
    }

    #[tokio::test]
    async fn test_ollama_malformed_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let provider = OllamaProvider::new().with_base_url(server.uri());
        let err = provider.embed(EmbeddingRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_status_codes_map_to_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(503).set_body_string("loading model"))
            .mount(&server)
            .await;

        let provider = OllamaProvider::new().with_base_url(server.uri());
        let err = provider.embed(EmbeddingRequest::new("x")).await.unwrap_err();
        assert_eq!(
            err,
            EmbeddingError::Server {
                status: 503,
                message: "loading model".to_string()
            }
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let provider = OllamaProvider::new().with_base_url("http://127.0.0.1:9");
        let err = provider.embed(EmbeddingRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_openai_batch_keeps_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "text-embedding-3-small",
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ],
                "usage": {"prompt_tokens": 4, "total_tokens": 4}
            })))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new()
            .with_api_key("test-key")
            .with_base_url(server.uri());
        let responses = provider
            .embed_batch(vec![EmbeddingRequest::new("a"), EmbeddingRequest::new("b")])
            .await
            .unwrap();

        assert_eq!(responses[0].embedding, vec![1.0, 0.0]);
        assert_eq!(responses[1].embedding, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_openai_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new()
            .with_api_key("k")
            .with_base_url(server.uri());
        let err = provider.embed(EmbeddingRequest::new("x")).await.unwrap_err();
        assert_eq!(err, EmbeddingError::RateLimited { retry_after_secs: 7 });
    }
}
