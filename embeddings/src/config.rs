//! Provider selection and pool settings.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::EmbeddingCache;
use crate::pool::{DEFAULT_WORKERS, EmbeddingPool};
use crate::provider::{DEFAULT_TIMEOUT, EmbeddingProvider, OllamaProvider, OpenAIProvider};
use crate::retry::RetryPolicy;

/// Which HTTP provider to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Ollama,
    #[serde(rename = "openai")]
    OpenAI,
}

/// Embedding settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider to use.
    pub provider: ProviderKind,

    /// Override the provider's base URL.
    pub base_url: Option<String>,

    /// Override the provider's default model.
    pub model: Option<String>,

    /// Expected vector dimension; the provider default when unset.
    pub dimension: Option<usize>,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,

    /// Concurrent provider calls.
    pub workers: usize,

    /// Retry settings.
    pub retry: RetryPolicy,

    /// Capacity of the query embedding cache; 0 disables it.
    pub cache_entries: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: None,
            model: None,
            dimension: None,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            cache_entries: 256,
        }
    }
}

impl EmbeddingConfig {
    /// Set the provider.
    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    /// Set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Instantiate the configured provider.
    pub fn build_provider(&self) -> Arc<dyn EmbeddingProvider> {
        let timeout = Duration::from_secs(self.timeout_secs.max(1));
        match self.provider {
            ProviderKind::Ollama => {
                let mut provider = OllamaProvider::new().with_timeout(timeout);
                if let Some(url) = &self.base_url {
                    provider = provider.with_base_url(url.clone());
                }
                if let Some(model) = &self.model {
                    let dimension = self.dimension.unwrap_or(provider.default_dimension());
                    provider = provider.with_model(model.clone(), dimension);
                }
                Arc::new(provider)
            }
            ProviderKind::OpenAI => {
                let mut provider = OpenAIProvider::new().with_timeout(timeout);
                if let Some(url) = &self.base_url {
                    provider = provider.with_base_url(url.clone());
                }
                if let Some(model) = &self.model {
                    provider = provider.with_model(model.clone());
                }
                Arc::new(provider)
            }
        }
    }

    /// Wrap `provider` in a pool configured from these settings.
    pub fn build_pool(&self, provider: Arc<dyn EmbeddingProvider>) -> EmbeddingPool {
        let mut pool = EmbeddingPool::new(provider)
            .with_workers(self.workers)
            .with_retry(self.retry);
        if let Some(dimension) = self.dimension {
            pool = pool.with_dimension(dimension);
        }
        if self.cache_entries > 0 {
            pool = pool.with_cache(Arc::new(EmbeddingCache::new(self.cache_entries)));
        }
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = EmbeddingConfig::default();
        assert_eq!(config.provider, ProviderKind::Ollama);
        assert_eq!(config.workers, 4);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EmbeddingConfig =
            serde_json::from_str(r#"{"provider":"openai","workers":2,"retry":{"max_attempts":5}}"#)
                .unwrap();
        assert_eq!(config.provider, ProviderKind::OpenAI);
        assert_eq!(config.workers, 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 200);
    }

    #[test]
    fn test_build_pool_uses_provider_dimension() {
        let config = EmbeddingConfig::default().with_workers(2);
        let pool = config.build_pool(config.build_provider());
        assert_eq!(pool.dimension(), 768);
        assert_eq!(pool.workers(), 2);
        assert_eq!(pool.provider().name(), "ollama");
    }
}
