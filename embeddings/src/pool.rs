//! Fixed-size worker pool for embedding calls.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::Embedding;
use crate::cache::EmbeddingCache;
use crate::error::{EmbeddingError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingRequest};
use crate::retry::RetryPolicy;

/// Default number of concurrent provider calls.
pub const DEFAULT_WORKERS: usize = 4;

/// Runs embedding requests against one provider with bounded concurrency
/// and per-request retries.
#[derive(Clone)]
pub struct EmbeddingPool {
    provider: Arc<dyn EmbeddingProvider>,
    workers: usize,
    retry: RetryPolicy,
    dimension: usize,
    cache: Option<Arc<EmbeddingCache>>,
}

impl EmbeddingPool {
    /// Create a pool expecting the provider's default dimension.
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        let dimension = provider.default_dimension();
        Self {
            provider,
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            dimension,
            cache: None,
        }
    }

    /// Set the worker count; `1` makes calls strictly sequential.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the expected vector dimension.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    /// Attach a cache used by [`EmbeddingPool::embed_one`].
    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The underlying provider.
    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Expected vector dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Worker count.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Embed every request; results come back in request order.
    ///
    /// A failed request does not affect the others.
    pub async fn embed_all(&self, requests: Vec<EmbeddingRequest>) -> Vec<Result<Embedding>> {
        let total = requests.len();
        let results: Vec<Result<Embedding>> = stream::iter(requests)
            .map(|request| self.embed_with_retry(request))
            .buffered(self.workers)
            .collect()
            .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(
                "{failed} of {total} embedding requests failed on provider {}",
                self.provider.name()
            );
        } else {
            debug!("Embedded {total} chunks");
        }
        results
    }

    /// Embed a single request, consulting the cache first.
    pub async fn embed_one(&self, request: EmbeddingRequest) -> Result<Embedding> {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string());

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&request.text, &model).await {
                return Ok(hit);
            }
        }

        let text = request.text.clone();
        let embedding = self.embed_with_retry(request).await?;
        if let Some(cache) = &self.cache {
            cache.put(&text, &model, embedding.clone()).await;
        }
        Ok(embedding)
    }

    async fn embed_with_retry(&self, request: EmbeddingRequest) -> Result<Embedding> {
        let response = self
            .retry
            .run(|| {
                let request = request.clone();
                async move { self.provider.embed(request).await }
            })
            .await?;

        if response.embedding.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: response.embedding.len(),
            });
        }
        Ok(response.embedding)
    }
}

impl std::fmt::Debug for EmbeddingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingPool")
            .field("provider", &self.provider.name())
            .field("workers", &self.workers)
            .field("retry", &self.retry)
            .field("dimension", &self.dimension)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::EmbeddingResponse;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Returns `[len, 1.0]`; texts containing "fail" always time out.
    #[derive(Default)]
    struct LengthProvider {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for LengthProvider {
        fn name(&self) -> &str {
            "length"
        }

        fn default_model(&self) -> &str {
            "length-v1"
        }

        fn default_dimension(&self) -> usize {
            2
        }

        async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            // Shorter texts finish later so completion order differs from request order.
            let delay = 100u64.saturating_sub(request.text.len() as u64 * 10);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if request.text.contains("fail") {
                return Err(EmbeddingError::Timeout("slow".to_string()));
            }
            EmbeddingResponse::validated(vec![request.text.len() as f32, 1.0], "length-v1")
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    fn requests(texts: &[&str]) -> Vec<EmbeddingRequest> {
        texts.iter().map(|t| EmbeddingRequest::new(*t)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_request_order() {
        let provider = Arc::new(LengthProvider::default());
        let pool = EmbeddingPool::new(provider.clone()).with_workers(3);

        let results = pool.embed_all(requests(&["a", "bbb", "cc", "dddd"])).await;
        let lengths: Vec<f32> = results
            .into_iter()
            .map(|r| r.unwrap()[0])
            .collect();

        assert_eq!(lengths, vec![1.0, 3.0, 2.0, 4.0]);
        assert!(provider.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_worker_is_sequential() {
        let provider = Arc::new(LengthProvider::default());
        let pool = EmbeddingPool::new(provider.clone()).with_workers(1);

        pool.embed_all(requests(&["a", "b", "c"])).await;
        assert_eq!(provider.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_isolated_and_retried() {
        let provider = Arc::new(LengthProvider::default());
        let pool = EmbeddingPool::new(provider.clone());

        let results = pool.embed_all(requests(&["ok", "fail", "fine"])).await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(EmbeddingError::Timeout(_))));
        assert!(results[2].is_ok());
        // Two successes plus three attempts for the failing text.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dimension_mismatch_is_reported() {
        let pool = EmbeddingPool::new(Arc::new(LengthProvider::default())).with_dimension(3);
        let result = pool.embed_one(EmbeddingRequest::new("abc")).await;
        assert_eq!(
            result,
            Err(EmbeddingError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_embed_one_uses_cache() {
        let provider = Arc::new(LengthProvider::default());
        let pool = EmbeddingPool::new(provider.clone()).with_cache(Arc::new(EmbeddingCache::new(8)));

        let first = pool.embed_one(EmbeddingRequest::new("query")).await.unwrap();
        let second = pool.embed_one(EmbeddingRequest::new("query")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
