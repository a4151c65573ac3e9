//! Model capability traits and bounded-concurrency pools
//!
//! Components never call a backend directly: completions go through a
//! [`ModelPool`] (semaphore, retry, response cache) and embeddings through an
//! [`EmbeddingPool`] (semaphore, retry, batching).

use crate::{AgentError, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use kgrag_core::hashing::hash_parts;
use kgrag_db::KvStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

/// What a completion call is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Extraction,
    Gleaning,
    GleaningCheck,
    Summarize,
    CommunityReport,
    GlobalMap,
    GlobalReduce,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// One completion call
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub kind: RequestKind,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub history: Vec<ChatMessage>,
    /// Ask the backend for a JSON object response
    pub json_response: bool,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(kind: RequestKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            system_prompt: None,
            history: Vec::new(),
            json_response: false,
            max_tokens: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_json_response(mut self) -> Self {
        self.json_response = true;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Full message list: system, history, then the prompt as a user turn
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if let Some(system) = &self.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(self.prompt.clone()));
        messages
    }

    /// Response cache key for this request against `model`
    pub fn cache_key(&self, model: &str) -> String {
        let mut parts = vec![model.to_string(), self.json_response.to_string()];
        for message in self.messages() {
            parts.push(message.role);
            parts.push(message.content);
        }
        hash_parts(parts)
    }
}

/// A text-generation backend
#[async_trait]
pub trait CompletionModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// A text-embedding backend
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Length of every returned vector
    fn dimension(&self) -> usize;

    /// Largest input the backend accepts, in tokens
    fn max_token_size(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Bounded retries with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_backoff_ms: 4_000,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            min_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Wait before attempt `attempt + 1` (attempts are counted from 1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self
            .min_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms.max(self.min_backoff_ms));
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let wait = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label, attempt, max_attempts, e, wait
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A completion model behind a concurrency limit, retry policy and
/// optional response cache
pub struct ModelPool {
    model: Arc<dyn CompletionModel>,
    permits: Arc<Semaphore>,
    max_async: usize,
    retry: RetryPolicy,
    cache: Option<Arc<dyn KvStore>>,
}

impl ModelPool {
    pub fn new(model: Arc<dyn CompletionModel>, max_async: usize, retry: RetryPolicy) -> Self {
        let max_async = max_async.max(1);
        Self {
            model,
            permits: Arc::new(Semaphore::new(max_async)),
            max_async,
            retry,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn KvStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn max_async(&self) -> usize {
        self.max_async
    }

    /// Complete `request`. The cache is consulted before a permit is taken.
    pub async fn complete(&self, request: CompletionRequest) -> Result<String> {
        self.complete_with(request, |text| Ok(text.to_string())).await
    }

    /// Complete `request` and run `parse` over the reply. Only replies that
    /// parse are written to the response cache; a cached reply that no longer
    /// parses is treated as a miss.
    #[instrument(skip(self, request, parse), fields(kind = ?request.kind, model = %self.model.name()))]
    pub async fn complete_with<T, P>(&self, request: CompletionRequest, parse: P) -> Result<T>
    where
        P: Fn(&str) -> Result<T>,
    {
        let key = self
            .cache
            .as_ref()
            .map(|_| request.cache_key(self.model.name()));

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(hit) = cache.get(key).await? {
                if let Some(text) = hit.get("return").and_then(|v| v.as_str()) {
                    match parse(text) {
                        Ok(value) => {
                            debug!("Response cache hit");
                            return Ok(value);
                        }
                        Err(e) => {
                            warn!("Discarding cached reply: {}", e);
                            cache.remove(key).await?;
                        }
                    }
                }
            }
        }

        let label = format!("{:?} completion", request.kind);
        let request = &request;
        let text = self
            .retry
            .run(&label, move || async move {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| AgentError::Processing(format!("model pool closed: {}", e)))?;
                self.model.complete(request).await
            })
            .await?;
        let value = parse(&text)?;

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            cache
                .set(key, json!({ "return": text, "model": self.model.name() }))
                .await?;
        }
        Ok(value)
    }
}

/// An embedding model behind a concurrency limit, retry policy and batching
pub struct EmbeddingPool {
    model: Arc<dyn EmbeddingModel>,
    permits: Arc<Semaphore>,
    max_async: usize,
    batch_size: usize,
    retry: RetryPolicy,
}

impl EmbeddingPool {
    pub fn new(
        model: Arc<dyn EmbeddingModel>,
        max_async: usize,
        batch_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        let max_async = max_async.max(1);
        Self {
            model,
            permits: Arc::new(Semaphore::new(max_async)),
            max_async,
            batch_size: batch_size.max(1),
            retry,
        }
    }

    pub fn dimension(&self) -> usize {
        self.model.dimension()
    }

    pub fn max_token_size(&self) -> usize {
        self.model.max_token_size()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_async(&self) -> usize {
        self.max_async
    }

    /// Embed one batch (at most `batch_size` texts) with retries.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self
            .retry
            .run("embedding", move || async move {
                let _permit = self.permits.acquire().await.map_err(|e| {
                    AgentError::Processing(format!("embedding pool closed: {}", e))
                })?;
                let vectors = self.model.embed(texts).await?;
                self.validate(texts.len(), &vectors)?;
                Ok(vectors)
            })
            .await?;
        Ok(vectors)
    }

    /// Embed any number of texts, batched and concurrent; fails if any batch fails.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let batches: Vec<Vec<Vec<f32>>> = stream::iter(texts.chunks(self.batch_size))
            .map(|batch| self.embed_batch(batch))
            .buffered(self.max_async)
            .try_collect()
            .await?;
        Ok(batches.into_iter().flatten().collect())
    }

    fn validate(&self, expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
        if vectors.len() != expected {
            return Err(AgentError::Embedding(format!(
                "expected {} vectors, got {}",
                expected,
                vectors.len()
            )));
        }
        let dimension = self.model.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(AgentError::Embedding(format!(
                "embedding dimension {} does not match declared {}",
                bad.len(),
                dimension
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgrag_db::JsonKvStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl CompletionModel for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(AgentError::Llm("rate limited".into()));
            }
            Ok(format!("echo: {}", request.prompt))
        }
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            min_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(2), Duration::from_secs(8));
        assert_eq!(policy.backoff(3), Duration::from_secs(10));
        assert_eq!(policy.backoff(10), Duration::from_secs(10));
    }

    #[test]
    fn test_cache_key_depends_on_messages() {
        let a = CompletionRequest::new(RequestKind::Answer, "q");
        let b = a.clone().with_system_prompt("sys");
        assert_ne!(a.cache_key("m"), b.cache_key("m"));
        assert_ne!(a.cache_key("m"), a.cache_key("n"));
        assert_eq!(a.cache_key("m"), a.clone().cache_key("m"));
    }

    #[tokio::test]
    async fn test_pool_retries_then_succeeds() {
        let model = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        let pool = ModelPool::new(model.clone(), 2, fast_retry(3));
        let out = pool
            .complete(CompletionRequest::new(RequestKind::Answer, "hi"))
            .await
            .unwrap();
        assert_eq!(out, "echo: hi");
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_pool_gives_up_after_max_attempts() {
        let model = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 10,
        });
        let pool = ModelPool::new(model.clone(), 1, fast_retry(2));
        let err = pool
            .complete(CompletionRequest::new(RequestKind::Answer, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Llm(_)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pool_cache_avoids_second_call() {
        let model = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let cache = Arc::new(JsonKvStore::in_memory("llm_response_cache"));
        let pool = ModelPool::new(model.clone(), 1, fast_retry(1)).with_cache(cache.clone());
        let request = CompletionRequest::new(RequestKind::Answer, "hi");
        pool.complete(request.clone()).await.unwrap();
        pool.complete(request).await.unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.all_keys().await.unwrap().len(), 1);
    }

    /// Fails the first "slow" request, answers everything else at once.
    struct FirstSlowFails {
        slow_calls: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl CompletionModel for FirstSlowFails {
        fn name(&self) -> &str {
            "first-slow-fails"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            if request.prompt == "slow" && self.slow_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(AgentError::Llm("overloaded".into()));
            }
            Ok(format!("{}:{}", request.prompt, self.finished.fetch_add(1, Ordering::SeqCst)))
        }
    }

    #[tokio::test]
    async fn test_pool_releases_permit_during_backoff() {
        let model = Arc::new(FirstSlowFails {
            slow_calls: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        });
        let retry = RetryPolicy {
            max_attempts: 2,
            min_backoff_ms: 200,
            max_backoff_ms: 200,
        };
        let pool = ModelPool::new(model, 1, retry);
        let (slow, fast) = tokio::join!(
            pool.complete(CompletionRequest::new(RequestKind::Answer, "slow")),
            pool.complete(CompletionRequest::new(RequestKind::Answer, "fast")),
        );
        assert_eq!(fast.unwrap(), "fast:0");
        assert_eq!(slow.unwrap(), "slow:1");
    }

    #[tokio::test]
    async fn test_pool_does_not_cache_rejected_reply() {
        let model = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let cache = Arc::new(JsonKvStore::in_memory("llm_response_cache"));
        let pool = ModelPool::new(model.clone(), 1, fast_retry(1)).with_cache(cache.clone());
        let request = CompletionRequest::new(RequestKind::Extraction, "hi");

        let err = pool
            .complete_with(request.clone(), |_| -> Result<()> {
                Err(AgentError::ExtractionParse("unusable".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ExtractionParse(_)));
        assert!(cache.all_keys().await.unwrap().is_empty());

        let out = pool.complete_with(request, |text| Ok(text.len())).await.unwrap();
        assert_eq!(out, "echo: hi".len());
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.all_keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pool_replaces_cached_reply_that_no_longer_parses() {
        let model = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let cache = Arc::new(JsonKvStore::in_memory("llm_response_cache"));
        let pool = ModelPool::new(model.clone(), 1, fast_retry(1)).with_cache(cache.clone());
        let request = CompletionRequest::new(RequestKind::Answer, "hi");
        let key = request.cache_key("flaky");
        cache
            .set(&key, json!({ "return": "garbage", "model": "flaky" }))
            .await
            .unwrap();

        let out = pool
            .complete_with(request, |text| {
                if text.starts_with("echo") {
                    Ok(text.to_string())
                } else {
                    Err(AgentError::Processing("stale".into()))
                }
            })
            .await
            .unwrap();
        assert_eq!(out, "echo: hi");
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        let stored = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(stored["return"], "echo: hi");
    }
}
