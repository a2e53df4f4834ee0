//! Testing doubles for the AI council proxy.
//!
//! [`MockProviderAdapter`] mirrors `dashflow-testing::MockTool`'s
//! handler/fixed-response/call-history/should-fail shape, adapted to the
//! [`ProviderAdapter`] seam instead of `Tool`. [`MockEmbeddingService`] is a
//! deterministic, dependency-free stand-in for a real embedding provider.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use council_core::embeddings::{EmbeddingError, EmbeddingService};
use council_core::error::ProviderError;
use council_core::provider::{ProviderAdapter, ProviderPrompt, ProviderResponse};
use council_core::types::{CouncilMember, TokenUsage};

type ResponseHandler = Arc<dyn Fn(&ProviderPrompt) -> Result<String, ProviderError> + Send + Sync>;

/// A configurable mock [`ProviderAdapter`] for testing the orchestrator and
/// provider pool without a live API.
pub struct MockProviderAdapter {
    provider_name: String,
    handler: Option<ResponseHandler>,
    fixed_response: String,
    latency: Duration,
    call_history: Arc<Mutex<Vec<(String, String)>>>,
    call_count: Arc<Mutex<usize>>,
    should_fail: Arc<Mutex<bool>>,
    error: Arc<Mutex<Option<ProviderError>>>,
}

impl std::fmt::Debug for MockProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProviderAdapter")
            .field("provider_name", &self.provider_name)
            .field("call_count", &self.call_count())
            .finish()
    }
}

impl MockProviderAdapter {
    #[must_use]
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            handler: None,
            fixed_response: "mock response".to_string(),
            latency: Duration::from_millis(1),
            call_history: Arc::new(Mutex::new(Vec::new())),
            call_count: Arc::new(Mutex::new(0)),
            should_fail: Arc::new(Mutex::new(false)),
            error: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.fixed_response = response.into();
        self
    }

    #[must_use]
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ProviderPrompt) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `send` call with `error`, then resume succeeding.
    pub fn fail_next_with(&self, error: ProviderError) {
        *self.should_fail.lock().unwrap_or_else(|e| e.into_inner()) = true;
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn call_history(&self) -> Vec<(String, String)> {
        self.call_history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    #[must_use]
    pub fn was_called_with(&self, query_fragment: &str) -> bool {
        self.call_history.lock().unwrap_or_else(|e| e.into_inner()).iter().any(|(q, _)| q.contains(query_fragment))
    }

    pub fn reset(&self) {
        *self.call_count.lock().unwrap_or_else(|e| e.into_inner()) = 0;
        self.call_history.lock().unwrap_or_else(|e| e.into_inner()).clear();
        *self.should_fail.lock().unwrap_or_else(|e| e.into_inner()) = false;
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[async_trait]
impl ProviderAdapter for MockProviderAdapter {
    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn send(&self, _member: &CouncilMember, prompt: &ProviderPrompt) -> Result<ProviderResponse, ProviderError> {
        *self.call_count.lock().unwrap_or_else(|e| e.into_inner()) += 1;

        {
            let mut should_fail = self.should_fail.lock().unwrap_or_else(|e| e.into_inner());
            if *should_fail {
                *should_fail = false;
                let err = self
                    .error
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                    .unwrap_or_else(|| ProviderError::Unknown {
                        provider: self.provider_name.clone(),
                        message: "mock failure".to_string(),
                    });
                return Err(err);
            }
        }

        let content = if let Some(handler) = &self.handler {
            handler(prompt)?
        } else {
            self.fixed_response.clone()
        };

        self.call_history.lock().unwrap_or_else(|e| e.into_inner()).push((prompt.query.clone(), content.clone()));

        Ok(ProviderResponse {
            content,
            token_usage: TokenUsage { prompt: 10, completion: 10 },
            latency: self.latency,
        })
    }

    async fn health(&self) -> Result<Duration, ProviderError> {
        Ok(self.latency)
    }
}

/// A deterministic [`EmbeddingService`] double: the same text always embeds
/// to the same vector, and distinct text embeds to distinct vectors, with no
/// network call.
pub struct MockEmbeddingService {
    dimension: usize,
}

impl MockEmbeddingService {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl EmbeddingService for MockEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut vector = Vec::with_capacity(self.dimension);
        for i in 0..self.dimension {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            i.hash(&mut hasher);
            let bits = hasher.finish();
            let normalized = (bits % 2_000_001) as f32 / 1_000_000.0 - 1.0;
            vector.push(normalized);
        }
        Ok(vector)
    }
}
