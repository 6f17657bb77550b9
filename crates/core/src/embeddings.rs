use crate::cancel::CancellationSignal;
use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::error::EmbeddingError;
use crate::providers::{OllamaProvider, OpenAiCompatibleProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A backend that turns text into a fixed-length vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn dimensions(&self) -> usize;

    /// Cheap reachability check. The client bounds it with its own timeout.
    async fn probe(&self) -> Result<(), EmbeddingError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingAvailability {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedEmbedding {
    pub embedding: Vec<f32>,
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
}

/// Retrying front for one embedding provider.
#[derive(Clone)]
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    retry_attempts: u32,
    retry_delay: Duration,
    probe_timeout: Duration,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: config.retry_delay(),
            probe_timeout: config.probe_timeout(),
        }
    }

    /// Build the provider named by `config.provider`.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let provider: Arc<dyn EmbeddingProvider> = match config.provider {
            EmbeddingProviderKind::Ollama => Arc::new(OllamaProvider::new(config)?),
            EmbeddingProviderKind::OpenaiCompatible => {
                Arc::new(OpenAiCompatibleProvider::new(config)?)
            }
            EmbeddingProviderKind::Local => Arc::new(LocalNgramProvider {
                dimensions: config.dimensions,
            }),
        };
        Ok(Self::new(provider, config))
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn check_availability(&self) -> EmbeddingAvailability {
        let provider = Some(self.provider.name().to_string());
        match tokio::time::timeout(self.probe_timeout, self.provider.probe()).await {
            Ok(Ok(())) => EmbeddingAvailability {
                available: true,
                provider,
                error: None,
            },
            Ok(Err(error)) => EmbeddingAvailability {
                available: false,
                provider,
                error: Some(availability_detail(error)),
            },
            Err(_) => EmbeddingAvailability {
                available: false,
                provider,
                error: Some(format!(
                    "probe timed out after {}ms",
                    self.probe_timeout.as_millis()
                )),
            },
        }
    }

    pub async fn generate_embedding(
        &self,
        text: &str,
    ) -> Result<GeneratedEmbedding, EmbeddingError> {
        self.generate_embedding_until(text, &CancellationSignal::never())
            .await
    }

    /// Like [`generate_embedding`](Self::generate_embedding), but stops between
    /// and during attempts once `cancel` is raised.
    ///
    /// Transient failures (network, 5xx, unavailable) are retried up to the
    /// configured attempt budget with exponential backoff. Anything else fails
    /// at once.
    pub async fn generate_embedding_until(
        &self,
        text: &str,
        cancel: &CancellationSignal,
    ) -> Result<GeneratedEmbedding, EmbeddingError> {
        let mut last_error = String::new();

        for attempt in 1..=self.retry_attempts {
            if attempt > 1 {
                let delay = self.retry_delay.saturating_mul(1 << (attempt - 2).min(16));
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying embedding");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(EmbeddingError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(EmbeddingError::Cancelled),
                outcome = self.provider.embed(text) => outcome,
            };

            match outcome.and_then(|vector| self.check_dimensions(vector)) {
                Ok(embedding) => {
                    return Ok(GeneratedEmbedding {
                        dimensions: embedding.len(),
                        embedding,
                        provider: self.provider.name().to_string(),
                        model: self.provider.model().to_string(),
                    })
                }
                Err(error) if error.is_transient() => {
                    warn!(
                        provider = self.provider.name(),
                        attempt,
                        max_attempts = self.retry_attempts,
                        %error,
                        "embedding attempt failed"
                    );
                    last_error = error.to_string();
                }
                Err(error) => return Err(error),
            }
        }

        Err(EmbeddingError::RetriesExhausted {
            attempts: self.retry_attempts,
            last_error,
        })
    }

    fn check_dimensions(&self, vector: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
        let expected = self.provider.dimensions();
        if vector.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }
}

/// What went wrong in a failed probe, without the "unavailable" wording the
/// caller adds itself.
fn availability_detail(error: EmbeddingError) -> String {
    match error {
        EmbeddingError::Unavailable(reason) => reason,
        other => other.to_string(),
    }
}

/// Offline provider hashing character trigrams into a normalized vector.
/// Deterministic, always available; meant for development and tests.
#[derive(Debug, Clone, Copy)]
pub struct LocalNgramProvider {
    pub dimensions: usize,
}

impl LocalNgramProvider {
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for ch in window {
                let mut buf = [0u8; 4];
                for byte in ch.encode_utf8(&mut buf).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for LocalNgramProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn model(&self) -> &str {
        "char-trigram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn probe(&self) -> Result<(), EmbeddingError> {
        Ok(())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls with the error built by `make_error`.
    struct FlakyProvider {
        failures: u32,
        calls: AtomicU32,
        make_error: fn() -> EmbeddingError,
        dimensions: usize,
    }

    impl FlakyProvider {
        fn new(failures: u32, make_error: fn() -> EmbeddingError) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                make_error,
                dimensions: 4,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        fn model(&self) -> &str {
            "flaky-model"
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        async fn probe(&self) -> Result<(), EmbeddingError> {
            Err((self.make_error)())
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err((self.make_error)())
            } else {
                Ok(vec![0.5; 4])
            }
        }
    }

    struct HangingProvider;

    #[async_trait]
    impl EmbeddingProvider for HangingProvider {
        fn name(&self) -> &str {
            "hanging"
        }

        fn model(&self) -> &str {
            "hanging-model"
        }

        fn dimensions(&self) -> usize {
            4
        }

        async fn probe(&self) -> Result<(), EmbeddingError> {
            std::future::pending().await
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            std::future::pending().await
        }
    }

    fn server_error() -> EmbeddingError {
        EmbeddingError::ServerStatus {
            provider: "flaky".to_string(),
            status: 503,
            details: "busy".to_string(),
        }
    }

    fn client_error() -> EmbeddingError {
        EmbeddingError::ClientStatus {
            provider: "flaky".to_string(),
            status: 400,
            details: "bad input".to_string(),
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let provider = Arc::new(FlakyProvider::new(2, server_error));
        let client = EmbeddingClient::new(provider.clone(), &EmbeddingConfig::for_tests());

        let generated = client.generate_embedding("hello").await.unwrap();
        assert_eq!(generated.dimensions, 4);
        assert_eq!(generated.provider, "flaky");
        assert_eq!(generated.model, "flaky-model");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let provider = Arc::new(FlakyProvider::new(10, server_error));
        let client = EmbeddingClient::new(provider.clone(), &EmbeddingConfig::for_tests());

        let error = client.generate_embedding("hello").await.unwrap_err();
        assert!(matches!(
            error,
            EmbeddingError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let provider = Arc::new(FlakyProvider::new(10, client_error));
        let client = EmbeddingClient::new(provider.clone(), &EmbeddingConfig::for_tests());

        let error = client.generate_embedding("hello").await.unwrap_err();
        assert!(matches!(error, EmbeddingError::ClientStatus { status: 400, .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrong_dimensions_are_rejected() {
        let mut provider = FlakyProvider::new(0, server_error);
        provider.dimensions = 8;
        let client = EmbeddingClient::new(Arc::new(provider), &EmbeddingConfig::for_tests());

        let error = client.generate_embedding("hello").await.unwrap_err();
        assert!(matches!(
            error,
            EmbeddingError::DimensionMismatch {
                expected: 8,
                actual: 4
            }
        ));
    }

    #[tokio::test]
    async fn availability_reports_probe_failure() {
        let client = EmbeddingClient::new(
            Arc::new(FlakyProvider::new(0, server_error)),
            &EmbeddingConfig::for_tests(),
        );
        let availability = client.check_availability().await;
        assert!(!availability.available);
        assert_eq!(availability.provider.as_deref(), Some("flaky"));
        assert!(availability.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn availability_keeps_only_the_unreachable_reason() {
        let client = EmbeddingClient::new(
            Arc::new(FlakyProvider::new(0, || {
                EmbeddingError::Unavailable("connection refused".to_string())
            })),
            &EmbeddingConfig::for_tests(),
        );
        let availability = client.check_availability().await;
        assert_eq!(availability.error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn availability_probe_times_out() {
        let client = EmbeddingClient::new(Arc::new(HangingProvider), &EmbeddingConfig::for_tests());
        let availability = client.check_availability().await;
        assert!(!availability.available);
        assert!(availability.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_request() {
        let client = EmbeddingClient::new(Arc::new(HangingProvider), &EmbeddingConfig::for_tests());
        let (source, signal) = cancellation();
        source.cancel();
        let error = client
            .generate_embedding_until("hello", &signal)
            .await
            .unwrap_err();
        assert!(matches!(error, EmbeddingError::Cancelled));
    }

    #[tokio::test]
    async fn local_provider_is_deterministic_and_normalized() {
        let provider = LocalNgramProvider { dimensions: 32 };
        let first = provider.embed("Lighthouse keeper's log").await.unwrap();
        let second = provider.embed("Lighthouse keeper's log").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        let norm = first.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
