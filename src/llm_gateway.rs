use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::log_llm_operation;
use crate::llm_providers::{extract_json_object, GeminiProvider, GenerationProvider, GroqProvider};
use crate::models::{GenerationRequest, GenerationResult, ModelMetrics};

/// Linear-backoff retry policy: `max_retries + 1` total attempts, sleeping
/// `0.5 * attempt` seconds between them. Kept separate from the call path so
/// the schedule is testable without a network.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(500 * u64::from(attempt))
    }
}

const LATENCY_UNSET: u64 = u64::MAX;

/// Gateway over the resolved text-generation provider.
///
/// Provider selection happens once, at construction: Groq if its key is
/// configured, else Gemini, else unavailable. The gateway owns only metrics
/// counters beyond that; every call is otherwise stateless.
pub struct ModelGateway {
    provider: Option<GenerationProvider>,
    requests: AtomicU64,
    errors: AtomicU64,
    last_latency_ms: AtomicU64,
}

impl ModelGateway {
    pub fn new(config: &ModelConfig) -> Self {
        let provider = Self::resolve_provider(config);
        Self {
            provider,
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(LATENCY_UNSET),
        }
    }

    fn resolve_provider(config: &ModelConfig) -> Option<GenerationProvider> {
        if let Some(key) = config.groq_api_key.as_deref().filter(|k| !k.is_empty()) {
            let provider = GroqProvider::new(
                key.to_string(),
                config.groq_url.clone(),
                config.groq_model.clone(),
            );
            info!(model = provider.model_name(), "Using Groq for text generation");
            return Some(GenerationProvider::Groq(provider));
        }
        if let Some(key) = config.gemini_api_key.as_deref().filter(|k| !k.is_empty()) {
            let provider = GeminiProvider::new(key.to_string(), None, config.gemini_model.clone());
            info!(model = provider.model_name(), "Using Gemini for text generation");
            return Some(GenerationProvider::Gemini(provider));
        }
        warn!("No generation credentials configured - heuristic fallbacks only");
        None
    }

    /// True iff a provider was resolved at construction.
    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    /// Provider name for health endpoints and logging.
    pub fn provider_name(&self) -> Option<&'static str> {
        self.provider.as_ref().map(|p| p.provider_name())
    }

    /// Run a structured generation call: issue the request, extract a JSON
    /// object from the response text, retry with linear backoff on transport
    /// or extraction failure. Never returns an error; exhausted retries yield
    /// an unsuccessful `GenerationResult` the caller degrades from.
    pub async fn generate(&self, request: &GenerationRequest) -> GenerationResult {
        let Some(provider) = &self.provider else {
            return GenerationResult::disabled("LLM disabled (no API_GROQ or GEMINI_API_KEY)");
        };

        log_llm_operation!(start, "generate", provider = provider.provider_name());

        let policy = RetryPolicy::new(request.max_retries);
        let mut last_error: Option<String> = None;

        for attempt in 1..=policy.total_attempts() {
            self.requests.fetch_add(1, Ordering::Relaxed);
            let start = Instant::now();

            match provider
                .generate_text(
                    &request.system,
                    &request.prompt,
                    request.temperature,
                    request.max_output_tokens,
                )
                .await
            {
                Ok(raw) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    self.last_latency_ms.store(latency_ms, Ordering::Relaxed);
                    log_llm_operation!(
                        success,
                        "generate",
                        provider = provider.provider_name(),
                        duration_ms = latency_ms
                    );

                    if let Some(data) = extract_json_object(&raw) {
                        return GenerationResult {
                            success: true,
                            data,
                            raw,
                            error: None,
                            llm_enabled: true,
                        };
                    }
                    log_llm_operation!(warn, "generate", "response contained no JSON object");
                    last_error = Some("JSON not found / invalid".to_string());
                }
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    log_llm_operation!(
                        error,
                        "generate",
                        provider = provider.provider_name(),
                        error = e,
                        attempt = attempt
                    );
                    last_error = Some(e.to_string());
                }
            }

            if attempt < policy.total_attempts() {
                tokio::time::sleep(policy.backoff_delay(attempt)).await;
            }
        }

        GenerationResult {
            success: false,
            data: serde_json::Map::new(),
            raw: String::new(),
            error: last_error.or_else(|| Some("unknown".to_string())),
            llm_enabled: true,
        }
    }

    /// Counter snapshot; observability only, no behavioral effect.
    pub fn metrics(&self) -> ModelMetrics {
        let last = self.last_latency_ms.load(Ordering::Relaxed);
        ModelMetrics {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_latency_ms: (last != LATENCY_UNSET).then_some(last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_config() -> ModelConfig {
        ModelConfig {
            groq_api_key: None,
            groq_url: None,
            groq_model: None,
            gemini_api_key: None,
            gemini_model: None,
        }
    }

    #[test]
    fn backoff_is_linear_in_attempt_number() {
        let policy = RetryPolicy::new(2);
        assert_eq!(policy.total_attempts(), 3);
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn gateway_without_credentials_is_unavailable() {
        let gateway = ModelGateway::new(&bare_config());
        assert!(!gateway.is_available());
        assert!(gateway.provider_name().is_none());

        let result = gateway
            .generate(&GenerationRequest::new("prompt", "system"))
            .await;
        assert!(!result.success);
        assert!(!result.llm_enabled);
        assert!(result.data.is_empty());

        // A disabled gateway issues no requests
        let metrics = gateway.metrics();
        assert_eq!(metrics.requests, 0);
        assert_eq!(metrics.errors, 0);
        assert_eq!(metrics.last_latency_ms, None);
    }

    #[test]
    fn groq_is_preferred_over_gemini() {
        let mut config = bare_config();
        config.groq_api_key = Some("gsk-test".to_string());
        config.gemini_api_key = Some("AIza-test".to_string());
        let gateway = ModelGateway::new(&config);
        assert_eq!(gateway.provider_name(), Some("Groq"));

        config.groq_api_key = None;
        let gateway = ModelGateway::new(&config);
        assert_eq!(gateway.provider_name(), Some("Gemini"));
    }

    #[test]
    fn empty_credential_counts_as_absent() {
        let mut config = bare_config();
        config.groq_api_key = Some(String::new());
        let gateway = ModelGateway::new(&config);
        assert!(!gateway.is_available());
    }
}
