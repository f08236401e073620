//! Upstream plumbing shared by the model and search clients.
//!
//! - `openai_compat`: OpenAI-compatible chat completions adapter
//! - `circuit`: windowed circuit breaker shared by every upstream client
//! - `rate_limiter`: sliding-window requests-per-minute limiter
//!
//! [`with_resilience`] wraps a single upstream call with the breaker pause and
//! exponential backoff retry used by both [`crate::brain::Brain`] and
//! [`crate::search::SearchClient`].

pub mod circuit;
pub mod openai_compat;
pub mod rate_limiter;

use crate::brain::LlmProvider;
use crate::config::{LlmConfig, ResilienceConfig};
use crate::error::{LlmError, SearchError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use circuit::{CircuitBreaker, CircuitState, SharedBreaker};
pub use openai_compat::OpenAiCompatibleProvider;
pub use rate_limiter::RequestRateLimiter;

/// Errors that can be classified as transient for retry purposes.
pub trait Transient {
    fn is_retryable(&self) -> bool;

    /// Server-provided retry hint in seconds, if any.
    fn retry_after_secs(&self) -> Option<u64> {
        None
    }
}

impl Transient for LlmError {
    fn is_retryable(&self) -> bool {
        LlmError::is_retryable(self)
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            LlmError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl Transient for SearchError {
    fn is_retryable(&self) -> bool {
        matches!(self, SearchError::Request { .. } | SearchError::Timeout { .. })
    }
}

/// Retry policy derived from [`ResilienceConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff_ms: config.base_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            jitter: true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ResilienceConfig::default())
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), honouring server hints.
    pub fn backoff_ms<E: Transient>(&self, attempt: usize, err: &E) -> u64 {
        let shift = attempt.min(16) as u32;
        let base = self.base_backoff_ms.saturating_mul(1u64 << shift);
        let capped = base.min(self.max_backoff_ms);
        let computed = if self.jitter {
            // up to 25% jitter
            capped + (capped as f64 * 0.25 * rand::random::<f64>()) as u64
        } else {
            capped
        };
        match err.retry_after_secs() {
            Some(secs) => computed.max(secs.saturating_mul(1000)),
            None => computed,
        }
    }
}

/// Run one upstream operation through the shared breaker and retry policy.
///
/// While the breaker is open the caller sleeps for the remaining cooldown
/// instead of failing, so a sustained upstream outage pauses the pipeline.
/// Every attempt outcome is fed back into the breaker. Permanent errors
/// return immediately.
pub async fn with_resilience<F, Fut, T, E>(
    policy: &RetryPolicy,
    breaker: &SharedBreaker,
    label: &str,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let pause = breaker.lock().await.wait_time();
        if let Some(wait) = pause {
            tracing::warn!(
                target_service = label,
                wait_ms = wait.as_millis() as u64,
                "Circuit open, pausing caller"
            );
            tokio::time::sleep(wait).await;
            // re-check; another caller may have sent the trial call meanwhile
            continue;
        }

        match operation().await {
            Ok(val) => {
                breaker.lock().await.record_success();
                return Ok(val);
            }
            Err(e) => {
                breaker.lock().await.record_failure();
                if !e.is_retryable() || attempt >= policy.max_retries {
                    return Err(e);
                }
                let backoff_ms = policy.backoff_ms(attempt, &e);
                tracing::warn!(
                    target_service = label,
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Create an LLM provider based on the configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.provider.as_str() {
        "openai" | "openai-compatible" | "ollama" | "vllm" => {
            Ok(Arc::new(OpenAiCompatibleProvider::new(config)?))
        }
        other => {
            tracing::warn!(
                provider = other,
                "Unknown provider name, assuming an OpenAI-compatible endpoint"
            );
            Ok(Arc::new(OpenAiCompatibleProvider::new(config)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 4,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 32_000,
            jitter: false,
        };
        let err = LlmError::Timeout { timeout_secs: 1 };
        assert_eq!(policy.backoff_ms(0, &err), 500);
        assert_eq!(policy.backoff_ms(1, &err), 1000);
        assert_eq!(policy.backoff_ms(3, &err), 4000);
        assert_eq!(policy.backoff_ms(10, &err), 32_000);
    }

    #[test]
    fn test_backoff_respects_rate_limit_hint() {
        let policy = fast_policy();
        let err = LlmError::RateLimited {
            retry_after_secs: 2,
        };
        assert_eq!(policy.backoff_ms(0, &err), 2000);
    }

    #[tokio::test]
    async fn test_with_resilience_retries_transient() {
        let breaker = CircuitBreaker::shared(20, 15, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let result: Result<u32, LlmError> = with_resilience(&fast_policy(), &breaker, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LlmError::Connection {
                        message: "reset".into(),
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.lock().await.failures(), 2);
    }

    #[tokio::test]
    async fn test_with_resilience_permanent_error_not_retried() {
        let breaker = CircuitBreaker::shared(20, 15, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let result: Result<u32, LlmError> = with_resilience(&fast_policy(), &breaker, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LlmError::AuthFailed {
                    provider: "openai".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(LlmError::AuthFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_resilience_gives_up_after_max_retries() {
        let breaker = CircuitBreaker::shared(20, 15, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let result: Result<u32, SearchError> =
            with_resilience(&fast_policy(), &breaker, "search", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SearchError::Timeout { timeout_secs: 1 })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_with_resilience_waits_out_open_breaker() {
        let breaker = CircuitBreaker::shared(2, 1, Duration::from_millis(20));
        breaker.lock().await.record_failure();
        let started = std::time::Instant::now();
        let result: Result<u32, LlmError> =
            with_resilience(&fast_policy(), &breaker, "test", || async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);
        assert!(started.elapsed() >= Duration::from_millis(15));
        assert_eq!(breaker.lock().await.state(), CircuitState::Closed);
    }
}
