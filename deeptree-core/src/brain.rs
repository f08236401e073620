//! Brain module: the model capability and the resilient client around it.
//!
//! [`LlmProvider`] is the text-in/text-out capability every adapter implements.
//! [`Brain`] wraps a provider with rate limiting, retry with exponential
//! backoff and the shared circuit breaker, and tracks token usage.
//! [`MockLlmProvider`] is a rule-based scripted provider for tests and dry runs.

use crate::config::{LlmConfig, ResilienceConfig};
use crate::error::LlmError;
use crate::providers::{
    CircuitBreaker, RequestRateLimiter, RetryPolicy, SharedBreaker, with_resilience,
};
use crate::types::{CompletionRequest, CompletionResponse, TokenUsage};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Trait for LLM providers, supporting plain chat completion.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// Resilient model client shared by every pipeline component.
pub struct Brain {
    provider: Arc<dyn LlmProvider>,
    limiter: Mutex<RequestRateLimiter>,
    breaker: SharedBreaker,
    policy: RetryPolicy,
    temperature: f32,
    judge_temperature: f32,
    max_tokens: usize,
    usage: Mutex<TokenUsage>,
    calls: AtomicUsize,
}

impl Brain {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        llm: &LlmConfig,
        resilience: &ResilienceConfig,
        breaker: SharedBreaker,
    ) -> Self {
        Self {
            provider,
            limiter: Mutex::new(RequestRateLimiter::new(resilience.requests_per_minute)),
            breaker,
            policy: RetryPolicy::from(resilience),
            temperature: llm.temperature,
            judge_temperature: llm.judge_temperature,
            max_tokens: llm.max_tokens,
            usage: Mutex::new(TokenUsage::default()),
            calls: AtomicUsize::new(0),
        }
    }

    /// A brain with default settings, millisecond backoff and its own breaker.
    pub fn with_defaults(provider: Arc<dyn LlmProvider>) -> Self {
        let resilience = ResilienceConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 10,
            ..ResilienceConfig::default()
        };
        let breaker = CircuitBreaker::shared(
            resilience.breaker_window,
            resilience.breaker_failure_threshold,
            Duration::from_secs(resilience.breaker_cooldown_secs),
        );
        Self::new(provider, &LlmConfig::default(), &resilience, breaker)
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Send a request through the rate limiter, breaker and retry policy.
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        {
            let mut limiter = self.limiter.lock().await;
            if let Some(wait) = limiter.check() {
                debug!(wait_ms = wait.as_millis() as u64, "Rate limiter delaying request");
                tokio::time::sleep(wait).await;
            }
            limiter.record();
        }

        self.calls.fetch_add(1, Ordering::Relaxed);
        let response = with_resilience(&self.policy, &self.breaker, "llm", || {
            let provider = Arc::clone(&self.provider);
            let request = request.clone();
            async move { provider.complete(request).await }
        })
        .await?;

        self.usage.lock().await.accumulate(&response.usage);
        debug!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Completion received"
        );
        Ok(response)
    }

    /// Creative prompt (question writing, composite paraphrase).
    pub async fn generate(&self, system: &str, user: String) -> Result<String, LlmError> {
        self.ask(system, user, self.temperature).await
    }

    /// Judgment prompt (validation, masking, synthesis); low temperature.
    pub async fn judge(&self, system: &str, user: String) -> Result<String, LlmError> {
        self.ask(system, user, self.judge_temperature).await
    }

    async fn ask(&self, system: &str, user: String, temperature: f32) -> Result<String, LlmError> {
        let request = CompletionRequest::prompt(system, user)
            .with_temperature(temperature)
            .with_max_tokens(self.max_tokens)
            .expecting_json();
        let response = self.complete(request).await?;
        if response.text.trim().is_empty() {
            warn!(model = %response.model, "Model returned empty text");
        }
        Ok(response.text)
    }

    /// Logical requests issued through this brain (retries not counted).
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub async fn total_usage(&self) -> TokenUsage {
        *self.usage.lock().await
    }
}

/// One scripted reply rule of the mock provider.
#[derive(Debug)]
struct MockRule {
    needles: Vec<String>,
    replies: Vec<String>,
    served: usize,
}

impl MockRule {
    fn matches(&self, prompt: &str) -> bool {
        self.needles.iter().all(|n| prompt.contains(n.as_str()))
    }

    fn next_reply(&mut self) -> String {
        let idx = self.served.min(self.replies.len().saturating_sub(1));
        self.served += 1;
        self.replies.get(idx).cloned().unwrap_or_default()
    }
}

/// A mock LLM provider for testing and dry runs.
///
/// Replies are chosen by substring rules over the full prompt text. The rule
/// with the most matching needles wins; ties go to the earliest rule. A rule
/// with several replies serves them in order and then repeats the last one.
pub struct MockLlmProvider {
    model: String,
    rules: std::sync::Mutex<Vec<MockRule>>,
    default_reply: Option<String>,
    fail_remaining: AtomicUsize,
    calls: AtomicUsize,
    prompts: std::sync::Mutex<Vec<String>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            rules: std::sync::Mutex::new(Vec::new()),
            default_reply: None,
            fail_remaining: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create a MockLlmProvider that always returns the given text.
    pub fn with_response(text: &str) -> Self {
        Self::new().with_default(text)
    }

    pub fn named(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Reply used when no rule matches.
    pub fn with_default(mut self, text: impl Into<String>) -> Self {
        self.default_reply = Some(text.into());
        self
    }

    /// Reply with `text` whenever the prompt contains `needle`.
    pub fn on(self, needle: impl Into<String>, text: impl Into<String>) -> Self {
        self.on_sequence(&[needle.into()], vec![text.into()])
    }

    /// Reply with `text` whenever the prompt contains every needle.
    pub fn on_all(self, needles: &[&str], text: impl Into<String>) -> Self {
        let needles: Vec<String> = needles.iter().map(|n| n.to_string()).collect();
        self.on_sequence(&needles, vec![text.into()])
    }

    /// Serve `replies` in order for prompts containing every needle.
    pub fn on_sequence(self, needles: &[String], replies: Vec<String>) -> Self {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MockRule {
                needles: needles.to_vec(),
                replies,
                served: 0,
            });
        self
    }

    /// Fail the next `n` calls with a transient connection error.
    pub fn failing(self, n: usize) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Create a simple text response for testing.
    pub fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            text: text.to_string(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("stop".to_string()),
        }
    }

    /// Total `complete` calls received, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls whose prompt contained `needle`.
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|p| p.contains(needle))
            .count()
    }

    /// Every prompt received, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn reply_for(&self, prompt: &str) -> Option<String> {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let mut best: Option<usize> = None;
        for (i, rule) in rules.iter().enumerate() {
            if !rule.matches(prompt) {
                continue;
            }
            match best {
                Some(b) if rules[b].needles.len() >= rule.needles.len() => {}
                _ => best = Some(i),
            }
        }
        match best {
            Some(i) => Some(rules[i].next_reply()),
            None => self.default_reply.clone(),
        }
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request.full_text();
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.clone());

        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LlmError::Connection {
                message: "mock transient failure".to_string(),
            });
        }

        match self.reply_for(&prompt) {
            Some(text) => {
                let mut response = Self::text_response(&text);
                response.model = self.model.clone();
                Ok(response)
            }
            None => Err(LlmError::ApiRequest {
                message: "mock: no scripted reply for prompt".to_string(),
            }),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_default_reply() {
        let mock = Arc::new(MockLlmProvider::with_response("hello"));
        let brain = Brain::with_defaults(mock.clone());
        let text = brain.judge("sys", "anything".into()).await.unwrap();
        assert_eq!(text, "hello");
        assert_eq!(mock.call_count(), 1);
        assert_eq!(brain.total_usage().await.total(), 150);
    }

    #[tokio::test]
    async fn test_mock_most_specific_rule_wins() {
        let mock = MockLlmProvider::new()
            .on("TASK: MASKING_TEST", "generic")
            .on_all(&["TASK: MASKING_TEST", "Keyword under test: NASA"], "specific");
        let req = CompletionRequest::prompt("s", "TASK: MASKING_TEST\nKeyword under test: NASA");
        assert_eq!(mock.complete(req).await.unwrap().text, "specific");
        let req = CompletionRequest::prompt("s", "TASK: MASKING_TEST\nKeyword under test: 1995");
        assert_eq!(mock.complete(req).await.unwrap().text, "generic");
    }

    #[tokio::test]
    async fn test_mock_sequence_repeats_last() {
        let mock = MockLlmProvider::new().on_sequence(
            &["Q".to_string()],
            vec!["one".to_string(), "two".to_string()],
        );
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(
                mock.complete(CompletionRequest::prompt("", "Q"))
                    .await
                    .unwrap()
                    .text,
            );
        }
        assert_eq!(seen, vec!["one", "two", "two"]);
    }

    #[tokio::test]
    async fn test_mock_unscripted_prompt_errors() {
        let mock = MockLlmProvider::new().on("known", "yes");
        let err = mock
            .complete(CompletionRequest::prompt("", "unknown"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(mock.calls_matching("unknown"), 1);
    }

    #[tokio::test]
    async fn test_brain_retries_transient_failures() {
        let mock = Arc::new(MockLlmProvider::with_response("ok").failing(2));
        let brain = Brain::with_defaults(mock.clone());
        let text = brain.generate("sys", "prompt".into()).await.unwrap();
        assert_eq!(text, "ok");
        assert_eq!(mock.call_count(), 3);
        assert_eq!(brain.call_count(), 1);
    }

    #[tokio::test]
    async fn test_brain_surfaces_exhausted_retries() {
        let mock = Arc::new(MockLlmProvider::with_response("ok").failing(10));
        let brain = Brain::with_defaults(mock.clone());
        let err = brain.generate("sys", "prompt".into()).await.unwrap_err();
        assert!(matches!(err, LlmError::Connection { .. }));
        // initial call + 3 retries
        assert_eq!(mock.call_count(), 4);
    }
}
