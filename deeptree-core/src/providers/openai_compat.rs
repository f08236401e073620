//! Chat completions adapter for OpenAI-style endpoints.
//!
//! Every pipeline prompt wants one JSON object back, so requests carry
//! `response_format: json_object` when the endpoint accepts it. Local servers
//! (Ollama, vLLM, LM Studio) that reject the field are detected on the first
//! 400 and served plain requests from then on.

use crate::brain::LlmProvider;
use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::types::{CompletionRequest, CompletionResponse, Message, TokenUsage};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 5;

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    code: Option<String>,
    param: Option<String>,
}

impl ApiError {
    fn from_body(body: &str) -> Self {
        serde_json::from_str::<ErrorEnvelope>(body)
            .map(|e| e.error)
            .unwrap_or_else(|_| ApiError {
                message: body.trim().to_string(),
                ..ApiError::default()
            })
    }

    /// The endpoint does not understand `response_format`.
    fn rejects_json_mode(&self) -> bool {
        self.param.as_deref() == Some("response_format")
            || self.message.contains("response_format")
    }
}

/// Question-writing and judgment client for OpenAI-compatible endpoints.
pub struct OpenAiCompatibleProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    json_mode: AtomicBool,
}

impl OpenAiCompatibleProvider {
    /// Build a provider, reading the key from `config.api_key_env`. Local
    /// endpoints run without one.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let local = config
            .base_url
            .as_deref()
            .is_some_and(|u| u.contains("localhost") || u.contains("127.0.0.1"));
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) => key,
            Err(_) if local => {
                debug!(base_url = ?config.base_url, "Local endpoint, no API key needed");
                "local".to_string()
            }
            Err(_) => {
                return Err(LlmError::AuthFailed {
                    provider: format!("{} (set {})", config.provider, config.api_key_env),
                });
            }
        };
        Self::new_with_key(config, api_key)
    }

    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self, LlmError> {
        let base = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LlmError::Connection {
                message: format!("HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            timeout_secs: config.request_timeout_secs,
            json_mode: AtomicBool::new(config.json_mode),
        })
    }

    fn body<'a>(&'a self, request: &'a CompletionRequest) -> ChatBody<'a> {
        let json = request.json_reply && self.json_mode.load(Ordering::Relaxed);
        ChatBody {
            model: request.model.as_deref().unwrap_or(&self.model),
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: json.then_some(ResponseFormat {
                kind: "json_object",
            }),
            stream: false,
        }
    }

    /// Pull the reply text out of a chat completion. A judgment cut off by
    /// `max_tokens` is returned as is; its JSON will fail to parse downstream.
    fn read_reply(raw: &str, fallback_model: &str) -> Result<CompletionResponse, LlmError> {
        let reply: ChatReply = serde_json::from_str(raw).map_err(|e| LlmError::ResponseParse {
            message: format!("chat completion body: {e}"),
        })?;
        let usage = reply.usage.unwrap_or_default();
        let model = reply.model.unwrap_or_else(|| fallback_model.to_string());
        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ResponseParse {
                message: "completion has no choices".into(),
            })?;

        if let Some(refusal) = choice.message.refusal.filter(|r| !r.is_empty()) {
            return Err(LlmError::ResponseParse {
                message: format!("model refused: {refusal}"),
            });
        }
        if choice.finish_reason.as_deref() == Some("length") {
            warn!(%model, "Reply truncated at max_tokens");
        }
        Ok(CompletionResponse {
            text: choice.message.content.unwrap_or_default(),
            usage: TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
            model,
            finish_reason: choice.finish_reason,
        })
    }

    fn status_error(status: StatusCode, headers: &HeaderMap, error: &ApiError) -> LlmError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed {
                provider: format!("chat completions ({})", error.message),
            },
            StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
                retry_after_secs: retry_after(headers, &error.message),
            },
            s if s.is_server_error() => LlmError::ApiRequest {
                message: format!("Server error ({}): {}", s.as_u16(), error.message),
            },
            s => LlmError::ApiRequest {
                message: match &error.code {
                    Some(code) => format!("HTTP {} [{code}]: {}", s.as_u16(), error.message),
                    None => format!("HTTP {}: {}", s.as_u16(), error.message),
                },
            },
        }
    }

    async fn post(&self, body: &ChatBody<'_>) -> Result<(StatusCode, HeaderMap, String), LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        timeout_secs: self.timeout_secs,
                    }
                } else if e.is_connect() {
                    LlmError::Connection {
                        message: e.to_string(),
                    }
                } else {
                    LlmError::ApiRequest {
                        message: format!("Request failed: {e}"),
                    }
                }
            })?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.map_err(|e| LlmError::Connection {
            message: format!("reading completion body: {e}"),
        })?;
        Ok((status, headers, text))
    }
}

/// Seconds to wait after a 429: the `Retry-After` header, else the
/// "try again in 20s" hint in the message.
fn retry_after(headers: &HeaderMap, message: &str) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|secs| secs.ceil() as u64)
        .or_else(|| {
            let hint = message.rsplit("in ").next()?;
            let secs = hint.trim().trim_end_matches('.').trim_end_matches('s');
            secs.parse::<f64>().ok().map(|s| s.ceil() as u64)
        })
        .unwrap_or(DEFAULT_RATE_LIMIT_WAIT_SECS)
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.body(&request);
        debug!(endpoint = %self.endpoint, model = body.model, json = body.response_format.is_some(), "Chat completion");
        let (mut status, mut headers, mut raw) = self.post(&body).await?;

        if status == StatusCode::BAD_REQUEST && body.response_format.is_some() {
            let error = ApiError::from_body(&raw);
            if error.rejects_json_mode() {
                warn!(endpoint = %self.endpoint, "Endpoint rejects response_format, sending plain requests");
                self.json_mode.store(false, Ordering::Relaxed);
                (status, headers, raw) = self.post(&self.body(&request)).await?;
            }
        }

        if !status.is_success() {
            return Err(Self::status_error(status, &headers, &ApiError::from_body(&raw)));
        }
        Self::read_reply(&raw, &self.model)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn test_config() -> LlmConfig {
        LlmConfig {
            api_key_env: "DEEPTREE_TEST_OPENAI_KEY_UNSET".to_string(),
            ..LlmConfig::default()
        }
    }

    fn provider() -> OpenAiCompatibleProvider {
        OpenAiCompatibleProvider::new_with_key(&test_config(), "sk-test".into()).unwrap()
    }

    fn judgment_request() -> CompletionRequest {
        CompletionRequest::prompt("You are a careful examiner", "TASK: MASKING_TEST")
            .with_temperature(0.0)
            .with_max_tokens(256)
            .expecting_json()
    }

    #[test]
    fn test_judgment_body_asks_for_json_object() {
        let p = provider();
        let request = judgment_request();
        let body = serde_json::to_value(p.body(&request)).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "TASK: MASKING_TEST");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_free_text_body_has_no_format() {
        let p = provider();
        let request = CompletionRequest::prompt("system", "user");
        let body = serde_json::to_value(p.body(&request)).unwrap();
        assert!(body.get("response_format").is_none());
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_json_mode_off_in_config() {
        let config = LlmConfig {
            json_mode: false,
            ..test_config()
        };
        let p = OpenAiCompatibleProvider::new_with_key(&config, "sk-test".into()).unwrap();
        let request = judgment_request();
        assert!(p.body(&request).response_format.is_none());
    }

    #[test]
    fn test_read_reply() {
        let raw = r#"{
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{
                "message": {"role": "assistant", "content": "{\"necessity_score\": 0.9}"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
        }"#;
        let resp = OpenAiCompatibleProvider::read_reply(raw, "gpt-4o-mini").unwrap();
        assert_eq!(resp.text, "{\"necessity_score\": 0.9}");
        assert_eq!(resp.usage.total(), 16);
        assert_eq!(resp.model, "gpt-4o-mini-2024-07-18");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_read_reply_without_usage_or_model() {
        let raw = r#"{"choices": [{"message": {"content": "{}"}, "finish_reason": "length"}]}"#;
        let resp = OpenAiCompatibleProvider::read_reply(raw, "llama3").unwrap();
        assert_eq!(resp.model, "llama3");
        assert_eq!(resp.usage.total(), 0);
        assert_eq!(resp.finish_reason.as_deref(), Some("length"));
    }

    #[test]
    fn test_read_reply_refusal_and_missing_choices() {
        let refused = r#"{"choices": [{"message": {"content": null, "refusal": "I can't help with that."}}]}"#;
        let err = OpenAiCompatibleProvider::read_reply(refused, "m").unwrap_err();
        assert!(err.to_string().contains("refused"));

        let err = OpenAiCompatibleProvider::read_reply(r#"{"choices": []}"#, "m").unwrap_err();
        assert!(matches!(err, LlmError::ResponseParse { .. }));
        assert!(OpenAiCompatibleProvider::read_reply("<html>", "m").is_err());
    }

    #[test]
    fn test_status_errors() {
        let none = HeaderMap::new();
        let err = OpenAiCompatibleProvider::status_error(
            StatusCode::UNAUTHORIZED,
            &none,
            &ApiError::from_body(r#"{"error": {"message": "Incorrect API key"}}"#),
        );
        assert!(matches!(err, LlmError::AuthFailed { .. }));

        let err = OpenAiCompatibleProvider::status_error(
            StatusCode::SERVICE_UNAVAILABLE,
            &none,
            &ApiError::from_body("overloaded"),
        );
        assert!(err.is_retryable());

        let err = OpenAiCompatibleProvider::status_error(
            StatusCode::BAD_REQUEST,
            &none,
            &ApiError::from_body(
                r#"{"error": {"message": "maximum context length exceeded", "code": "context_length_exceeded"}}"#,
            ),
        );
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("[context_length_exceeded]"));
    }

    #[test]
    fn test_rate_limit_wait() {
        let message = "Rate limit reached. Please try again in 20s.";
        assert_eq!(retry_after(&HeaderMap::new(), message), 20);
        assert_eq!(retry_after(&HeaderMap::new(), "slow down"), DEFAULT_RATE_LIMIT_WAIT_SECS);

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        let err = OpenAiCompatibleProvider::status_error(
            StatusCode::TOO_MANY_REQUESTS,
            &headers,
            &ApiError::from_body(&format!(r#"{{"error": {{"message": "{message}"}}}}"#)),
        );
        assert!(matches!(err, LlmError::RateLimited { retry_after_secs: 7 }));
    }

    #[test]
    fn test_json_mode_rejection_detected() {
        let error = ApiError::from_body(
            r#"{"error": {"message": "Unrecognized request argument", "param": "response_format"}}"#,
        );
        assert!(error.rejects_json_mode());
        assert!(!ApiError::from_body(r#"{"error": {"message": "bad temperature"}}"#).rejects_json_mode());
        assert!(ApiError::from_body("unknown field response_format").rejects_json_mode());
    }

    #[test]
    fn test_new_without_key_fails() {
        let result = OpenAiCompatibleProvider::new(&test_config());
        assert!(matches!(result, Err(LlmError::AuthFailed { .. })));
    }

    #[test]
    fn test_local_endpoint_without_key() {
        let config = LlmConfig {
            base_url: Some("http://localhost:11434/v1/".to_string()),
            model: "llama3".to_string(),
            ..test_config()
        };
        let p = OpenAiCompatibleProvider::new(&config).unwrap();
        assert_eq!(p.endpoint, "http://localhost:11434/v1/chat/completions");
        assert_eq!(p.model_name(), "llama3");
    }
}
