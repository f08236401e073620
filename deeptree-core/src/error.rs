//! Error types for the DeepTree core library.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering LLM, search, configuration, tree-contract, and export domains.
//!
//! Policy violations (circular risk, compliance failures, shortcut leaks) are
//! not errors: the orchestrator recovers from them by retrying or rejecting the
//! branch. Only capability failures, configuration problems and tree-contract
//! violations travel through these types.

use std::path::PathBuf;

/// Top-level error type for the DeepTree core library.
#[derive(Debug, thiserror::Error)]
pub enum DeepTreeError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from LLM provider interactions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Circuit breaker open, cooling down for {cooldown_secs}s")]
    CircuitOpen { cooldown_secs: u64 },
}

impl LlmError {
    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Timeout { .. } | LlmError::Connection { .. }
        ) || matches!(self, LlmError::ApiRequest { message } if message.starts_with("Server error"))
    }
}

/// Errors from web search interactions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error("Search request failed: {message}")]
    Request { message: String },

    #[error("Search response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Search timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Violations of the reasoning-tree contract.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TreeError {
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Tree already has a root node")]
    RootAlreadySet,

    #[error("Tree has no root node")]
    MissingRoot,

    #[error("Unknown parent node: {id}")]
    UnknownParent { id: String },

    #[error("Node already accepted: {id}")]
    DuplicateNode { id: String },

    #[error("Hierarchy violation: answer '{actual}' does not match parent keyword '{expected}'")]
    HierarchyViolation { expected: String, actual: String },

    #[error("Shortcut violation: question leaks '{leaked}'")]
    ShortcutViolation { leaked: String },

    #[error("Layer {layer} is outside the tree bound of {max_layers}")]
    LayerOutOfBounds { layer: usize, max_layers: usize },

    #[error("Keyword '{keyword}' overlaps sibling keyword '{sibling}' in the parent question")]
    KeywordSpanOverlap { keyword: String, sibling: String },
}

/// A type alias for results using the top-level `DeepTreeError`.
pub type Result<T> = std::result::Result<T, DeepTreeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_llm() {
        let err = DeepTreeError::Llm(LlmError::ApiRequest {
            message: "connection refused".into(),
        });
        assert_eq!(
            err.to_string(),
            "LLM error: API request failed: connection refused"
        );
    }

    #[test]
    fn test_error_display_tree() {
        let err = DeepTreeError::Tree(TreeError::HierarchyViolation {
            expected: "NASA".into(),
            actual: "ESA".into(),
        });
        assert_eq!(
            err.to_string(),
            "Tree error: Hierarchy violation: answer 'ESA' does not match parent keyword 'NASA'"
        );
    }

    #[test]
    fn test_error_display_search() {
        let err = DeepTreeError::Search(SearchError::Timeout { timeout_secs: 10 });
        assert_eq!(err.to_string(), "Search error: Search timed out after 10s");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DeepTreeError = io_err.into();
        assert!(matches!(err, DeepTreeError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: DeepTreeError = serde_err.into();
        assert!(matches!(err, DeepTreeError::Serialization(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::RateLimited { retry_after_secs: 1 }.is_retryable());
        assert!(LlmError::Timeout { timeout_secs: 30 }.is_retryable());
        assert!(
            LlmError::ApiRequest {
                message: "Server error (503): overloaded".into()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::AuthFailed {
                provider: "openai".into()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::ResponseParse {
                message: "bad".into()
            }
            .is_retryable()
        );
    }
}
