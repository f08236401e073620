//! Configuration system for DeepTree.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config -> environment variables -> explicit overrides.
//!
//! Every risk and acceptance threshold lives here. The pipeline only relies on
//! their ordering (low < medium < high < critical, conditional < pass), which
//! [`DeepTreeConfig::validate`] enforces.

use crate::error::ConfigError;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for a tree-construction run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepTreeConfig {
    pub llm: LlmConfig,
    /// Optional second model used for the uniqueness judgment so the two
    /// validators are independent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validator_llm: Option<LlmConfig>,
    pub search: SearchConfig,
    pub tree: TreeConfig,
    pub root: RootConfig,
    pub child: ChildConfig,
    pub minimality: MinimalityConfig,
    pub circular: CircularConfig,
    pub extension: ExtensionConfig,
    pub compliance: ComplianceConfig,
    pub resilience: ResilienceConfig,
    pub integration: IntegrationConfig,
    pub output: OutputConfig,
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name: "openai" or any OpenAI-compatible endpoint.
    pub provider: String,
    /// Model identifier (e.g., "gpt-4o-mini").
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Optional base URL override for the API endpoint.
    pub base_url: Option<String>,
    /// Temperature for generation prompts.
    pub temperature: f32,
    /// Temperature for judgment prompts (validation, masking, synthesis).
    pub judge_temperature: f32,
    /// Maximum tokens to generate in a response.
    pub max_tokens: usize,
    pub request_timeout_secs: u64,
    /// Send `response_format: json_object`. Endpoints that reject it are
    /// detected and the field is dropped for the rest of the run.
    pub json_mode: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            temperature: 0.7,
            judge_temperature: 0.0,
            max_tokens: 1024,
            request_timeout_secs: 60,
            json_mode: true,
        }
    }
}

/// Web search provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Provider name: "duckduckgo".
    pub provider: String,
    pub max_results: usize,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: "duckduckgo".to_string(),
            max_results: 8,
            timeout_secs: 10,
            user_agent: "DeepTree/0.3".to_string(),
        }
    }
}

/// Shape bounds of one reasoning tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Number of layers below the root. Root is layer 0; nodes on layer
    /// `max_layers` are never extended.
    pub max_layers: usize,
    pub max_children_per_node: usize,
    pub max_nodes: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_layers: 3,
            max_children_per_node: 2,
            max_nodes: 16,
        }
    }
}

/// Root question generation and validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    pub max_attempts: usize,
    pub validity_threshold: f64,
    pub uniqueness_threshold: f64,
    /// Short answers below this extraction confidence are never tried.
    pub min_answer_confidence: f64,
    /// Document text is truncated to this many characters in prompts.
    pub max_document_chars: usize,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            validity_threshold: 0.7,
            uniqueness_threshold: 0.7,
            min_answer_confidence: 0.3,
            max_document_chars: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildConfig {
    /// Question generations per successful extension.
    pub max_generation_attempts: usize,
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            max_generation_attempts: 2,
        }
    }
}

/// Keyword extraction and masking tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimalityConfig {
    /// A keyword is necessary when its necessity score is strictly above this.
    pub necessity_threshold: f64,
    /// Width of the masking worker pool.
    pub workers: usize,
    pub max_keywords: usize,
    /// Run a joint test over all dropped keywords.
    pub verify_sufficiency: bool,
}

impl Default for MinimalityConfig {
    fn default() -> Self {
        Self {
            necessity_threshold: 0.5,
            workers: 3,
            max_keywords: 6,
            verify_sufficiency: true,
        }
    }
}

/// Circular-risk thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircularConfig {
    pub medium_threshold: f64,
    pub high_threshold: f64,
    pub critical_threshold: f64,
    /// Answer similarity at or above this counts as direct repetition.
    pub direct_repetition_threshold: f64,
    /// Rolling window of session history entries.
    pub max_history: usize,
}

impl Default for CircularConfig {
    fn default() -> Self {
        Self {
            medium_threshold: 0.4,
            high_threshold: 0.6,
            critical_threshold: 0.8,
            direct_repetition_threshold: 0.9,
            max_history: 500,
        }
    }
}

/// Search-grounded extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    /// Search-call budget per extension. Values above 3 are capped.
    pub max_attempts: usize,
    pub min_confidence: f64,
    pub top_results: usize,
    pub cache_capacity: usize,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_confidence: 0.6,
            top_results: 3,
            cache_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    pub pass_threshold: f64,
    pub conditional_threshold: f64,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 0.8,
            conditional_threshold: 0.65,
        }
    }
}

/// Retry, circuit breaker and rate limiting for upstream calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_retries: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Number of recent attempts the breaker looks at.
    pub breaker_window: usize,
    /// Failures within the window that open the breaker.
    pub breaker_failure_threshold: usize,
    pub breaker_cooldown_secs: u64,
    /// 0 disables rate limiting.
    pub requests_per_minute: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 32_000,
            breaker_window: 20,
            breaker_failure_threshold: 15,
            breaker_cooldown_secs: 60,
            requests_per_minute: 0,
        }
    }
}

/// Which model-written composite variants to attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    pub llm_integrated: bool,
    pub ambiguous: bool,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            llm_integrated: true,
            ambiguous: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("deeptree-output"),
        }
    }
}

impl DeepTreeConfig {
    /// Reject configurations whose values contradict each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.circular;
        if !(0.0 < c.medium_threshold
            && c.medium_threshold < c.high_threshold
            && c.high_threshold < c.critical_threshold
            && c.critical_threshold <= 1.0)
        {
            return Err(ConfigError::Invalid {
                message: format!(
                    "circular thresholds must satisfy 0 < medium < high < critical <= 1 (got {} / {} / {})",
                    c.medium_threshold, c.high_threshold, c.critical_threshold
                ),
            });
        }
        if self.compliance.conditional_threshold >= self.compliance.pass_threshold {
            return Err(ConfigError::Invalid {
                message: format!(
                    "compliance.conditional_threshold ({}) must be below pass_threshold ({})",
                    self.compliance.conditional_threshold, self.compliance.pass_threshold
                ),
            });
        }
        if self.minimality.workers == 0 {
            return Err(ConfigError::Invalid {
                message: "minimality.workers must be at least 1".into(),
            });
        }
        if self.tree.max_layers == 0 {
            return Err(ConfigError::Invalid {
                message: "tree.max_layers must be at least 1".into(),
            });
        }
        if self.root.max_attempts == 0 || self.extension.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "root.max_attempts and extension.max_attempts must be at least 1".into(),
            });
        }
        if self.resilience.breaker_failure_threshold > self.resilience.breaker_window {
            return Err(ConfigError::Invalid {
                message: format!(
                    "resilience.breaker_failure_threshold ({}) exceeds breaker_window ({})",
                    self.resilience.breaker_failure_threshold, self.resilience.breaker_window
                ),
            });
        }
        Ok(())
    }

    /// Serialize to the TOML form written by `deeptree config init`.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".deeptree").join("config.toml")
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "deeptree", "deeptree")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration by merging layers in priority order (highest last):
///
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DEEPTREE_`)
/// 3. Workspace-local config (`.deeptree/config.toml`)
/// 4. User config (`~/.config/deeptree/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&DeepTreeConfig>,
) -> Result<DeepTreeConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(DeepTreeConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // DEEPTREE_TREE__MAX_LAYERS, DEEPTREE_LLM__MODEL, ...
    figment = figment.merge(Env::prefixed("DEEPTREE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeepTreeConfig::default();
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.tree.max_layers, 3);
        assert_eq!(config.minimality.workers, 3);
        assert_eq!(config.extension.max_attempts, 3);
        assert!(config.validator_llm.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = DeepTreeConfig::default();
        let toml_str = config.to_toml().unwrap();
        let back: DeepTreeConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.llm.model, config.llm.model);
        assert_eq!(back.circular.critical_threshold, 0.8);
        assert_eq!(back.output.dir, PathBuf::from("deeptree-output"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: DeepTreeConfig = toml::from_str("[tree]\nmax_layers = 5\n").unwrap();
        assert_eq!(config.tree.max_layers, 5);
        assert_eq!(config.tree.max_children_per_node, 2);
        assert_eq!(config.root.max_attempts, 3);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = DeepTreeConfig::default();
        overrides.llm.model = "judge-large".to_string();
        overrides.tree.max_nodes = 40;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.llm.model, "judge-large");
        assert_eq!(config.tree.max_nodes, 40);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".deeptree");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            r#"
[minimality]
workers = 5

[circular]
critical_threshold = 0.85
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.minimality.workers, 5);
        assert_eq!(config.circular.critical_threshold, 0.85);
        assert_eq!(config.circular.high_threshold, 0.6);
    }

    #[test]
    fn test_validate_threshold_ordering() {
        let mut config = DeepTreeConfig::default();
        config.circular.high_threshold = 0.9;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("medium < high < critical"));

        let mut config = DeepTreeConfig::default();
        config.compliance.conditional_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_workers() {
        let mut config = DeepTreeConfig::default();
        config.minimality.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_breaker_window() {
        let mut config = DeepTreeConfig::default();
        config.resilience.breaker_failure_threshold = 25;
        assert!(config.validate().is_err());
    }
}
