//! # DeepTree Core
//!
//! Engine for synthetic multi-hop reasoning trees. A document-grounded root
//! question is extended layer by layer: keywords of an accepted question are
//! verified by masking, screened for circularity, researched through web
//! search and turned into child questions whose answer is that keyword. The
//! finished tree is collapsed into composite questions and every step is
//! recorded in a trajectory.

pub mod brain;
pub mod circular;
pub mod compliance;
pub mod composite;
pub mod config;
pub mod corpus;
pub mod error;
pub mod export;
pub mod extension;
pub mod generation;
pub mod history;
pub mod judgment;
pub mod keywords;
pub mod model;
pub mod orchestrator;
pub mod pool;
pub mod prompts;
pub mod providers;
pub mod search;
pub mod state;
pub mod text;
pub mod trajectory;
pub mod types;
pub mod validator;

// Re-export commonly used types at the crate root.
pub use brain::{Brain, LlmProvider, MockLlmProvider};
pub use circular::{CandidatePair, CircularDetector};
pub use compliance::{ComplianceEnforcer, CompliancePhase, ComplianceReport, ComplianceStatus};
pub use composite::{CompositeIntegrator, CompositeKind, CompositeQuery, CompositeTier};
pub use config::{DeepTreeConfig, load_config};
pub use error::{DeepTreeError, Result};
pub use history::SessionHistory;
pub use model::{
    AnswerType, BranchType, CircularRisk, Document, ExtensionContext, ExtensionType, Keyword,
    KeywordType, QuestionNode, ReasoningTree, RiskLevel, ShortAnswer, TreeStatus,
    ValidationResult,
};
pub use orchestrator::{DocumentResult, TreeOrchestrator};
pub use search::{DuckDuckGoSearch, MockSearchProvider, SearchClient, SearchProvider, SearchResult};
pub use state::{NodeLifecycle, NodeState};
pub use trajectory::{ProcessStep, StepType, Trajectory, TrajectoryStats};
pub use types::{CompletionRequest, CompletionResponse, Message, Role, TokenUsage};
