//! Typed reasoning-tree data model.
//!
//! A [`ReasoningTree`] holds accepted [`QuestionNode`]s in insertion order.
//! [`ReasoningTree::accept`] is the only way in, and it enforces the
//! structural contracts of the tree:
//!
//! - hierarchy: a child's answer is exactly the parent keyword it extends, and
//!   that keyword belongs to the parent's validated keyword set;
//! - shortcut: no question contains its own answer or the answer of any
//!   ancestor;
//! - disjoint spans: sibling keywords occupy separate spans of the parent
//!   question, so each child can be spliced into the nested composite.

use crate::composite::CompositeQuery;
use crate::error::TreeError;
use crate::keywords;
use crate::text;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Semantic category of an answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerType {
    Name,
    Date,
    Number,
    Location,
    Organization,
    Technical,
    #[default]
    Other,
}

impl AnswerType {
    /// Best-effort guess from the answer text alone.
    pub fn infer(answer: &str) -> Self {
        let trimmed = answer.trim();
        if text::has_year(trimmed) && trimmed.len() <= 20 {
            return AnswerType::Date;
        }
        if trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == ',' || c.is_whitespace())
            && trimmed.chars().any(|c| c.is_ascii_digit())
        {
            return AnswerType::Number;
        }
        if trimmed.len() >= 2
            && trimmed.len() <= 8
            && trimmed.chars().all(|c| c.is_ascii_uppercase() || c == '-')
        {
            return AnswerType::Organization;
        }
        if trimmed.chars().next().is_some_and(char::is_uppercase) {
            return AnswerType::Name;
        }
        AnswerType::Other
    }
}

impl std::fmt::Display for AnswerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AnswerType::Name => "name",
            AnswerType::Date => "date",
            AnswerType::Number => "number",
            AnswerType::Location => "location",
            AnswerType::Organization => "organization",
            AnswerType::Technical => "technical",
            AnswerType::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// A candidate fact extracted from a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortAnswer {
    pub text: String,
    #[serde(default)]
    pub answer_type: AnswerType,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub source_excerpt: String,
    #[serde(default)]
    pub position: usize,
}

fn default_confidence() -> f64 {
    1.0
}

impl ShortAnswer {
    pub fn new(text: impl Into<String>, answer_type: AnswerType) -> Self {
        Self {
            text: text.into(),
            answer_type,
            confidence: 1.0,
            source_excerpt: String::new(),
            position: 0,
        }
    }
}

/// Input record: a document with its candidate short answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub short_answers: Vec<ShortAnswer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordType {
    ProperNoun,
    Numeric,
    Date,
    Technical,
    Other,
}

impl KeywordType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "proper_noun" | "name" | "entity" | "organization" | "location" => {
                KeywordType::ProperNoun
            }
            "numeric" | "number" | "quantity" => KeywordType::Numeric,
            "date" | "year" | "time" => KeywordType::Date,
            "technical" | "term" | "technical_term" => KeywordType::Technical,
            _ => KeywordType::Other,
        }
    }

    /// Answer type a child question gets when it extends this keyword.
    pub fn answer_type(self) -> AnswerType {
        match self {
            KeywordType::ProperNoun => AnswerType::Name,
            KeywordType::Numeric => AnswerType::Number,
            KeywordType::Date => AnswerType::Date,
            KeywordType::Technical => AnswerType::Technical,
            KeywordType::Other => AnswerType::Other,
        }
    }
}

/// A question keyword; `text` is the exact substring found in the question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub text: String,
    pub keyword_type: KeywordType,
    /// Set by the masking test; 1.0 before testing.
    pub necessity_score: f64,
    pub extraction_confidence: f64,
}

impl Keyword {
    pub fn new(text: impl Into<String>, keyword_type: KeywordType) -> Self {
        Self {
            text: text.into(),
            keyword_type,
            necessity_score: 1.0,
            extraction_confidence: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchType {
    Root,
    Series,
    Parallel,
}

/// How a child relates to its parent's reasoning thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionType {
    /// Drills deeper into the same thread.
    Series,
    /// Explores an adjacent concept at the same layer.
    Parallel,
}

impl From<ExtensionType> for BranchType {
    fn from(t: ExtensionType) -> Self {
        match t {
            ExtensionType::Series => BranchType::Series,
            ExtensionType::Parallel => BranchType::Parallel,
        }
    }
}

impl std::fmt::Display for ExtensionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtensionType::Series => write!(f, "series"),
            ExtensionType::Parallel => write!(f, "parallel"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMethod {
    DocumentGrounded,
    SearchExtension,
}

/// Outcome of dual validation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub validity_score: f64,
    pub uniqueness_score: f64,
    pub specificity_score: f64,
    pub issues: Vec<String>,
    pub validity_model: String,
    pub uniqueness_model: String,
    /// A judgment came from heuristic parsing or a failed call.
    pub fallback_used: bool,
}

impl ValidationResult {
    pub fn mean_score(&self) -> f64 {
        (self.validity_score + self.uniqueness_score) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Proceed,
    RetryMultiAngle,
    RetryDomainExpanded,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSignal {
    DirectRepetition,
    SemanticSignature,
    ReverseInclusion,
    TemporalSymmetry,
    KeywordOverlap,
    None,
}

/// Circularity assessment of a candidate pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircularRisk {
    pub similarity_score: f64,
    pub risk_level: RiskLevel,
    pub should_skip: bool,
    pub recommended_action: RecommendedAction,
    pub reason: String,
    pub signal: RiskSignal,
}

impl CircularRisk {
    pub fn none() -> Self {
        Self {
            similarity_score: 0.0,
            risk_level: RiskLevel::Low,
            should_skip: false,
            recommended_action: RecommendedAction::Proceed,
            reason: "no overlap with history".to_string(),
            signal: RiskSignal::None,
        }
    }
}

/// Query strategy for an extension, driven by circular risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionStrategy {
    Standard,
    MultiAngle,
    DomainExpanded,
}

impl From<RecommendedAction> for ExtensionStrategy {
    fn from(action: RecommendedAction) -> Self {
        match action {
            RecommendedAction::RetryMultiAngle => ExtensionStrategy::MultiAngle,
            RecommendedAction::RetryDomainExpanded => ExtensionStrategy::DomainExpanded,
            RecommendedAction::Proceed | RecommendedAction::Skip => ExtensionStrategy::Standard,
        }
    }
}

/// A web source that fed a synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub title: String,
    pub url: Option<String>,
    pub credibility: f64,
}

/// Search-grounded context a child question was written from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionContext {
    pub original_keyword: String,
    pub extension_type: ExtensionType,
    pub strategy: ExtensionStrategy,
    pub search_query: String,
    pub synthesized_context: String,
    pub facts: Vec<String>,
    pub confidence: f64,
    pub sources: Vec<SourceRef>,
    /// Attempts made, including the successful one.
    pub attempts: usize,
    /// Search calls actually issued (cache hits excluded).
    pub search_calls: usize,
}

/// One accepted question/answer pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionNode {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub parent_keyword: Option<String>,
    pub question_text: String,
    pub answer: String,
    pub answer_type: AnswerType,
    pub layer_level: usize,
    pub branch_type: BranchType,
    pub keywords: Vec<Keyword>,
    pub validation: ValidationResult,
    pub validation_passed: bool,
    pub generation_method: GenerationMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<ExtensionContext>,
    pub compliance_score: f64,
    pub created_at: DateTime<Utc>,
}

impl QuestionNode {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn keyword_texts(&self) -> Vec<String> {
        self.keywords.iter().map(|k| k.text.clone()).collect()
    }

    pub fn has_keyword(&self, text: &str) -> bool {
        self.keywords.iter().any(|k| k.text == text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeStatus {
    Building,
    Complete,
    Cancelled,
}

/// The reasoning tree of one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningTree {
    pub tree_id: Uuid,
    pub document_id: String,
    pub root_id: Option<Uuid>,
    /// Accepted nodes in acceptance order.
    pub nodes: Vec<QuestionNode>,
    pub max_layers: usize,
    pub composites: Vec<CompositeQuery>,
    pub status: TreeStatus,
}

impl ReasoningTree {
    pub fn new(document_id: impl Into<String>, max_layers: usize) -> Self {
        Self {
            tree_id: Uuid::new_v4(),
            document_id: document_id.into(),
            root_id: None,
            nodes: Vec::new(),
            max_layers,
            composites: Vec::new(),
            status: TreeStatus::Building,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<&QuestionNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn root(&self) -> Option<&QuestionNode> {
        self.root_id.and_then(|id| self.get(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Deepest layer reached (0 for a root-only or empty tree).
    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|n| n.layer_level).max().unwrap_or(0)
    }

    pub fn children(&self, id: Uuid) -> Vec<&QuestionNode> {
        self.nodes
            .iter()
            .filter(|n| n.parent_id == Some(id))
            .collect()
    }

    /// Ancestors of `id`, nearest first, ending at the root.
    pub fn ancestors(&self, id: Uuid) -> Vec<&QuestionNode> {
        let mut out = Vec::new();
        let mut current = self.get(id).and_then(|n| n.parent_id);
        while let Some(pid) = current {
            match self.get(pid) {
                Some(parent) => {
                    out.push(parent);
                    current = parent.parent_id;
                }
                None => break,
            }
        }
        out
    }

    /// Nodes from the root down to `id`, inclusive.
    pub fn path_to(&self, id: Uuid) -> Vec<&QuestionNode> {
        let Some(node) = self.get(id) else {
            return Vec::new();
        };
        let mut path = self.ancestors(id);
        path.reverse();
        path.push(node);
        path
    }

    /// Answers of `id` and all its ancestors.
    pub fn lineage_answers(&self, id: Uuid) -> Vec<String> {
        self.path_to(id).iter().map(|n| n.answer.clone()).collect()
    }

    /// Whether `node` satisfies the hierarchy contract against this tree.
    pub fn hierarchy_holds(&self, node: &QuestionNode) -> bool {
        self.check_hierarchy(node).is_ok()
    }

    fn check_hierarchy(&self, node: &QuestionNode) -> Result<(), TreeError> {
        let Some(parent_id) = node.parent_id else {
            return Ok(());
        };
        let parent = self.get(parent_id).ok_or_else(|| TreeError::UnknownParent {
            id: parent_id.to_string(),
        })?;
        let expected = node.parent_keyword.clone().unwrap_or_default();
        if expected.is_empty() || node.answer != expected || !parent.has_keyword(&expected) {
            return Err(TreeError::HierarchyViolation {
                expected,
                actual: node.answer.clone(),
            });
        }
        Ok(())
    }

    /// Byte range of `keyword` in the question of `parent_id`.
    fn keyword_span(&self, parent_id: Uuid, keyword: &str) -> Option<std::ops::Range<usize>> {
        let parent = self.get(parent_id)?;
        let start = keywords::locate(&parent.question_text, keyword)?;
        Some(start..start + keyword.trim().len())
    }

    /// Accepted child of `parent_id` whose keyword span overlaps `keyword`'s.
    pub fn overlapping_sibling(&self, parent_id: Uuid, keyword: &str) -> Option<&QuestionNode> {
        let span = self.keyword_span(parent_id, keyword)?;
        self.children(parent_id).into_iter().find(|sibling| {
            sibling
                .parent_keyword
                .as_deref()
                .and_then(|k| self.keyword_span(parent_id, k))
                .is_some_and(|other| span.start < other.end && other.start < span.end)
        })
    }

    /// First answer (own or ancestor) leaked by `node`'s question, if any.
    pub fn shortcut_leak(&self, node: &QuestionNode) -> Option<String> {
        if text::contains_phrase(&node.question_text, &node.answer) {
            return Some(node.answer.clone());
        }
        let mut current = node.parent_id;
        while let Some(pid) = current {
            let ancestor = self.get(pid)?;
            if text::contains_phrase(&node.question_text, &ancestor.answer) {
                return Some(ancestor.answer.clone());
            }
            current = ancestor.parent_id;
        }
        None
    }

    /// Insert an accepted node after checking the tree contracts.
    pub fn accept(&mut self, node: QuestionNode) -> Result<(), TreeError> {
        if self.get(node.id).is_some() {
            return Err(TreeError::DuplicateNode {
                id: node.id.to_string(),
            });
        }
        match node.parent_id {
            None => {
                if self.root_id.is_some() {
                    return Err(TreeError::RootAlreadySet);
                }
                if node.layer_level != 0 {
                    return Err(TreeError::LayerOutOfBounds {
                        layer: node.layer_level,
                        max_layers: self.max_layers,
                    });
                }
            }
            Some(parent_id) => {
                if self.root_id.is_none() {
                    return Err(TreeError::MissingRoot);
                }
                let parent_layer = self
                    .get(parent_id)
                    .map(|p| p.layer_level)
                    .ok_or_else(|| TreeError::UnknownParent {
                        id: parent_id.to_string(),
                    })?;
                if node.layer_level != parent_layer + 1 || node.layer_level > self.max_layers {
                    return Err(TreeError::LayerOutOfBounds {
                        layer: node.layer_level,
                        max_layers: self.max_layers,
                    });
                }
                self.check_hierarchy(&node)?;
                let keyword = node.parent_keyword.as_deref().unwrap_or_default();
                if let Some(sibling) = self.overlapping_sibling(parent_id, keyword) {
                    return Err(TreeError::KeywordSpanOverlap {
                        keyword: keyword.to_string(),
                        sibling: sibling.parent_keyword.clone().unwrap_or_default(),
                    });
                }
            }
        }
        if let Some(leaked) = self.shortcut_leak(&node) {
            return Err(TreeError::ShortcutViolation { leaked });
        }
        if node.parent_id.is_none() {
            self.root_id = Some(node.id);
        }
        self.nodes.push(node);
        Ok(())
    }
}
