//! Circular question detection.
//!
//! Scores a candidate question/answer pair against the session history with
//! several independent signals and keeps the strongest one:
//!
//! | signal | score |
//! |---|---|
//! | direct repetition (question word or answer character similarity) | similarity |
//! | semantic signature (same question type, same top-3 keywords) | 0.85 |
//! | reverse inclusion: candidate answer inside an existing question | 0.70 |
//! | reverse inclusion: existing answer inside the candidate question | 0.75 |
//! | temporal symmetry ("when" vs. a year answer, shared entities) | 0.65 |
//! | keyword subset/superset | 0.45 + 0.4 * jaccard |
//!
//! Question similarity and semantic signatures are checked against the whole
//! session. Answer-based signals only look at the candidate's own tree: a
//! repeated answer across unrelated documents is not a loop.

use crate::config::CircularConfig;
use crate::history::{HistoryEntry, SessionHistory};
use crate::model::{CircularRisk, RecommendedAction, RiskLevel, RiskSignal};
use crate::text::{self, QuestionType};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

const SEMANTIC_SIGNATURE_SCORE: f64 = 0.85;
const ANSWER_IN_EXISTING_QUESTION: f64 = 0.7;
const EXISTING_ANSWER_IN_QUESTION: f64 = 0.75;
const TEMPORAL_SYMMETRY_SCORE: f64 = 0.65;
const KEYWORD_OVERLAP_BASE: f64 = 0.45;
const KEYWORD_OVERLAP_SPAN: f64 = 0.4;

/// The pair being checked.
///
/// Before any search the question is unknown and the answer is the parent
/// keyword the child is expected to resolve to.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub question: Option<String>,
    pub answer: String,
    pub keywords: Vec<String>,
    pub parent_id: Option<Uuid>,
    pub tree_id: Uuid,
}

impl CandidatePair {
    /// Pre-search candidate: only the expected answer is known.
    pub fn expected_answer(answer: impl Into<String>, parent_id: Uuid, tree_id: Uuid) -> Self {
        Self {
            question: None,
            answer: answer.into(),
            keywords: Vec::new(),
            parent_id: Some(parent_id),
            tree_id,
        }
    }

    /// Post-generation candidate. Keywords are not extracted yet, so the
    /// question's entities and years stand in for them.
    pub fn generated(
        question: impl Into<String>,
        answer: impl Into<String>,
        parent_id: Uuid,
        tree_id: Uuid,
    ) -> Self {
        let question = question.into();
        let answer = answer.into();
        let mut keywords: Vec<String> = text::capitalized_entities(&question);
        keywords.extend(text::extract_years(&question));
        keywords.retain(|k| !text::contains_phrase(k, &answer));
        Self {
            question: Some(question),
            answer,
            keywords,
            parent_id: Some(parent_id),
            tree_id,
        }
    }
}

impl CandidatePair {
    /// Replace the stand-in keywords with the node's minimal keyword set.
    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }
}

/// One signal's contribution.
#[derive(Debug, Clone)]
struct SignalHit {
    score: f64,
    signal: RiskSignal,
    reason: String,
}

pub struct CircularDetector {
    config: CircularConfig,
}

impl CircularDetector {
    pub fn new(config: CircularConfig) -> Self {
        Self { config }
    }

    /// Assess `candidate` against every entry of `history`.
    pub fn assess(&self, candidate: &CandidatePair, history: &SessionHistory) -> CircularRisk {
        let mut best: Option<SignalHit> = None;
        for entry in history.entries() {
            for hit in self.signals(candidate, entry) {
                if best.as_ref().is_none_or(|b| hit.score > b.score) {
                    best = Some(hit);
                }
            }
        }

        let Some(hit) = best else {
            return CircularRisk::none();
        };
        let (risk_level, recommended_action) = self.classify(hit.score);
        debug!(
            answer = %candidate.answer,
            score = hit.score,
            risk = ?risk_level,
            signal = ?hit.signal,
            "Circular risk assessed"
        );
        CircularRisk {
            similarity_score: hit.score,
            risk_level,
            should_skip: risk_level == RiskLevel::Critical,
            recommended_action,
            reason: hit.reason,
            signal: if risk_level == RiskLevel::Low && hit.score == 0.0 {
                RiskSignal::None
            } else {
                hit.signal
            },
        }
    }

    /// Map a score to its risk level and action.
    pub fn classify(&self, score: f64) -> (RiskLevel, RecommendedAction) {
        let c = &self.config;
        if score > c.critical_threshold {
            (RiskLevel::Critical, RecommendedAction::Skip)
        } else if score >= c.high_threshold {
            (RiskLevel::High, RecommendedAction::RetryDomainExpanded)
        } else if score >= c.medium_threshold {
            (RiskLevel::Medium, RecommendedAction::RetryMultiAngle)
        } else {
            (RiskLevel::Low, RecommendedAction::Proceed)
        }
    }

    fn signals(&self, candidate: &CandidatePair, entry: &HistoryEntry) -> Vec<SignalHit> {
        let mut hits = Vec::new();
        let same_tree = entry.tree_id == candidate.tree_id;
        let is_parent = candidate.parent_id == Some(entry.node_id);

        // direct repetition
        if let Some(q) = &candidate.question {
            let s = text::token_similarity(q, &entry.question);
            hits.push(SignalHit {
                score: s,
                signal: RiskSignal::DirectRepetition,
                reason: format!("question {:.2} similar to \"{}\"", s, entry.question),
            });
        }
        if same_tree {
            let s = text::similarity(&candidate.answer, &entry.answer);
            if s >= self.config.direct_repetition_threshold {
                hits.push(SignalHit {
                    score: s,
                    signal: RiskSignal::DirectRepetition,
                    reason: format!(
                        "answer \"{}\" repeats existing answer \"{}\" ({:.2})",
                        candidate.answer, entry.answer, s
                    ),
                });
            }
        }

        // semantic signature
        if let Some(q) = &candidate.question
            && QuestionType::classify(q) == QuestionType::classify(&entry.question)
        {
            let a = top_keywords(&candidate.keywords);
            let b = top_keywords(&entry.keywords);
            if !a.is_empty() && a == b {
                hits.push(SignalHit {
                    score: SEMANTIC_SIGNATURE_SCORE,
                    signal: RiskSignal::SemanticSignature,
                    reason: format!("same question type and keywords as \"{}\"", entry.question),
                });
            }
        }

        if !same_tree {
            return hits;
        }

        // reverse inclusion
        if !is_parent && text::contains_phrase(&entry.question, &candidate.answer) {
            hits.push(SignalHit {
                score: ANSWER_IN_EXISTING_QUESTION,
                signal: RiskSignal::ReverseInclusion,
                reason: format!(
                    "answer \"{}\" already appears in \"{}\"",
                    candidate.answer, entry.question
                ),
            });
        }
        if let Some(q) = &candidate.question
            && text::contains_phrase(q, &entry.answer)
        {
            hits.push(SignalHit {
                score: EXISTING_ANSWER_IN_QUESTION,
                signal: RiskSignal::ReverseInclusion,
                reason: format!("question contains existing answer \"{}\"", entry.answer),
            });
        }

        // temporal symmetry
        let candidate_text = candidate.question.as_deref().unwrap_or(&candidate.answer);
        let candidate_asks_when = candidate
            .question
            .as_deref()
            .is_some_and(|q| QuestionType::classify(q) == QuestionType::When);
        let entry_asks_when = QuestionType::classify(&entry.question) == QuestionType::When;
        if (candidate_asks_when && text::has_year(&entry.answer))
            || (entry_asks_when && text::has_year(&candidate.answer))
        {
            let shared: Vec<String> = text::entity_set(candidate_text)
                .intersection(&text::entity_set(&entry.question))
                .cloned()
                .collect();
            if !shared.is_empty() {
                hits.push(SignalHit {
                    score: TEMPORAL_SYMMETRY_SCORE,
                    signal: RiskSignal::TemporalSymmetry,
                    reason: format!("temporal mirror of \"{}\" over {:?}", entry.question, shared),
                });
            }
        }

        // keyword subset / superset
        if !is_parent {
            let a = keyword_set(&candidate.keywords);
            let b = keyword_set(&entry.keywords);
            if !a.is_empty() && !b.is_empty() && (a.is_subset(&b) || b.is_subset(&a)) {
                let j = text::jaccard(&a, &b);
                hits.push(SignalHit {
                    score: KEYWORD_OVERLAP_BASE + KEYWORD_OVERLAP_SPAN * j,
                    signal: RiskSignal::KeywordOverlap,
                    reason: format!("keywords nest with \"{}\" (jaccard {:.2})", entry.question, j),
                });
            }
        }

        hits
    }
}

fn keyword_set(keywords: &[String]) -> HashSet<String> {
    keywords
        .iter()
        .map(|k| text::normalize(k))
        .filter(|k| !k.is_empty())
        .collect()
}

/// First three keywords, normalised, as a set.
fn top_keywords(keywords: &[String]) -> HashSet<String> {
    keywords
        .iter()
        .map(|k| text::normalize(k))
        .filter(|k| !k.is_empty())
        .take(3)
        .collect()
}
