//! Dual validation: two independent judgments per question.
//!
//! Validity asks whether the question is answerable strictly from the evidence;
//! uniqueness asks whether the evidence admits exactly one answer. The two
//! judgments may run on different providers so one model never grades itself
//! on both axes. Specificity is computed locally.

use crate::brain::Brain;
use crate::config::RootConfig;
use crate::judgment;
use crate::model::ValidationResult;
use crate::prompts;
use crate::text;
use std::sync::Arc;
use tracing::{debug, warn};

const SCORE_KEYS: &[&str] = &["score", "validity", "validity_score", "uniqueness", "uniqueness_score", "unique"];

pub struct DualValidator {
    validity_brain: Arc<Brain>,
    uniqueness_brain: Arc<Brain>,
    validity_threshold: f64,
    uniqueness_threshold: f64,
    max_evidence_chars: usize,
}

struct Verdict {
    score: f64,
    reason: String,
    alternatives: Vec<String>,
    fallback_used: bool,
}

impl DualValidator {
    /// `secondary` judges uniqueness when given; otherwise `primary` does both.
    pub fn new(primary: Arc<Brain>, secondary: Option<Arc<Brain>>, config: &RootConfig) -> Self {
        let uniqueness_brain = secondary.unwrap_or_else(|| primary.clone());
        Self {
            validity_brain: primary,
            uniqueness_brain,
            validity_threshold: config.validity_threshold,
            uniqueness_threshold: config.uniqueness_threshold,
            max_evidence_chars: config.max_document_chars,
        }
    }

    pub fn is_independent(&self) -> bool {
        !Arc::ptr_eq(&self.validity_brain, &self.uniqueness_brain)
    }

    pub async fn validate(&self, question: &str, answer: &str, evidence: &str) -> ValidationResult {
        let evidence = text::truncate_chars(evidence, self.max_evidence_chars);

        // independent judgments, issued together
        let (validity, uniqueness) = tokio::join!(
            self.ask(
                &self.validity_brain,
                prompts::validity_judgment(question, answer, evidence),
                "validity",
            ),
            self.ask(
                &self.uniqueness_brain,
                prompts::uniqueness_judgment(question, answer, evidence),
                "uniqueness",
            ),
        );

        let mut issues = Vec::new();
        if validity.score < self.validity_threshold {
            issues.push(format!(
                "validity {:.2} below {:.2}: {}",
                validity.score, self.validity_threshold, validity.reason
            ));
        }
        if uniqueness.score < self.uniqueness_threshold {
            issues.push(format!(
                "uniqueness {:.2} below {:.2}: {}",
                uniqueness.score, self.uniqueness_threshold, uniqueness.reason
            ));
        }
        let alternatives: Vec<&String> = uniqueness
            .alternatives
            .iter()
            .filter(|a| !text::contains_phrase(a, answer))
            .collect();
        if !alternatives.is_empty() {
            issues.push(format!(
                "alternative answers: {}",
                alternatives
                    .iter()
                    .map(|a| a.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        let passed = validity.score >= self.validity_threshold
            && uniqueness.score >= self.uniqueness_threshold;
        debug!(
            question,
            validity = validity.score,
            uniqueness = uniqueness.score,
            passed,
            "Dual validation"
        );
        ValidationResult {
            passed,
            validity_score: validity.score,
            uniqueness_score: uniqueness.score,
            specificity_score: specificity(question),
            issues,
            validity_model: self.validity_brain.model_name().to_string(),
            uniqueness_model: self.uniqueness_brain.model_name().to_string(),
            fallback_used: validity.fallback_used || uniqueness.fallback_used,
        }
    }

    async fn ask(&self, brain: &Brain, prompt: String, axis: &str) -> Verdict {
        match brain.judge(prompts::SYSTEM_EXAMINER, prompt).await {
            Ok(reply) => {
                let alternatives = judgment::extract_json(&reply)
                    .map(|v| judgment::string_list(&v, "alternatives"))
                    .unwrap_or_default();
                match judgment::parse_score(&reply, SCORE_KEYS) {
                    Some(j) => Verdict {
                        score: j.score,
                        reason: j.reason,
                        alternatives,
                        fallback_used: j.fallback_used,
                    },
                    None => {
                        warn!(axis, "Unparseable judgment, scoring 0");
                        Verdict {
                            score: 0.0,
                            reason: "unparseable judgment".to_string(),
                            alternatives,
                            fallback_used: true,
                        }
                    }
                }
            }
            Err(e) => {
                warn!(axis, error = %e, "Judgment call failed, scoring 0");
                Verdict {
                    score: 0.0,
                    reason: format!("judgment call failed: {e}"),
                    alternatives: Vec::new(),
                    fallback_used: true,
                }
            }
        }
    }
}

/// How concrete a question reads: content words, named entities, numbers.
pub fn specificity(question: &str) -> f64 {
    let content = text::content_tokens(question).len() as f64;
    let entities = text::capitalized_entities(question).len();
    let has_number = question.chars().any(|c| c.is_ascii_digit());
    let mut score = (content / 8.0).min(1.0) * 0.6;
    if entities > 0 {
        score += 0.25;
    }
    if has_number {
        score += 0.15;
    }
    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;

    fn brain(mock: MockLlmProvider) -> Arc<Brain> {
        Arc::new(Brain::with_defaults(Arc::new(mock)))
    }

    #[tokio::test]
    async fn test_both_judgments_pass() {
        let b = brain(
            MockLlmProvider::new()
                .named("judge-a")
                .on("TASK: VALIDITY_JUDGMENT", r#"{"score": 0.9, "reason": "stated"}"#)
                .on("TASK: UNIQUENESS_JUDGMENT", r#"{"score": 0.8, "alternatives": []}"#),
        );
        let v = DualValidator::new(b, None, &RootConfig::default());
        assert!(!v.is_independent());
        let r = v.validate("Which telescope launched in 1990?", "Hubble", "doc").await;
        assert!(r.passed);
        assert_eq!(r.validity_score, 0.9);
        assert_eq!(r.uniqueness_score, 0.8);
        assert!(r.issues.is_empty());
        assert_eq!(r.validity_model, "judge-a");
        assert!(!r.fallback_used);
    }

    #[tokio::test]
    async fn test_second_provider_judges_uniqueness() {
        let a = brain(
            MockLlmProvider::new()
                .named("a")
                .on("TASK: VALIDITY_JUDGMENT", r#"{"score": 0.95}"#),
        );
        let b = brain(
            MockLlmProvider::new()
                .named("b")
                .on("TASK: UNIQUENESS_JUDGMENT", r#"{"score": 0.4, "alternatives": ["Chandra"]}"#),
        );
        let v = DualValidator::new(a, Some(b), &RootConfig::default());
        assert!(v.is_independent());
        let r = v.validate("Which telescope?", "Hubble", "doc").await;
        assert!(!r.passed);
        assert_eq!(r.uniqueness_model, "b");
        assert_eq!(r.issues.len(), 2);
        assert!(r.issues[1].contains("Chandra"));
    }

    #[tokio::test]
    async fn test_failed_call_scores_zero() {
        let b = brain(MockLlmProvider::new().on("TASK: VALIDITY_JUDGMENT", "Score: 8/10"));
        let v = DualValidator::new(b, None, &RootConfig::default());
        let r = v.validate("Which telescope?", "Hubble", "doc").await;
        assert!((r.validity_score - 0.8).abs() < 1e-9);
        assert_eq!(r.uniqueness_score, 0.0);
        assert!(r.fallback_used);
        assert!(!r.passed);
    }

    #[test]
    fn test_specificity_rewards_detail() {
        let vague = specificity("What is it?");
        let detailed = specificity(
            "Which observatory did NASA launch aboard Discovery in 1990 to study galaxies?",
        );
        assert!(detailed > vague);
        assert!(detailed <= 1.0);
    }
}
