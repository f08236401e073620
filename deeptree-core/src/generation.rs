//! Question generation for root and child nodes.
//!
//! Each attempt rotates the phrasing style so retries alter wording. Generated
//! text is parsed with the judgment fallbacks and then checked locally before
//! any validator call is spent on it.

use crate::brain::Brain;
use crate::judgment;
use crate::model::{AnswerType, Document, ExtensionContext, ShortAnswer};
use crate::prompts;
use crate::text;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// A question that passed the local checks.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedQuestion {
    pub question: String,
    pub style: &'static str,
    pub fallback_used: bool,
}

/// Why an attempt produced no usable question.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationFailure {
    #[error("generation call failed: {0}")]
    CallFailed(String),
    #[error("no question found in model output")]
    Unparseable,
    #[error("question does not end with '?'")]
    NotAQuestion,
    #[error("question reveals the answer")]
    AnswerLeak,
    #[error("forbidden phrasing for answer type: {0}")]
    ForbiddenPhrasing(String),
    #[error("question mentions forbidden term: {0}")]
    ForbiddenTerm(String),
}

/// Circular-avoidance guidance given to the writer for an answer type.
pub fn answer_type_guidance(answer_type: AnswerType, answer: &str) -> String {
    match answer_type {
        AnswerType::Date => "do not ask \"when did\", \"when was\", \"what year\" or \"in which year\"; \
             identify the date through the event it anchors"
            .to_string(),
        AnswerType::Number => "do not ask \"how many\" or \"how much\" of the headline figure; \
             identify the number through what it measures and its context"
            .to_string(),
        AnswerType::Name | AnswerType::Organization => format!(
            "do not ask \"who is {answer}\" or \"what is {answer}\"; identify it through its role"
        ),
        AnswerType::Location => format!(
            "do not ask \"where is {answer}\"; identify the place through what happened there"
        ),
        AnswerType::Technical | AnswerType::Other => {
            "identify the answer through its function or context".to_string()
        }
    }
}

/// Phrasing that turns the question into a lookup of its own answer.
pub fn forbidden_phrasing(question: &str, answer: &str, answer_type: AnswerType) -> Option<String> {
    let q = text::normalize(question);
    let a = text::normalize(answer);
    let banned: Vec<String> = match answer_type {
        AnswerType::Date => vec![
            "when did".into(),
            "when was".into(),
            "what year".into(),
            "in which year".into(),
        ],
        AnswerType::Number => vec!["how many".into(), "how much".into()],
        AnswerType::Name | AnswerType::Organization => {
            vec![format!("who is {a}"), format!("what is {a}")]
        }
        AnswerType::Location => vec![format!("where is {a}")],
        AnswerType::Technical | AnswerType::Other => Vec::new(),
    };
    banned
        .into_iter()
        .find(|phrase| format!(" {q} ").contains(&format!(" {phrase} ")))
}

/// Local checks shared by root and child questions.
pub fn check_question(
    question: &str,
    answer: &str,
    answer_type: AnswerType,
    forbidden_terms: &[String],
) -> Result<(), GenerationFailure> {
    let q = question.trim();
    if q.is_empty() {
        return Err(GenerationFailure::Unparseable);
    }
    if !q.ends_with('?') {
        return Err(GenerationFailure::NotAQuestion);
    }
    if text::contains_phrase(q, answer) {
        return Err(GenerationFailure::AnswerLeak);
    }
    if let Some(phrase) = forbidden_phrasing(q, answer, answer_type) {
        return Err(GenerationFailure::ForbiddenPhrasing(phrase));
    }
    if let Some(term) = forbidden_terms
        .iter()
        .find(|t| text::contains_phrase(q, t))
    {
        return Err(GenerationFailure::ForbiddenTerm(term.clone()));
    }
    Ok(())
}

pub struct QuestionGenerator {
    brain: Arc<Brain>,
    max_document_chars: usize,
}

impl QuestionGenerator {
    pub fn new(brain: Arc<Brain>, max_document_chars: usize) -> Self {
        Self {
            brain,
            max_document_chars,
        }
    }

    /// Write a document-grounded root question whose answer is `answer`.
    pub async fn generate_root(
        &self,
        document: &Document,
        answer: &ShortAnswer,
        attempt: usize,
    ) -> Result<GeneratedQuestion, GenerationFailure> {
        let style = prompts::style_for_attempt(attempt);
        let prompt = prompts::root_question(
            &document.title,
            text::truncate_chars(&document.text, self.max_document_chars),
            &answer.text,
            answer.answer_type,
            &answer_type_guidance(answer.answer_type, &answer.text),
            style,
        );
        self.run(prompt, &answer.text, answer.answer_type, &[], style)
            .await
    }

    /// Write a child question whose answer is the parent keyword.
    pub async fn generate_child(
        &self,
        keyword: &str,
        answer_type: AnswerType,
        extension: &ExtensionContext,
        forbidden_terms: &[String],
        attempt: usize,
    ) -> Result<GeneratedQuestion, GenerationFailure> {
        let style = prompts::style_for_attempt(attempt);
        let prompt = prompts::child_question(
            keyword,
            answer_type,
            extension.extension_type,
            &extension.synthesized_context,
            &extension.facts,
            forbidden_terms,
            &answer_type_guidance(answer_type, keyword),
            style,
        );
        self.run(prompt, keyword, answer_type, forbidden_terms, style)
            .await
    }

    async fn run(
        &self,
        prompt: String,
        answer: &str,
        answer_type: AnswerType,
        forbidden_terms: &[String],
        style: &'static str,
    ) -> Result<GeneratedQuestion, GenerationFailure> {
        let reply = self
            .brain
            .generate(prompts::SYSTEM_QUESTION_WRITER, prompt)
            .await
            .map_err(|e| GenerationFailure::CallFailed(e.to_string()))?;
        let (question, fallback_used) =
            judgment::parse_question(&reply).ok_or(GenerationFailure::Unparseable)?;
        check_question(&question, answer, answer_type, forbidden_terms)?;
        debug!(question = %question, style, fallback_used, "Question generated");
        Ok(GeneratedQuestion {
            question,
            style,
            fallback_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::model::{ExtensionStrategy, ExtensionType};

    fn doc() -> Document {
        Document {
            id: "d1".into(),
            title: "Hubble".into(),
            text: "The Hubble Space Telescope was launched in 1990 aboard Discovery.".into(),
            short_answers: vec![ShortAnswer::new("1990", AnswerType::Date)],
        }
    }

    fn generator(mock: MockLlmProvider) -> QuestionGenerator {
        QuestionGenerator::new(Arc::new(Brain::with_defaults(Arc::new(mock))), 8000)
    }

    #[test]
    fn test_forbidden_phrasing_by_type() {
        assert_eq!(
            forbidden_phrasing("When was Hubble launched?", "1990", AnswerType::Date),
            Some("when was".to_string())
        );
        assert!(forbidden_phrasing(
            "The shuttle that carried Hubble flew in which launch year?",
            "1990",
            AnswerType::Date
        )
        .is_none());
        assert_eq!(
            forbidden_phrasing("Who is NASA?", "NASA", AnswerType::Organization),
            Some("who is nasa".to_string())
        );
        assert!(forbidden_phrasing("How many mirrors?", "2", AnswerType::Number).is_some());
        assert!(forbidden_phrasing("Where is Baltimore?", "Baltimore", AnswerType::Location).is_some());
    }

    #[test]
    fn test_check_question_failures() {
        let none: Vec<String> = Vec::new();
        assert_eq!(
            check_question("Which telescope", "Hubble", AnswerType::Name, &none),
            Err(GenerationFailure::NotAQuestion)
        );
        assert_eq!(
            check_question("Is it the hubble telescope?", "Hubble", AnswerType::Name, &none),
            Err(GenerationFailure::AnswerLeak)
        );
        assert_eq!(
            check_question(
                "Which agency runs the telescope?",
                "NASA",
                AnswerType::Organization,
                &["telescope".to_string()]
            ),
            Err(GenerationFailure::ForbiddenTerm("telescope".to_string()))
        );
    }

    #[tokio::test]
    async fn test_generate_root_parses_json() {
        let g = generator(MockLlmProvider::new().on(
            "TASK: ROOT_QUESTION",
            r#"{"question": "The space shuttle Discovery deployed NASA's great observatory during which calendar year of the STS-31 mission?"}"#,
        ));
        let out = g
            .generate_root(&doc(), &doc().short_answers[0], 1)
            .await
            .unwrap();
        assert_eq!(out.style, "descriptive");
        assert!(!out.fallback_used);
    }

    #[tokio::test]
    async fn test_generate_root_rejects_leak() {
        let g = generator(
            MockLlmProvider::new().on("TASK: ROOT_QUESTION", "Question: What happened in 1990?"),
        );
        let err = g
            .generate_root(&doc(), &doc().short_answers[0], 0)
            .await
            .unwrap_err();
        assert_eq!(err, GenerationFailure::AnswerLeak);
    }

    #[tokio::test]
    async fn test_generate_child_uses_context() {
        let mock = Arc::new(MockLlmProvider::new().on(
            "TASK: CHILD_QUESTION",
            r#"{"question": "Which space agency founded in 1958 operates the Goddard center?"}"#,
        ));
        let g = QuestionGenerator::new(Arc::new(Brain::with_defaults(mock.clone())), 8000);
        let ext = ExtensionContext {
            original_keyword: "NASA".into(),
            extension_type: ExtensionType::Series,
            strategy: ExtensionStrategy::Standard,
            search_query: "NASA history".into(),
            synthesized_context: "NASA was founded in 1958.".into(),
            facts: vec!["Founded 1958".into()],
            confidence: 0.9,
            sources: Vec::new(),
            attempts: 1,
            search_calls: 1,
        };
        let out = g
            .generate_child("NASA", AnswerType::Organization, &ext, &["Hubble".into()], 0)
            .await
            .unwrap();
        assert!(out.question.contains("1958"));
        assert!(mock.prompts()[0].contains("NASA was founded in 1958."));
    }
}
