//! Scripted backends for `deeptree build --dry-run`.
//!
//! Root questions are cloze statements cut from the sentence that carries
//! the answer, so the full pipeline runs offline. Extensions find no search
//! results, which leaves every tree at its root.

use deeptree_core::text;
use deeptree_core::{Document, MockLlmProvider, MockSearchProvider, ShortAnswer};

/// Cloze question for `answer`, grounded in the first sentence that states it.
pub fn cloze_question(document: &Document, answer: &ShortAnswer) -> String {
    let sentence = document
        .text
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .find(|s| s.contains(answer.text.as_str()) && text::contains_phrase(s, &answer.text));
    match sentence {
        Some(sentence) => {
            let blanked = sentence
                .replace(answer.text.as_str(), "___")
                .trim_end_matches(['.', '!', '?'])
                .to_string();
            format!("Which {} fills the blank in \"{blanked}\"?", answer.answer_type)
        }
        None => format!(
            "Which {} does the document \"{}\" single out?",
            answer.answer_type, document.title
        ),
    }
}

pub fn llm(document: &Document) -> MockLlmProvider {
    let mut mock = MockLlmProvider::new()
        .named("dry-run")
        .on(
            "TASK: VALIDITY_JUDGMENT",
            r#"{"score": 0.85, "reason": "dry run"}"#,
        )
        .on(
            "TASK: UNIQUENESS_JUDGMENT",
            r#"{"score": 0.85, "alternatives": []}"#,
        )
        // no JSON, so extraction falls back to the regex heuristics
        .on("TASK: KEYWORD_EXTRACTION", "dry run")
        .on("TASK: MASKING_TEST", r#"{"necessity_score": 0.8}"#)
        .on("TASK: SUFFICIENCY_TEST", r#"{"still_unique": true}"#)
        .on(
            "TASK: EXTENSION_SYNTHESIS",
            r#"{"context": "", "facts": [], "confidence": 0.0}"#,
        );
    for answer in &document.short_answers {
        let needle = format!("Answer: {}\n", answer.text);
        let reply = serde_json::json!({ "question": cloze_question(document, answer) });
        mock = mock.on_all(&["TASK: ROOT_QUESTION", &needle], reply.to_string());
    }
    mock
}

pub fn search() -> MockSearchProvider {
    MockSearchProvider::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use deeptree_core::AnswerType;
    use deeptree_core::generation::check_question;

    fn document() -> Document {
        Document {
            id: "hubble".into(),
            title: "Hubble Space Telescope".into(),
            text: "The Hubble Space Telescope is a space observatory. \
                   It was launched by NASA in 1990 aboard the shuttle Discovery."
                .into(),
            short_answers: vec![ShortAnswer {
                text: "1990".into(),
                answer_type: AnswerType::Date,
                confidence: 0.9,
                source_excerpt: String::new(),
                position: 0,
            }],
        }
    }

    #[test]
    fn test_cloze_blanks_the_answer() {
        let doc = document();
        let q = cloze_question(&doc, &doc.short_answers[0]);
        assert_eq!(
            q,
            "Which date fills the blank in \"It was launched by NASA in ___ aboard the shuttle Discovery\"?"
        );
        assert!(check_question(&q, "1990", AnswerType::Date, &[]).is_ok());
    }

    #[test]
    fn test_cloze_falls_back_to_title() {
        let doc = document();
        let missing = ShortAnswer {
            text: "Edwin Hubble".into(),
            ..doc.short_answers[0].clone()
        };
        let q = cloze_question(&doc, &missing);
        assert!(q.contains("Hubble Space Telescope"));
        assert!(q.ends_with('?'));
    }
}
