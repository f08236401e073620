//! Prompt templates.
//!
//! Every user prompt opens with a `TASK:` header line naming the job. The
//! header keeps prompts self-describing in logs and lets scripted providers
//! route replies. All templates ask for a single JSON object.

use crate::model::{AnswerType, ExtensionType};

pub const SYSTEM_QUESTION_WRITER: &str = "You write precise, single-answer quiz questions for a \
multi-hop reasoning benchmark. Never reveal the answer in the question. Reply with JSON only.";

pub const SYSTEM_EXAMINER: &str = "You are a strict benchmark examiner. Judge only from the \
evidence given, never from general knowledge. Reply with JSON only.";

pub const SYSTEM_ANALYST: &str = "You analyse question wording for a benchmark pipeline. \
Reply with JSON only.";

pub const SYSTEM_RESEARCHER: &str = "You condense web search results into verifiable facts. \
Use only the results provided. Reply with JSON only.";

pub const MASK_TOKEN: &str = "[MASK]";

/// Phrasing styles rotated across attempts so retries alter the question.
pub const QUESTION_STYLES: &[&str] = &["context-based", "descriptive", "relational"];

pub fn style_for_attempt(attempt: usize) -> &'static str {
    QUESTION_STYLES[attempt % QUESTION_STYLES.len()]
}

fn style_instruction(style: &str) -> &'static str {
    match style {
        "descriptive" => "Describe the answer through its defining attributes.",
        "relational" => "Identify the answer through its relation to another entity in the text.",
        _ => "Identify the answer through the surrounding context of the event it belongs to.",
    }
}

pub fn root_question(
    title: &str,
    document: &str,
    answer: &str,
    answer_type: AnswerType,
    guidance: &str,
    style: &str,
) -> String {
    format!(
        "TASK: ROOT_QUESTION\n\
         Document title: {title}\n\
         Document:\n{document}\n\n\
         Answer: {answer}\n\
         Answer type: {answer_type}\n\
         Style: {style}. {style_instruction}\n\
         Rules:\n\
         - the question must be answerable only from the document and have exactly one answer: \"{answer}\"\n\
         - do not include the answer or any part of it in the question\n\
         - {guidance}\n\
         Reply as {{\"question\": \"...\"}}",
        style_instruction = style_instruction(style),
    )
}

pub fn validity_judgment(question: &str, answer: &str, evidence: &str) -> String {
    format!(
        "TASK: VALIDITY_JUDGMENT\n\
         Evidence:\n{evidence}\n\n\
         Question: {question}\n\
         Proposed answer: {answer}\n\
         Is the question answerable strictly from the evidence (not from common knowledge), \
         and does the evidence support the proposed answer?\n\
         Reply as {{\"score\": <0.0-1.0>, \"reason\": \"...\"}}"
    )
}

pub fn uniqueness_judgment(question: &str, answer: &str, evidence: &str) -> String {
    format!(
        "TASK: UNIQUENESS_JUDGMENT\n\
         Evidence:\n{evidence}\n\n\
         Question: {question}\n\
         Proposed answer: {answer}\n\
         Does the evidence admit exactly one answer to the question? List any alternative \
         answers the evidence would also support.\n\
         Reply as {{\"score\": <0.0-1.0>, \"alternatives\": [..], \"reason\": \"...\"}}"
    )
}

pub fn keyword_extraction(question: &str, answer: &str, max_keywords: usize) -> String {
    format!(
        "TASK: KEYWORD_EXTRACTION\n\
         Question: {question}\n\
         Answer: {answer}\n\
         List at most {max_keywords} keywords from the question that are needed to pin down \
         the answer: proper nouns, dates, numbers, technical terms. Copy each keyword exactly \
         as written in the question. Never list the answer.\n\
         Reply as [{{\"text\": \"...\", \"type\": \"proper_noun|numeric|date|technical|other\", \
         \"confidence\": <0.0-1.0>}}]"
    )
}

pub fn masking_test(masked_question: &str, answer: &str, keyword: &str) -> String {
    format!(
        "TASK: MASKING_TEST\n\
         Keyword under test: {keyword}\n\
         Masked question: {masked_question}\n\
         Original answer: {answer}\n\
         With the keyword replaced by {MASK_TOKEN}, does the question still determine the \
         original answer uniquely? necessity_score is 1.0 when the answer becomes ambiguous \
         without the keyword and 0.0 when the rest of the question still pins it down.\n\
         Reply as {{\"necessity_score\": <0.0-1.0>, \"still_unique\": true|false, \"reason\": \"...\"}}"
    )
}

pub fn sufficiency_test(masked_question: &str, answer: &str, dropped: &[String]) -> String {
    format!(
        "TASK: SUFFICIENCY_TEST\n\
         Keywords removed together: {}\n\
         Masked question: {masked_question}\n\
         Original answer: {answer}\n\
         With all removed keywords masked at once, does the question still determine the \
         original answer uniquely?\n\
         Reply as {{\"still_unique\": true|false, \"score\": <0.0-1.0>, \"reason\": \"...\"}}",
        dropped.join(", ")
    )
}

pub fn extension_synthesis(
    keyword: &str,
    extension_type: ExtensionType,
    query: &str,
    results: &str,
) -> String {
    format!(
        "TASK: EXTENSION_SYNTHESIS\n\
         Keyword: {keyword}\n\
         Extension type: {extension_type}\n\
         Search query: {query}\n\
         Results:\n{results}\n\n\
         Summarise what these results establish about \"{keyword}\" in a short paragraph, \
         list the concrete facts, and rate how confidently the results identify it.\n\
         Reply as {{\"context\": \"...\", \"facts\": [\"...\"], \"confidence\": <0.0-1.0>}}"
    )
}

#[allow(clippy::too_many_arguments)]
pub fn child_question(
    keyword: &str,
    answer_type: AnswerType,
    extension_type: ExtensionType,
    context: &str,
    facts: &[String],
    forbidden: &[String],
    guidance: &str,
    style: &str,
) -> String {
    let thread = match extension_type {
        ExtensionType::Series => "Go deeper into the same thread with added technical detail.",
        ExtensionType::Parallel => "Approach it from an adjacent, alternative angle.",
    };
    format!(
        "TASK: CHILD_QUESTION\n\
         Target answer: {keyword}\n\
         Answer type: {answer_type}\n\
         Extension: {extension_type}. {thread}\n\
         Context:\n{context}\n\
         Facts:\n- {}\n\n\
         Style: {style}. {style_instruction}\n\
         Rules:\n\
         - the question must have exactly one answer: \"{keyword}\", supported by the context\n\
         - never mention any of: {}\n\
         - {guidance}\n\
         Reply as {{\"question\": \"...\"}}",
        facts.join("\n- "),
        forbidden.join(", "),
        style_instruction = style_instruction(style),
    )
}

pub fn composite_integration(nested: &str, chain: &str, root_answer: &str) -> String {
    format!(
        "TASK: COMPOSITE_INTEGRATION\n\
         Nested question: {nested}\n\
         Reasoning chain (innermost first):\n{chain}\n\
         Rewrite the nested question as one fluent question that still requires every hop \
         and still has the single answer \"{root_answer}\". Do not reveal any intermediate answer.\n\
         Reply as {{\"question\": \"...\"}}"
    )
}

pub fn composite_ambiguous(nested: &str, chain: &str, root_answer: &str) -> String {
    format!(
        "TASK: COMPOSITE_AMBIGUOUS\n\
         Nested question: {nested}\n\
         Reasoning chain (innermost first):\n{chain}\n\
         Rewrite the nested question as one question where each intermediate entity is \
         referred to only by an indirect description, so a solver must resolve every hop. \
         The single answer must remain \"{root_answer}\". Do not reveal any intermediate answer.\n\
         Reply as {{\"question\": \"...\"}}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_style_rotation() {
        assert_eq!(style_for_attempt(0), "context-based");
        assert_eq!(style_for_attempt(1), "descriptive");
        assert_eq!(style_for_attempt(2), "relational");
        assert_eq!(style_for_attempt(3), "context-based");
    }

    #[test]
    fn test_headers_present() {
        let p = masking_test("What did [MASK] launch?", "Hubble", "NASA");
        assert!(p.starts_with("TASK: MASKING_TEST\nKeyword under test: NASA"));
        let p = root_question("t", "d", "1995", AnswerType::Date, "g", "descriptive");
        assert!(p.contains("Answer: 1995"));
        assert!(p.contains("Style: descriptive"));
        let p = child_question(
            "NASA",
            AnswerType::Organization,
            ExtensionType::Series,
            "ctx",
            &["f1".into()],
            &["Hubble".into()],
            "g",
            "relational",
        );
        assert!(p.contains("Target answer: NASA"));
        assert!(p.contains("never mention any of: Hubble"));
    }
}
