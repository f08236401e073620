//! Text utilities shared by the detectors and validators.
//!
//! Normalisation, normalised string similarity (via `similar`), phrase
//! containment, stop-word keyword tokens, years, question types and
//! capitalised entity spans.

use regex::Regex;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::HashSet;
use std::sync::LazyLock;

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(1[0-9]{3}|20[0-9]{2})\b").expect("year pattern"));

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][A-Za-z0-9'\-]*(?:\s+(?:of\s+|the\s+)?[A-Z][A-Za-z0-9'\-]*)*")
        .expect("entity pattern")
});

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "shall", "should", "may", "might", "must", "can",
    "could", "of", "in", "to", "for", "with", "on", "at", "from", "by", "about", "as", "into",
    "through", "during", "before", "after", "above", "below", "between", "this", "that",
    "these", "those", "it", "its", "and", "but", "or", "what", "which", "who", "whom", "whose",
    "when", "where", "how", "many", "much", "why",
];

/// Words that open questions; never entities on their own.
const QUESTION_WORDS: &[&str] = &[
    "What", "Which", "Who", "Whom", "Whose", "When", "Where", "How", "Why", "In", "The", "A",
    "An", "On", "At", "For", "During", "After", "Before",
];

/// Lowercase, replace punctuation with spaces and collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.chars()
        .flat_map(|c| {
            let c = if c.is_alphanumeric() { c } else { ' ' };
            c.to_lowercase()
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Character-level similarity ratio of the normalised forms, in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let na = normalize(a);
    let nb = normalize(b);
    if na.is_empty() && nb.is_empty() {
        return 1.0;
    }
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    if na == nb {
        return 1.0;
    }
    f64::from(TextDiff::from_chars(na.as_str(), nb.as_str()).ratio())
}

/// Word-level similarity ratio of the normalised forms, in `[0, 1]`.
///
/// Used for whole questions, where character-level ratios overstate the
/// overlap of unrelated sentences.
pub fn token_similarity(a: &str, b: &str) -> f64 {
    let na = normalize(a);
    let nb = normalize(b);
    if na.is_empty() && nb.is_empty() {
        return 1.0;
    }
    let wa: Vec<&str> = na.split(' ').filter(|w| !w.is_empty()).collect();
    let wb: Vec<&str> = nb.split(' ').filter(|w| !w.is_empty()).collect();
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }
    f64::from(TextDiff::from_slices(&wa, &wb).ratio())
}

/// Case-insensitive whole-phrase containment on normalised text.
pub fn contains_phrase(haystack: &str, needle: &str) -> bool {
    let needle = normalize(needle);
    if needle.is_empty() {
        return false;
    }
    format!(" {} ", normalize(haystack)).contains(&format!(" {} ", needle))
}

/// Stop-word filtered lowercase tokens.
pub fn content_tokens(text: &str) -> Vec<String> {
    normalize(text)
        .split(' ')
        .filter(|w| !w.is_empty() && (w.len() > 2 || w.chars().all(|c| c.is_ascii_digit())))
        .filter(|w| !STOP_WORDS.contains(w))
        .map(String::from)
        .collect()
}

/// Fraction of `query`'s content tokens found in `text`.
pub fn term_overlap(query: &str, text: &str) -> f64 {
    let q: HashSet<String> = content_tokens(query).into_iter().collect();
    if q.is_empty() {
        return 0.0;
    }
    let t: HashSet<String> = content_tokens(text).into_iter().collect();
    q.intersection(&t).count() as f64 / q.len() as f64
}

/// Jaccard similarity of two sets.
pub fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        a.intersection(b).count() as f64 / union as f64
    }
}

/// Four-digit years (1000-2099) in order of appearance.
pub fn extract_years(text: &str) -> Vec<String> {
    YEAR_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

pub fn has_year(text: &str) -> bool {
    YEAR_RE.is_match(text)
}

/// Capitalised multi-word spans, excluding bare question words.
pub fn capitalized_entities(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in ENTITY_RE.find_iter(text) {
        let mut span = m.as_str().trim();
        // drop a leading question/article word ("What NASA" -> "NASA")
        if let Some((first, rest)) = span.split_once(char::is_whitespace)
            && QUESTION_WORDS.contains(&first)
        {
            span = rest.trim();
        }
        if span.is_empty() || QUESTION_WORDS.contains(&span) {
            continue;
        }
        if !out.iter().any(|e| e == span) {
            out.push(span.to_string());
        }
    }
    out
}

/// Lowercased entity set used for overlap checks.
pub fn entity_set(text: &str) -> HashSet<String> {
    capitalized_entities(text)
        .into_iter()
        .map(|e| normalize(&e))
        .collect()
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Coarse interrogative type of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    When,
    Where,
    Who,
    What,
    Which,
    HowMany,
    Other,
}

impl QuestionType {
    /// Classify by the first interrogative found in the question.
    pub fn classify(question: &str) -> Self {
        let norm = normalize(question);
        let tokens: Vec<&str> = norm.split(' ').collect();
        for (i, tok) in tokens.iter().enumerate() {
            let next = tokens.get(i + 1).copied().unwrap_or("");
            match *tok {
                "how" if next == "many" || next == "much" => return QuestionType::HowMany,
                "when" => return QuestionType::When,
                "what" | "which" if next == "year" || next == "date" => return QuestionType::When,
                "where" => return QuestionType::Where,
                "who" | "whom" | "whose" => return QuestionType::Who,
                "which" => return QuestionType::Which,
                "what" => return QuestionType::What,
                _ => {}
            }
        }
        QuestionType::Other
    }
}
