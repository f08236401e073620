//! Keyword extraction and minimality (masking) validation.
//!
//! [`KeywordExtractor`] asks the model for the keywords of a question and
//! falls back to regex heuristics. Keywords are canonicalised to the exact
//! substring found in the question, so a child answer can equal its parent
//! keyword byte for byte.
//!
//! [`MinimalityValidator`] masks one keyword at a time and asks whether the
//! question still pins down its answer. Tests run concurrently on the
//! [`WorkerPool`] and are joined before the node proceeds. Keywords whose
//! removal keeps the answer unique are dropped.

use crate::brain::Brain;
use crate::config::MinimalityConfig;
use crate::judgment;
use crate::model::{Keyword, KeywordType};
use crate::pool::WorkerPool;
use crate::prompts::{self, MASK_TOKEN};
use crate::text;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

const NEAR_DUPLICATE_SIMILARITY: f64 = 0.85;
const HEURISTIC_CONFIDENCE: f64 = 0.5;

static QUANTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b\d+(?:[.,]\d+)?\s*(?:%|percent|km|kilometers|kilometres|m|meters|metres|cm|mm|nm|kg|tons|tonnes|miles|million|billion|light-years)\b",
    )
    .expect("quantity pattern")
});

static TECHNICAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:[A-Za-z]+-[A-Za-z0-9]+(?:-[A-Za-z0-9]+)*|[a-z]+[A-Z][A-Za-z]+)\b")
        .expect("technical pattern")
});

/// Result of keyword extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordExtraction {
    pub keywords: Vec<Keyword>,
    pub fallback_used: bool,
}

pub struct KeywordExtractor {
    brain: Arc<Brain>,
    max_keywords: usize,
}

impl KeywordExtractor {
    pub fn new(brain: Arc<Brain>, max_keywords: usize) -> Self {
        Self {
            brain,
            max_keywords: max_keywords.max(1),
        }
    }

    /// Extract the keywords of `question` whose answer is `answer`.
    pub async fn extract(&self, question: &str, answer: &str) -> KeywordExtraction {
        let prompt = prompts::keyword_extraction(question, answer, self.max_keywords);
        let (raw, mut fallback_used) = match self.brain.judge(prompts::SYSTEM_ANALYST, prompt).await
        {
            Ok(reply) => match parse_keyword_reply(&reply) {
                Some(list) if !list.is_empty() => (list, false),
                _ => {
                    warn!(question, "Keyword reply unparseable, using heuristics");
                    (heuristic_keywords(question), true)
                }
            },
            Err(e) => {
                warn!(question, error = %e, "Keyword extraction call failed, using heuristics");
                (heuristic_keywords(question), true)
            }
        };

        let mut keywords = clean_keywords(question, answer, raw, self.max_keywords);
        if keywords.is_empty() && !fallback_used {
            // the model only returned terms absent from the question
            fallback_used = true;
            keywords = clean_keywords(
                question,
                answer,
                heuristic_keywords(question),
                self.max_keywords,
            );
        }
        debug!(
            question,
            count = keywords.len(),
            fallback_used,
            "Keywords extracted"
        );
        KeywordExtraction {
            keywords,
            fallback_used,
        }
    }
}

/// Accepts `[{text,type,confidence}]`, `{"keywords": [...]}` or `["..."]`.
fn parse_keyword_reply(reply: &str) -> Option<Vec<Keyword>> {
    let value = judgment::extract_json(reply)?;
    let items = match &value {
        Value::Array(items) => items.clone(),
        Value::Object(_) => value.get("keywords")?.as_array()?.clone(),
        _ => return None,
    };
    Some(
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(Keyword {
                    text: s.trim().to_string(),
                    keyword_type: guess_type(s),
                    necessity_score: 1.0,
                    extraction_confidence: 0.8,
                }),
                Value::Object(_) => {
                    let text = judgment::string_field(item, "text")
                        .or_else(|| judgment::string_field(item, "keyword"))?;
                    let keyword_type = judgment::string_field(item, "type")
                        .map(|t| KeywordType::parse(&t))
                        .unwrap_or_else(|| guess_type(&text));
                    let extraction_confidence =
                        judgment::number_field(item, "confidence").unwrap_or(0.8);
                    Some(Keyword {
                        text,
                        keyword_type,
                        necessity_score: 1.0,
                        extraction_confidence,
                    })
                }
                _ => None,
            })
            .collect(),
    )
}

fn guess_type(text: &str) -> KeywordType {
    let t = text.trim();
    if text::has_year(t) && t.len() <= 12 {
        KeywordType::Date
    } else if t.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        KeywordType::Numeric
    } else if TECHNICAL_RE.is_match(t) && !t.contains(' ') {
        KeywordType::Technical
    } else if t.chars().next().is_some_and(char::is_uppercase) {
        KeywordType::ProperNoun
    } else {
        KeywordType::Other
    }
}

/// Regex keyword heuristics: entities, years, quantities, technical terms.
pub fn heuristic_keywords(question: &str) -> Vec<Keyword> {
    let mut out = Vec::new();
    let mut push = |text: &str, keyword_type: KeywordType| {
        out.push(Keyword {
            text: text.to_string(),
            keyword_type,
            necessity_score: 1.0,
            extraction_confidence: HEURISTIC_CONFIDENCE,
        });
    };
    for entity in text::capitalized_entities(question) {
        push(&entity, KeywordType::ProperNoun);
    }
    for year in text::extract_years(question) {
        push(&year, KeywordType::Date);
    }
    for m in QUANTITY_RE.find_iter(question) {
        push(m.as_str(), KeywordType::Numeric);
    }
    for m in TECHNICAL_RE.find_iter(question) {
        push(m.as_str(), KeywordType::Technical);
    }
    out
}

/// Byte offset of `needle` in `haystack`, ignoring ASCII case, on word
/// boundaries.
pub fn locate(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.trim();
    if needle.is_empty() {
        return None;
    }
    for (i, _) in haystack.char_indices() {
        let Some(slice) = haystack.get(i..i + needle.len()) else {
            continue;
        };
        if !slice.eq_ignore_ascii_case(needle) {
            continue;
        }
        let before_ok = haystack[..i]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = haystack[i + needle.len()..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return Some(i);
        }
    }
    None
}

/// The question's own spelling of `needle`, if present.
pub fn find_in_question<'a>(haystack: &'a str, needle: &str) -> Option<&'a str> {
    let start = locate(haystack, needle)?;
    haystack.get(start..start + needle.trim().len())
}

/// Canonicalise, drop answer overlaps and near-duplicates, cap the count.
fn clean_keywords(
    question: &str,
    answer: &str,
    raw: Vec<Keyword>,
    max_keywords: usize,
) -> Vec<Keyword> {
    let mut kept: Vec<Keyword> = Vec::new();
    for mut kw in raw {
        let Some(canonical) = find_in_question(question, &kw.text) else {
            debug!(keyword = %kw.text, "Keyword not present in question, dropped");
            continue;
        };
        kw.text = canonical.to_string();
        // near-verbatim answer echoes are left for the circular detector
        if text::contains_phrase(&kw.text, answer) {
            continue;
        }
        let duplicate = kept.iter().position(|k| {
            text::normalize(&k.text) == text::normalize(&kw.text)
                || text::contains_phrase(&k.text, &kw.text)
                || text::contains_phrase(&kw.text, &k.text)
                || text::similarity(&k.text, &kw.text) >= NEAR_DUPLICATE_SIMILARITY
        });
        match duplicate {
            Some(idx) if kept[idx].extraction_confidence < kw.extraction_confidence => {
                kept[idx] = kw;
            }
            Some(_) => {}
            None => kept.push(kw),
        }
    }

    kept.sort_by(|a, b| b.extraction_confidence.total_cmp(&a.extraction_confidence));
    kept.truncate(max_keywords);
    kept.sort_by_key(|k| locate(question, &k.text).unwrap_or(usize::MAX));
    kept
}

/// Replace every whole-word occurrence of `keyword` with the mask token.
pub fn mask(question: &str, keyword: &str) -> String {
    let keyword = keyword.trim();
    let mut out = String::with_capacity(question.len());
    let mut rest = 0;
    // a match always ends before a non-word char, so each remainder starts on a boundary
    while let Some(offset) = locate(&question[rest..], keyword) {
        let start = rest + offset;
        out.push_str(&question[rest..start]);
        out.push_str(MASK_TOKEN);
        rest = start + keyword.len();
    }
    out.push_str(&question[rest..]);
    out
}

/// One masking test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskingTest {
    pub keyword: String,
    pub masked_question: String,
    pub necessity_score: f64,
    pub necessary: bool,
    pub fallback_used: bool,
    pub reason: String,
}

/// Outcome of minimality validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinimalityReport {
    /// Minimal keyword set, in question order, with necessity scores.
    pub kept: Vec<Keyword>,
    pub dropped: Vec<Keyword>,
    pub tests: Vec<MaskingTest>,
    /// The joint test over dropped keywords confirmed the answer stays unique.
    pub sufficiency_verified: bool,
    /// Keyword restored after a failed joint test.
    pub restored: Option<String>,
}

impl MinimalityReport {
    pub fn kept_texts(&self) -> Vec<String> {
        self.kept.iter().map(|k| k.text.clone()).collect()
    }

    pub fn fallback_used(&self) -> bool {
        self.tests.iter().any(|t| t.fallback_used)
    }
}

pub struct MinimalityValidator {
    brain: Arc<Brain>,
    pool: WorkerPool,
    necessity_threshold: f64,
    verify_sufficiency: bool,
}

impl MinimalityValidator {
    pub fn new(brain: Arc<Brain>, config: &MinimalityConfig) -> Self {
        Self {
            brain,
            pool: WorkerPool::new(config.workers),
            necessity_threshold: config.necessity_threshold,
            verify_sufficiency: config.verify_sufficiency,
        }
    }

    /// Reduce `keywords` to the minimal set that keeps `answer` unique.
    pub async fn validate(
        &self,
        question: &str,
        answer: &str,
        keywords: Vec<Keyword>,
    ) -> MinimalityReport {
        let jobs: Vec<(String, String)> = keywords
            .iter()
            .map(|k| (k.text.clone(), mask(question, &k.text)))
            .collect();

        let brain = self.brain.clone();
        let answer_owned = answer.to_string();
        let outcomes = self
            .pool
            .run(jobs.clone(), move |(keyword, masked)| {
                let brain = brain.clone();
                let answer = answer_owned.clone();
                async move {
                    let prompt = prompts::masking_test(&masked, &answer, &keyword);
                    match brain.judge(prompts::SYSTEM_EXAMINER, prompt).await {
                        Ok(reply) => parse_masking_reply(&reply),
                        Err(e) => {
                            warn!(keyword = %keyword, error = %e, "Masking test call failed");
                            None
                        }
                    }
                }
            })
            .await;

        let mut tests = Vec::with_capacity(jobs.len());
        let mut kept = Vec::new();
        let mut dropped = Vec::new();
        for ((mut kw, (_, masked)), outcome) in keywords.into_iter().zip(jobs).zip(outcomes) {
            let (necessity_score, reason, fallback_used) = match outcome.flatten() {
                Some(parsed) => parsed,
                // unknown means keep it
                None => (1.0, "masking judgment unavailable".to_string(), true),
            };
            let necessary = necessity_score > self.necessity_threshold;
            kw.necessity_score = necessity_score;
            tests.push(MaskingTest {
                keyword: kw.text.clone(),
                masked_question: masked,
                necessity_score,
                necessary,
                fallback_used,
                reason,
            });
            if necessary { kept.push(kw) } else { dropped.push(kw) }
        }

        let mut sufficiency_verified = false;
        let mut restored = None;
        if !dropped.is_empty() {
            let still_unique = if self.verify_sufficiency {
                self.joint_test(question, answer, &dropped).await
            } else {
                true
            };
            if still_unique && !kept.is_empty() {
                sufficiency_verified = self.verify_sufficiency;
            } else {
                // restore the most necessary dropped keyword
                if let Some(idx) = dropped
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.necessity_score.total_cmp(&b.1.necessity_score))
                    .map(|(i, _)| i)
                {
                    let kw = dropped.remove(idx);
                    info!(keyword = %kw.text, "Restoring dropped keyword after sufficiency check");
                    restored = Some(kw.text.clone());
                    kept.push(kw);
                }
            }
        }
        kept.sort_by_key(|k| locate(question, &k.text).unwrap_or(usize::MAX));

        info!(
            kept = kept.len(),
            dropped = dropped.len(),
            sufficiency_verified,
            "Minimality validated"
        );
        MinimalityReport {
            kept,
            dropped,
            tests,
            sufficiency_verified,
            restored,
        }
    }

    async fn joint_test(&self, question: &str, answer: &str, dropped: &[Keyword]) -> bool {
        let texts: Vec<String> = dropped.iter().map(|k| k.text.clone()).collect();
        let masked = texts
            .iter()
            .fold(question.to_string(), |q, kw| mask(&q, kw));
        let prompt = prompts::sufficiency_test(&masked, answer, &texts);
        match self.brain.judge(prompts::SYSTEM_EXAMINER, prompt).await {
            Ok(reply) => parse_sufficiency_reply(&reply).unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "Sufficiency test call failed");
                false
            }
        }
    }
}

/// `(necessity_score, reason, fallback_used)` from a masking reply.
fn parse_masking_reply(reply: &str) -> Option<(f64, String, bool)> {
    if let Some(value) = judgment::extract_json(reply) {
        let reason = judgment::string_field(&value, "reason").unwrap_or_default();
        if let Some(score) = judgment::number_field(&value, "necessity_score")
            .or_else(|| judgment::number_field(&value, "necessity"))
        {
            return Some((score, reason, false));
        }
        if let Some(unique) = judgment::number_field(&value, "still_unique") {
            return Some((1.0 - unique, reason, false));
        }
    }
    let reason = reply.trim().chars().take(200).collect::<String>();
    if let Some(score) = judgment::heuristic_number(reply) {
        return Some((score, reason, true));
    }
    // a bare verdict answers "still unique?"
    judgment::heuristic_verdict(reply).map(|unique| (if unique { 0.0 } else { 1.0 }, reason, true))
}

fn parse_sufficiency_reply(reply: &str) -> Option<bool> {
    if let Some(value) = judgment::extract_json(reply) {
        if let Some(unique) = judgment::number_field(&value, "still_unique") {
            return Some(unique >= 0.5);
        }
        if let Some(score) = judgment::number_field(&value, "score") {
            return Some(score >= 0.5);
        }
    }
    judgment::heuristic_verdict(reply)
}
