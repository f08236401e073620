//! Parsing of free-text model judgments into structured values.
//!
//! Every prompt asks for a JSON object. Models do not always comply, so each
//! parser first looks for the first balanced JSON object or array in the text
//! (code fences tolerated) and then falls back to regex heuristics. Callers get
//! `fallback_used` so the trajectory can record how a value was obtained, and
//! pick their own conservative default when both paths fail.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static SCORE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:score|confidence|necessity(?:_score)?|validity(?:_score)?|uniqueness(?:_score)?|rating)\b\W{0,3}\s*[:=]?\s*([0-9]*\.?[0-9]+)\s*(%|/\s*10\b|/\s*100\b)?",
    )
    .expect("score pattern")
});

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([0-9]{1,3}(?:\.[0-9]+)?)\s*%").expect("percent pattern"));

static VERDICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|\b(?:verdict|answer|result|still_unique|unique|valid)\b\W{0,3}\s*[:=]?\s*)\W*\b(yes|no|true|false|pass|fail)\b")
        .expect("verdict pattern")
});

/// A score-style judgment extracted from model output.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    /// Score in `[0, 1]`.
    pub score: f64,
    pub reason: String,
    pub fallback_used: bool,
}

/// Strip surrounding markdown code fences, if any.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
        return body.trim_end().trim_end_matches("```").trim();
    }
    trimmed
}

/// Find and parse the first balanced JSON object or array in `text`.
pub fn extract_json(text: &str) -> Option<Value> {
    let text = strip_fences(text);
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find(['{', '[']) {
        let start = search_from + offset;
        if let Some(end) = balanced_end(bytes, start)
            && let Ok(value) = serde_json::from_str::<Value>(&text[start..=end])
        {
            return Some(value);
        }
        search_from = start + 1;
    }
    None
}

/// Index of the bracket closing the one at `start`, string-aware.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Read a numeric field that may be a number, a numeric string, a percent
/// string or a boolean.
pub fn number_field(value: &Value, key: &str) -> Option<f64> {
    let v = value.get(key)?;
    let raw = match v {
        Value::Number(n) => n.as_f64()?,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if let Some(p) = s.strip_suffix('%') {
                p.trim().parse::<f64>().ok()? / 100.0
            } else {
                verdict_word(s).or_else(|| s.parse::<f64>().ok())?
            }
        }
        _ => return None,
    };
    Some(normalize_score(raw))
}

/// Read a string field, trimmed; empty strings count as missing.
pub fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Read an array of strings, skipping non-string entries.
pub fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Scores above 1 are read as percentages (or tenths when at most 10).
fn normalize_score(raw: f64) -> f64 {
    let scaled = if raw > 10.0 {
        raw / 100.0
    } else if raw > 1.0 {
        raw / 10.0
    } else {
        raw
    };
    scaled.clamp(0.0, 1.0)
}

fn verdict_word(word: &str) -> Option<f64> {
    match word.to_ascii_lowercase().as_str() {
        "yes" | "true" | "pass" => Some(1.0),
        "no" | "false" | "fail" => Some(0.0),
        _ => None,
    }
}

/// Parse a score judgment, trying `keys` in order on the JSON path.
pub fn parse_score(text: &str, keys: &[&str]) -> Option<Judgment> {
    if let Some(value) = extract_json(text) {
        let reason = string_field(&value, "reason")
            .or_else(|| string_field(&value, "reasoning"))
            .unwrap_or_default();
        for key in keys {
            if let Some(score) = number_field(&value, key) {
                return Some(Judgment {
                    score,
                    reason,
                    fallback_used: false,
                });
            }
        }
    }
    parse_score_heuristic(text)
}

/// Regex fallback: `score: 0.x`, `7/10`, percentages, then yes/no verdicts.
pub fn parse_score_heuristic(text: &str) -> Option<Judgment> {
    let reason = text.trim().chars().take(200).collect::<String>();
    let score = heuristic_number(text)
        .or_else(|| heuristic_verdict(text).map(|v| if v { 1.0 } else { 0.0 }))?;
    Some(Judgment {
        score,
        reason,
        fallback_used: true,
    })
}

/// A labelled score (`score: 0.8`, `8/10`) or a bare percentage.
pub fn heuristic_number(text: &str) -> Option<f64> {
    if let Some(caps) = SCORE_RE.captures(text)
        && let Ok(raw) = caps[1].parse::<f64>()
    {
        let score = match caps.get(2).map(|m| m.as_str().replace(' ', "")) {
            Some(unit) if unit == "%" || unit == "/100" => raw / 100.0,
            Some(unit) if unit == "/10" => raw / 10.0,
            _ => normalize_score(raw),
        };
        return Some(score.clamp(0.0, 1.0));
    }
    let caps = PERCENT_RE.captures(text)?;
    let raw = caps[1].parse::<f64>().ok()?;
    Some((raw / 100.0).clamp(0.0, 1.0))
}

/// A leading or labelled yes/no verdict.
pub fn heuristic_verdict(text: &str) -> Option<bool> {
    let caps = VERDICT_RE.captures(text.trim())?;
    verdict_word(&caps[1]).map(|v| v >= 0.5)
}

/// Extract a question from generation output: JSON `{"question": ..}` first,
/// then the first line ending in `?`. Returns `(question, fallback_used)`.
pub fn parse_question(text: &str) -> Option<(String, bool)> {
    if let Some(value) = extract_json(text)
        && let Some(q) = string_field(&value, "question")
    {
        return Some((q, false));
    }
    text.lines()
        .map(clean_question_line)
        .find(|l| l.ends_with('?') && l.len() > 1)
        .map(|q| (q, true))
}

fn clean_question_line(line: &str) -> String {
    let mut l = line.trim();
    for prefix in ["Question:", "question:", "Q:", "Composite question:", "- ", "* "] {
        if let Some(rest) = l.strip_prefix(prefix) {
            l = rest.trim();
        }
    }
    // "1. What ..." / "2) What ..."
    if let Some((head, rest)) = l.split_once(['.', ')'])
        && !head.is_empty()
        && head.chars().all(|c| c.is_ascii_digit())
    {
        l = rest.trim();
    }
    l.trim_matches(|c| c == '"' || c == '\'' || c == '`' || c == '*')
        .trim()
        .to_string()
}
