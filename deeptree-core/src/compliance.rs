//! Workflow compliance scoring.
//!
//! Each phase evaluates a fixed checklist against what is known about the
//! node at that point. Applicable items score in `[0, 1]` and carry a weight;
//! the weighted mean is the overall score. Failing items map to concrete
//! remediations the orchestrator uses to choose between retrying and
//! rejecting.

use crate::config::ComplianceConfig;
use crate::keywords::MinimalityReport;
use crate::model::{Keyword, KeywordType, ValidationResult};
use crate::text;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Items scoring below this fail and produce a remediation.
const ITEM_PASS_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompliancePhase {
    Generation,
    Validation,
    Extraction,
    Extension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistItem {
    KeywordSpecificity,
    KeywordDistinctiveness,
    KeywordUniqueness,
    DocumentGroundedness,
    AnswerUniqueness,
    ValidatorIndependence,
    ValidatorAgreement,
    MinimalKeywordSufficiency,
    HierarchyCorrectness,
    SearchBudgetAdherence,
    ShortcutPrevention,
}

impl ChecklistItem {
    pub fn weight(self) -> f64 {
        match self {
            ChecklistItem::KeywordSpecificity => 0.2,
            ChecklistItem::KeywordDistinctiveness => 0.15,
            ChecklistItem::KeywordUniqueness => 0.2,
            ChecklistItem::DocumentGroundedness => 0.3,
            ChecklistItem::AnswerUniqueness => 0.35,
            ChecklistItem::ValidatorIndependence => 0.1,
            ChecklistItem::ValidatorAgreement => 0.25,
            ChecklistItem::MinimalKeywordSufficiency => 0.25,
            ChecklistItem::HierarchyCorrectness => 0.4,
            ChecklistItem::SearchBudgetAdherence => 0.15,
            ChecklistItem::ShortcutPrevention => 0.4,
        }
    }

    /// Items whose failure rejects the node regardless of the overall score.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            ChecklistItem::HierarchyCorrectness | ChecklistItem::ShortcutPrevention
        )
    }

    pub fn remediation(self) -> Remediation {
        match self {
            ChecklistItem::KeywordSpecificity
            | ChecklistItem::KeywordDistinctiveness
            | ChecklistItem::KeywordUniqueness
            | ChecklistItem::MinimalKeywordSufficiency => Remediation::ReextractKeywords,
            ChecklistItem::DocumentGroundedness | ChecklistItem::AnswerUniqueness => {
                Remediation::RegenerateQuestion
            }
            ChecklistItem::ValidatorIndependence | ChecklistItem::ValidatorAgreement => {
                Remediation::RevalidateIndependently
            }
            ChecklistItem::SearchBudgetAdherence => Remediation::ReduceSearchCalls,
            ChecklistItem::ShortcutPrevention => Remediation::RephraseToRemoveShortcut,
            ChecklistItem::HierarchyCorrectness => Remediation::RejectPermanently,
        }
    }

    fn phases(self) -> &'static [CompliancePhase] {
        use CompliancePhase::*;
        match self {
            ChecklistItem::KeywordSpecificity
            | ChecklistItem::KeywordDistinctiveness
            | ChecklistItem::KeywordUniqueness
            | ChecklistItem::MinimalKeywordSufficiency => &[Extraction],
            ChecklistItem::DocumentGroundedness => &[Generation, Validation, Extension],
            ChecklistItem::AnswerUniqueness
            | ChecklistItem::ValidatorIndependence
            | ChecklistItem::ValidatorAgreement => &[Validation],
            ChecklistItem::HierarchyCorrectness => &[Generation, Extraction],
            ChecklistItem::SearchBudgetAdherence => &[Generation, Extension],
            ChecklistItem::ShortcutPrevention => &[Generation, Extraction],
        }
    }

    const ALL: [ChecklistItem; 11] = [
        ChecklistItem::KeywordSpecificity,
        ChecklistItem::KeywordDistinctiveness,
        ChecklistItem::KeywordUniqueness,
        ChecklistItem::DocumentGroundedness,
        ChecklistItem::AnswerUniqueness,
        ChecklistItem::ValidatorIndependence,
        ChecklistItem::ValidatorAgreement,
        ChecklistItem::MinimalKeywordSufficiency,
        ChecklistItem::HierarchyCorrectness,
        ChecklistItem::SearchBudgetAdherence,
        ChecklistItem::ShortcutPrevention,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    RegenerateQuestion,
    ReextractKeywords,
    RevalidateIndependently,
    ReduceSearchCalls,
    RephraseToRemoveShortcut,
    RejectPermanently,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    /// Acceptable for the production tier.
    Conditional,
    NonCompliant,
}

/// What is known about a node when a phase is evaluated. Absent data makes
/// the dependent items inapplicable.
#[derive(Debug, Clone, Default)]
pub struct ComplianceSubject<'a> {
    pub question: &'a str,
    pub answer: &'a str,
    /// `None` for a root.
    pub parent_keyword: Option<&'a str>,
    /// Keywords of the parent node, for the hierarchy check.
    pub parent_keywords: Option<&'a [Keyword]>,
    /// Answers of every ancestor.
    pub ancestor_answers: &'a [String],
    /// Document text (root) or synthesized context (child).
    pub evidence: Option<&'a str>,
    pub validation: Option<&'a ValidationResult>,
    pub validators_independent: bool,
    pub keywords: Option<&'a [Keyword]>,
    pub minimality: Option<&'a MinimalityReport>,
    /// `(calls issued, budget)` for the extension behind this node.
    pub search_budget: Option<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemScore {
    pub item: ChecklistItem,
    pub score: f64,
    pub weight: f64,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub phase: CompliancePhase,
    pub items: Vec<ItemScore>,
    pub overall: f64,
    pub status: ComplianceStatus,
    pub remediations: Vec<Remediation>,
}

impl ComplianceReport {
    pub fn is_acceptable(&self) -> bool {
        self.status != ComplianceStatus::NonCompliant
    }

    /// Non-compliant, but every remediation is something a retry can do.
    pub fn should_retry(&self) -> bool {
        self.status == ComplianceStatus::NonCompliant
            && !self.remediations.is_empty()
            && !self.remediations.contains(&Remediation::RejectPermanently)
    }

    /// Non-compliant with nothing a retry could fix.
    pub fn is_terminal(&self) -> bool {
        self.status == ComplianceStatus::NonCompliant && !self.should_retry()
    }

    pub fn failing(&self) -> impl Iterator<Item = &ItemScore> {
        self.items.iter().filter(|i| !i.passed)
    }
}

pub struct ComplianceEnforcer {
    pass_threshold: f64,
    conditional_threshold: f64,
}

impl ComplianceEnforcer {
    pub fn new(config: &ComplianceConfig) -> Self {
        Self {
            pass_threshold: config.pass_threshold,
            conditional_threshold: config.conditional_threshold,
        }
    }

    pub fn evaluate(&self, phase: CompliancePhase, subject: &ComplianceSubject<'_>) -> ComplianceReport {
        let items: Vec<ItemScore> = ChecklistItem::ALL
            .iter()
            .filter(|item| item.phases().contains(&phase))
            .filter_map(|&item| {
                let (score, detail) = score_item(item, phase, subject)?;
                let score = score.clamp(0.0, 1.0);
                Some(ItemScore {
                    item,
                    score,
                    weight: item.weight(),
                    passed: score >= ITEM_PASS_SCORE,
                    detail,
                })
            })
            .collect();

        let total_weight: f64 = items.iter().map(|i| i.weight).sum();
        let overall = if total_weight > 0.0 {
            items.iter().map(|i| i.score * i.weight).sum::<f64>() / total_weight
        } else {
            1.0
        };
        let critical_failure = items.iter().any(|i| !i.passed && i.item.is_critical());
        let status = if critical_failure {
            ComplianceStatus::NonCompliant
        } else if overall >= self.pass_threshold {
            ComplianceStatus::Compliant
        } else if overall >= self.conditional_threshold {
            ComplianceStatus::Conditional
        } else {
            ComplianceStatus::NonCompliant
        };

        let mut remediations: Vec<Remediation> = Vec::new();
        for item in items.iter().filter(|i| !i.passed) {
            let r = item.item.remediation();
            if !remediations.contains(&r) {
                remediations.push(r);
            }
        }
        if status == ComplianceStatus::NonCompliant && remediations.is_empty() {
            // low overall without a single failing item
            remediations.push(match phase {
                CompliancePhase::Extraction => Remediation::ReextractKeywords,
                CompliancePhase::Extension => Remediation::ReduceSearchCalls,
                CompliancePhase::Validation => Remediation::RevalidateIndependently,
                CompliancePhase::Generation => Remediation::RegenerateQuestion,
            });
        }

        debug!(?phase, overall, ?status, "Compliance evaluated");
        ComplianceReport {
            phase,
            items,
            overall,
            status,
            remediations,
        }
    }
}

fn keyword_specificity(kind: KeywordType) -> f64 {
    match kind {
        KeywordType::ProperNoun | KeywordType::Date | KeywordType::Numeric => 1.0,
        KeywordType::Technical => 0.9,
        KeywordType::Other => 0.5,
    }
}

fn score_item(
    item: ChecklistItem,
    phase: CompliancePhase,
    s: &ComplianceSubject<'_>,
) -> Option<(f64, String)> {
    match item {
        ChecklistItem::KeywordSpecificity => {
            let keywords = s.keywords.filter(|k| !k.is_empty())?;
            let mean = keywords
                .iter()
                .map(|k| keyword_specificity(k.keyword_type))
                .sum::<f64>()
                / keywords.len() as f64;
            Some((mean, format!("{} keywords", keywords.len())))
        }
        ChecklistItem::KeywordDistinctiveness => {
            let keywords = s.keywords.filter(|k| !k.is_empty())?;
            let mut worst: f64 = 0.0;
            for (i, a) in keywords.iter().enumerate() {
                for b in &keywords[i + 1..] {
                    worst = worst.max(text::similarity(&a.text, &b.text));
                }
            }
            Some((1.0 - worst, format!("max pairwise similarity {worst:.2}")))
        }
        ChecklistItem::KeywordUniqueness => {
            let keywords = s.keywords.filter(|k| !k.is_empty())?;
            let answers: Vec<&str> = std::iter::once(s.answer)
                .chain(s.ancestor_answers.iter().map(String::as_str))
                .collect();
            let clashing: Vec<&str> = keywords
                .iter()
                .filter(|k| {
                    answers.iter().any(|a| {
                        text::contains_phrase(&k.text, a) || text::contains_phrase(a, &k.text)
                    })
                })
                .map(|k| k.text.as_str())
                .collect();
            let score = 1.0 - clashing.len() as f64 / keywords.len() as f64;
            Some((score, format!("keywords echoing answers: {clashing:?}")))
        }
        ChecklistItem::DocumentGroundedness => match (phase, s.validation) {
            (CompliancePhase::Validation, Some(v)) => {
                Some((v.validity_score, format!("validity {:.2}", v.validity_score)))
            }
            _ => {
                let evidence = s.evidence?;
                let overlap = text::term_overlap(s.question, evidence);
                Some(((overlap / 0.5).min(1.0), format!("term overlap {overlap:.2}")))
            }
        },
        ChecklistItem::AnswerUniqueness => {
            let v = s.validation?;
            Some((v.uniqueness_score, format!("uniqueness {:.2}", v.uniqueness_score)))
        }
        ChecklistItem::ValidatorIndependence => {
            s.validation?;
            if s.validators_independent {
                Some((1.0, "separate providers".into()))
            } else {
                Some((0.6, "separate calls on one provider".into()))
            }
        }
        ChecklistItem::ValidatorAgreement => {
            let v = s.validation?;
            let gap = (v.validity_score - v.uniqueness_score).abs();
            Some((1.0 - gap, format!("score gap {gap:.2}")))
        }
        ChecklistItem::MinimalKeywordSufficiency => {
            // nothing was extracted, so there is no set to be minimal
            let report = s
                .minimality
                .filter(|r| !r.kept.is_empty() || !r.dropped.is_empty())?;
            let score = if report.kept.is_empty() {
                0.0
            } else if report.dropped.is_empty() || report.sufficiency_verified {
                1.0
            } else if report.restored.is_some() {
                0.8
            } else {
                0.7
            };
            Some((
                score,
                format!("kept {}, dropped {}", report.kept.len(), report.dropped.len()),
            ))
        }
        ChecklistItem::HierarchyCorrectness => {
            let keyword = s.parent_keyword?;
            let in_parent = s
                .parent_keywords
                .is_none_or(|ks| ks.iter().any(|k| k.text == keyword));
            let ok = s.answer == keyword && in_parent;
            Some((
                if ok { 1.0 } else { 0.0 },
                format!("answer {:?} vs parent keyword {:?}", s.answer, keyword),
            ))
        }
        ChecklistItem::SearchBudgetAdherence => {
            let (calls, budget) = s.search_budget?;
            let score = if calls <= budget {
                1.0
            } else {
                budget as f64 / calls as f64
            };
            Some((score, format!("{calls} calls of {budget}")))
        }
        ChecklistItem::ShortcutPrevention => {
            let leaked = std::iter::once(s.answer)
                .chain(s.ancestor_answers.iter().map(String::as_str))
                .find(|a| text::contains_phrase(s.question, a));
            Some(match leaked {
                Some(a) => (0.0, format!("question leaks {a:?}")),
                None => (1.0, "no answer leaked".into()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn enforcer() -> ComplianceEnforcer {
        ComplianceEnforcer::new(&ComplianceConfig::default())
    }

    fn validation(validity: f64, uniqueness: f64) -> ValidationResult {
        ValidationResult {
            passed: true,
            validity_score: validity,
            uniqueness_score: uniqueness,
            ..ValidationResult::default()
        }
    }

    #[test]
    fn test_validation_phase_compliant() {
        let v = validation(0.9, 0.9);
        let subject = ComplianceSubject {
            question: "Which agency operates the observatory?",
            answer: "NASA",
            validation: Some(&v),
            ..ComplianceSubject::default()
        };
        let report = enforcer().evaluate(CompliancePhase::Validation, &subject);
        assert_eq!(report.status, ComplianceStatus::Compliant);
        assert_eq!(report.items.len(), 4);
        assert!(report.remediations.is_empty());
        assert!(!report.should_retry());
        assert!(!report.is_terminal());
    }

    #[test]
    fn test_conditional_band() {
        let v = validation(0.75, 0.6);
        let subject = ComplianceSubject {
            question: "q?",
            answer: "a",
            validation: Some(&v),
            validators_independent: true,
            ..ComplianceSubject::default()
        };
        let report = enforcer().evaluate(CompliancePhase::Validation, &subject);
        assert_eq!(report.status, ComplianceStatus::Conditional);
        assert!(report.is_acceptable());
    }

    #[test]
    fn test_shortcut_leak_is_critical() {
        let ancestors = vec!["Hubble".to_string()];
        let subject = ComplianceSubject {
            question: "Which agency launched Hubble?",
            answer: "NASA",
            parent_keyword: Some("NASA"),
            ancestor_answers: &ancestors,
            evidence: Some("NASA launched the Hubble telescope agency"),
            ..ComplianceSubject::default()
        };
        let report = enforcer().evaluate(CompliancePhase::Generation, &subject);
        assert_eq!(report.status, ComplianceStatus::NonCompliant);
        assert_eq!(report.remediations, vec![Remediation::RephraseToRemoveShortcut]);
        assert!(report.should_retry());
    }

    #[test]
    fn test_hierarchy_failure_is_terminal() {
        let subject = ComplianceSubject {
            question: "Which agency was founded in 1958?",
            answer: "ESA",
            parent_keyword: Some("NASA"),
            ..ComplianceSubject::default()
        };
        let report = enforcer().evaluate(CompliancePhase::Extraction, &subject);
        assert!(report.is_terminal());
        assert!(report.remediations.contains(&Remediation::RejectPermanently));
    }

    #[test]
    fn test_search_budget_overrun() {
        let subject = ComplianceSubject {
            question: "q?",
            answer: "a",
            search_budget: Some((6, 3)),
            ..ComplianceSubject::default()
        };
        let report = enforcer().evaluate(CompliancePhase::Extension, &subject);
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].score, 0.5);
        assert_eq!(report.status, ComplianceStatus::NonCompliant);
        assert_eq!(report.remediations, vec![Remediation::ReduceSearchCalls]);
    }

    #[test]
    fn test_extraction_keyword_checks() {
        let keywords = vec![
            Keyword::new("Discovery", KeywordType::ProperNoun),
            Keyword::new("1958", KeywordType::Date),
        ];
        let subject = ComplianceSubject {
            question: "Which agency, founded in 1958, flew Discovery?",
            answer: "NASA",
            keywords: Some(&keywords),
            ..ComplianceSubject::default()
        };
        let report = enforcer().evaluate(CompliancePhase::Extraction, &subject);
        assert_eq!(report.status, ComplianceStatus::Compliant);
        assert!(report.failing().next().is_none());
    }

    #[test]
    fn test_keywordless_root_passes_extraction() {
        let minimality = MinimalityReport::default();
        let subject = ComplianceSubject {
            question: "Which orbiting observatory was deployed from a shuttle?",
            answer: "the Hubble Space Telescope",
            keywords: Some(&[]),
            minimality: Some(&minimality),
            ..ComplianceSubject::default()
        };
        let report = enforcer().evaluate(CompliancePhase::Extraction, &subject);
        assert_eq!(report.status, ComplianceStatus::Compliant);
        let items: Vec<ChecklistItem> = report.items.iter().map(|i| i.item).collect();
        assert_eq!(items, vec![ChecklistItem::ShortcutPrevention]);
    }
}
