//! Search-grounded extension content for child questions.
//!
//! For one parent keyword the engine makes a bounded number of attempts, each
//! with its own query and at most one search call. Results that merely repeat
//! the source document are dropped, the rest are ranked by relevance and
//! source credibility, and the best few are condensed by the model into a
//! context paragraph with facts and a confidence. A synthesis below the
//! confidence floor fails the attempt. When every attempt fails the extension
//! is abandoned; nothing is substituted.

use crate::brain::Brain;
use crate::config::ExtensionConfig;
use crate::judgment;
use crate::model::{ExtensionContext, ExtensionStrategy, ExtensionType, SourceRef};
use crate::prompts;
use crate::search::{SearchClient, SearchResult};
use crate::text;
use crate::trajectory::{StepDraft, StepType, TrajectoryRecorder};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts per extension never exceed this, whatever the configuration says.
pub const MAX_EXTENSION_ATTEMPTS: usize = 3;

const RELEVANCE_WEIGHT: f64 = 0.6;
const CREDIBILITY_WEIGHT: f64 = 0.4;

const SCHOLARLY_HOSTS: &[&str] = &[
    "wikipedia.org",
    "britannica.com",
    "nature.com",
    "science.org",
    "arxiv.org",
    "jstor.org",
    "sciencedirect.com",
    "springer.com",
    "scholar.google.com",
];

/// Everything the engine needs to extend one keyword.
#[derive(Debug, Clone)]
pub struct ExtensionRequest<'a> {
    /// Candidate node the extension is for.
    pub candidate_id: Uuid,
    pub layer: usize,
    pub keyword: &'a str,
    pub parent_question: &'a str,
    pub parent_answer: &'a str,
    pub extension_type: ExtensionType,
    pub strategy: ExtensionStrategy,
    pub document_text: &'a str,
}

impl ExtensionRequest<'_> {
    /// Terms from the parent question that widen a domain-expanded query.
    pub fn domain_terms(&self) -> Vec<String> {
        let exclude: Vec<String> = text::content_tokens(self.keyword)
            .into_iter()
            .chain(text::content_tokens(self.parent_answer))
            .collect();
        let mut terms = Vec::new();
        for token in text::content_tokens(self.parent_question) {
            if !exclude.contains(&token) && !terms.contains(&token) {
                terms.push(token);
            }
        }
        terms
    }
}

/// Build the query for one attempt. Each attempt gets a distinct focus;
/// the strategy adds angle or domain terms.
pub fn formulate_query(
    keyword: &str,
    extension_type: ExtensionType,
    strategy: ExtensionStrategy,
    attempt: usize,
    domain_terms: &[String],
) -> String {
    let focus = match (extension_type, attempt % MAX_EXTENSION_ATTEMPTS) {
        (ExtensionType::Series, 0) => "technical details",
        (ExtensionType::Series, 1) => "history",
        (ExtensionType::Series, _) => "specifications",
        (ExtensionType::Parallel, 0) => "overview",
        (ExtensionType::Parallel, 1) => "related facts",
        (ExtensionType::Parallel, _) => "background",
    };
    let mut query = format!("{keyword} {focus}");
    match strategy {
        ExtensionStrategy::Standard => {}
        ExtensionStrategy::MultiAngle => {
            let angle = ["origin", "role", "significance"][attempt % 3];
            query.push(' ');
            query.push_str(angle);
        }
        ExtensionStrategy::DomainExpanded => {
            for term in domain_terms.iter().take(3) {
                query.push(' ');
                query.push_str(term);
            }
        }
    }
    if attempt + 1 >= MAX_EXTENSION_ATTEMPTS && strategy != ExtensionStrategy::DomainExpanded {
        for term in domain_terms.iter().take(2) {
            query.push(' ');
            query.push_str(term);
        }
    }
    query
}

/// Credibility of a source by its domain.
pub fn credibility(url: Option<&str>) -> f64 {
    let Some(url) = url else {
        return 0.3;
    };
    let host = url
        .split("://")
        .nth(1)
        .unwrap_or(url)
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .to_lowercase();
    if host.is_empty() {
        return 0.3;
    }
    if SCHOLARLY_HOSTS.iter().any(|h| host == *h || host.ends_with(&format!(".{h}"))) {
        return 0.85;
    }
    if host.ends_with(".gov") || host.ends_with(".edu") || host.contains(".gov.") || host.contains(".edu.") {
        return 0.9;
    }
    if host.ends_with(".org") {
        return 0.7;
    }
    0.5
}

/// Whether a result mostly repeats the source document.
pub fn is_document_derived(content: &str, document_norm: &str) -> bool {
    let content_norm = text::normalize(content);
    if content_norm.is_empty() {
        return true;
    }
    if document_norm.contains(&content_norm) {
        return true;
    }
    let sentences: Vec<String> = content
        .split(['.', '!', '?', '\n'])
        .map(text::normalize)
        .filter(|s| s.split(' ').count() >= 6)
        .collect();
    if sentences.is_empty() {
        return false;
    }
    let copied = sentences
        .iter()
        .filter(|s| document_norm.contains(s.as_str()))
        .count();
    copied * 2 > sentences.len()
}

#[derive(Debug, Clone)]
struct RankedResult {
    result: SearchResult,
    credibility: f64,
    score: f64,
}

fn rank(results: Vec<SearchResult>, keyword: &str, query: &str) -> Vec<RankedResult> {
    let mut ranked: Vec<RankedResult> = results
        .into_iter()
        .map(|result| {
            let body = format!("{} {}", result.title, result.content);
            let relevance =
                0.5 * text::term_overlap(keyword, &body) + 0.5 * text::term_overlap(query, &body);
            let credibility = credibility(result.url.as_deref());
            RankedResult {
                score: RELEVANCE_WEIGHT * relevance + CREDIBILITY_WEIGHT * credibility,
                credibility,
                result,
            }
        })
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked
}

#[derive(Debug, Clone, PartialEq)]
struct Synthesis {
    context: String,
    facts: Vec<String>,
    confidence: f64,
    fallback_used: bool,
}

fn parse_synthesis(reply: &str) -> Synthesis {
    if let Some(value) = judgment::extract_json(reply)
        && let Some(context) = judgment::string_field(&value, "context")
    {
        return Synthesis {
            facts: judgment::string_list(&value, "facts"),
            confidence: judgment::number_field(&value, "confidence").unwrap_or(0.0),
            context,
            fallback_used: false,
        };
    }
    // raw paragraph plus any stated confidence
    let context = reply
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty() && !p.starts_with('{'))
        .unwrap_or("")
        .to_string();
    let confidence = if context.is_empty() {
        0.0
    } else {
        judgment::heuristic_number(reply).unwrap_or(0.0)
    };
    Synthesis {
        context,
        facts: Vec::new(),
        confidence,
        fallback_used: true,
    }
}

pub struct ExtensionEngine {
    brain: Arc<Brain>,
    search: SearchClient,
    max_attempts: usize,
    min_confidence: f64,
    top_results: usize,
}

impl ExtensionEngine {
    pub fn new(brain: Arc<Brain>, search: SearchClient, config: &ExtensionConfig) -> Self {
        Self {
            brain,
            search,
            max_attempts: config.max_attempts.clamp(1, MAX_EXTENSION_ATTEMPTS),
            min_confidence: config.min_confidence,
            top_results: config.top_results.max(1),
        }
    }

    pub fn search_calls_issued(&self) -> usize {
        self.search.calls_issued()
    }

    /// Gather search-grounded context for `request.keyword`, or `None` when
    /// every attempt falls short.
    pub async fn extend(
        &mut self,
        request: &ExtensionRequest<'_>,
        trajectory: &mut TrajectoryRecorder,
    ) -> Option<ExtensionContext> {
        let domain_terms = request.domain_terms();
        let document_norm = text::normalize(request.document_text);
        let mut total_calls = 0;

        for attempt in 0..self.max_attempts {
            let started = Instant::now();
            let query = formulate_query(
                request.keyword,
                request.extension_type,
                request.strategy,
                attempt,
                &domain_terms,
            );
            let (results, outcome) = self.search.search(&query).await;
            total_calls += outcome.calls();

            let returned = results.len();
            let independent: Vec<SearchResult> = results
                .into_iter()
                .filter(|r| !is_document_derived(&r.content, &document_norm))
                .collect();
            let mut ranked = rank(independent, request.keyword, &query);
            ranked.truncate(self.top_results);

            let synthesis = if ranked.is_empty() {
                None
            } else {
                Some(self.synthesize(request, &query, &ranked).await)
            };
            let confidence = synthesis.as_ref().map(|s| s.confidence).unwrap_or(0.0);
            let success = synthesis
                .as_ref()
                .is_some_and(|s| !s.context.is_empty() && s.confidence >= self.min_confidence);

            trajectory.record(
                StepDraft::new(StepType::Search, success)
                    .node(request.candidate_id, request.layer)
                    .inputs(json!({
                        "keyword": request.keyword,
                        "query": query,
                        "attempt": attempt + 1,
                        "strategy": request.strategy,
                        "extension_type": request.extension_type,
                    }))
                    .outputs(json!({
                        "returned": returned,
                        "independent": ranked.len(),
                        "cached": outcome.calls() == 0,
                        "confidence": confidence,
                        "fallback_used": synthesis.as_ref().is_some_and(|s| s.fallback_used),
                    }))
                    .search_calls(outcome.calls())
                    .duration(started.elapsed()),
            );

            match synthesis {
                Some(s) if success => {
                    info!(
                        keyword = request.keyword,
                        attempt = attempt + 1,
                        confidence = s.confidence,
                        "Extension synthesized"
                    );
                    return Some(ExtensionContext {
                        original_keyword: request.keyword.to_string(),
                        extension_type: request.extension_type,
                        strategy: request.strategy,
                        search_query: query,
                        synthesized_context: s.context,
                        facts: s.facts,
                        confidence: s.confidence,
                        sources: ranked
                            .iter()
                            .map(|r| SourceRef {
                                title: r.result.title.clone(),
                                url: r.result.url.clone(),
                                credibility: r.credibility,
                            })
                            .collect(),
                        attempts: attempt + 1,
                        search_calls: total_calls,
                    });
                }
                _ => debug!(
                    keyword = request.keyword,
                    attempt = attempt + 1,
                    confidence,
                    "Extension attempt fell short"
                ),
            }
        }

        warn!(
            keyword = request.keyword,
            attempts = self.max_attempts,
            "Extension abandoned"
        );
        trajectory.record(
            StepDraft::new(StepType::ExtensionAbandoned, false)
                .node(request.candidate_id, request.layer)
                .inputs(json!({ "keyword": request.keyword }))
                .outputs(json!({ "attempts": self.max_attempts, "search_calls": total_calls })),
        );
        None
    }

    async fn synthesize(
        &self,
        request: &ExtensionRequest<'_>,
        query: &str,
        ranked: &[RankedResult],
    ) -> Synthesis {
        let listing = ranked
            .iter()
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "[{}] {}\n{}\nSource: {}",
                    i + 1,
                    r.result.title,
                    r.result.content,
                    r.result.url.as_deref().unwrap_or("unknown")
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt =
            prompts::extension_synthesis(request.keyword, request.extension_type, query, &listing);
        match self.brain.judge(prompts::SYSTEM_RESEARCHER, prompt).await {
            Ok(reply) => parse_synthesis(&reply),
            Err(e) => {
                warn!(keyword = request.keyword, error = %e, "Synthesis call failed");
                Synthesis {
                    context: String::new(),
                    facts: Vec::new(),
                    confidence: 0.0,
                    fallback_used: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::config::{ResilienceConfig, SearchConfig};
    use crate::providers::CircuitBreaker;
    use crate::search::MockSearchProvider;
    use std::time::Duration;

    const DOC: &str = "The Hubble Space Telescope was launched by NASA in 1990 aboard the space shuttle Discovery.";

    fn engine(llm: MockLlmProvider, search: Arc<MockSearchProvider>) -> ExtensionEngine {
        let resilience = ResilienceConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            ..ResilienceConfig::default()
        };
        let breaker = CircuitBreaker::shared(20, 15, Duration::from_secs(60));
        let client = SearchClient::new(search, &SearchConfig::default(), &resilience, 16, breaker);
        ExtensionEngine::new(
            Arc::new(Brain::with_defaults(Arc::new(llm))),
            client,
            &ExtensionConfig::default(),
        )
    }

    fn request(strategy: ExtensionStrategy) -> ExtensionRequest<'static> {
        ExtensionRequest {
            candidate_id: Uuid::new_v4(),
            layer: 1,
            keyword: "Discovery",
            parent_question: "Which observatory did NASA deploy from Discovery in 1990?",
            parent_answer: "Hubble",
            extension_type: ExtensionType::Series,
            strategy,
            document_text: DOC,
        }
    }

    fn orbiter_results() -> Vec<SearchResult> {
        vec![
            SearchResult::new(
                "Space Shuttle Discovery",
                "Discovery is a retired orbiter that flew 39 missions between 1984 and 2011.",
                Some("https://en.wikipedia.org/wiki/Space_Shuttle_Discovery"),
            ),
            SearchResult::new(
                "Copied",
                "The Hubble Space Telescope was launched by NASA in 1990 aboard the space shuttle Discovery.",
                Some("https://example.com/copy"),
            ),
        ]
    }

    #[test]
    fn test_credibility_tiers() {
        assert_eq!(credibility(Some("https://www.nasa.gov/hubble")), 0.9);
        assert_eq!(credibility(Some("https://cs.stanford.edu/x")), 0.9);
        assert_eq!(credibility(Some("https://en.wikipedia.org/wiki/X")), 0.85);
        assert_eq!(credibility(Some("https://www.esa.org/")), 0.7);
        assert_eq!(credibility(Some("https://blog.example.com/")), 0.5);
        assert_eq!(credibility(None), 0.3);
    }

    #[test]
    fn test_queries_differ_per_attempt() {
        let terms = request(ExtensionStrategy::Standard).domain_terms();
        assert!(terms.contains(&"observatory".to_string()));
        assert!(!terms.contains(&"discovery".to_string()));
        let queries: Vec<String> = (0..3)
            .map(|a| {
                formulate_query("Discovery", ExtensionType::Series, ExtensionStrategy::Standard, a, &terms)
            })
            .collect();
        assert_eq!(queries[0], "Discovery technical details");
        assert_ne!(queries[0], queries[1]);
        assert_ne!(queries[1], queries[2]);
        let expanded = formulate_query(
            "Discovery",
            ExtensionType::Parallel,
            ExtensionStrategy::DomainExpanded,
            0,
            &terms,
        );
        assert!(expanded.starts_with("Discovery overview observatory"));
        let angled =
            formulate_query("Discovery", ExtensionType::Series, ExtensionStrategy::MultiAngle, 1, &terms);
        assert!(angled.ends_with("role"));
    }

    #[test]
    fn test_document_derived_results_filtered() {
        let doc = text::normalize(DOC);
        assert!(is_document_derived(&orbiter_results()[1].content, &doc));
        assert!(!is_document_derived(&orbiter_results()[0].content, &doc));
    }

    #[test]
    fn test_parse_synthesis_fallback() {
        let s = parse_synthesis("Discovery flew 39 missions.\n\nConfidence: 0.8");
        assert!(s.fallback_used);
        assert_eq!(s.context, "Discovery flew 39 missions.");
        assert!((s.confidence - 0.8).abs() < 1e-9);
        assert_eq!(parse_synthesis("").confidence, 0.0);
    }

    #[tokio::test]
    async fn test_first_attempt_succeeds() {
        let search = Arc::new(MockSearchProvider::new().on("Discovery", orbiter_results()));
        let llm = MockLlmProvider::new().on(
            "TASK: EXTENSION_SYNTHESIS",
            r#"{"context": "Discovery is a retired orbiter that flew 39 missions.", "facts": ["39 missions"], "confidence": 0.9}"#,
        );
        let mut e = engine(llm, search.clone());
        let mut rec = TrajectoryRecorder::new("doc");
        let ctx = e
            .extend(&request(ExtensionStrategy::Standard), &mut rec)
            .await
            .unwrap();
        assert_eq!(ctx.attempts, 1);
        assert_eq!(ctx.search_calls, 1);
        // the copied snippet never reaches synthesis
        assert_eq!(ctx.sources.len(), 1);
        assert_eq!(ctx.sources[0].credibility, 0.85);
        assert_eq!(rec.count(StepType::Search), 1);
        assert_eq!(search.call_count(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_abandons_after_three() {
        let search = Arc::new(MockSearchProvider::new().on("Discovery", orbiter_results()));
        let llm = MockLlmProvider::new().on(
            "TASK: EXTENSION_SYNTHESIS",
            r#"{"context": "Unclear.", "facts": [], "confidence": 0.2}"#,
        );
        let mut e = engine(llm, search.clone());
        let mut rec = TrajectoryRecorder::new("doc");
        let ctx = e.extend(&request(ExtensionStrategy::Standard), &mut rec).await;
        assert!(ctx.is_none());
        assert_eq!(rec.count(StepType::Search), 3);
        assert_eq!(rec.count(StepType::ExtensionAbandoned), 1);
        assert!(rec.steps().iter().all(|s| !s.success));
        assert_eq!(search.call_count(), 3);
        assert_eq!(e.search_calls_issued(), 3);
    }

    #[tokio::test]
    async fn test_no_results_skips_synthesis() {
        let search = Arc::new(MockSearchProvider::new());
        let llm = MockLlmProvider::new();
        let mut e = engine(llm, search);
        let mut rec = TrajectoryRecorder::new("doc");
        assert!(e.extend(&request(ExtensionStrategy::MultiAngle), &mut rec).await.is_none());
        assert_eq!(rec.count(StepType::Search), 3);
    }
}
