//! Web search access for the extension system.
//!
//! [`SearchProvider`] is the seam for backends. [`SearchClient`] owns the
//! provider together with retry, the shared circuit breaker, a rate limiter
//! and an LRU cache keyed by the literal query string. The client is used from
//! the single tree-construction task, so it takes `&mut self` and holds no
//! locks of its own.

pub mod duckduckgo;

pub use duckduckgo::DuckDuckGoSearch;

use crate::config::{ResilienceConfig, SearchConfig};
use crate::error::SearchError;
use crate::providers::{RequestRateLimiter, RetryPolicy, SharedBreaker, with_resilience};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub content: String,
    pub url: Option<String>,
    #[serde(default)]
    pub citations: Vec<String>,
}

impl SearchResult {
    pub fn new(title: impl Into<String>, content: impl Into<String>, url: Option<&str>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            url: url.map(String::from),
            citations: Vec::new(),
        }
    }
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize)
    -> Result<Vec<SearchResult>, SearchError>;

    fn name(&self) -> &str;
}

/// How a [`SearchClient::search`] call was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Served from cache; no call issued.
    Cached,
    /// One logical call issued (retries included).
    Issued,
    /// A call was issued and failed after retries.
    Failed,
}

impl SearchOutcome {
    pub fn calls(self) -> usize {
        match self {
            SearchOutcome::Cached => 0,
            SearchOutcome::Issued | SearchOutcome::Failed => 1,
        }
    }
}

pub struct SearchClient {
    provider: Arc<dyn SearchProvider>,
    policy: RetryPolicy,
    breaker: SharedBreaker,
    limiter: RequestRateLimiter,
    cache: LruCache<String, Vec<SearchResult>>,
    max_results: usize,
    calls: usize,
}

impl SearchClient {
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        search: &SearchConfig,
        resilience: &ResilienceConfig,
        cache_capacity: usize,
        breaker: SharedBreaker,
    ) -> Self {
        Self {
            provider,
            policy: RetryPolicy::from(resilience),
            breaker,
            limiter: RequestRateLimiter::new(resilience.requests_per_minute),
            cache: LruCache::new(NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN)),
            max_results: search.max_results,
            calls: 0,
        }
    }

    /// Search `query`. Provider failure after retries yields no results.
    pub async fn search(&mut self, query: &str) -> (Vec<SearchResult>, SearchOutcome) {
        if let Some(hit) = self.cache.get(query) {
            debug!(query, "Search cache hit");
            return (hit.clone(), SearchOutcome::Cached);
        }

        if let Some(wait) = self.limiter.check() {
            debug!(wait_ms = wait.as_millis() as u64, "Rate limiter delaying search");
            tokio::time::sleep(wait).await;
        }
        self.limiter.record();
        self.calls += 1;

        let provider = Arc::clone(&self.provider);
        let max_results = self.max_results;
        let result = with_resilience(&self.policy, &self.breaker, "search", || {
            let provider = Arc::clone(&provider);
            async move { provider.search(query, max_results).await }
        })
        .await;

        match result {
            Ok(results) => {
                debug!(query, count = results.len(), provider = self.provider.name(), "Search completed");
                self.cache.put(query.to_string(), results.clone());
                (results, SearchOutcome::Issued)
            }
            Err(e) => {
                warn!(query, error = %e, "Search failed, treating as no results");
                (Vec::new(), SearchOutcome::Failed)
            }
        }
    }

    /// Logical search calls issued so far (cache hits excluded).
    pub fn calls_issued(&self) -> usize {
        self.calls
    }

    pub fn cached_queries(&self) -> usize {
        self.cache.len()
    }
}

struct ScriptedResults {
    needle: String,
    results: Vec<SearchResult>,
}

/// Deterministic search backend for tests and dry runs.
///
/// Results are scripted by query substring; the longest matching needle
/// wins. Unscripted queries return no results.
#[derive(Default)]
pub struct MockSearchProvider {
    scripts: Vec<ScriptedResults>,
    fail_remaining: AtomicUsize,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl MockSearchProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, needle: impl Into<String>, results: Vec<SearchResult>) -> Self {
        self.scripts.push(ScriptedResults {
            needle: needle.into(),
            results,
        });
        self
    }

    /// The first `n` calls fail with a transient error.
    pub fn failing(self, n: usize) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl SearchProvider for MockSearchProvider {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(query.to_string());

        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SearchError::Request {
                message: "mock transient failure".to_string(),
            });
        }

        let lower = query.to_lowercase();
        Ok(self
            .scripts
            .iter()
            .filter(|s| lower.contains(&s.needle.to_lowercase()))
            .max_by_key(|s| s.needle.len())
            .map(|s| s.results.iter().take(max_results).cloned().collect())
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::CircuitBreaker;
    use std::time::Duration;

    fn client(provider: Arc<MockSearchProvider>, capacity: usize) -> SearchClient {
        let resilience = ResilienceConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            ..ResilienceConfig::default()
        };
        let breaker = CircuitBreaker::shared(20, 15, Duration::from_secs(60));
        SearchClient::new(provider, &SearchConfig::default(), &resilience, capacity, breaker)
    }

    fn hubble() -> Vec<SearchResult> {
        vec![SearchResult::new(
            "Hubble Space Telescope",
            "Hubble is a space telescope operated by NASA.",
            Some("https://en.wikipedia.org/wiki/Hubble_Space_Telescope"),
        )]
    }

    #[tokio::test]
    async fn test_cache_hit_issues_no_call() {
        let mock = Arc::new(MockSearchProvider::new().on("hubble", hubble()));
        let mut c = client(mock.clone(), 8);
        let (r1, o1) = c.search("Hubble history").await;
        let (r2, o2) = c.search("Hubble history").await;
        assert_eq!(r1, r2);
        assert_eq!(o1, SearchOutcome::Issued);
        assert_eq!(o2, SearchOutcome::Cached);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(c.calls_issued(), 1);
        assert_eq!(o2.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let mock = Arc::new(MockSearchProvider::new().on("hubble", hubble()).failing(2));
        let mut c = client(mock.clone(), 8);
        let (results, outcome) = c.search("hubble").await;
        assert_eq!(results.len(), 1);
        assert_eq!(outcome, SearchOutcome::Issued);
        assert_eq!(mock.call_count(), 3);
        assert_eq!(c.calls_issued(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mean_no_results() {
        let mock = Arc::new(MockSearchProvider::new().on("hubble", hubble()).failing(10));
        let mut c = client(mock, 8);
        let (results, outcome) = c.search("hubble").await;
        assert!(results.is_empty());
        assert_eq!(outcome, SearchOutcome::Failed);
        assert_eq!(c.cached_queries(), 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_still_caches_one() {
        let mock = Arc::new(MockSearchProvider::new());
        let mut c = client(mock, 0);
        c.search("a").await;
        assert_eq!(c.search("a").await.1, SearchOutcome::Cached);
    }
}
