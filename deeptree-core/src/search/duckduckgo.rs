//! DuckDuckGo instant-answer backend (no API key required).

use super::{SearchProvider, SearchResult};
use crate::config::SearchConfig;
use crate::error::SearchError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

const ENDPOINT: &str = "https://api.duckduckgo.com/";

pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    endpoint: String,
    timeout_secs: u64,
}

impl DuckDuckGoSearch {
    pub fn new(config: &SearchConfig) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| SearchError::Request {
                message: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: ENDPOINT.to_string(),
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let url = format!(
            "{}?q={}&format=json&no_html=1&skip_disambig=1",
            self.endpoint,
            urlencoding::encode(query)
        );
        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                SearchError::Timeout {
                    timeout_secs: self.timeout_secs,
                }
            } else {
                SearchError::Request {
                    message: e.to_string(),
                }
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Request {
                message: format!("HTTP {status}"),
            });
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| SearchError::ResponseParse {
                message: e.to_string(),
            })?;
        Ok(parse_instant_answer(&body, max_results))
    }

    fn name(&self) -> &str {
        "duckduckgo"
    }
}

/// Convert an instant-answer body into results: abstract first, then related
/// topics (nested topic groups flattened), then direct results.
pub fn parse_instant_answer(body: &Value, max_results: usize) -> Vec<SearchResult> {
    let mut results = Vec::new();

    if let Some(text) = body.get("AbstractText").and_then(|v| v.as_str())
        && !text.is_empty()
    {
        let title = body
            .get("Heading")
            .and_then(|v| v.as_str())
            .filter(|h| !h.is_empty())
            .or_else(|| body.get("AbstractSource").and_then(|v| v.as_str()))
            .unwrap_or("Abstract");
        let url = body
            .get("AbstractURL")
            .and_then(|v| v.as_str())
            .filter(|u| !u.is_empty());
        let mut result = SearchResult::new(title, text, url);
        if let Some(source) = body.get("AbstractSource").and_then(|v| v.as_str()) {
            result.citations.push(source.to_string());
        }
        results.push(result);
    }

    let mut topics = Vec::new();
    if let Some(related) = body.get("RelatedTopics").and_then(|v| v.as_array()) {
        for topic in related {
            match topic.get("Topics").and_then(|v| v.as_array()) {
                Some(group) => topics.extend(group.iter()),
                None => topics.push(topic),
            }
        }
    }
    if let Some(direct) = body.get("Results").and_then(|v| v.as_array()) {
        topics.extend(direct.iter());
    }

    for topic in topics {
        if results.len() >= max_results {
            break;
        }
        let Some(text) = topic.get("Text").and_then(|v| v.as_str()) else {
            continue;
        };
        let url = topic
            .get("FirstURL")
            .and_then(|v| v.as_str())
            .filter(|u| !u.is_empty());
        // "Title - description" is the usual shape of a topic text
        let title = text.split(" - ").next().unwrap_or(text);
        results.push(SearchResult::new(title, text, url));
    }

    results.truncate(max_results);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_instant_answer() {
        let body = serde_json::json!({
            "Heading": "Hubble Space Telescope",
            "AbstractText": "The Hubble Space Telescope is a space telescope launched in 1990.",
            "AbstractSource": "Wikipedia",
            "AbstractURL": "https://en.wikipedia.org/wiki/Hubble_Space_Telescope",
            "RelatedTopics": [
                {"Text": "STS-31 - Space Shuttle mission that deployed Hubble", "FirstURL": "https://duckduckgo.com/STS-31"},
                {"Name": "Instruments", "Topics": [
                    {"Text": "WFPC2 - Wide Field and Planetary Camera 2", "FirstURL": ""}
                ]}
            ],
            "Results": []
        });
        let results = parse_instant_answer(&body, 5);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].title, "Hubble Space Telescope");
        assert_eq!(results[0].citations, vec!["Wikipedia"]);
        assert_eq!(results[1].title, "STS-31");
        assert_eq!(results[2].url, None);
    }

    #[test]
    fn test_parse_respects_max_results() {
        let body = serde_json::json!({
            "AbstractText": "",
            "RelatedTopics": [
                {"Text": "a - 1", "FirstURL": "https://a"},
                {"Text": "b - 2", "FirstURL": "https://b"},
                {"Text": "c - 3", "FirstURL": "https://c"}
            ]
        });
        assert_eq!(parse_instant_answer(&body, 2).len(), 2);
        assert!(parse_instant_answer(&serde_json::json!({}), 5).is_empty());
    }

    #[test]
    fn test_new_builds_client() {
        let search = DuckDuckGoSearch::new(&SearchConfig::default()).unwrap();
        assert_eq!(search.name(), "duckduckgo");
    }
}
