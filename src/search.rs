//! Web search provider client. The provider returns organic and shopping
//! result arrays plus an eBay-style "sold listings" engine mode; everything is
//! treated as untyped JSON and parsed defensively by the orchestrator.

use crate::http::build_client;
use crate::retry::{RetryPolicy, with_retry};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("SEARCH_API_KEY is not set")]
    MissingKey,
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub base_url: String,
    pub api_key: String,
}

impl SearchConfig {
    /// Missing credentials are a configuration error: fatal, no retry.
    pub fn from_env() -> Result<Self, SearchError> {
        let api_key = std::env::var("SEARCH_API_KEY").map_err(|_| SearchError::MissingKey)?;
        let base_url = std::env::var("SEARCH_API_URL")
            .unwrap_or_else(|_| "https://serpapi.com".into())
            .trim_end_matches('/')
            .to_string();
        Ok(Self { base_url, api_key })
    }
}

pub struct SearchClient {
    http: Client,
    config: SearchConfig,
    retry: RetryPolicy,
}

impl SearchClient {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            http: build_client(),
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self, SearchError> {
        SearchConfig::from_env().map(Self::new)
    }

    /// General web search: organic + shopping result arrays.
    pub async fn web_search(&self, query: &str) -> Result<Value, SearchError> {
        let url = format!(
            "{}/search?engine=google&q={}&num=20&api_key={}",
            self.config.base_url,
            urlencoding::encode(query),
            self.config.api_key,
        );
        with_retry(&self.retry, "web_search", || self.fetch(url.clone())).await
    }

    /// Marketplace-native completed/sold listings search.
    pub async fn sold_listings(&self, query: &str) -> Result<Value, SearchError> {
        let url = format!(
            "{}/search?engine=ebay&_nkw={}&LH_Sold=1&LH_Complete=1&api_key={}",
            self.config.base_url,
            urlencoding::encode(query),
            self.config.api_key,
        );
        with_retry(&self.retry, "sold_listings", || self.fetch(url.clone())).await
    }

    async fn fetch(&self, url: String) -> Result<Value, SearchError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| SearchError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SearchError::Request(format!("HTTP {}", response.status())));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| SearchError::InvalidResponse(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_search_errors_are_retryable() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&SearchError::Request("HTTP 429".into()).to_string()));
        assert!(policy.is_retryable(&SearchError::Request("HTTP 503".into()).to_string()));
        assert!(!policy.is_retryable(&SearchError::MissingKey.to_string()));
        assert!(!policy.is_retryable(&SearchError::InvalidResponse("bad json".into()).to_string()));
    }
}
