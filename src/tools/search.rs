//! Web search tool
//!
//! Provides web search via configurable providers (Brave, Serper)

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Results spoken back to the model
const SPOKEN_RESULTS: usize = 3;

/// Snippet characters kept per result
const SNIPPET_CHARS: usize = 200;

/// Search provider configuration
#[derive(Debug, Clone)]
pub enum SearchProvider {
    /// Brave Search API
    Brave {
        /// API key for Brave Search
        api_key: SecretString,
    },
    /// Serper (Google) Search API
    Serper {
        /// API key for Serper
        api_key: SecretString,
    },
}

/// Web search tool
pub struct WebSearchTool {
    provider: SearchProvider,
    client: reqwest::Client,
}

/// Search result from web search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Result title
    pub title: String,
    /// Result URL
    pub url: String,
    /// Result snippet/description
    pub snippet: String,
}

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
const SERPER_ENDPOINT: &str = "https://google.serper.dev/search";

// Brave: GET with the query string, results under `web.results`
#[derive(Debug, Default, Deserialize)]
struct BraveBody {
    #[serde(default)]
    web: BraveHits,
}

#[derive(Debug, Default, Deserialize)]
struct BraveHits {
    #[serde(default)]
    results: Vec<BraveHit>,
}

#[derive(Debug, Deserialize)]
struct BraveHit {
    title: String,
    url: String,
    #[serde(default)]
    description: String,
}

impl From<BraveHit> for SearchResult {
    fn from(hit: BraveHit) -> Self {
        Self {
            title: hit.title,
            url: hit.url,
            snippet: hit.description,
        }
    }
}

// Serper: POST a JSON body, results under `organic`
#[derive(Debug, Default, Deserialize)]
struct SerperBody {
    #[serde(default)]
    organic: Vec<SerperHit>,
}

#[derive(Debug, Deserialize)]
struct SerperHit {
    title: String,
    link: String,
    #[serde(default)]
    snippet: String,
}

impl From<SerperHit> for SearchResult {
    fn from(hit: SerperHit) -> Self {
        Self {
            title: hit.title,
            url: hit.link,
            snippet: hit.snippet,
        }
    }
}

impl WebSearchTool {
    /// Create a search tool whose requests give up after `timeout`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(provider: SearchProvider, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { provider, client })
    }

    /// Provider name, for logging
    #[must_use]
    pub const fn provider_name(&self) -> &'static str {
        match self.provider {
            SearchProvider::Brave { .. } => "brave",
            SearchProvider::Serper { .. } => "serper",
        }
    }

    /// Query the provider for up to `limit` results
    ///
    /// # Errors
    ///
    /// Returns error on a transport failure, a non-success status, or an
    /// undecodable body
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        tracing::debug!(provider = self.provider_name(), query, limit, "web search");

        let results: Vec<SearchResult> = match &self.provider {
            SearchProvider::Brave { api_key } => {
                let request = self
                    .client
                    .get(BRAVE_ENDPOINT)
                    .header("X-Subscription-Token", api_key.expose_secret())
                    .query(&[("q", query), ("count", &limit.to_string())]);
                let body: BraveBody = fetch(request).await?;
                body.web.results.into_iter().map(Into::into).collect()
            }
            SearchProvider::Serper { api_key } => {
                let request = self
                    .client
                    .post(SERPER_ENDPOINT)
                    .header("X-API-KEY", api_key.expose_secret())
                    .json(&serde_json::json!({ "q": query, "num": limit }));
                let body: SerperBody = fetch(request).await?;
                body.organic.into_iter().map(Into::into).collect()
            }
        };

        tracing::debug!(count = results.len(), "web search returned");
        Ok(results)
    }
}

async fn fetch<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T> {
    let response = request.send().await?.error_for_status().map_err(Error::Http)?;
    Ok(response.json().await?)
}

/// Format the top results for the model to read out
#[must_use]
pub fn format_results(query: &str, results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No results found.".to_string();
    }

    let mut formatted = format!("Search results for '{query}':\n\n");
    for (i, result) in results.iter().take(SPOKEN_RESULTS).enumerate() {
        let snippet: String = result.snippet.chars().take(SNIPPET_CHARS).collect();
        formatted.push_str(&format!("{}. {}\n{snippet}...\n\n", i + 1, result.title));
    }
    formatted
}
