pub mod augment;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::conversation::Source;
use crate::error::{ParleyError, Result};

pub use augment::{build_augmented_prompt, Augmentation, SourceAugmenter};

const MAX_TOKENS_PER_PAGE: u32 = 1024;
const USER_AGENT: &str = "Mozilla/5.0 (compatible; parley/0.1)";

/// Web search collaborator used for prompt augmentation.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Ranked sources for `query`, at most `max_results`.
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Source>>;

    /// Plain text of the page at `url`.
    async fn fetch_page_text(&self, url: &str) -> Result<String>;

    /// Whether credentials are configured.  Checked before every search.
    fn has_api_key(&self) -> bool;
}

// -- Perplexity -------------------------------------------------------------

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    max_results: usize,
    max_tokens_per_page: u32,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    date: Option<String>,
}

/// Search client backed by the Perplexity search API.
pub struct PerplexityClient {
    client: Client,
    api_key: String,
    base_url: String,
    fetch_timeout: Duration,
}

impl PerplexityClient {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ParleyError::Config(format!("failed to create HTTP client: {e}")))?;

        info!(
            base_url = %config.base_url,
            has_key = !config.api_key.is_empty(),
            "search client initialized"
        );

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs.max(1)),
        })
    }
}

#[async_trait]
impl SearchClient for PerplexityClient {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Source>> {
        if self.api_key.is_empty() {
            return Err(ParleyError::MissingApiKey("search".into()));
        }

        let url = format!("{}/search", self.base_url);
        let body = SearchRequest {
            query,
            max_results,
            max_tokens_per_page: MAX_TOKENS_PER_PAGE,
        };

        debug!(query, max_results, "searching the web");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(status = %status, "search API rejected the key");
            return Err(ParleyError::InvalidApiKey("search".into()));
        }
        if !status.is_success() {
            warn!(status = %status, "search API error");
            return Err(ParleyError::ServerError(status.as_u16()));
        }

        let parsed: SearchResponse = resp.json().await?;
        let sources: Vec<Source> = parsed
            .results
            .into_iter()
            .filter(|hit| !hit.url.is_empty())
            .take(max_results)
            .map(|hit| {
                debug!(url = %hit.url, score = ?hit.score, date = ?hit.date, "search hit");
                let title = if hit.title.trim().is_empty() || hit.title.contains(&hit.url) {
                    fallback_title(&hit.url)
                } else {
                    hit.title
                };
                Source::new(title, hit.url, hit.snippet.filter(|s| !s.is_empty()))
            })
            .collect();

        info!(query, results = sources.len(), "search completed");
        Ok(sources)
    }

    async fn fetch_page_text(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .timeout(self.fetch_timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ParleyError::ServerError(status.as_u16()));
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = resp.text().await?;
        let text = if content_type.contains("text/html") {
            htmd::convert(&body).unwrap_or(body)
        } else {
            body
        };

        debug!(url, chars = text.len(), "page fetched");
        Ok(text.trim().to_string())
    }

    fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Title for a hit that came back without one. Never the URL itself, so the
/// augmented prompt names each URL exactly once.
fn fallback_title(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "Untitled".to_string())
}
