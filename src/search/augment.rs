use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::SearchClient;
use crate::conversation::Source;
use crate::error::{ParleyError, Result};

/// Fetched page text is cut to this many characters per source.
const MAX_CONTENT_CHARS: usize = 800;

/// Embed search results into `query` as numbered, citable context.
///
/// Deterministic: identical inputs always produce identical output.
pub fn build_augmented_prompt(
    query: &str,
    sources: &[Source],
    fetched_text_by_url: &HashMap<String, String>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(query);
    prompt.push_str("\n\n---\nCONTEXT FROM WEB SEARCH:\n\n");

    for (i, source) in sources.iter().enumerate() {
        let _ = writeln!(prompt, "[{}] {}", i + 1, source.title);
        let _ = writeln!(prompt, "URL: {}", source.url);

        match fetched_text_by_url.get(&source.url).filter(|t| !t.is_empty()) {
            Some(content) => {
                let _ = writeln!(prompt, "Content: {}", truncate_chars(content, MAX_CONTENT_CHARS));
            }
            None => {
                let _ = writeln!(
                    prompt,
                    "Snippet: {}",
                    source.snippet.as_deref().unwrap_or_default()
                );
            }
        }
        prompt.push('\n');
    }

    prompt.push_str("---\n\n");
    prompt.push_str("Please provide a comprehensive answer using the above sources. ");
    prompt.push_str("Include relevant citations using [1], [2], etc.");
    prompt
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Result of a successful augmentation pass.
#[derive(Debug, Clone)]
pub struct Augmentation {
    pub prompt: String,
    pub sources: Vec<Source>,
}

/// Runs search, fetches the top pages, and builds the augmented prompt.
pub struct SourceAugmenter {
    client: Arc<dyn SearchClient>,
    max_results: usize,
    fetch_top: usize,
}

impl SourceAugmenter {
    pub fn new(client: Arc<dyn SearchClient>, max_results: usize, fetch_top: usize) -> Self {
        Self {
            client,
            max_results,
            fetch_top,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client.has_api_key()
    }

    /// Search for `query` and build an augmented prompt.
    ///
    /// Page fetches are best effort: a failed fetch falls back to the
    /// source's snippet without affecting the others.
    pub async fn augment(&self, query: &str) -> Result<Augmentation> {
        if !self.client.has_api_key() {
            return Err(ParleyError::MissingApiKey("search".into()));
        }

        let sources = self.client.search(query, self.max_results).await?;
        if sources.is_empty() {
            debug!(query, "search returned no sources");
            return Ok(Augmentation {
                prompt: query.to_string(),
                sources,
            });
        }

        let fetches = sources.iter().take(self.fetch_top).map(|source| {
            let client = Arc::clone(&self.client);
            let url = source.url.clone();
            async move {
                let result = client.fetch_page_text(&url).await;
                (url, result)
            }
        });

        let mut fetched = HashMap::new();
        for (url, result) in join_all(fetches).await {
            match result {
                Ok(text) if !text.is_empty() => {
                    fetched.insert(url, text);
                }
                Ok(_) => debug!(url = %url, "fetched page was empty"),
                Err(e) => warn!(url = %url, error = %e, "page fetch failed, using snippet"),
            }
        }

        info!(
            sources = sources.len(),
            fetched = fetched.len(),
            "prompt augmented with search results"
        );

        Ok(Augmentation {
            prompt: build_augmented_prompt(query, &sources, &fetched),
            sources,
        })
    }
}
