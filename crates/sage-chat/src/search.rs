//! Web search stage.
//!
//! The backend returns raw hits; this module turns them into at most K
//! ranked [`Reference`]s and retries when nothing usable came back.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use sage_core::config::SearchConfig;
use sage_core::{Reference, RetryPolicy};

use crate::error::SearchError;
use crate::language;

/// One search query as sent to the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchQuery {
    pub q: String,
    /// ISO-639-1 code or `auto`.
    pub language: String,
}

/// A backend result before filtering. Missing values are empty strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// Anything that can run a web search.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, SearchError>;
}

// =============================================================================
// SearXNG client
// =============================================================================

/// `GET {base}/search?format=json` against a SearXNG instance.
pub struct SearxClient {
    http: reqwest::Client,
    config: SearchConfig,
    deadline: Duration,
}

#[derive(Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxResult>,
}

#[derive(Deserialize)]
struct SearxResult {
    url: Option<String>,
    title: Option<String>,
    #[serde(alias = "snippet")]
    content: Option<String>,
}

impl SearxClient {
    pub fn new(config: SearchConfig) -> Result<Self, SearchError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SearchError::Transport(format!("failed to build HTTP client: {}", e)))?;
        let deadline = Duration::from_secs(config.timeout_secs.max(1));
        Ok(Self {
            http,
            config,
            deadline,
        })
    }

    /// Override the request deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

#[async_trait]
impl SearchBackend for SearxClient {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, SearchError> {
        let url = format!("{}/search", self.config.base_url.trim_end_matches('/'));
        let safesearch = self.config.safesearch.to_string();
        let request = self.http.get(url).query(&[
            ("q", query.q.as_str()),
            ("language", query.language.as_str()),
            ("categories", self.config.categories.as_str()),
            ("engines", self.config.engines.as_str()),
            ("safesearch", safesearch.as_str()),
            ("format", "json"),
        ]);

        tracing::debug!(q = %query.q, language = %query.language, "Sending search request");

        let response = tokio::time::timeout(self.deadline, request.send())
            .await
            .map_err(|_| SearchError::Timeout(self.deadline))?
            .map_err(|e| SearchError::from_reqwest(e, self.deadline))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Remote {
                status: status.as_u16(),
            });
        }

        let body: SearxResponse = tokio::time::timeout(self.deadline, response.json())
            .await
            .map_err(|_| SearchError::Timeout(self.deadline))?
            .map_err(|e| SearchError::from_reqwest(e, self.deadline))?;

        Ok(body
            .results
            .into_iter()
            .map(|r| SearchHit {
                url: r.url.unwrap_or_default(),
                title: r.title.unwrap_or_default(),
                snippet: r.content.unwrap_or_default(),
            })
            .collect())
    }
}

// =============================================================================
// Stage
// =============================================================================

/// Limits applied to search results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchLimits {
    pub top_k: usize,
    pub snippet_max_chars: usize,
}

impl From<&SearchConfig> for SearchLimits {
    fn from(config: &SearchConfig) -> Self {
        Self {
            top_k: config.top_k.max(1),
            snippet_max_chars: config.snippet_max_chars,
        }
    }
}

/// Build the query for the reasoning output.
///
/// The topic is appended to the keyphrases unless they already mention it.
pub fn build_query(keyphrases: &str, topic: &str, language: &str) -> SearchQuery {
    let keyphrases = keyphrases.trim();
    let topic = topic.trim();
    let q = if topic.is_empty() || keyphrases.to_lowercase().contains(&topic.to_lowercase()) {
        keyphrases.to_string()
    } else if keyphrases.is_empty() {
        topic.to_string()
    } else {
        format!("{} {}", keyphrases, topic)
    };
    SearchQuery {
        q,
        language: language::search_code(language).to_string(),
    }
}

/// Drop unusable hits, keep the best `top_k` and number them from 1.
pub fn normalize(hits: Vec<SearchHit>, limits: SearchLimits) -> Vec<Reference> {
    hits.into_iter()
        .filter(|h| !h.url.trim().is_empty() && !h.snippet.trim().is_empty())
        .take(limits.top_k)
        .enumerate()
        .map(|(i, h)| {
            let url = h.url.trim().to_string();
            let title = match h.title.trim() {
                "" => url.clone(),
                t => t.to_string(),
            };
            Reference {
                position: i + 1,
                snippet: clip(h.snippet.trim(), limits.snippet_max_chars),
                url,
                title,
            }
        })
        .collect()
}

/// Run the search with retries until at least one usable reference is found.
pub async fn search(
    backend: &dyn SearchBackend,
    retry: &RetryPolicy,
    limits: SearchLimits,
    query: &SearchQuery,
) -> Result<Vec<Reference>, SearchError> {
    retry
        .run("search", |attempt| async move {
            let hits = backend.search(query).await?;
            let total = hits.len();
            let references = normalize(hits, limits);
            tracing::debug!(attempt, total, kept = references.len(), "Search results filtered");
            if references.is_empty() {
                return Err(SearchError::NoResults);
            }
            Ok(references)
        })
        .await
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", text[..idx].trim_end()),
        None => text.to_string(),
    }
}
