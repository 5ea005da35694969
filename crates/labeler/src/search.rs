//! Similarity search over indexed issues.
//!
//! Embeds the query text and ranks a repository's indexed issues by
//! cosine similarity, brute force. Index sizes are a few thousand
//! issues per repository; a scan beats carrying a vector database.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ai::EmbeddingProvider;
use crate::cache::TtlCache;
use crate::errors::SearchError;
use crate::github::AppAuth;
use crate::store::{IssueIndex, EMBED_DIMENSIONS};
use crate::tokens::TokenCounter;

/// Hard ceiling on returned matches.
const MAX_RESULTS: usize = 100;

/// Embedding input ceiling for text-embedding-3-small.
const EMBED_MAX_TOKENS: usize = 8191;

/// Installation-ID lookups change rarely; a short TTL keeps the
/// hot path off the GitHub API.
const INSTALL_ID_TTL: Duration = Duration::from_secs(60);

fn default_limit() -> usize {
    MAX_RESULTS
}

/// A similarity search request.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    /// Repository owner login
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Free-text query
    #[serde(rename = "q")]
    pub query: String,
    /// Maximum matches to return
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// A search response: the installation the repository resolved to plus
/// its ranked matches.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    /// App installation covering the repository
    pub install_id: i64,
    /// Ranked matches, best first
    pub issues: Vec<SearchMatch>,
}

/// One ranked match.
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    /// Issue number within the repository
    pub issue_number: i64,
    /// Issue title
    pub title: String,
    /// Web URL
    pub html_url: String,
    /// Labels applied at index time
    pub labels: Vec<String>,
    /// Cosine similarity to the query, in [-1, 1]
    pub similarity: f64,
}

/// Cosine similarity. Zero-magnitude vectors have no direction, so
/// their similarity to anything is 0 rather than NaN.
fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Serves similarity searches against the issue index.
pub struct SearchService {
    auth: Arc<AppAuth>,
    embeddings: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn IssueIndex>,
    counter: Arc<TokenCounter>,
    install_cache: TtlCache<(String, String), i64>,
}

impl SearchService {
    /// Create a search service.
    pub fn new(
        auth: Arc<AppAuth>,
        embeddings: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn IssueIndex>,
        counter: Arc<TokenCounter>,
    ) -> Self {
        Self {
            auth,
            embeddings,
            index,
            counter,
            install_cache: TtlCache::new(4096),
        }
    }

    /// Rank indexed issues of a repository against `query`.
    ///
    /// Private repositories are rejected before the query is embedded:
    /// there is no per-searcher authorization yet, so nothing private
    /// may leak into results, and paying for an embedding first would
    /// be wasted.
    pub async fn search(&self, req: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let install_id = self
            .install_cache
            .get_or_fetch(
                (req.owner.clone(), req.repo.clone()),
                INSTALL_ID_TTL,
                || {
                    let auth = Arc::clone(&self.auth);
                    let (owner, repo) = (req.owner.clone(), req.repo.clone());
                    async move { auth.install_id_for_repo(&owner, &repo).await }
                },
            )
            .await
            .map_err(|e| SearchError::Upstream(anyhow::Error::new(e)))?;
        let client = self
            .auth
            .installation_client(install_id)
            .await
            .map_err(SearchError::Upstream)?;
        let repo = client
            .get_repo(&req.owner, &req.repo)
            .await
            .map_err(SearchError::Upstream)?;
        if repo.private {
            return Err(SearchError::Forbidden);
        }

        let issues: Vec<_> = self
            .index
            .repo_issues(repo.id)
            .await
            .map_err(SearchError::Upstream)?
            .into_iter()
            .filter(|i| i.state == "open")
            .collect();
        if issues.is_empty() {
            return Err(SearchError::NotFound);
        }

        let query_text = self
            .counter
            .truncate(&req.query, EMBED_MAX_TOKENS)
            .map_err(SearchError::Upstream)?;
        let query_vec = self.embeddings.embed(&query_text, EMBED_DIMENSIONS).await?;

        let mut matches = Vec::with_capacity(issues.len());
        for issue in issues {
            if issue.embedding.len() != query_vec.len() {
                return Err(SearchError::DimensionMismatch {
                    query: query_vec.len(),
                    index: issue.embedding.len(),
                });
            }
            matches.push(SearchMatch {
                similarity: cosine(&query_vec, &issue.embedding),
                issue_number: issue.issue_number,
                title: issue.title,
                html_url: issue.html_url,
                labels: issue.labels,
            });
        }

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(req.limit.clamp(1, MAX_RESULTS));

        info!(
            owner = %req.owner,
            repo = %req.repo,
            install_id,
            matches = matches.len(),
            "search served"
        );
        Ok(SearchResponse {
            install_id,
            issues: matches,
        })
    }
}
