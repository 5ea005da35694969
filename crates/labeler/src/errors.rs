//! Error taxonomies for the inference and search pipelines.

use thiserror::Error;

use crate::ai::ProviderError;

/// Errors surfaced by [`crate::infer::Labeler::infer`].
///
/// Only transient provider errors are retried, inside the orchestrator;
/// every variant here already exhausted its retries or was never
/// retryable.
#[derive(Debug, Error)]
pub enum InferError {
    /// Installation credential resolution failed. Not retried.
    #[error("resolve installation credentials: {0}")]
    Config(#[source] anyhow::Error),

    /// Fetching issues, labels, or config from GitHub failed. Fatal for
    /// this call; the caller may retry the whole operation later.
    #[error("fetch repository data: {0}")]
    Upstream(#[source] anyhow::Error),

    /// The completion provider failed (after retry for transient cases).
    #[error("completion provider: {0}")]
    Provider(#[from] ProviderError),

    /// The provider responded successfully but violated the expected
    /// response contract. Not retried; worth alerting on.
    #[error("unexpected completion response: {0}")]
    Protocol(String),
}

/// Errors surfaced by [`crate::search::SearchService::search`].
#[derive(Debug, Error)]
pub enum SearchError {
    /// Searches on private repositories are rejected until searcher
    /// authentication exists. By design.
    #[error("repository is private")]
    Forbidden,

    /// No issues indexed for the repository; distinct from an empty
    /// match list.
    #[error("no indexed issues for repository")]
    NotFound,

    /// Stored and query vectors disagree on dimensionality; cosine
    /// similarity would be meaningless.
    #[error("embedding dimension mismatch: query has {query}, index has {index}")]
    DimensionMismatch {
        /// Query vector dimensionality
        query: usize,
        /// Stored vector dimensionality
        index: usize,
    },

    /// The embedding provider failed.
    #[error("embedding provider: {0}")]
    Provider(#[from] ProviderError),

    /// GitHub or the durable store failed.
    #[error("upstream failure: {0}")]
    Upstream(#[source] anyhow::Error),
}
