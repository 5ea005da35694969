//! Durable storage of indexed issue embeddings.
//!
//! The indexer writes one row per observed issue version, append-only;
//! readers see only the most recently inserted version of each issue.
//! The trait hides the backend so search and the indexer run
//! identically against Postgres or the in-memory index used by tests.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryIndex;
#[cfg(feature = "postgres")]
pub use postgres::PostgresIndex;

/// Dimensionality of stored issue embeddings.
pub const EMBED_DIMENSIONS: u32 = 256;

/// One indexed issue version.
#[derive(Debug, Clone)]
pub struct IndexedIssue {
    /// App installation the issue was observed through
    pub install_id: i64,
    /// Repository ID
    pub repo_id: i64,
    /// owner/name at index time
    pub repo_full_name: String,
    /// Issue number within the repository
    pub issue_number: i64,
    /// Issue title
    pub title: String,
    /// Issue body
    pub body: String,
    /// open or closed at index time
    pub state: String,
    /// Web URL
    pub html_url: String,
    /// Label names applied at index time
    pub labels: Vec<String>,
    /// Whether the record is really a pull request; filtered out of
    /// reads as a second line of defense behind index-time exclusion
    pub pull_request: bool,
    /// Embedding of the issue text
    pub embedding: Vec<f64>,
    /// Issue creation time
    pub created_at: DateTime<Utc>,
    /// Issue update time this version reflects
    pub updated_at: DateTime<Utc>,
    /// When this row was written; the newest insertion wins at read time
    pub inserted_at: DateTime<Utc>,
}

/// Backend-independent issue index.
#[async_trait]
pub trait IssueIndex: Send + Sync {
    /// Append issue versions. Re-indexing an already stored version is
    /// harmless; readers dedup to the most recently inserted row.
    async fn upsert(&self, issues: &[IndexedIssue]) -> anyhow::Result<()>;

    /// Most recently inserted version of every indexed issue in a
    /// repository, pull requests excluded. An empty result means the
    /// repository has never been indexed (or has no issues).
    async fn repo_issues(&self, repo_id: i64) -> anyhow::Result<Vec<IndexedIssue>>;

    /// The most recent `updated_at` stored for a repository; the
    /// indexer's incremental-fetch watermark.
    async fn last_indexed_at(&self, repo_id: i64) -> anyhow::Result<Option<DateTime<Utc>>>;
}
