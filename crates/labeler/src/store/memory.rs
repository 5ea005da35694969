//! In-memory issue index for tests and single-process deployments.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{IndexedIssue, IssueIndex};

/// Append-only index kept in process memory; reads resolve each issue
/// to its most recently inserted row, the same way the Postgres
/// backend does.
#[derive(Default)]
pub struct MemoryIndex {
    rows: Mutex<Vec<IndexedIssue>>,
}

impl MemoryIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IssueIndex for MemoryIndex {
    async fn upsert(&self, issues: &[IndexedIssue]) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().expect("index lock poisoned");
        rows.extend_from_slice(issues);
        Ok(())
    }

    async fn repo_issues(&self, repo_id: i64) -> anyhow::Result<Vec<IndexedIssue>> {
        let rows = self.rows.lock().expect("index lock poisoned");
        let mut latest: Vec<&IndexedIssue> = Vec::new();
        for row in rows.iter().filter(|r| r.repo_id == repo_id) {
            match latest.iter_mut().find(|r| r.issue_number == row.issue_number) {
                // Ties go to the later write, matching insertion order.
                Some(existing) if existing.inserted_at <= row.inserted_at => *existing = row,
                Some(_) => {}
                None => latest.push(row),
            }
        }
        let mut issues: Vec<IndexedIssue> = latest
            .into_iter()
            .filter(|r| !r.pull_request)
            .cloned()
            .collect();
        issues.sort_by_key(|i| i.issue_number);
        Ok(issues)
    }

    async fn last_indexed_at(&self, repo_id: i64) -> anyhow::Result<Option<DateTime<Utc>>> {
        let rows = self.rows.lock().expect("index lock poisoned");
        Ok(rows
            .iter()
            .filter(|r| r.repo_id == repo_id)
            .map(|r| r.updated_at)
            .max())
    }
}
