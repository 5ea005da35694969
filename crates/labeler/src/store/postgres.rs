//! Postgres-backed issue index.
//!
//! Rows are append-only; `repo_issues` collapses them to the most
//! recently inserted version per issue with `DISTINCT ON` and drops
//! pull requests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{IndexedIssue, IssueIndex};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS indexed_issues (
    install_id     BIGINT       NOT NULL,
    repo_id        BIGINT       NOT NULL,
    repo_full_name TEXT         NOT NULL,
    issue_number   BIGINT       NOT NULL,
    title          TEXT         NOT NULL,
    body           TEXT         NOT NULL,
    state          TEXT         NOT NULL,
    html_url       TEXT         NOT NULL,
    labels         TEXT[]       NOT NULL,
    pull_request   BOOLEAN      NOT NULL,
    embedding      FLOAT8[]     NOT NULL,
    created_at     TIMESTAMPTZ  NOT NULL,
    updated_at     TIMESTAMPTZ  NOT NULL,
    inserted_at    TIMESTAMPTZ  NOT NULL
);
CREATE INDEX IF NOT EXISTS indexed_issues_repo_idx
    ON indexed_issues (repo_id, issue_number, inserted_at DESC);
";

/// Issue index stored in Postgres.
pub struct PostgresIndex {
    pool: PgPool,
}

impl PostgresIndex {
    /// Connect to the database and create the schema if missing.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .context("connect to Postgres")?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("create index schema")?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool; the schema must already exist.
    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IssueIndex for PostgresIndex {
    async fn upsert(&self, issues: &[IndexedIssue]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("begin transaction")?;
        for issue in issues {
            sqlx::query(
                "INSERT INTO indexed_issues \
                 (install_id, repo_id, repo_full_name, issue_number, title, body, state, \
                  html_url, labels, pull_request, embedding, created_at, updated_at, \
                  inserted_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(issue.install_id)
            .bind(issue.repo_id)
            .bind(&issue.repo_full_name)
            .bind(issue.issue_number)
            .bind(&issue.title)
            .bind(&issue.body)
            .bind(&issue.state)
            .bind(&issue.html_url)
            .bind(&issue.labels)
            .bind(issue.pull_request)
            .bind(&issue.embedding)
            .bind(issue.created_at)
            .bind(issue.updated_at)
            .bind(issue.inserted_at)
            .execute(&mut *tx)
            .await
            .context("insert indexed issue")?;
        }
        tx.commit().await.context("commit indexed issues")?;
        Ok(())
    }

    async fn repo_issues(&self, repo_id: i64) -> anyhow::Result<Vec<IndexedIssue>> {
        let rows = sqlx::query(
            "SELECT DISTINCT ON (issue_number) \
             install_id, repo_id, repo_full_name, issue_number, title, body, state, \
             html_url, labels, pull_request, embedding, created_at, updated_at, inserted_at \
             FROM indexed_issues WHERE repo_id = $1 AND pull_request = FALSE \
             ORDER BY issue_number, inserted_at DESC",
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await
        .context("query indexed issues")?;

        rows.into_iter()
            .map(|row| {
                Ok(IndexedIssue {
                    install_id: row.try_get("install_id")?,
                    repo_id: row.try_get("repo_id")?,
                    repo_full_name: row.try_get("repo_full_name")?,
                    issue_number: row.try_get("issue_number")?,
                    title: row.try_get("title")?,
                    body: row.try_get("body")?,
                    state: row.try_get("state")?,
                    html_url: row.try_get("html_url")?,
                    labels: row.try_get("labels")?,
                    pull_request: row.try_get("pull_request")?,
                    embedding: row.try_get("embedding")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                    inserted_at: row.try_get("inserted_at")?,
                })
            })
            .collect()
    }

    async fn last_indexed_at(&self, repo_id: i64) -> anyhow::Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT max(updated_at) AS last FROM indexed_issues WHERE repo_id = $1",
        )
        .bind(repo_id)
        .fetch_one(&self.pool)
        .await
        .context("query index watermark")?;
        Ok(row.try_get("last")?)
    }
}
