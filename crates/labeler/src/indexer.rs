//! Background indexer feeding the issue index.
//!
//! Periodically sweeps every installation, embeds issues updated since
//! the last sweep, and appends them to the store. Failures are scoped
//! to a repository so one broken repo cannot stall the sweep.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::ai::EmbeddingProvider;
use crate::github::{AppAuth, GitHubClient, Issue, Repository};
use crate::store::{IndexedIssue, IssueIndex, EMBED_DIMENSIONS};
use crate::tokens::TokenCounter;

/// Issues fetched per repository per sweep.
const MAX_ISSUES_PER_SWEEP: usize = 100;

/// Embedding input ceiling for text-embedding-3-small.
const EMBED_MAX_TOKENS: usize = 8191;

/// Text embedded for an issue: title, state, author, labels, body,
/// truncated to the embedding model's input limit.
fn embed_text(counter: &TokenCounter, issue: &Issue) -> anyhow::Result<String> {
    let labels: Vec<&str> = issue.labels.iter().map(|l| l.name.as_str()).collect();
    let text = format!(
        "title: {}\nstate: {}\nauthor: {}\nlabels: {}\n{}",
        issue.title,
        issue.state,
        issue.user.login,
        labels.join(", "),
        issue.body
    );
    counter.truncate(&text, EMBED_MAX_TOKENS)
}

/// Periodic issue-embedding indexer.
pub struct Indexer {
    auth: Arc<AppAuth>,
    embeddings: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn IssueIndex>,
    counter: Arc<TokenCounter>,
    interval: Duration,
}

impl Indexer {
    /// Create an indexer sweeping every `interval`.
    pub fn new(
        auth: Arc<AppAuth>,
        embeddings: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn IssueIndex>,
        counter: Arc<TokenCounter>,
        interval: Duration,
    ) -> Self {
        Self {
            auth,
            embeddings,
            index,
            counter,
            interval,
        }
    }

    /// Sweep forever. Intended to be spawned alongside the server.
    pub async fn run(self) {
        loop {
            if let Err(err) = self.sweep().await {
                warn!(error = %err, "index sweep failed");
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One pass over every installation and its repositories.
    pub async fn sweep(&self) -> anyhow::Result<()> {
        let installations = self.auth.list_installations().await?;
        for installation in installations {
            let client = match self.auth.installation_client(installation.id).await {
                Ok(client) => client,
                Err(err) => {
                    warn!(install_id = installation.id, error = %err, "skipping installation");
                    continue;
                }
            };
            let repos = match client.list_installation_repos().await {
                Ok(repos) => repos,
                Err(err) => {
                    warn!(install_id = installation.id, error = %err, "listing repos failed");
                    continue;
                }
            };
            for repo in repos {
                // Search refuses private repositories; indexing them
                // would store text nobody can query.
                if repo.private {
                    continue;
                }
                if let Err(err) = self.index_repo(&client, installation.id, &repo).await {
                    warn!(repo = %repo.full_name, error = %err, "indexing repo failed");
                }
            }
        }
        Ok(())
    }

    async fn index_repo(
        &self,
        client: &GitHubClient,
        install_id: i64,
        repo: &Repository,
    ) -> anyhow::Result<()> {
        let issues = match self.index.last_indexed_at(repo.id).await? {
            Some(watermark) => {
                client
                    .list_issues_since(&repo.owner.login, &repo.name, watermark, MAX_ISSUES_PER_SWEEP)
                    .await?
            }
            None => {
                client
                    .list_issues(&repo.owner.login, &repo.name, MAX_ISSUES_PER_SWEEP)
                    .await?
            }
        };
        if issues.is_empty() {
            return Ok(());
        }

        let mut batch = Vec::with_capacity(issues.len());
        for issue in &issues {
            let text = embed_text(&self.counter, issue)?;
            let embedding = self.embeddings.embed(&text, EMBED_DIMENSIONS).await?;
            batch.push(IndexedIssue {
                install_id,
                repo_id: repo.id,
                repo_full_name: repo.full_name.clone(),
                issue_number: issue.number,
                title: issue.title.clone(),
                body: issue.body.clone(),
                state: issue.state.clone(),
                html_url: issue.html_url.clone(),
                labels: issue.labels.iter().map(|l| l.name.clone()).collect(),
                pull_request: issue.is_pull_request(),
                embedding,
                created_at: issue.created_at,
                updated_at: issue.updated_at,
                inserted_at: chrono::Utc::now(),
            });
        }
        self.index.upsert(&batch).await?;
        info!(repo = %repo.full_name, indexed = batch.len(), "repo indexed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::ProviderError;
    use crate::store::MemoryIndex;
    use async_trait::async_trait;
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct UnitEmbeddings;

    #[async_trait]
    impl EmbeddingProvider for UnitEmbeddings {
        async fn embed(&self, _text: &str, dimensions: u32) -> Result<Vec<f64>, ProviderError> {
            Ok(vec![1.0; dimensions as usize])
        }
    }

    fn issue_json(number: i64, updated_at: &str) -> serde_json::Value {
        serde_json::json!({
            "id": number * 1000,
            "number": number,
            "title": format!("issue {number}"),
            "body": "body",
            "user": {"login": "alice"},
            "labels": [{"name": "bug"}],
            "state": "open",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": updated_at,
            "html_url": format!("https://github.com/o/r/issues/{number}")
        })
    }

    #[tokio::test]
    async fn test_sweep_indexes_public_repos_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app/installations"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": 1}])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/installation/repositories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 2,
                "repositories": [
                    {"id": 10, "name": "r", "full_name": "o/r",
                     "owner": {"login": "o"}, "private": false},
                    {"id": 11, "name": "sekrit", "full_name": "o/sekrit",
                     "owner": {"login": "o"}, "private": true},
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/issues"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                issue_json(1, "2024-02-01T00:00:00Z"),
                issue_json(2, "2024-02-02T00:00:00Z"),
            ])))
            .mount(&server)
            .await;

        let auth = Arc::new(AppAuth::new_token("t").unwrap().with_base_url(server.uri()));
        let index = Arc::new(MemoryIndex::new());
        let indexer = Indexer::new(
            auth,
            Arc::new(UnitEmbeddings),
            Arc::clone(&index) as Arc<dyn IssueIndex>,
            Arc::new(TokenCounter::new().unwrap()),
            Duration::from_secs(600),
        );
        indexer.sweep().await.unwrap();

        let indexed = index.repo_issues(10).await.unwrap();
        assert_eq!(indexed.len(), 2);
        assert_eq!(indexed[0].labels, vec!["bug"]);
        assert_eq!(indexed[0].embedding.len(), EMBED_DIMENSIONS as usize);
        // The private repo was skipped entirely.
        assert!(index.repo_issues(11).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_incremental_sweep_uses_watermark() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app/installations"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": 1}])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/installation/repositories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 1,
                "repositories": [
                    {"id": 10, "name": "r", "full_name": "o/r",
                     "owner": {"login": "o"}, "private": false},
                ]
            })))
            .mount(&server)
            .await;
        // First sweep: no watermark, plain listing.
        Mock::given(method("GET"))
            .and(path("/repos/o/r/issues"))
            .and(query_param_is_missing("since"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                issue_json(1, "2024-02-01T00:00:00Z"),
            ])))
            .expect(1..)
            .mount(&server)
            .await;
        // Second sweep: must carry a since parameter.
        Mock::given(method("GET"))
            .and(path("/repos/o/r/issues"))
            .and(query_param("since", "2024-02-01T00:00:00Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                issue_json(2, "2024-02-05T00:00:00Z"),
            ])))
            .mount(&server)
            .await;

        let auth = Arc::new(AppAuth::new_token("t").unwrap().with_base_url(server.uri()));
        let index = Arc::new(MemoryIndex::new());
        let indexer = Indexer::new(
            auth,
            Arc::new(UnitEmbeddings),
            Arc::clone(&index) as Arc<dyn IssueIndex>,
            Arc::new(TokenCounter::new().unwrap()),
            Duration::from_secs(600),
        );

        indexer.sweep().await.unwrap();
        indexer.sweep().await.unwrap();

        let indexed = index.repo_issues(10).await.unwrap();
        let numbers: Vec<i64> = indexed.iter().map(|i| i.issue_number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }
}
