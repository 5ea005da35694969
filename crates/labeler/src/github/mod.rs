//! Thin GitHub REST client: issue, label, and repository plumbing.
//!
//! The inference pipeline treats GitHub as an external collaborator;
//! this module is the whole surface it needs: bounded pagination over
//! issues and labels, single-issue fetch, label application, repository
//! metadata, and file contents for the per-repo override config.

pub mod auth;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Serialize};

pub use auth::AppAuth;

/// GitHub API base URL
const GITHUB_API_URL: &str = "https://api.github.com";

/// Page size used for list endpoints
const PER_PAGE: usize = 100;

/// A repository label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    /// Label name, unique within a repository
    pub name: String,
    /// Label description; may carry the human-only sentinel phrase
    #[serde(default)]
    pub description: String,
}

/// Issue author.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    /// Login name
    pub login: String,
}

/// Marker object present on issues that are actually pull requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestMarker {
    /// API URL of the pull request
    #[serde(default)]
    pub url: Option<String>,
}

/// A GitHub issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Global issue ID
    pub id: i64,
    /// Issue number within the repository
    pub number: i64,
    /// Title
    pub title: String,
    /// Body text; absent bodies deserialize as empty
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub body: String,
    /// Author
    #[serde(default)]
    pub user: User,
    /// Author's relationship to the repository (OWNER, MEMBER, NONE, ...)
    #[serde(default)]
    pub author_association: String,
    /// Labels currently applied
    #[serde(default)]
    pub labels: Vec<Label>,
    /// open or closed
    #[serde(default)]
    pub state: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Present when the "issue" is a pull request
    #[serde(default)]
    pub pull_request: Option<PullRequestMarker>,
    /// Web URL
    #[serde(default)]
    pub html_url: String,
}

impl Issue {
    /// Whether this list item is really a pull request.
    #[must_use]
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }
}

/// Repository metadata; only the fields the service reads.
#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    /// Repository ID
    pub id: i64,
    /// Repository name
    pub name: String,
    /// owner/name
    #[serde(default)]
    pub full_name: String,
    /// Repository owner
    #[serde(default)]
    pub owner: User,
    /// Whether the repository is private
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Deserialize)]
struct InstallationRepositories {
    repositories: Vec<Repository>,
}

/// File contents response from the contents API.
#[derive(Debug, Deserialize)]
struct FileContents {
    content: String,
    #[serde(default)]
    encoding: String,
}

#[derive(Debug, Serialize)]
struct AddLabelsRequest {
    labels: Vec<String>,
}

fn deserialize_null_default<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// GitHub API client scoped to one installation (or static) token.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl GitHubClient {
    /// Create a new client with a bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("labeler/0.3"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: GITHUB_API_URL.to_string(),
            token: token.into(),
        })
    }

    /// Point the client at a different API host (tests, proxies).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("GitHub API error: {status} - {body}"));
        }

        response.json().await.context("Failed to parse response")
    }

    /// Fetch successive pages from `path` until `max` items are
    /// collected or the listing is exhausted.
    async fn get_paged<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &str,
        max: usize,
    ) -> Result<Vec<T>> {
        let mut all = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{}{}?{}per_page={}&page={}",
                self.base_url, path, query, PER_PAGE, page
            );
            let items: Vec<T> = self.get_json(&url).await?;
            let exhausted = items.len() < PER_PAGE;
            for item in items {
                all.push(item);
                if all.len() == max {
                    return Ok(all);
                }
            }
            if exhausted {
                return Ok(all);
            }
            page += 1;
        }
    }

    /// List up to `max` recent issues of a repository, excluding pull
    /// requests at the source boundary.
    pub async fn list_issues(&self, owner: &str, repo: &str, max: usize) -> Result<Vec<Issue>> {
        let issues: Vec<Issue> = self
            .get_paged(
                &format!("/repos/{owner}/{repo}/issues"),
                "state=all&",
                max,
            )
            .await
            .context("list issues")?;
        Ok(issues.into_iter().filter(|i| !i.is_pull_request()).collect())
    }

    /// List up to `max` issues updated at or after `since`, most
    /// recently updated first. Pull requests are excluded.
    pub async fn list_issues_since(
        &self,
        owner: &str,
        repo: &str,
        since: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Issue>> {
        let since = since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let issues: Vec<Issue> = self
            .get_paged(
                &format!("/repos/{owner}/{repo}/issues"),
                &format!("state=all&sort=updated&direction=desc&since={since}&"),
                max,
            )
            .await
            .context("list issues since")?;
        Ok(issues.into_iter().filter(|i| !i.is_pull_request()).collect())
    }

    /// List up to `max` labels defined in a repository.
    pub async fn list_labels(&self, owner: &str, repo: &str, max: usize) -> Result<Vec<Label>> {
        self.get_paged(&format!("/repos/{owner}/{repo}/labels"), "", max)
            .await
            .context("list labels")
    }

    /// Fetch a single issue. Never cached: the caller needs the latest
    /// state, including labels already applied.
    pub async fn get_issue(&self, owner: &str, repo: &str, number: i64) -> Result<Issue> {
        self.get_json(&format!(
            "{}/repos/{owner}/{repo}/issues/{number}",
            self.base_url
        ))
        .await
        .context("get issue")
    }

    /// Fetch repository metadata.
    pub async fn get_repo(&self, owner: &str, repo: &str) -> Result<Repository> {
        self.get_json(&format!("{}/repos/{owner}/{repo}", self.base_url))
            .await
            .context("get repository")
    }

    /// Add labels to an issue.
    pub async fn add_labels(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        labels: Vec<String>,
    ) -> Result<()> {
        let url = format!(
            "{}/repos/{owner}/{repo}/issues/{number}/labels",
            self.base_url
        );
        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&AddLabelsRequest { labels })
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("GitHub API error: {status} - {body}"));
        }
        Ok(())
    }

    /// List the repositories accessible to this installation token.
    pub async fn list_installation_repos(&self) -> Result<Vec<Repository>> {
        let mut all = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{}/installation/repositories?per_page={}&page={}",
                self.base_url, PER_PAGE, page
            );
            let batch: InstallationRepositories = self
                .get_json(&url)
                .await
                .context("list installation repositories")?;
            let exhausted = batch.repositories.len() < PER_PAGE;
            all.extend(batch.repositories);
            if exhausted {
                return Ok(all);
            }
            page += 1;
        }
    }

    /// Fetch a repository file's decoded contents, or `None` when the
    /// file does not exist.
    pub async fn get_file_contents(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<Option<String>> {
        let url = format!("{}/repos/{owner}/{repo}/contents/{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("GitHub API error: {status} - {body}"));
        }

        let contents: FileContents = response.json().await.context("Failed to parse contents")?;
        if contents.encoding != "base64" {
            return Err(anyhow!("unexpected encoding: {}", contents.encoding));
        }
        // The contents API wraps base64 at 60 columns.
        let raw = contents.content.replace(['\n', '\r'], "");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(raw)
            .context("decode file contents")?;
        Ok(Some(
            String::from_utf8(decoded).context("file contents are not UTF-8")?,
        ))
    }
}
