//! GitHub App authentication: app JWTs and installation tokens.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::cache::TtlCache;

use super::GitHubClient;

const GITHUB_API_URL: &str = "https://api.github.com";

/// Installation tokens live for an hour; refresh comfortably earlier.
const TOKEN_TTL: Duration = Duration::from_secs(50 * 60);

#[derive(Debug, Serialize)]
struct JwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct InstallationRef {
    id: i64,
}

/// An app installation, as returned by the installations listing.
#[derive(Debug, Clone, Deserialize)]
pub struct Installation {
    /// Installation ID
    pub id: i64,
}

enum Credentials {
    /// GitHub App: RS256-signed JWTs exchanged for installation tokens.
    App { app_id: String, key: EncodingKey },
    /// A static token (PAT); used by tests and single-tenant setups.
    Token(String),
}

/// Resolves per-installation GitHub clients from app credentials.
pub struct AppAuth {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    token_cache: TtlCache<i64, String>,
}

impl AppAuth {
    /// Create an authenticator from a GitHub App ID and RSA private key
    /// in PEM form.
    pub fn new_app(app_id: impl Into<String>, private_key_pem: &[u8]) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(private_key_pem)
            .context("parse GitHub App private key")?;
        Ok(Self {
            client: Self::http_client()?,
            base_url: GITHUB_API_URL.to_string(),
            credentials: Credentials::App {
                app_id: app_id.into(),
                key,
            },
            token_cache: TtlCache::new(1024),
        })
    }

    /// Create an authenticator around a static token.
    pub fn new_token(token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: Self::http_client()?,
            base_url: GITHUB_API_URL.to_string(),
            credentials: Credentials::Token(token.into()),
            token_cache: TtlCache::new(1024),
        })
    }

    /// Point the authenticator at a different API host (tests).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn http_client() -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("labeler/0.3"));
        reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")
    }

    /// Mint a short-lived app JWT. In static-token mode the token itself
    /// is the bearer credential.
    fn app_bearer(&self) -> Result<String> {
        match &self.credentials {
            Credentials::App { app_id, key } => {
                let now = chrono::Utc::now().timestamp();
                let claims = JwtClaims {
                    // Backdated to absorb clock drift.
                    iat: now - 60,
                    exp: now + 540,
                    iss: app_id.clone(),
                };
                encode(&Header::new(Algorithm::RS256), &claims, key)
                    .context("sign GitHub App JWT")
            }
            Credentials::Token(token) => Ok(token.clone()),
        }
    }

    /// Resolve a [`GitHubClient`] authorized for the given installation.
    /// Tokens are cached per installation and refreshed before expiry.
    pub async fn installation_client(&self, install_id: i64) -> Result<GitHubClient> {
        let token = match &self.credentials {
            Credentials::Token(token) => token.clone(),
            Credentials::App { .. } => self
                .token_cache
                .get_or_fetch(install_id, TOKEN_TTL, || {
                    self.fetch_installation_token(install_id)
                })
                .await
                .map_err(anyhow::Error::new)?,
        };
        Ok(GitHubClient::new(token)?.with_base_url(self.base_url.clone()))
    }

    async fn fetch_installation_token(&self, install_id: i64) -> Result<String> {
        let bearer = self.app_bearer()?;
        let response = self
            .client
            .post(format!(
                "{}/app/installations/{install_id}/access_tokens",
                self.base_url
            ))
            .header(AUTHORIZATION, format!("Bearer {bearer}"))
            .send()
            .await
            .context("request installation token")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "installation token request failed: {status} - {body}"
            ));
        }

        let token: AccessTokenResponse = response
            .json()
            .await
            .context("parse installation token response")?;
        Ok(token.token)
    }

    /// Look up the installation ID covering a repository.
    pub async fn install_id_for_repo(&self, owner: &str, repo: &str) -> Result<i64> {
        let bearer = self.app_bearer()?;
        let response = self
            .client
            .get(format!(
                "{}/repos/{owner}/{repo}/installation",
                self.base_url
            ))
            .header(AUTHORIZATION, format!("Bearer {bearer}"))
            .send()
            .await
            .context("request repo installation")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("repo installation lookup failed: {status} - {body}"));
        }

        let installation: InstallationRef = response
            .json()
            .await
            .context("parse installation response")?;
        Ok(installation.id)
    }

    /// List every installation of the app.
    pub async fn list_installations(&self) -> Result<Vec<Installation>> {
        let bearer = self.app_bearer()?;
        let mut all = Vec::new();
        let mut page = 1;
        loop {
            let response = self
                .client
                .get(format!(
                    "{}/app/installations?per_page=100&page={page}",
                    self.base_url
                ))
                .header(AUTHORIZATION, format!("Bearer {bearer}"))
                .send()
                .await
                .context("list installations")?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(anyhow!("list installations failed: {status} - {body}"));
            }

            let installations: Vec<Installation> = response
                .json()
                .await
                .context("parse installations response")?;
            let exhausted = installations.len() < 100;
            all.extend(installations);
            if exhausted {
                return Ok(all);
            }
            page += 1;
        }
    }
}
