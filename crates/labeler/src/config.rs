//! Service configuration from the environment.

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// GitHub credentials, one of two shapes.
pub enum GitHubCredentials {
    /// GitHub App: ID plus RSA private key PEM.
    App {
        /// App ID
        app_id: String,
        /// Private key PEM bytes
        private_key_pem: Vec<u8>,
    },
    /// A static token (PAT); single-tenant and test setups.
    Token(String),
}

/// Service configuration.
pub struct Config {
    /// GitHub credentials
    pub github: GitHubCredentials,
    /// OpenAI API key
    pub openai_api_key: String,
    /// Completion model
    pub model: String,
    /// Listen address
    pub bind_addr: String,
    /// Webhook HMAC secret; webhooks are rejected without one
    pub webhook_secret: Option<String>,
    /// Postgres URL for the issue index; in-memory when unset
    pub database_url: Option<String>,
    /// Pause between index sweeps
    pub index_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let github = match env::var("GITHUB_APP_ID") {
            Ok(app_id) => {
                let private_key_pem = match env::var("GITHUB_APP_PRIVATE_KEY") {
                    Ok(pem) => pem.into_bytes(),
                    Err(_) => {
                        let path = env::var("GITHUB_APP_PRIVATE_KEY_FILE").context(
                            "GITHUB_APP_ID set but neither GITHUB_APP_PRIVATE_KEY nor \
                             GITHUB_APP_PRIVATE_KEY_FILE is",
                        )?;
                        std::fs::read(&path)
                            .with_context(|| format!("read private key file {path}"))?
                    }
                };
                GitHubCredentials::App {
                    app_id,
                    private_key_pem,
                }
            }
            Err(_) => match env::var("GITHUB_TOKEN") {
                Ok(token) => GitHubCredentials::Token(token),
                Err(_) => bail!("set GITHUB_APP_ID (with a private key) or GITHUB_TOKEN"),
            },
        };

        let openai_api_key = env::var("OPENAI_API_KEY").context("OPENAI_API_KEY is not set")?;
        let model = env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let webhook_secret = env::var("GITHUB_WEBHOOK_SECRET").ok();
        let database_url = env::var("DATABASE_URL").ok();
        let index_interval = match env::var("INDEX_INTERVAL_SECS") {
            Ok(secs) => Duration::from_secs(
                secs.parse()
                    .context("INDEX_INTERVAL_SECS must be an integer")?,
            ),
            Err(_) => Duration::from_secs(600),
        };

        Ok(Self {
            github,
            openai_api_key,
            model,
            bind_addr,
            webhook_secret,
            database_url,
            index_interval,
        })
    }
}
