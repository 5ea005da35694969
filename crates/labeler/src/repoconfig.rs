//! Per-repository override configuration.
//!
//! Repositories opt labels out of automatic application by committing
//! `.github/labeler.yml` with a list of exclusion patterns:
//!
//! ```yaml
//! exclude:
//!   - ^roadmap$
//!   - ^release/
//! ```

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::github::GitHubClient;

/// Path of the override file within a repository.
const CONFIG_PATH: &str = ".github/labeler.yml";

#[derive(Debug, Default, Deserialize)]
struct RawRepoConfig {
    #[serde(default)]
    exclude: Vec<String>,
}

/// Parsed repository override configuration.
#[derive(Debug, Default)]
pub struct RepoConfig {
    /// Label names matching any of these are never applied automatically.
    pub exclude: Vec<Regex>,
}

impl RepoConfig {
    /// Parse the YAML override file. Invalid regexes fail the whole
    /// config; a half-honored exclusion list is worse than an error.
    pub fn parse(contents: &str) -> Result<Self> {
        let raw: RawRepoConfig =
            serde_yaml::from_str(contents).context("parse labeler.yml")?;
        let exclude = raw
            .exclude
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("invalid exclude pattern {pattern:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { exclude })
    }

    /// Fetch and parse a repository's override config. A missing file
    /// yields the empty config.
    pub async fn fetch(client: &GitHubClient, owner: &str, repo: &str) -> Result<Self> {
        match client.get_file_contents(owner, repo, CONFIG_PATH).await? {
            Some(contents) => Self::parse(&contents),
            None => Ok(Self::default()),
        }
    }
}
