//! The inference orchestrator: one `infer` call per issue to label.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ai::{ChatResponse, CompletionProvider, ErrorClass};
use crate::cache::TtlCache;
use crate::context::{PromptContext, SET_LABELS_TOOL};
use crate::errors::InferError;
use crate::github::{AppAuth, Issue, Label};
use crate::repoconfig::RepoConfig;
use crate::sanitize::sanitize;
use crate::tokens::TokenCounter;

/// Recent issues fetched per repository.
const MAX_RECENT_ISSUES: usize = 100;

/// Labels fetched per repository; a large monorepo label set is a
/// reasonable maximum.
const MAX_LABELS: usize = 300;

/// Cache key for per-repository metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RepoKey {
    install_id: i64,
    owner: String,
    repo: String,
}

/// Retry pacing for transient completion-provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// First backoff delay
    pub initial: Duration,
    /// Backoff cap
    pub cap: Duration,
    /// Maximum attempts, including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following attempt number `attempt`
    /// (1-based), or `None` when attempts are exhausted.
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.initial.saturating_mul(2u32.saturating_pow(exp));
        Some(delay.min(self.cap))
    }
}

/// An inference request.
#[derive(Debug, Clone, Deserialize)]
pub struct InferRequest {
    /// GitHub App installation ID
    pub install_id: i64,
    /// Repository owner login
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Target issue number
    pub issue: i64,
    /// When set, the target issue's existing labels are stripped before
    /// prompt construction so known labels can be used as ground truth.
    #[serde(default)]
    pub test_mode: bool,
}

/// The labels chosen for an issue, plus accounting.
#[derive(Debug, Clone, Serialize)]
pub struct InferResponse {
    /// Labels safe to apply
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub set_labels: Vec<String>,
    /// Total tokens consumed by the completion call
    pub tokens_used: u32,
    /// Repo labels excluded from automatic application
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disabled_labels: Vec<String>,
}

/// Orchestrates label inference for single issues.
pub struct Labeler {
    auth: Arc<AppAuth>,
    completions: Arc<dyn CompletionProvider>,
    counter: Arc<TokenCounter>,
    model: String,
    sentinel: String,
    retry: RetryPolicy,
    cache_ttl: Duration,
    // These caches earn their keep under the evaluation tool, which
    // fires many inference calls at one repo in a short window.
    issues_cache: TtlCache<RepoKey, Vec<Issue>>,
    labels_cache: TtlCache<RepoKey, Vec<Label>>,
}

impl Labeler {
    /// Create an orchestrator.
    pub fn new(
        auth: Arc<AppAuth>,
        completions: Arc<dyn CompletionProvider>,
        counter: Arc<TokenCounter>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            auth,
            completions,
            counter,
            model: model.into(),
            sentinel: crate::sanitize::DISABLE_SENTINEL.to_string(),
            retry: RetryPolicy::default(),
            cache_ttl: Duration::from_secs(60),
            issues_cache: TtlCache::new(4096),
            labels_cache: TtlCache::new(4096),
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the metadata cache TTL.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Infer labels for one issue.
    ///
    /// Steps are strictly sequential: resolve credentials, fetch repo
    /// metadata (cached), fetch the target issue (never cached), build
    /// the prompt, call the model with retry on transient failures,
    /// validate and parse the structured response, sanitize.
    pub async fn infer(&self, req: &InferRequest) -> Result<InferResponse, InferError> {
        let client = self
            .auth
            .installation_client(req.install_id)
            .await
            .map_err(InferError::Config)?;

        let config = RepoConfig::fetch(&client, &req.owner, &req.repo)
            .await
            .map_err(InferError::Upstream)?;

        let key = RepoKey {
            install_id: req.install_id,
            owner: req.owner.clone(),
            repo: req.repo.clone(),
        };

        let history = self
            .issues_cache
            .get_or_fetch(key.clone(), self.cache_ttl, || {
                let client = client.clone();
                let req = req.clone();
                async move {
                    client
                        .list_issues(&req.owner, &req.repo, MAX_RECENT_ISSUES)
                        .await
                }
            })
            .await
            .map_err(|e| InferError::Upstream(anyhow::Error::new(e)))?;

        let labels = self
            .labels_cache
            .get_or_fetch(key, self.cache_ttl, || {
                let client = client.clone();
                let req = req.clone();
                async move { client.list_labels(&req.owner, &req.repo, MAX_LABELS).await }
            })
            .await
            .map_err(|e| InferError::Upstream(anyhow::Error::new(e)))?;

        let mut target = client
            .get_issue(&req.owner, &req.repo, req.issue)
            .await
            .map_err(InferError::Upstream)?;

        let mut history: Vec<Issue> = history
            .into_iter()
            .filter(|i| i.number != target.number)
            .collect();
        history.sort_by_key(|i| i.created_at);

        if req.test_mode {
            target.labels.clear();
        }

        let mut context = PromptContext {
            labels: labels.clone(),
            history,
            target,
            sentinel: self.sentinel.clone(),
            ceiling_override: None,
        };
        let request = context.build_request(&self.counter, &self.model);

        let response = self.complete_with_retry(&request).await?;
        let raw_labels = parse_set_labels(&response)?;

        let outcome = sanitize(&raw_labels, &labels, &config.exclude, &self.sentinel);
        for unknown in &outcome.unknown_labels {
            // The model hallucinated or mis-delimited; drop rather than
            // create labels that do not exist.
            warn!(
                owner = %req.owner,
                repo = %req.repo,
                issue = req.issue,
                label = %unknown,
                "label not found in repository"
            );
        }

        info!(
            owner = %req.owner,
            repo = %req.repo,
            issue = req.issue,
            labels = ?outcome.final_labels,
            tokens_used = response.usage.total_tokens,
            "labels inferred"
        );

        Ok(InferResponse {
            set_labels: outcome.final_labels,
            tokens_used: response.usage.total_tokens,
            disabled_labels: outcome.disabled_labels,
        })
    }

    /// Call the completion provider, retrying transient failures with
    /// exponential backoff until the policy's attempt ceiling.
    async fn complete_with_retry(
        &self,
        request: &crate::ai::ChatRequest,
    ) -> Result<ChatResponse, InferError> {
        let mut attempt = 1;
        loop {
            match self.completions.complete(request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.classify() == ErrorClass::Transient => {
                    let Some(delay) = self.retry.next_delay(attempt) else {
                        return Err(err.into());
                    };
                    warn!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying completion call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Validate the response shape and extract the proposed labels.
///
/// Exactly one choice carrying exactly one `set_labels` call is the
/// contract; anything else means the provider and prompt disagree, and
/// retrying the same prompt will not fix that.
fn parse_set_labels(response: &ChatResponse) -> Result<Vec<String>, InferError> {
    if response.choices.len() != 1 {
        return Err(InferError::Protocol(format!(
            "expected one choice, got {}",
            response.choices.len()
        )));
    }
    let message = &response.choices[0].message;
    if message.tool_calls.len() != 1 {
        return Err(InferError::Protocol(format!(
            "expected one tool call, got {}",
            message.tool_calls.len()
        )));
    }
    let call = &message.tool_calls[0];
    if call.name != SET_LABELS_TOOL {
        return Err(InferError::Protocol(format!(
            "expected {SET_LABELS_TOOL} call, got {:?}",
            call.name
        )));
    }

    // Some models return {"labels": "bug critical"} instead of a list.
    // Accept both encodings, nothing further.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum LabelsField {
        List(Vec<String>),
        SpaceDelimited(String),
    }

    #[derive(Deserialize)]
    struct SetLabelsArgs {
        #[serde(default)]
        labels: Option<LabelsField>,
    }

    let args: SetLabelsArgs = serde_json::from_str(&call.arguments).map_err(|e| {
        InferError::Protocol(format!(
            "unparsable {SET_LABELS_TOOL} arguments: {e}; raw: {}",
            call.arguments
        ))
    })?;

    Ok(match args.labels {
        Some(LabelsField::List(labels)) => labels,
        Some(LabelsField::SpaceDelimited(s)) => {
            s.split_whitespace().map(str::to_string).collect()
        }
        None => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ChatChoice, ChatMessage, ChatRole, TokenUsage, ToolCall};

    fn response_with_arguments(arguments: &str) -> ChatResponse {
        ChatResponse {
            choices: vec![ChatChoice {
                message: ChatMessage {
                    role: ChatRole::Assistant,
                    content: String::new(),
                    tool_calls: vec![ToolCall {
                        id: "call_1".to_string(),
                        name: SET_LABELS_TOOL.to_string(),
                        arguments: arguments.to_string(),
                    }],
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
            usage: TokenUsage::default(),
            model: "gpt-4o".to_string(),
        }
    }

    #[test]
    fn test_parse_list_encoded_labels() {
        let response = response_with_arguments(r#"{"labels": ["bug", "critical"]}"#);
        assert_eq!(parse_set_labels(&response).unwrap(), vec!["bug", "critical"]);
    }

    #[test]
    fn test_parse_space_delimited_labels() {
        let response = response_with_arguments(r#"{"labels": "bug critical"}"#);
        assert_eq!(parse_set_labels(&response).unwrap(), vec!["bug", "critical"]);
    }

    #[test]
    fn test_parse_missing_labels_field_is_empty() {
        let response = response_with_arguments("{}");
        assert!(parse_set_labels(&response).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_tool_call_count_is_protocol_error() {
        let mut response = response_with_arguments(r#"{"labels": []}"#);
        response.choices[0].message.tool_calls.clear();
        assert!(matches!(
            parse_set_labels(&response),
            Err(InferError::Protocol(_))
        ));
    }

    #[test]
    fn test_wrong_choice_count_is_protocol_error() {
        let mut response = response_with_arguments(r#"{"labels": []}"#);
        let extra = response.choices[0].clone();
        response.choices.push(extra);
        assert!(matches!(
            parse_set_labels(&response),
            Err(InferError::Protocol(_))
        ));
    }

    #[test]
    fn test_garbage_arguments_are_protocol_error() {
        let response = response_with_arguments("not json");
        assert!(matches!(
            parse_set_labels(&response),
            Err(InferError::Protocol(_))
        ));
    }

    #[test]
    fn test_retry_delays_double_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_secs(8)));
        assert_eq!(policy.next_delay(5), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(6), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(8), None);
    }
}
