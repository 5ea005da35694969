//! End-to-end inference flow against a mocked GitHub API and a
//! scripted completion provider.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use labeler::ai::{
    ChatChoice, ChatMessage, ChatRequest, ChatResponse, ChatRole, CompletionProvider,
    ProviderError, TokenUsage, ToolCall,
};
use labeler::errors::InferError;
use labeler::github::AppAuth;
use labeler::infer::{InferRequest, Labeler, RetryPolicy};
use labeler::tokens::TokenCounter;

struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<ChatResponse, ProviderError>>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(responses: Vec<Result<ChatResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("provider called more times than scripted")
    }
}

fn labels_response(labels: &[&str]) -> ChatResponse {
    let arguments = serde_json::json!({ "labels": labels }).to_string();
    ChatResponse {
        choices: vec![ChatChoice {
            message: ChatMessage {
                role: ChatRole::Assistant,
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "set_labels".to_string(),
                    arguments,
                }],
            },
            finish_reason: Some("tool_calls".to_string()),
        }],
        usage: TokenUsage {
            prompt_tokens: 900,
            completion_tokens: 12,
            total_tokens: 912,
        },
        model: "gpt-4o".to_string(),
    }
}

fn api_error(status: u16) -> ProviderError {
    ProviderError::Api {
        status,
        message: "scripted failure".to_string(),
    }
}

fn issue_json(number: i64, labels: &[&str]) -> serde_json::Value {
    let labels: Vec<serde_json::Value> = labels
        .iter()
        .map(|name| serde_json::json!({"name": name, "description": ""}))
        .collect();
    serde_json::json!({
        "id": number * 1000,
        "number": number,
        "title": format!("issue {number}"),
        "body": "the app crashes on startup",
        "user": {"login": "alice"},
        "author_association": "MEMBER",
        "labels": labels,
        "state": "open",
        "created_at": format!("2024-01-{:02}T00:00:00Z", number),
        "updated_at": format!("2024-01-{:02}T00:00:00Z", number),
        "html_url": format!("https://github.com/o/r/issues/{number}")
    })
}

async fn mock_github(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/repos/o/r/contents/.github/labeler.yml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/issues"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            issue_json(1, &["bug"]),
            issue_json(2, &["feature"]),
        ])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/labels"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"name": "bug", "description": "Something is broken"},
            {"name": "feature", "description": "New functionality"},
            {"name": "roadmap", "description": "Planned. Only humans may set this."},
        ])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/issues/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(issue_json(7, &[])))
        .mount(server)
        .await;
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial: Duration::from_millis(5),
        cap: Duration::from_millis(10),
        max_attempts: 3,
    }
}

fn labeler(server: &MockServer, provider: Arc<ScriptedProvider>) -> Labeler {
    let auth = Arc::new(
        AppAuth::new_token("t")
            .unwrap()
            .with_base_url(server.uri()),
    );
    Labeler::new(auth, provider, Arc::new(TokenCounter::new().unwrap()), "gpt-4o")
        .with_retry(fast_retry())
}

fn request() -> InferRequest {
    InferRequest {
        install_id: 1,
        owner: "o".to_string(),
        repo: "r".to_string(),
        issue: 7,
        test_mode: false,
    }
}

#[tokio::test]
async fn infer_sanitizes_model_output() {
    let server = MockServer::start().await;
    mock_github(&server).await;

    // The model proposes a good label, a human-only label, and a
    // hallucination; only the good one survives.
    let provider = Arc::new(ScriptedProvider::new(vec![Ok(labels_response(&[
        "bug", "roadmap", "ghost",
    ]))]));
    let labeler = labeler(&server, Arc::clone(&provider));

    let response = labeler.infer(&request()).await.unwrap();
    assert_eq!(response.set_labels, vec!["bug"]);
    assert_eq!(response.disabled_labels, vec!["roadmap"]);
    assert_eq!(response.tokens_used, 912);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn infer_retries_transient_failures() {
    let server = MockServer::start().await;
    mock_github(&server).await;

    let provider = Arc::new(ScriptedProvider::new(vec![
        Err(api_error(500)),
        Err(api_error(429)),
        Ok(labels_response(&["bug"])),
    ]));
    let labeler = labeler(&server, Arc::clone(&provider));

    let response = labeler.infer(&request()).await.unwrap();
    assert_eq!(response.set_labels, vec!["bug"]);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn infer_does_not_retry_client_errors() {
    let server = MockServer::start().await;
    mock_github(&server).await;

    let provider = Arc::new(ScriptedProvider::new(vec![Err(api_error(400))]));
    let labeler = labeler(&server, Arc::clone(&provider));

    let err = labeler.infer(&request()).await.unwrap_err();
    assert!(matches!(err, InferError::Provider(_)));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn infer_gives_up_after_retry_budget() {
    let server = MockServer::start().await;
    mock_github(&server).await;

    let provider = Arc::new(ScriptedProvider::new(vec![
        Err(api_error(503)),
        Err(api_error(503)),
        Err(api_error(503)),
    ]));
    let labeler = labeler(&server, Arc::clone(&provider));

    let err = labeler.infer(&request()).await.unwrap_err();
    assert!(matches!(err, InferError::Provider(_)));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn infer_accepts_space_delimited_labels() {
    let server = MockServer::start().await;
    mock_github(&server).await;

    let arguments = serde_json::json!({"labels": "bug feature"}).to_string();
    let mut response = labels_response(&[]);
    response.choices[0].message.tool_calls[0].arguments = arguments;

    let provider = Arc::new(ScriptedProvider::new(vec![Ok(response)]));
    let labeler = labeler(&server, provider);

    let response = labeler.infer(&request()).await.unwrap();
    assert_eq!(response.set_labels, vec!["bug", "feature"]);
}

#[tokio::test]
async fn infer_respects_repo_exclusion_config() {
    let server = MockServer::start().await;
    // Same fixtures but with an exclusion config present.
    Mock::given(method("GET"))
        .and(path("/repos/x/y/contents/.github/labeler.yml"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "content": base64_encode("exclude:\n  - ^feature$\n"),
            "encoding": "base64"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/x/y/issues"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/x/y/labels"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"name": "bug", "description": ""},
            {"name": "feature", "description": ""},
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/x/y/issues/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(issue_json(7, &[])))
        .mount(&server)
        .await;

    let provider = Arc::new(ScriptedProvider::new(vec![Ok(labels_response(&[
        "bug", "feature",
    ]))]));
    let labeler = labeler(&server, provider);

    let response = labeler
        .infer(&InferRequest {
            install_id: 1,
            owner: "x".to_string(),
            repo: "y".to_string(),
            issue: 7,
            test_mode: false,
        })
        .await
        .unwrap();
    assert_eq!(response.set_labels, vec!["bug"]);
    assert_eq!(response.disabled_labels, vec!["feature"]);
}

fn base64_encode(text: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(text)
}
