//! HTTP surface: inference, search, webhook intake, health.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::errors::{InferError, SearchError};
use crate::github::AppAuth;
use crate::infer::{InferRequest, Labeler};
use crate::search::{SearchRequest, SearchService};
use crate::webhook::{verify_signature, IssuesEvent};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Inference orchestrator
    pub labeler: Arc<Labeler>,
    /// Similarity search
    pub search: Arc<SearchService>,
    /// Installation credential resolver, for applying webhook labels
    pub auth: Arc<AppAuth>,
    /// Webhook HMAC secret; webhook intake is disabled without one
    pub webhook_secret: Option<String>,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/infer", get(infer))
        .route("/search", get(search))
        .route("/webhook", post(webhook))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

impl From<InferError> for ApiError {
    fn from(err: InferError) -> Self {
        let status = match &err {
            InferError::Config(_) => StatusCode::BAD_REQUEST,
            InferError::Upstream(_) | InferError::Provider(_) | InferError::Protocol(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %err, "inference failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        let status = match &err {
            SearchError::Forbidden => StatusCode::FORBIDDEN,
            SearchError::NotFound => StatusCode::NOT_FOUND,
            SearchError::DimensionMismatch { .. }
            | SearchError::Provider(_)
            | SearchError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "search failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn infer(
    State(state): State<AppState>,
    Query(req): Query<InferRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.labeler.infer(&req).await?;
    Ok(Json(response))
}

async fn search(
    State(state): State<AppState>,
    Query(req): Query<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.search.search(&req).await?;
    Ok(Json(response))
}

async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(secret) = &state.webhook_secret else {
        return (StatusCode::SERVICE_UNAVAILABLE, "webhook intake disabled").into_response();
    };
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if let Err(err) = verify_signature(secret, &body, signature) {
        warn!(error = %err, "webhook rejected");
        return (StatusCode::FORBIDDEN, "signature rejected").into_response();
    }

    let event_kind = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if event_kind != "issues" {
        return (StatusCode::OK, "ignored").into_response();
    }

    let event: IssuesEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "unparsable issues event");
            return (StatusCode::BAD_REQUEST, "unparsable payload").into_response();
        }
    };
    if !event.wants_inference() {
        return (StatusCode::OK, "ignored").into_response();
    }

    // Label in the background; GitHub expects webhook responses fast.
    tokio::spawn(label_from_event(state, event));
    (StatusCode::ACCEPTED, "labeling").into_response()
}

async fn label_from_event(state: AppState, event: IssuesEvent) {
    let owner = event.repository.owner.login.clone();
    let repo = event.repository.name.clone();
    let number = event.issue.number;

    let req = InferRequest {
        install_id: event.install_id(),
        owner: owner.clone(),
        repo: repo.clone(),
        issue: number,
        test_mode: false,
    };
    let response = match state.labeler.infer(&req).await {
        Ok(response) => response,
        Err(err) => {
            error!(owner = %owner, repo = %repo, issue = number, error = %err,
                "webhook inference failed");
            return;
        }
    };
    if response.set_labels.is_empty() {
        info!(owner = %owner, repo = %repo, issue = number, "no labels to apply");
        return;
    }

    let client = match state.auth.installation_client(event.install_id()).await {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "resolving installation for label application failed");
            return;
        }
    };
    if let Err(err) = client
        .add_labels(&owner, &repo, number, response.set_labels.clone())
        .await
    {
        error!(owner = %owner, repo = %repo, issue = number, error = %err,
            "applying labels failed");
        return;
    }
    info!(owner = %owner, repo = %repo, issue = number,
        labels = ?response.set_labels, "labels applied");
}
