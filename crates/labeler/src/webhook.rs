//! GitHub webhook intake: signature verification and issue events.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::github::Issue;

type HmacSha256 = Hmac<Sha256>;

/// Webhook rejection reasons.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    /// The X-Hub-Signature-256 header is missing or not hex.
    #[error("malformed webhook signature")]
    MalformedSignature,

    /// The signature does not match the payload.
    #[error("webhook signature mismatch")]
    SignatureMismatch,
}

/// Verify a payload against its `X-Hub-Signature-256` header value.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> Result<(), WebhookError> {
    let hex_digest = header
        .strip_prefix("sha256=")
        .ok_or(WebhookError::MalformedSignature)?;
    let claimed = hex::decode(hex_digest).map_err(|_| WebhookError::MalformedSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::MalformedSignature)?;
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected.ct_eq(&claimed).into() {
        Ok(())
    } else {
        Err(WebhookError::SignatureMismatch)
    }
}

/// Repository block of a webhook payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRepository {
    /// Repository ID
    pub id: i64,
    /// Repository name
    pub name: String,
    /// Owner block
    pub owner: WebhookOwner,
    /// Whether the repository is private
    #[serde(default)]
    pub private: bool,
}

/// Owner block of a webhook payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookOwner {
    /// Owner login
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WebhookInstallation {
    id: i64,
}

/// An `issues` webhook event, reduced to the fields the service reads.
#[derive(Debug, Clone, Deserialize)]
pub struct IssuesEvent {
    /// Event action (opened, edited, labeled, ...)
    pub action: String,
    /// The issue the event concerns
    pub issue: Issue,
    /// The repository the event concerns
    pub repository: WebhookRepository,
    /// Installation the app received the event through
    installation: WebhookInstallation,
}

impl IssuesEvent {
    /// Installation ID the event arrived through.
    #[must_use]
    pub fn install_id(&self) -> i64 {
        self.installation.id
    }

    /// Whether this event should trigger inference. Only opened and
    /// reopened issues are labeled automatically; edits and manual
    /// label changes belong to humans.
    #[must_use]
    pub fn wants_inference(&self) -> bool {
        matches!(self.action.as_str(), "opened" | "reopened")
    }
}
