//! Inbound message relay.
//!
//! Every inbound message that is not our own echo is normalised into an
//! [`InboundEnvelope`] and POSTed once to the external message store. The
//! outcome is only logged: `STORED`, `FAILED` or `ERROR`. Nothing is retried
//! or buffered.
//!
//! The relay can also answer configured trigger phrases. Replies go through
//! the dispatch queue like any other outbound send.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::InboundMessage;
use crate::config::{AutoReplyRule, RelayConfig};
use crate::dispatch::{DispatchQueue, JobPayload};
use crate::session::InboundHandler;

const USER_SERVER: &str = "s.whatsapp.net";
const GROUP_SUFFIX: &str = "@g.us";

// ============================================================================
// Envelope
// ============================================================================

/// Normalised inbound message as sent to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundEnvelope {
    pub session_name: String,
    pub wa: String,
    pub from: String,
    pub to: String,
    pub push_name: String,
    pub text: String,
    pub message_id: String,
    pub timestamp: i64,
    pub is_group: bool,
    pub group_id: Option<String>,
}

impl InboundEnvelope {
    /// Build the envelope, or `None` for echoes and content-less messages.
    pub fn from_message(
        session: &str,
        self_id: Option<&str>,
        message: &InboundMessage,
    ) -> Option<Self> {
        if message.from_me || !message.has_content {
            return None;
        }

        let is_group = message.remote_jid.ends_with(GROUP_SUFFIX);
        Some(Self {
            session_name: session.to_string(),
            wa: session.to_string(),
            from: message.remote_jid.clone(),
            to: self_id.map(user_jid).unwrap_or_default(),
            push_name: message.push_name.clone().unwrap_or_default(),
            text: message.text.clone().unwrap_or_default(),
            message_id: message.message_id.clone(),
            timestamp: message.timestamp,
            is_group,
            group_id: is_group.then(|| message.remote_jid.clone()),
        })
    }
}

/// `628123:12@s.whatsapp.net` and `628123` both become `628123@s.whatsapp.net`.
fn user_jid(id: &str) -> String {
    let user = id.split([':', '@']).next().unwrap_or(id);
    format!("{}@{}", user, USER_SERVER)
}

// ============================================================================
// Classification
// ============================================================================

/// Store reply body.
#[derive(Debug, Clone, Default)]
pub struct StoreResponse {
    pub status: Value,
    pub id: Option<Value>,
    pub message: Option<String>,
}

impl StoreResponse {
    /// Read a 2xx body. A body that is not a JSON object carries no status.
    pub fn from_body(body: &[u8]) -> Self {
        let value: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        let field = |key: &str| value.get(key).filter(|v| !v.is_null());
        Self {
            status: field("status").cloned().unwrap_or(Value::Null),
            id: field("id").cloned(),
            message: field("message").map(value_to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Stored { id: Option<String> },
    Failed { reason: Option<String> },
    Error { detail: String },
}

impl RelayOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            RelayOutcome::Stored { .. } => "STORED",
            RelayOutcome::Failed { .. } => "FAILED",
            RelayOutcome::Error { .. } => "ERROR",
        }
    }
}

/// Map a store exchange to its outcome. Pure.
pub fn classify(result: &Result<StoreResponse, RelayError>) -> RelayOutcome {
    match result {
        Ok(response) if is_truthy(&response.status) => RelayOutcome::Stored {
            id: response.id.as_ref().map(value_to_string),
        },
        Ok(response) => RelayOutcome::Failed {
            reason: response.message.clone(),
        },
        Err(e) => RelayOutcome::Error {
            detail: e.to_string(),
        },
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store responded with HTTP {0}")]
    Status(u16),
}

// ============================================================================
// InboundRelay
// ============================================================================

pub struct InboundRelay {
    client: reqwest::Client,
    url: Option<String>,
    timeout: Duration,
    auto_reply: Vec<AutoReplyRule>,
    queue: Option<DispatchQueue>,
}

impl InboundRelay {
    pub fn new(client: reqwest::Client, config: &RelayConfig) -> Self {
        Self {
            client,
            url: config.url.clone().filter(|u| !u.trim().is_empty()),
            timeout: config.timeout(),
            auto_reply: Vec::new(),
            queue: None,
        }
    }

    /// Answer matching inbound texts through `queue`.
    pub fn with_auto_reply(mut self, rules: Vec<AutoReplyRule>, queue: DispatchQueue) -> Self {
        self.auto_reply = rules;
        self.queue = Some(queue);
        self
    }

    /// POST `envelope` once and classify the result.
    pub async fn forward(&self, url: &str, envelope: &InboundEnvelope) -> RelayOutcome {
        classify(&self.post(url, envelope).await)
    }

    async fn post(&self, url: &str, envelope: &InboundEnvelope) -> Result<StoreResponse, RelayError> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(envelope)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        Ok(StoreResponse::from_body(&body))
    }

    fn reply_for(&self, text: &str) -> Option<&str> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        self.auto_reply
            .iter()
            .find(|rule| rule.trigger.trim().eq_ignore_ascii_case(text))
            .map(|rule| rule.reply.as_str())
    }

    fn auto_reply(&self, envelope: &InboundEnvelope) {
        let Some(queue) = &self.queue else {
            return;
        };
        let Some(reply) = self.reply_for(&envelope.text) else {
            return;
        };

        let payload = JobPayload::Text {
            text: reply.to_string(),
        };
        match queue.enqueue(&envelope.session_name, &envelope.from, payload) {
            Ok(job_id) => info!(
                wa = %envelope.session_name,
                msg_id = %envelope.message_id,
                job_id = %job_id,
                "Auto reply queued"
            ),
            Err(e) => warn!(
                wa = %envelope.session_name,
                msg_id = %envelope.message_id,
                error = %e,
                "Auto reply not queued"
            ),
        }
    }
}

#[async_trait]
impl InboundHandler for InboundRelay {
    async fn handle(&self, session: String, self_id: Option<String>, message: InboundMessage) {
        let Some(envelope) = InboundEnvelope::from_message(&session, self_id.as_deref(), &message)
        else {
            return;
        };

        self.auto_reply(&envelope);

        let Some(url) = &self.url else {
            debug!(wa = %session, msg_id = %envelope.message_id, "No store configured, inbound message not relayed");
            return;
        };

        let outcome = self.forward(url, &envelope).await;
        log_outcome(&envelope, &outcome);
    }
}

fn log_outcome(envelope: &InboundEnvelope, outcome: &RelayOutcome) {
    let wa = &envelope.session_name;
    let msg_id = &envelope.message_id;
    let status = outcome.status();
    match outcome {
        RelayOutcome::Stored { id } => info!(
            wa = %wa,
            msg_id = %msg_id,
            db_id = id.as_deref().unwrap_or_default(),
            status,
            "Inbound message stored"
        ),
        RelayOutcome::Failed { reason } => warn!(
            wa = %wa,
            msg_id = %msg_id,
            reason = reason.as_deref().unwrap_or_default(),
            status,
            "Store rejected inbound message"
        ),
        RelayOutcome::Error { detail } => error!(
            wa = %wa,
            msg_id = %msg_id,
            error = %detail,
            status,
            "Inbound relay failed"
        ),
    }
}

// ============================================================================
// Tests
// ============================================================================
