//! Messaging backend boundary.
//!
//! The gateway never speaks the platform protocol itself. A [`Backend`] opens
//! one [`Connection`] per session and reports everything that happens on it as
//! an ordered stream of [`ConnectionEvent`]s. The session manager consumes that
//! stream; the dispatch queue uses [`Connection::send`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod sidecar;

pub use sidecar::SidecarBackend;
pub use wagate_protocol::InboundMessageData as InboundMessage;

/// Opaque per-session credential material, owned by the credential store.
pub type CredentialState = serde_json::Value;

// ============================================================================
// Events
// ============================================================================

/// Something the backend reports about one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A login challenge (QR payload) was issued.
    ChallengeIssued(String),
    /// The connection is open and can send.
    Opened { self_id: Option<String> },
    /// The connection closed. No further events follow.
    Closed { reason: Option<String> },
    /// Credentials rotated and must be persisted.
    CredentialsUpdated(CredentialState),
    /// An inbound message arrived.
    MessageReceived(InboundMessage),
}

// ============================================================================
// Outbound content
// ============================================================================

/// Content of a single outbound send.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundContent {
    Text {
        text: String,
    },
    Document {
        data: Bytes,
        mimetype: String,
        file_name: String,
        caption: String,
    },
    Poll {
        name: String,
        values: Vec<String>,
        selectable_count: u32,
    },
    Button {
        text: String,
        footer: String,
        url: String,
        display_text: String,
    },
}

impl OutboundContent {
    /// Short label used in log records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Document { .. } => "document",
            Self::Poll { .. } => "poll",
            Self::Button { .. } => "button",
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A live connection owned by exactly one session.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send content to a chat JID.
    async fn send(&self, to: &str, content: OutboundContent) -> Result<(), BackendError>;

    /// Ask the backend to close the connection. Credentials are kept.
    async fn close(&self);
}

/// A freshly opened connection plus its event stream.
pub struct Connected {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

/// Factory for per-session connections.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open a new connection for `session`, resuming from `credentials` if any.
    async fn connect(
        &self,
        session: &str,
        credentials: Option<CredentialState>,
    ) -> Result<Connected, BackendError>;
}

// ============================================================================
// BackendError
// ============================================================================

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to connect to backend: {0}")]
    Connect(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("send rejected: {0}")]
    SendRejected(String),

    #[error("send timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),
}
