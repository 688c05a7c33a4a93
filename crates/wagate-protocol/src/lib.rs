//! Sidecar protocol types for wagate.
//!
//! wagate does not speak the messaging platform's wire protocol itself. Each
//! session opens a WebSocket to a sidecar process that owns the platform SDK,
//! and the two sides exchange JSON text frames:
//!
//! - [`SidecarCommand`]: frames sent from wagate to the sidecar
//! - [`SidecarEvent`]: frames sent from the sidecar to wagate
//!
//! Every frame is a JSON object tagged by a `type` field in `snake_case`.
//! Credential material is opaque to wagate: the sidecar hands it over in
//! [`SidecarEvent::CredsUpdate`] and receives it back in
//! [`SidecarCommand::Login`].

use serde::{Deserialize, Serialize};

// ============================================================================
// Commands (wagate → sidecar)
// ============================================================================

/// A frame sent from wagate to the sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarCommand {
    /// Open a platform connection for a session.
    ///
    /// `credentials` is `None` on first login, in which case the sidecar is
    /// expected to issue a [`SidecarEvent::Qr`] challenge.
    Login {
        session: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<serde_json::Value>,
    },

    /// Send a message through the session's connection.
    Send {
        request_id: String,
        to: String,
        content: SidecarContent,
    },

    /// Close the platform connection without clearing credentials.
    Logout,
}

/// Outbound message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SidecarContent {
    Text {
        text: String,
    },
    /// A document attachment. The bytes travel base64-encoded.
    Document {
        data_base64: String,
        mimetype: String,
        file_name: String,
        #[serde(default)]
        caption: String,
    },
    Poll {
        name: String,
        values: Vec<String>,
        selectable_count: u32,
    },
    /// A text message with a single URL button.
    Button {
        text: String,
        footer: String,
        url: String,
        display_text: String,
    },
}

// ============================================================================
// Events (sidecar → wagate)
// ============================================================================

/// A frame sent from the sidecar to wagate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarEvent {
    /// A new login challenge (QR payload) was issued.
    Qr { qr: String },

    /// The platform connection is open.
    Connected {
        #[serde(default)]
        self_id: Option<String>,
    },

    /// The platform connection closed.
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },

    /// The platform revoked the session's credentials.
    LoggedOut,

    /// Credentials rotated; wagate must persist them before continuing.
    CredsUpdate { credentials: serde_json::Value },

    /// An inbound message.
    Message(InboundMessageData),

    /// Reply to a [`SidecarCommand::Send`].
    SendResult {
        request_id: String,
        success: bool,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },

    /// A sidecar-side error not tied to a request.
    Error { error: String },
}

/// Payload of [`SidecarEvent::Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessageData {
    pub message_id: String,
    /// Chat the message arrived in (a user JID or a group JID).
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub push_name: Option<String>,
    /// Plain text body, if the message carries one.
    #[serde(default)]
    pub text: Option<String>,
    /// False for protocol/stub messages with no user-visible content.
    #[serde(default = "default_true")]
    pub has_content: bool,
    /// Unix timestamp in seconds.
    #[serde(default)]
    pub timestamp: i64,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_omits_missing_credentials() {
        let cmd = SidecarCommand::Login {
            session: "upb".to_string(),
            credentials: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"type":"login","session":"upb"}"#);
    }

    #[test]
    fn send_command_nests_tagged_content() {
        let cmd = SidecarCommand::Send {
            request_id: "r1".to_string(),
            to: "628123@s.whatsapp.net".to_string(),
            content: SidecarContent::Text {
                text: "hello".to_string(),
            },
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["type"], "send");
        assert_eq!(value["content"]["kind"], "text");
        assert_eq!(value["content"]["text"], "hello");
    }

    #[test]
    fn parses_message_event_with_defaults() {
        let json = r#"{"type":"message","message_id":"ABC","remote_jid":"1@g.us"}"#;
        let event: SidecarEvent = serde_json::from_str(json).unwrap();
        let SidecarEvent::Message(data) = event else {
            panic!("expected message event");
        };
        assert_eq!(data.message_id, "ABC");
        assert!(!data.from_me);
        assert!(data.has_content);
        assert_eq!(data.text, None);
        assert_eq!(data.timestamp, 0);
    }

    #[test]
    fn parses_connection_events() {
        let qr: SidecarEvent = serde_json::from_str(r#"{"type":"qr","qr":"2@abc"}"#).unwrap();
        assert_eq!(
            qr,
            SidecarEvent::Qr {
                qr: "2@abc".to_string()
            }
        );

        let closed: SidecarEvent = serde_json::from_str(r#"{"type":"disconnected"}"#).unwrap();
        assert_eq!(closed, SidecarEvent::Disconnected { reason: None });

        let logged_out: SidecarEvent = serde_json::from_str(r#"{"type":"logged_out"}"#).unwrap();
        assert_eq!(logged_out, SidecarEvent::LoggedOut);
    }

    #[test]
    fn rejects_unknown_event_type() {
        let result = serde_json::from_str::<SidecarEvent>(r#"{"type":"presence"}"#);
        assert!(result.is_err());
    }
}
