//! WebSocket sidecar backend.
//!
//! Each session opens its own socket to the sidecar, logs in with its stored
//! credentials and from then on only sees its own events. Sends are
//! correlated with their `send_result` replies by request id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use wagate_protocol::{SidecarCommand, SidecarContent, SidecarEvent};

use super::{
    Backend, BackendError, Connected, Connection, ConnectionEvent, CredentialState,
    OutboundContent,
};

/// Capacity of the per-connection event channel.
const EVENT_BUFFER: usize = 256;

/// How long a send waits for the sidecar's `send_result`.
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on the WebSocket handshake plus the login frame.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

type PendingSends = Arc<DashMap<String, oneshot::Sender<Result<(), BackendError>>>>;

// ============================================================================
// SidecarBackend
// ============================================================================

/// Backend that delegates the platform protocol to a sidecar process.
pub struct SidecarBackend {
    url: String,
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl SidecarBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }
}

#[async_trait]
impl Backend for SidecarBackend {
    async fn connect(
        &self,
        session: &str,
        credentials: Option<CredentialState>,
    ) -> Result<Connected, BackendError> {
        let login = SidecarCommand::Login {
            session: session.to_string(),
            credentials,
        };
        let handshake = async {
            let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str())
                .await
                .map_err(|e| BackendError::Connect(e.to_string()))?;
            let (mut sink, stream) = socket.split();
            sink.send(encode(&login)?)
                .await
                .map_err(|e| BackendError::Connect(e.to_string()))?;
            Ok::<_, BackendError>((sink, stream))
        };
        let (mut sink, mut stream) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                BackendError::Connect(format!(
                    "sidecar handshake timed out after {}s",
                    self.connect_timeout.as_secs_f32()
                ))
            })??;

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<SidecarCommand>();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let pending: PendingSends = Arc::new(DashMap::new());

        // Writer: drains commands until the connection handle is dropped.
        let writer_session = session.to_string();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let frame = match encode(&command) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(session = %writer_session, error = %e, "Dropping unencodable command");
                        continue;
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    debug!(session = %writer_session, error = %e, "Sidecar socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: translates frames into connection events, in order.
        let reader_session = session.to_string();
        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut reason = None;
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        reason = Some(e.to_string());
                        break;
                    }
                };

                let event = match serde_json::from_str::<SidecarEvent>(text.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(session = %reader_session, error = %e, "Ignoring malformed sidecar frame");
                        continue;
                    }
                };

                if let Some(event) = translate_event(event, &reader_pending) {
                    let closed = matches!(event, ConnectionEvent::Closed { .. });
                    if event_tx.send(event).await.is_err() || closed {
                        fail_pending(&reader_pending);
                        return;
                    }
                }
            }

            fail_pending(&reader_pending);
            let reason = reason.unwrap_or_else(|| "sidecar connection lost".to_string());
            let _ = event_tx
                .send(ConnectionEvent::Closed {
                    reason: Some(reason),
                })
                .await;
        });

        let connection = SidecarConnection {
            commands: command_tx,
            pending,
            send_timeout: self.send_timeout,
        };

        Ok(Connected {
            connection: Arc::new(connection),
            events: event_rx,
        })
    }
}

// ============================================================================
// SidecarConnection
// ============================================================================

struct SidecarConnection {
    commands: mpsc::UnboundedSender<SidecarCommand>,
    pending: PendingSends,
    send_timeout: Duration,
}

#[async_trait]
impl Connection for SidecarConnection {
    async fn send(&self, to: &str, content: OutboundContent) -> Result<(), BackendError> {
        let request_id = ulid::Ulid::new().to_string().to_lowercase();
        debug!(request_id = %request_id, to, kind = content.kind(), "Sending through sidecar");
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let command = SidecarCommand::Send {
            request_id: request_id.clone(),
            to: to.to_string(),
            content: to_wire(content),
        };
        if self.commands.send(command).is_err() {
            self.pending.remove(&request_id);
            return Err(BackendError::ConnectionClosed);
        }

        match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BackendError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(BackendError::Timeout)
            }
        }
    }

    async fn close(&self) {
        let _ = self.commands.send(SidecarCommand::Logout);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn encode(command: &SidecarCommand) -> Result<Message, BackendError> {
    let json = serde_json::to_string(command).map_err(|e| BackendError::Protocol(e.to_string()))?;
    Ok(Message::Text(json.into()))
}

/// Map a sidecar frame to a connection event.
///
/// Send results are resolved against `pending` and produce no event.
fn translate_event(event: SidecarEvent, pending: &PendingSends) -> Option<ConnectionEvent> {
    match event {
        SidecarEvent::Qr { qr } => Some(ConnectionEvent::ChallengeIssued(qr)),
        SidecarEvent::Connected { self_id } => Some(ConnectionEvent::Opened { self_id }),
        SidecarEvent::Disconnected { reason } => Some(ConnectionEvent::Closed { reason }),
        SidecarEvent::LoggedOut => Some(ConnectionEvent::Closed {
            reason: Some("logged out".to_string()),
        }),
        SidecarEvent::CredsUpdate { credentials } => {
            Some(ConnectionEvent::CredentialsUpdated(credentials))
        }
        SidecarEvent::Message(data) => Some(ConnectionEvent::MessageReceived(data)),
        SidecarEvent::SendResult {
            request_id,
            success,
            error,
            ..
        } => {
            match pending.remove(&request_id) {
                Some((_, tx)) => {
                    let result = if success {
                        Ok(())
                    } else {
                        Err(BackendError::SendRejected(
                            error.unwrap_or_else(|| "unknown error".to_string()),
                        ))
                    };
                    let _ = tx.send(result);
                }
                None => debug!(request_id = %request_id, "Send result for unknown request"),
            }
            None
        }
        SidecarEvent::Error { error } => {
            warn!(error = %error, "Sidecar reported an error");
            None
        }
    }
}

fn fail_pending(pending: &PendingSends) {
    let ids: Vec<String> = pending.iter().map(|e| e.key().clone()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(BackendError::ConnectionClosed));
        }
    }
}

fn to_wire(content: OutboundContent) -> SidecarContent {
    match content {
        OutboundContent::Text { text } => SidecarContent::Text { text },
        OutboundContent::Document {
            data,
            mimetype,
            file_name,
            caption,
        } => SidecarContent::Document {
            data_base64: STANDARD.encode(&data),
            mimetype,
            file_name,
            caption,
        },
        OutboundContent::Poll {
            name,
            values,
            selectable_count,
        } => SidecarContent::Poll {
            name,
            values,
            selectable_count,
        },
        OutboundContent::Button {
            text,
            footer,
            url,
            display_text,
        } => SidecarContent::Button {
            text,
            footer,
            url,
            display_text,
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
