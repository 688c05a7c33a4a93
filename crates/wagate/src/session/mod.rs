//! Messaging sessions and their connection state machine.
//!
//! A session is one named, long-lived connection to the messaging backend.
//! Its state only moves along these edges:
//!
//! ```text
//!   INIT ──challenge──▶ AUTHENTICATING ──opened──▶ READY ──closed──▶ DISCONNECTED
//!    ▲                                                                   │
//!    └──────────────────────────── restart (after delay) ◀───────────────┘
//! ```
//!
//! A few extra edges keep real connections moving:
//!
//! - `INIT ──opened──▶ READY` when stored credentials make a challenge unnecessary
//! - `INIT | AUTHENTICATING ──closed──▶ DISCONNECTED` when login is abandoned
//! - `AUTHENTICATING ──challenge──▶ AUTHENTICATING` when the backend rotates
//!   the QR code; only the pending payload changes

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::backend::{BackendError, Connection};
use crate::credentials::CredentialError;

pub mod manager;

pub use manager::{InboundHandler, SessionManager};

// ============================================================================
// SessionState
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Init,
    Authenticating,
    Ready,
    Disconnected,
}

impl SessionState {
    /// Next state for `signal`, or `None` if the signal does not apply.
    pub fn next(self, signal: &Signal) -> Option<SessionState> {
        use SessionState::*;

        match (self, signal) {
            (Init | Authenticating, Signal::Challenge(_)) => Some(Authenticating),
            (Init | Authenticating, Signal::Opened) => Some(Ready),
            (Init | Authenticating | Ready, Signal::Closed) => Some(Disconnected),
            (Disconnected, Signal::Restart) => Some(Init),
            _ => None,
        }
    }

    pub fn is_ready(self) -> bool {
        self == SessionState::Ready
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Init => "INIT",
            SessionState::Authenticating => "AUTHENTICATING",
            SessionState::Ready => "READY",
            SessionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}

/// Connection-level input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Challenge(String),
    Opened,
    Closed,
    /// Issued by the manager when a reconnect attempt begins.
    Restart,
}

// ============================================================================
// Session
// ============================================================================

/// One registered session.
pub struct Session {
    name: String,
    state: SessionState,
    pending_challenge: Option<String>,
    /// The account's own JID, reported when the connection opens.
    self_id: Option<String>,
    handle: Option<Arc<dyn Connection>>,
    /// Incremented each time `handle` is replaced; events from older handles
    /// carry a stale generation and are dropped.
    generation: u64,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: SessionState::Init,
            pending_challenge: None,
            self_id: None,
            handle: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending_challenge(&self) -> Option<&str> {
        self.pending_challenge.as_deref()
    }

    /// Apply a signal. Returns the new state if it was accepted.
    pub fn apply(&mut self, signal: Signal) -> Option<SessionState> {
        let next = self.state.next(&signal)?;
        self.state = next;
        match signal {
            Signal::Challenge(payload) => self.pending_challenge = Some(payload),
            _ => self.pending_challenge = None,
        }
        Some(next)
    }

    /// Install a fresh connection handle, returning the one it replaces.
    fn replace_handle(&mut self, handle: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        self.generation += 1;
        self.self_id = None;
        self.pending_challenge = None;
        self.state = SessionState::Init;
        self.handle.replace(handle)
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub name: String,
    pub state: SessionState,
    pub challenge: Option<String>,
}

impl SessionStatus {
    pub fn has_challenge(&self) -> bool {
        self.challenge.is_some()
    }
}

impl From<&Session> for SessionStatus {
    fn from(session: &Session) -> Self {
        Self {
            name: session.name.clone(),
            state: session.state,
            challenge: session.pending_challenge.clone(),
        }
    }
}

// ============================================================================
// SessionError
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("credential store error: {0}")]
    Credentials(#[from] CredentialError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

// ============================================================================
// Tests
// ============================================================================
