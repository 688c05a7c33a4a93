//! Session manager.
//!
//! Owns every registered [`Session`], connects them through the [`Backend`],
//! drives their state machine from backend events and reconnects them after a
//! fixed delay when a connection is lost.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Session, SessionError, SessionState, SessionStatus, Signal};
use crate::backend::{
    Backend, Connected, Connection, ConnectionEvent, CredentialState, InboundMessage,
};
use crate::credentials::CredentialStore;

/// Receives inbound messages for every session.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, session: String, self_id: Option<String>, message: InboundMessage);
}

/// Handle to the session registry. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    /// Registration order; auto-routing depends on it.
    order: Vec<String>,
    sessions: DashMap<String, Session>,
    backend: Arc<dyn Backend>,
    credentials: Arc<dyn CredentialStore>,
    inbound: Option<Arc<dyn InboundHandler>>,
    reconnect_delay: Duration,
    reconnects: DashMap<String, JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Register `names` in order. No connection is opened until [`start`].
    ///
    /// [`start`]: SessionManager::start
    pub fn new(
        names: Vec<String>,
        backend: Arc<dyn Backend>,
        credentials: Arc<dyn CredentialStore>,
        reconnect_delay: Duration,
    ) -> Self {
        let sessions = DashMap::new();
        for name in &names {
            sessions.insert(name.clone(), Session::new(name.clone()));
        }

        Self {
            inner: Arc::new(Inner {
                order: names,
                sessions,
                backend,
                credentials,
                inbound: None,
                reconnect_delay,
                reconnects: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Attach the inbound message handler. Must be called before any session starts.
    pub fn with_inbound_handler(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.inbound = Some(handler),
            None => warn!("Session manager already shared, inbound handler not attached"),
        }
        self
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Registered names in registration order.
    pub fn list(&self) -> &[String] {
        &self.inner.order
    }

    pub fn status(&self, name: &str) -> Option<SessionStatus> {
        self.inner
            .sessions
            .get(name)
            .map(|s| SessionStatus::from(s.value()))
    }

    /// Every session's state, in registration order.
    pub fn snapshot(&self) -> Vec<(String, SessionState)> {
        self.inner
            .order
            .iter()
            .filter_map(|name| {
                self.inner
                    .sessions
                    .get(name)
                    .map(|s| (name.clone(), s.state()))
            })
            .collect()
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.inner
            .sessions
            .get(name)
            .is_some_and(|s| s.state().is_ready())
    }

    /// The session's current connection handle, whatever its state.
    pub fn connection(&self, name: &str) -> Option<Arc<dyn Connection>> {
        self.inner
            .sessions
            .get(name)
            .and_then(|s| s.handle.clone())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start every registered session in the background.
    ///
    /// Returns immediately; a slow or failing backend never holds up callers.
    pub fn start_all(&self) {
        for name in self.inner.order.clone() {
            let manager = self.clone();
            tokio::spawn(async move {
                // Failures are logged and retried by `start` itself.
                let _ = manager.start(&name).await;
            });
        }
    }

    /// Open a new connection for `name`.
    ///
    /// Not idempotent: calling it for a live session replaces its handle. A
    /// failed attempt marks the session disconnected and schedules a retry.
    pub async fn start(&self, name: &str) -> Result<(), SessionError> {
        if !self.inner.sessions.contains_key(name) {
            return Err(SessionError::UnknownSession(name.to_string()));
        }
        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }

        match self.connect(name).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(session = %name, error = %e, status = "DISCONNECTED", "Session start failed");
                if let Some(mut session) = self.inner.sessions.get_mut(name) {
                    session.apply(Signal::Closed);
                }
                self.schedule_reconnect(name);
                Err(e)
            }
        }
    }

    async fn connect(&self, name: &str) -> Result<(), SessionError> {
        self.inner.credentials.ensure_scope(name).await?;
        let stored = self.inner.credentials.load(name).await?;
        let Connected { connection, events } = self.inner.backend.connect(name, stored).await?;

        let (generation, previous) = {
            let mut session = self
                .inner
                .sessions
                .get_mut(name)
                .ok_or_else(|| SessionError::UnknownSession(name.to_string()))?;
            if session.state() == SessionState::Disconnected {
                session.apply(Signal::Restart);
            }
            let previous = session.replace_handle(connection);
            (session.generation, previous)
            // DashMap RefMut dropped here
        };

        if let Some(previous) = previous {
            previous.close().await;
        }

        info!(session = %name, generation, status = "INIT", "Session connecting");
        tokio::spawn(self.clone().run_events(name.to_string(), generation, events));
        Ok(())
    }

    /// Cancel pending reconnects and close every live connection.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let names: Vec<String> = self
            .inner
            .reconnects
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for name in names {
            if let Some((_, task)) = self.inner.reconnects.remove(&name) {
                task.abort();
            }
        }

        let handles: Vec<Arc<dyn Connection>> = self
            .inner
            .sessions
            .iter_mut()
            .filter_map(|mut s| s.handle.take())
            .collect();
        for handle in handles {
            handle.close().await;
        }
        info!("Session manager stopped");
    }

    fn schedule_reconnect(&self, name: &str) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let manager = self.clone();
        let task_name = name.to_string();
        let delay = self.inner.reconnect_delay;
        let token = self.inner.shutdown.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            manager.inner.reconnects.remove(&task_name);
            debug!(session = %task_name, "Reconnecting session");
            let _ = manager.start(&task_name).await;
        });

        if let Some(previous) = self.inner.reconnects.insert(name.to_string(), task) {
            previous.abort();
        }
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    async fn run_events(
        self,
        name: String,
        generation: u64,
        mut events: mpsc::Receiver<ConnectionEvent>,
    ) {
        loop {
            let event = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                event = events.recv() => event,
            };

            match event {
                Some(ConnectionEvent::ChallengeIssued(payload)) => {
                    self.on_challenge(&name, generation, payload)
                }
                Some(ConnectionEvent::Opened { self_id }) => {
                    self.on_opened(&name, generation, self_id)
                }
                Some(ConnectionEvent::CredentialsUpdated(state)) => {
                    self.on_credentials(&name, &state).await
                }
                Some(ConnectionEvent::MessageReceived(message)) => {
                    self.on_message(&name, message)
                }
                Some(ConnectionEvent::Closed { reason }) => {
                    self.on_closed(&name, generation, reason);
                    return;
                }
                None => {
                    self.on_closed(&name, generation, Some("event stream ended".to_string()));
                    return;
                }
            }
        }
    }

    /// Apply `signal` if `generation` still owns the session.
    fn transition(&self, name: &str, generation: u64, signal: Signal) -> Option<SessionState> {
        let mut session = self.inner.sessions.get_mut(name)?;
        if session.generation != generation {
            debug!(session = %name, generation, "Ignoring event from superseded connection");
            return None;
        }
        session.apply(signal)
    }

    fn on_challenge(&self, name: &str, generation: u64, payload: String) {
        if self
            .transition(name, generation, Signal::Challenge(payload))
            .is_some()
        {
            info!(session = %name, status = "AUTHENTICATING", "Login challenge issued");
        }
    }

    fn on_opened(&self, name: &str, generation: u64, self_id: Option<String>) {
        if self.transition(name, generation, Signal::Opened).is_none() {
            return;
        }
        if let Some(mut session) = self.inner.sessions.get_mut(name) {
            session.self_id = self_id;
        }
        info!(session = %name, status = "READY", "Session ready");
    }

    fn on_closed(&self, name: &str, generation: u64, reason: Option<String>) {
        if self.transition(name, generation, Signal::Closed).is_none() {
            return;
        }
        error!(
            session = %name,
            reason = reason.as_deref().unwrap_or("unknown"),
            status = "DISCONNECTED",
            "Session disconnected"
        );
        self.schedule_reconnect(name);
    }

    /// Persist rotated credentials before the next event is processed.
    async fn on_credentials(&self, name: &str, state: &CredentialState) {
        if let Err(e) = self.inner.credentials.save(name, state).await {
            error!(session = %name, error = %e, "Failed to persist credentials");
        }
    }

    fn on_message(&self, name: &str, message: InboundMessage) {
        let Some(handler) = self.inner.inbound.clone() else {
            return;
        };
        let self_id = self
            .inner
            .sessions
            .get(name)
            .and_then(|s| s.self_id.clone());
        let session = name.to_string();
        tokio::spawn(async move {
            handler.handle(session, self_id, message).await;
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
