//! Session selection for outbound requests.
//!
//! Callers either name a session or ask for [`AUTO`]. Explicit names pass
//! through untouched so a caller targeting a session that is currently down
//! gets a clear readiness error instead of a silent reroute. `auto` picks the
//! first ready session in registration order; there is no round-robin.

use crate::session::{SessionManager, SessionState};

/// Sentinel that asks for automatic session selection.
pub const AUTO: &str = "auto";

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteIntent {
    Auto,
    Named(String),
}

impl RouteIntent {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == AUTO {
            RouteIntent::Auto
        } else {
            RouteIntent::Named(raw.to_string())
        }
    }

    /// Resolve against a readiness snapshot given in registration order.
    ///
    /// `None` means no session is available for `auto`.
    pub fn resolve(&self, snapshot: &[(String, SessionState)]) -> Option<String> {
        match self {
            RouteIntent::Named(name) => Some(name.clone()),
            RouteIntent::Auto => snapshot
                .iter()
                .find(|(_, state)| state.is_ready())
                .map(|(name, _)| name.clone()),
        }
    }
}

/// Resolve `intent` against the manager's current readiness.
pub fn select(manager: &SessionManager, intent: &RouteIntent) -> Option<String> {
    match intent {
        RouteIntent::Named(name) => Some(name.clone()),
        RouteIntent::Auto => intent.resolve(&manager.snapshot()),
    }
}
