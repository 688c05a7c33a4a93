use axum::extract::State;
use axum::http::StatusCode;

use crate::server::AppState;

pub async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Ready once at least one session can send.
pub async fn readyz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let any_ready = state
        .sessions
        .snapshot()
        .iter()
        .any(|(_, s)| s.is_ready());
    if any_ready {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no session ready")
    }
}
