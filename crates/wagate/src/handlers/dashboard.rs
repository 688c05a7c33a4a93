use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::server::AppState;
use crate::session::SessionState;

#[derive(Debug, Serialize)]
pub struct DashboardEntry {
    wa: String,
    /// `ONLINE` when the session can send, `OFFLINE` otherwise.
    status: &'static str,
    state: SessionState,
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    total: usize,
    online: usize,
    data: Vec<DashboardEntry>,
}

/// GET /dashboard
pub async fn dashboard(State(state): State<AppState>) -> Json<DashboardResponse> {
    let data: Vec<DashboardEntry> = state
        .sessions
        .snapshot()
        .into_iter()
        .map(|(wa, state)| DashboardEntry {
            wa,
            status: if state.is_ready() { "ONLINE" } else { "OFFLINE" },
            state,
        })
        .collect();

    Json(DashboardResponse {
        total: data.len(),
        online: data.iter().filter(|d| d.state.is_ready()).count(),
        data,
    })
}
