use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::timeout::TimeoutLayer;

use crate::auth::{self, ApiKey};
use crate::dispatch::DispatchQueue;
use crate::handlers;
use crate::request_throttle::{self, RequestThrottle};
use crate::session::SessionManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub queue: DispatchQueue,
    pub api_key: ApiKey,
    pub throttle: RequestThrottle,
}

pub fn build_app(state: AppState, request_timeout_secs: u64) -> Router {
    let send = Router::new()
        .route("/send", post(handlers::send_text))
        .route("/send-file", post(handlers::send_file))
        .route("/send-button", post(handlers::send_button))
        .route("/send-poll", post(handlers::send_poll))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/dashboard", get(handlers::dashboard))
        .route("/qr/{name}", get(handlers::qr))
        .merge(send)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            request_throttle::throttle_gate,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_secs),
        ))
        .with_state(state)
}
