//! Outbound send handlers.
//!
//! Each handler resolves a session, validates its input, admits exactly one
//! job to the dispatch queue and answers `202 Accepted` without waiting for
//! delivery. Routing is checked before validation.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::attachment::RemoteDocument;
use crate::dispatch::JobPayload;
use crate::response;
use crate::routing::{self, RouteIntent};
use crate::server::AppState;

const USER_SERVER: &str = "s.whatsapp.net";
const DEFAULT_BUTTON_TEXT: &str = "Tap the button below:";
const DEFAULT_BUTTON_LABEL: &str = "Open link";
const MIN_POLL_OPTIONS: usize = 2;
const MAX_POLL_OPTIONS: usize = 12;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SendTextRequest {
    number: Option<String>,
    chat_id: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendFileRequest {
    number: Option<String>,
    file_url: Option<String>,
    caption: Option<String>,
    file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendButtonRequest {
    number: Option<String>,
    text: Option<String>,
    url: Option<String>,
    button_text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendPollRequest {
    number: Option<String>,
    question: Option<String>,
    #[serde(default)]
    options: Vec<String>,
    max_answers: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    status: bool,
    queued: bool,
    job_id: String,
    wa: String,
    to: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /send
pub async fn send_text(
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let (session, req) = match route_and_decode::<SendTextRequest>(&state, &body) {
        Ok(routed) => routed,
        Err(resp) => return resp,
    };

    let Some(message) = non_empty(req.message) else {
        return response::bad_request("message is required").into_response();
    };
    let target = match non_empty(req.chat_id) {
        Some(chat_id) => chat_id,
        None => match req.number.as_deref().and_then(user_jid) {
            Some(jid) => jid,
            None => {
                return response::bad_request("number or chat_id is required").into_response();
            }
        },
    };

    enqueue(&state, session, target, JobPayload::Text { text: message })
}

/// POST /send-file
pub async fn send_file(
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let (session, req) = match route_and_decode::<SendFileRequest>(&state, &body) {
        Ok(routed) => routed,
        Err(resp) => return resp,
    };

    let Some(file_url) = non_empty(req.file_url) else {
        return response::bad_request("file_url is required").into_response();
    };
    if !is_http_url(&file_url) {
        return response::bad_request("file_url must be an http(s) URL").into_response();
    }
    let Some(target) = req.number.as_deref().and_then(file_target) else {
        return response::bad_request("number is required").into_response();
    };

    let payload = JobPayload::Document(RemoteDocument {
        url: file_url,
        caption: non_empty(req.caption),
        file_name: non_empty(req.file_name),
    });
    enqueue(&state, session, target, payload)
}

/// POST /send-button
pub async fn send_button(
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let (session, req) = match route_and_decode::<SendButtonRequest>(&state, &body) {
        Ok(routed) => routed,
        Err(resp) => return resp,
    };

    let Some(target) = req.number.as_deref().and_then(user_jid) else {
        return response::bad_request("number is required").into_response();
    };
    let Some(url) = non_empty(req.url).filter(|u| u.starts_with("https://")) else {
        return response::bad_request("url must start with https://").into_response();
    };

    let payload = JobPayload::Button {
        text: non_empty(req.text).unwrap_or_else(|| DEFAULT_BUTTON_TEXT.to_string()),
        url,
        button_text: non_empty(req.button_text)
            .unwrap_or_else(|| DEFAULT_BUTTON_LABEL.to_string()),
    };
    enqueue(&state, session, target, payload)
}

/// POST /send-poll
pub async fn send_poll(
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let (session, req) = match route_and_decode::<SendPollRequest>(&state, &body) {
        Ok(routed) => routed,
        Err(resp) => return resp,
    };

    let Some(target) = req.number.as_deref().and_then(user_jid) else {
        return response::bad_request("number is required").into_response();
    };
    let Some(question) = non_empty(req.question) else {
        return response::bad_request("question is required").into_response();
    };
    let options: Vec<String> = req
        .options
        .into_iter()
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .collect();
    if !(MIN_POLL_OPTIONS..=MAX_POLL_OPTIONS).contains(&options.len()) {
        return response::bad_request(format!(
            "options must contain between {} and {} entries",
            MIN_POLL_OPTIONS, MAX_POLL_OPTIONS
        ))
        .into_response();
    }
    let max_answers = req.max_answers.unwrap_or(1);
    if max_answers == 0 || max_answers as usize > options.len() {
        return response::bad_request("max_answers must be between 1 and the number of options")
            .into_response();
    }

    let payload = JobPayload::Poll {
        question,
        options,
        max_answers,
    };
    enqueue(&state, session, target, payload)
}

// ============================================================================
// Helpers
// ============================================================================

/// Resolve the session from the body's `wa`, then decode the full request.
///
/// `wa` is read leniently so that an unroutable request is a 503 whatever the
/// shape of the rest of the body.
fn route_and_decode<T: DeserializeOwned>(
    state: &AppState,
    body: &[u8],
) -> Result<(String, T), Response> {
    let wa = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("wa").and_then(Value::as_str).map(str::to_string));
    let session = resolve_session(state, wa.as_deref())?;

    let req = serde_json::from_slice(body).map_err(|e| {
        response::bad_request(format!("Invalid request body: {}", e)).into_response()
    })?;
    Ok((session, req))
}

/// Pick the session for `wa`; it must exist and be ready.
fn resolve_session(state: &AppState, wa: Option<&str>) -> Result<String, Response> {
    let intent = RouteIntent::parse(wa.unwrap_or_default());
    match routing::select(&state.sessions, &intent) {
        Some(name) if state.sessions.is_ready(&name) => Ok(name),
        _ => Err(response::service_unavailable("No messaging session available").into_response()),
    }
}

fn enqueue(state: &AppState, session: String, target: String, payload: JobPayload) -> Response {
    let kind = payload.kind();
    match state.queue.enqueue(&session, &target, payload) {
        Ok(job_id) => {
            info!(job_id = %job_id, wa = %session, to = %target, kind = %kind, "Job queued");
            let body = QueuedResponse {
                status: true,
                queued: true,
                job_id,
                wa: session,
                to: target,
            };
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
        Err(e) => {
            error!(wa = %session, to = %target, error = %e, "Failed to queue job");
            response::service_unavailable("Dispatch queue unavailable").into_response()
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Digits of `number` as a user JID, or `None` if it has no digits.
fn user_jid(number: &str) -> Option<String> {
    let digits: String = number.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        Some(format!("{}@{}", digits, USER_SERVER))
    }
}

/// Like [`user_jid`], but a value that is already a JID is kept as is.
fn file_target(number: &str) -> Option<String> {
    let number = number.trim();
    if number.contains('@') {
        Some(number.to_string())
    } else {
        user_jid(number)
    }
}

fn is_http_url(raw: &str) -> bool {
    url::Url::parse(raw).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}
