use std::io::Cursor;

use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use serde::Serialize;
use tracing::error;

use crate::response;
use crate::server::AppState;

/// Smallest edge of the rendered QR image, in pixels.
const QR_MIN_SIZE: u32 = 256;

#[derive(Debug, Serialize)]
pub struct QrResponse {
    status: bool,
    wa: String,
    ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
    /// Login challenge as a `data:image/png;base64,...` URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    qr: Option<String>,
}

/// GET /qr/{name}
pub async fn qr(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(status) = state.sessions.status(&name) else {
        return response::not_found(format!("Unknown session '{}'", name)).into_response();
    };

    let body = if status.state.is_ready() {
        QrResponse {
            status: true,
            wa: name,
            ready: true,
            message: Some("Session is logged in"),
            qr: None,
        }
    } else if let Some(challenge) = status.challenge {
        let image = match qr_data_url(&challenge) {
            Ok(url) => url,
            Err(e) => {
                error!(wa = %name, error = %e, "Failed to render login QR");
                return response::internal_error("Failed to render QR code").into_response();
            }
        };
        QrResponse {
            status: true,
            wa: name,
            ready: false,
            message: None,
            qr: Some(image),
        }
    } else {
        QrResponse {
            status: false,
            wa: name,
            ready: false,
            message: Some("QR code not available yet"),
            qr: None,
        }
    };

    Json(body).into_response()
}

/// Render `payload` as a PNG QR code wrapped in a data URL.
fn qr_data_url(payload: &str) -> anyhow::Result<String> {
    let code = QrCode::new(payload.as_bytes())?;
    let pixels = code
        .render::<Luma<u8>>()
        .min_dimensions(QR_MIN_SIZE, QR_MIN_SIZE)
        .build();

    let mut png = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(pixels).write_to(&mut png, ImageFormat::Png)?;
    Ok(format!(
        "data:image/png;base64,{}",
        STANDARD.encode(png.into_inner())
    ))
}
