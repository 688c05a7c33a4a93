//! HTTP request handlers.

mod dashboard;
mod health;
mod qr;
mod send;

pub use dashboard::dashboard;
pub use health::{livez, readyz};
pub use qr::qr;
pub use send::{send_button, send_file, send_poll, send_text};
