//! Wagate - a multi-session messaging gateway with a rate-limited outbound queue.

pub mod attachment;
pub mod auth;
pub mod backend;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod handlers;
pub mod relay;
pub mod request_throttle;
pub mod response;
pub mod routing;
pub mod server;
pub mod session;
