//! Per-client fixed-window request throttle.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::response;
use crate::server::AppState;

/// Tracked clients above which expired windows are swept.
const SWEEP_AT_CLIENTS: usize = 1024;

#[derive(Clone)]
pub struct RequestThrottle {
    max_requests: usize,
    window: Duration,
    clients: Arc<DashMap<IpAddr, Window>>,
}

/// One client's current window.
#[derive(Debug, Clone, Copy)]
struct Window {
    opened_at: Instant,
    used: usize,
}

impl Window {
    fn open(now: Instant) -> Self {
        Self {
            opened_at: now,
            used: 0,
        }
    }

    fn is_expired(&self, now: Instant, length: Duration) -> bool {
        now.saturating_duration_since(self.opened_at) >= length
    }

    /// Count one request, rolling over to a fresh window once this one ends.
    fn admit(&mut self, now: Instant, max_requests: usize, length: Duration) -> ThrottleDecision {
        if self.is_expired(now, length) {
            *self = Self::open(now);
        }
        if self.used < max_requests {
            self.used += 1;
            return ThrottleDecision::Allowed;
        }
        ThrottleDecision::Denied {
            retry_after: length.saturating_sub(now.saturating_duration_since(self.opened_at)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThrottleDecision {
    Allowed,
    Denied { retry_after: Duration },
}

impl RequestThrottle {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: Duration::from_secs(config.window_seconds),
            clients: Arc::new(DashMap::new()),
        }
    }

    fn check(&self, ip: IpAddr) -> ThrottleDecision {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> ThrottleDecision {
        if self.clients.len() >= SWEEP_AT_CLIENTS {
            self.sweep(now);
        }
        self.clients
            .entry(ip)
            .or_insert_with(|| Window::open(now))
            .admit(now, self.max_requests, self.window)
    }

    /// Forget clients whose window has ended; they start fresh anyway.
    fn sweep(&self, now: Instant) {
        self.clients
            .retain(|_, window| !window.is_expired(now, self.window));
    }
}

pub async fn throttle_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    match state.throttle.check(client_ip) {
        ThrottleDecision::Allowed => next.run(request).await,
        ThrottleDecision::Denied { retry_after } => {
            warn!(client_ip = %client_ip, path = %request.uri().path(), "Request throttled");
            rate_limited_response(retry_after)
        }
    }
}

fn rate_limited_response(retry_after: Duration) -> Response {
    let retry_after_secs = retry_after.as_secs().max(1);
    let mut response = response::too_many_requests(format!(
        "Too many requests, retry after {}s",
        retry_after_secs
    ))
    .into_response();

    if let Ok(value) = retry_after_secs.to_string().parse() {
        response.headers_mut().insert(RETRY_AFTER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(max_requests: usize) -> RequestThrottle {
        RequestThrottle::new(&RateLimitConfig {
            max_requests,
            window_seconds: 60,
        })
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn allows_up_to_limit_then_denies() {
        let throttle = throttle(3);
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(throttle.check_at(ip(1), now), ThrottleDecision::Allowed);
        }
        assert!(matches!(
            throttle.check_at(ip(1), now + Duration::from_secs(10)),
            ThrottleDecision::Denied { retry_after } if retry_after == Duration::from_secs(50)
        ));
    }

    #[test]
    fn window_resets_after_expiry() {
        let throttle = throttle(1);
        let now = Instant::now();
        assert_eq!(throttle.check_at(ip(1), now), ThrottleDecision::Allowed);
        assert!(matches!(
            throttle.check_at(ip(1), now),
            ThrottleDecision::Denied { .. }
        ));
        assert_eq!(
            throttle.check_at(ip(1), now + Duration::from_secs(60)),
            ThrottleDecision::Allowed
        );
    }

    #[test]
    fn clients_are_counted_separately() {
        let throttle = throttle(1);
        let now = Instant::now();
        assert_eq!(throttle.check_at(ip(1), now), ThrottleDecision::Allowed);
        assert_eq!(throttle.check_at(ip(2), now), ThrottleDecision::Allowed);
    }

    #[test]
    fn zero_limit_denies_everything() {
        let throttle = throttle(0);
        assert!(matches!(
            throttle.check_at(ip(1), Instant::now()),
            ThrottleDecision::Denied { .. }
        ));
    }

    #[test]
    fn expired_clients_are_swept_once_the_map_grows() {
        let throttle = throttle(5);
        let now = Instant::now();
        for i in 0..SWEEP_AT_CLIENTS {
            let ip = IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i as u32));
            throttle.check_at(ip, now);
        }
        assert_eq!(throttle.clients.len(), SWEEP_AT_CLIENTS);

        let later = now + Duration::from_secs(61);
        assert_eq!(throttle.check_at(ip(250), later), ThrottleDecision::Allowed);
        assert_eq!(throttle.clients.len(), 1);
    }

    #[test]
    fn denied_response_carries_retry_after() {
        let response = rate_limited_response(Duration::from_millis(200));
        assert_eq!(response.status(), axum::http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "1");
    }
}
