//! Per-caller rate limiting for the submission and polling endpoints.
//!
//! Bots poll far more often than callers submit work, so the two surfaces
//! get separate quotas keyed by client IP rather than one global limiter,
//! which would otherwise let one noisy caller starve every other caller
//! sharing the same bucket.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use std::{net::IpAddr, net::SocketAddr, num::NonZeroU32, sync::Arc};

pub const SUBMIT_REQUESTS_PER_MINUTE: u32 = 120;
pub const POLL_REQUESTS_PER_MINUTE: u32 = 600;

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

#[derive(Clone)]
pub struct RateLimitState {
    pub submit_limiter: Arc<KeyedLimiter>,
    pub poll_limiter: Arc<KeyedLimiter>,
}

impl RateLimitState {
    pub fn new() -> Self {
        let submit_quota = Quota::per_minute(NonZeroU32::new(SUBMIT_REQUESTS_PER_MINUTE).unwrap());
        let poll_quota = Quota::per_minute(NonZeroU32::new(POLL_REQUESTS_PER_MINUTE).unwrap());
        Self {
            submit_limiter: Arc::new(RateLimiter::keyed(submit_quota)),
            poll_limiter: Arc::new(RateLimiter::keyed(poll_quota)),
        }
    }
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies the submission quota to `POST /swarming/api/v1/tasks/new` and
/// the poll quota to everything else, keyed by client IP.
pub async fn rate_limit_middleware(
    State(state): State<Arc<RateLimitState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let ip = extract_client_ip(&request).unwrap_or(addr.ip());
    let is_submit = request.uri().path().ends_with("/tasks/new") && request.method() == "POST";

    let limiter = if is_submit {
        &state.submit_limiter
    } else {
        &state.poll_limiter
    };

    limiter
        .check_key(&ip)
        .map_err(|_| StatusCode::TOO_MANY_REQUESTS)?;

    Ok(next.run(request).await)
}

/// Prefers `x-forwarded-for`/`x-real-ip` for proxied deployments, falling
/// back to the socket's peer address.
fn extract_client_ip(request: &Request) -> Option<IpAddr> {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(s) = forwarded.to_str() {
            if let Some(first) = s.split(',').next() {
                if let Ok(ip) = first.trim().parse() {
                    return Some(ip);
                }
            }
        }
    }
    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(s) = real_ip.to_str() {
            if let Ok(ip) = s.parse() {
                return Some(ip);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_limiter_allows_initial_request() {
        let state = RateLimitState::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(state.submit_limiter.check_key(&ip).is_ok());
        assert!(state.poll_limiter.check_key(&ip).is_ok());
    }

    #[test]
    fn distinct_callers_get_independent_buckets() {
        let state = RateLimitState::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        for _ in 0..SUBMIT_REQUESTS_PER_MINUTE {
            state.submit_limiter.check_key(&a).unwrap();
        }
        assert!(state.submit_limiter.check_key(&a).is_err());
        assert!(state.submit_limiter.check_key(&b).is_ok());
    }
}
