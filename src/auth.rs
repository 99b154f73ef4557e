//! Caller authorization middleware.
//!
//! ACL rules are treated as an external collaborator; this module is the
//! minimal concrete implementation that lets the crate run standalone —
//! a single shared bearer token checked in constant time.

use crate::config::ApiConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub config: ApiConfig,
}

pub fn create_auth_state(config: ApiConfig) -> Arc<AuthState> {
    Arc::new(AuthState { config })
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"}))).into_response()
}

/// Validates a bearer/`x-api-key` header before a request reaches the
/// router. CORS preflight (`OPTIONS`) bypasses auth, matching browser
/// expectations.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let path = request.uri().path().to_string();
    let provided_key = extract_key(&headers).ok_or_else(|| {
        warn!("missing or malformed API key for path: {}", path);
        unauthorized()
    })?;

    let Some(expected_key) = &auth_state.config.api_key else {
        warn!("auth middleware active but no API key configured");
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Internal Server Error"})),
        )
            .into_response());
    };

    if provided_key.as_bytes().ct_eq(expected_key.as_bytes()).into() {
        Ok(next.run(request).await)
    } else {
        warn!("authentication failed for path: {}", path);
        Err(unauthorized())
    }
}

fn extract_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key") {
        return value.to_str().ok().map(str::to_string);
    }
    if let Some(value) = headers.get("authorization") {
        let value = value.to_str().ok()?;
        return value.strip_prefix("Bearer ").map(str::to_string);
    }
    None
}
