//! Bearer token authentication for the control API.
//!
//! The control API shares the local server's static token. When no token is
//! configured the API is open, which matches a loopback-only deployment where
//! the local server itself runs without auth.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Expected control token, injected as a request extension. `None` disables
/// the check.
#[derive(Clone, Debug, Default)]
pub struct ControlToken(pub Option<String>);

/// Axum middleware that rejects requests without the configured
/// `Authorization: Bearer` token.
///
/// # Error responses
///
/// - `401 Unauthorized`: header missing or malformed
/// - `403 Forbidden`: token present but wrong
/// - `500 Internal Server Error`: [`ControlToken`] extension not found (misconfiguration)
pub async fn require_control_token(request: Request, next: Next) -> Response {
    let expected = match request.extensions().get::<ControlToken>() {
        Some(ControlToken(Some(token))) => token.clone(),
        Some(ControlToken(None)) => return next.run(request).await,
        None => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"detail": "server configuration error"})),
            )
                .into_response();
        }
    };

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(provided) = provided else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "missing or invalid Authorization header"})),
        )
            .into_response();
    };

    if !constant_time_eq(expected.as_bytes(), provided.trim().as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"detail": "invalid token"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison.
///
/// Iterates over the full length of `expected` whatever the length of
/// `provided`, so response timing does not reveal the token length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}
