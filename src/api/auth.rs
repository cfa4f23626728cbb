//! Admin authentication middleware.
//!
//! Admin routes accept either an `X-Admin-Token` header or HTTP basic auth.
//! The token, when configured, takes precedence over basic credentials. All
//! comparisons are constant-time, and 401 responses carry a
//! `WWW-Authenticate` challenge.

use axum::{
    Json,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;

use crate::config::AdminConfig;

/// Admin token header name
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Middleware guarding the admin route group
pub async fn require_admin(
    State(admin): State<AdminConfig>,
    request: Request,
    next: Next,
) -> Response {
    if !admin.any_configured() {
        return unauthorized_response("Admin access is not configured");
    }

    // Token header takes precedence over basic auth
    if let Some(expected) = &admin.token {
        if let Some(provided) = request
            .headers()
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
                return next.run(request).await;
            }
            return unauthorized_response("Invalid admin token");
        }
    }

    if let (Some(username), Some(password)) = (&admin.username, &admin.password) {
        if let Some((provided_user, provided_pass)) = basic_credentials(&request) {
            // Compare both parts unconditionally to keep timing uniform
            let user_ok = constant_time_eq(provided_user.as_bytes(), username.as_bytes());
            let pass_ok = constant_time_eq(provided_pass.as_bytes(), password.as_bytes());
            if user_ok && pass_ok {
                return next.run(request).await;
            }
            return unauthorized_response("Invalid credentials");
        }
    }

    unauthorized_response("Missing credentials")
}

/// Extract username/password from an `Authorization: Basic` header
fn basic_credentials(request: &Request) -> Option<(String, String)> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
/// Always compares all bytes regardless of where the first mismatch occurs.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// 401 with a JSON body and a WWW-Authenticate challenge
fn unauthorized_response(message: &str) -> Response {
    let body = Json(json!({
        "error": {
            "code": "unauthorized",
            "message": message
        }
    }));

    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"vod-mirror admin\"")],
        body,
    )
        .into_response()
}
