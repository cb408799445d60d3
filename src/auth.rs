//! Pre-shared API key gating for the admin REST surface.
//!
//! The terminal WebSocket itself is admitted upstream (the platform
//! authorises the principal against the assessment before routing here);
//! the admin endpoints for listing and destroying pods are operator
//! tooling and require `Authorization: Bearer <key>`.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Extension carrying the expected key, injected at router construction so
/// the middleware never touches wider state.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Axum middleware rejecting requests without a valid Bearer key.
///
/// `401` for a missing or malformed header, `403` for a wrong key.
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(expected) = request.extensions().get::<ApiKey>().map(|k| k.0.clone()) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error"})),
        )
            .into_response();
    };

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(provided) = provided else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header"})),
        )
            .into_response();
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid API key"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison. Iterates the full expected length
/// regardless of the provided length so response timing leaks neither
/// content nor length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, &byte) in expected.iter().enumerate() {
        let other = provided.get(i).copied().unwrap_or(0xff);
        diff |= byte ^ other;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_match() {
        assert!(constant_time_eq(b"secret", b"secret"));
    }

    #[test]
    fn unequal_keys_do_not_match() {
        assert!(!constant_time_eq(b"secret", b"secres"));
        assert!(!constant_time_eq(b"secret", b"secret1"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(!constant_time_eq(b"", b"secret"));
    }
}
