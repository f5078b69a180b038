//! Admin credential check.
//!
//! Admin routes accept the shared token as `Authorization: Bearer <token>`
//! or in the `X-Admin-Token` header. Tokens are compared in constant time.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Constant-time string comparison.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Pull the presented credential out of the request headers.
fn presented_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    bearer.or_else(|| {
        headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    })
}

/// Middleware guarding the admin routes.
///
/// The router only mounts admin routes when a token is configured; a
/// missing token here still rejects rather than letting requests through.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(ApiError::not_found("admin endpoints are disabled"));
    };

    match presented_token(request.headers()) {
        Some(token) if constant_time_eq(token, expected) => Ok(next.run(request).await),
        Some(_) => {
            warn!(path = %request.uri().path(), "Rejected admin request with invalid token");
            Err(ApiError::unauthorized("invalid admin token"))
        }
        None => Err(ApiError::unauthorized("missing admin token")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("token-1", "token-1"));
        assert!(!constant_time_eq("token-1", "token-2"));
        assert!(!constant_time_eq("token", "token-1"));
        assert!(!constant_time_eq("", "token"));
    }

    #[test]
    fn test_presented_token_prefers_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_TOKEN_HEADER, HeaderValue::from_static("header-token"));
        assert_eq!(presented_token(&headers), Some("header-token"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer bearer-token"));
        assert_eq!(presented_token(&headers), Some("bearer-token"));
    }

    #[test]
    fn test_other_schemes_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(presented_token(&headers), None);
    }
}
