//! Shared-secret authentication and CORS for the control API.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};

pub const API_KEY_HEADER: &str = "x-api-key";

/// The boot-time shared secret every API request must present.
#[derive(Clone)]
pub struct ApiKey(Arc<String>);

impl ApiKey {
    pub fn new(key: String) -> Self {
        Self(Arc::new(key))
    }
}

/// Compare two strings in constant time to prevent timing side-channels.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Middleware rejecting requests without the right `X-API-Key` header.
/// Preflight OPTIONS requests are answered by the CORS layer before they
/// reach this check.
pub async fn require_api_key(
    State(ApiKey(expected)): State<ApiKey>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(key) if constant_time_eq(key, &expected) => next.run(request).await,
        _ => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
    }
}

/// CORS policy: any origin, the API's methods, JSON bodies plus the key
/// header. Applied to every response, including errors.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(API_KEY_HEADER)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_keys() {
        assert!(constant_time_eq("secret-key-abc", "secret-key-abc"));
    }

    #[test]
    fn constant_time_eq_rejects_differences() {
        assert!(!constant_time_eq("secret-key-abc", "secret-key-xyz"));
        assert!(!constant_time_eq("short", "much-longer-key"));
        assert!(!constant_time_eq("", "nonempty"));
    }
}
