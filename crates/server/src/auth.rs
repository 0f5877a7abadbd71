use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use crate::error::ApiError;

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone, Default)]
pub struct SharedSecret(pub Option<Arc<SecretString>>);

/// Accepts `Authorization: Bearer <secret>` or `X-Api-Key: <secret>`.
/// With no secret configured every request passes.
pub async fn require_shared_secret(
    State(secret): State<SharedSecret>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = secret.0 else {
        return next.run(request).await;
    };

    let headers = request.headers();
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .or_else(|| headers.get(API_KEY_HEADER).and_then(|value| value.to_str().ok()));

    let authorized = presented.is_some_and(|token| {
        constant_time_eq(token.trim().as_bytes(), expected.expose_secret().as_bytes())
    });
    if authorized {
        return next.run(request).await;
    }

    warn!(
        event_name = "server.auth.rejected",
        path = %request.uri().path(),
        "request rejected: missing or invalid shared secret"
    );
    ApiError::unauthorized("missing or invalid credentials").into_response()
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter().zip(right).fold(0_u8, |diff, (a, b)| diff | (a ^ b)) == 0
}

#[cfg(test)]
mod tests {
    use super::constant_time_eq;

    #[test]
    fn comparison_requires_identical_bytes() {
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3creT"));
        assert!(!constant_time_eq(b"s3cret", b"s3cret!"));
    }
}
