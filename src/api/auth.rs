//! Control API access policy
//!
//! With a configured key every `/api` request must carry it as a bearer
//! token. Without one, a loopback bind stays fully open, while any other
//! bind only serves read-only requests.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::{Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use super::ApiState;
use super::control::ErrorResponse;

/// Bearer token from the Authorization header
fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn key_matches(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

const fn is_read_only(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

fn denied(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(ErrorResponse::new(code, message))).into_response()
}

/// Gate `/api` routes on the bearer key and the bind address
pub async fn require_api_key(State(state): State<Arc<ApiState>>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();

    let Some(expected) = &state.api_key else {
        if state.host.is_loopback() || is_read_only(req.method()) {
            return next.run(req).await;
        }
        tracing::warn!(%path, method = %req.method(), host = %state.host, "write refused, no api key configured");
        return denied(
            StatusCode::FORBIDDEN,
            "api_key_required",
            "set server.api_key to change state through a non-loopback bind",
        );
    };

    match bearer_token(&req) {
        Some(token) if key_matches(expected, token) => next.run(req).await,
        Some(_) => {
            tracing::warn!(%path, "invalid api key provided");
            denied(StatusCode::UNAUTHORIZED, "unauthorized", "invalid api key")
        }
        None => {
            tracing::debug!(%path, "no api key provided");
            denied(StatusCode::UNAUTHORIZED, "unauthorized", "missing bearer token")
        }
    }
}
