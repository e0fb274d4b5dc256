//! Health check endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use super::ApiState;
use crate::orchestrator::RunState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Detailed readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub state: RunState,
    pub checks: ReadinessChecks,
}

/// Individual readiness checks
#[derive(Serialize)]
pub struct ReadinessChecks {
    pub database: CheckResult,
    pub driver: CheckResult,
    pub upstream: CheckResult,
}

/// Result of a single health check
#[derive(Serialize)]
pub struct CheckResult {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    const fn ok() -> Self {
        Self {
            status: "ok",
            message: None,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            status: "fail",
            message: Some(message.into()),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: "unavailable",
            message: Some(message.into()),
        }
    }
}

/// Liveness probe - is the process up?
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe - can the gateway answer chats?
async fn ready(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let status = state.orchestrator.status();

    let database = match state.orchestrator.store().ping() {
        Ok(()) => CheckResult::ok(),
        Err(e) => CheckResult::fail(e.to_string()),
    };
    let driver = if status.driver_connected {
        CheckResult::ok()
    } else {
        CheckResult::fail(format!("{} disconnected", status.driver))
    };
    let upstream = match &status.active_preset {
        Some(_) => CheckResult::ok(),
        None => CheckResult::unavailable("no preset selected"),
    };

    let all_ok = database.status == "ok"
        && driver.status == "ok"
        && upstream.status == "ok"
        && matches!(status.state, RunState::Running | RunState::Paused);

    let http_status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(ReadinessResponse {
            status: if all_ok { "ok" } else { "degraded" },
            state: status.state,
            checks: ReadinessChecks {
                database,
                driver,
                upstream,
            },
        }),
    )
}

/// Health routes (unauthenticated)
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}
