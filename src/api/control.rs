//! Control endpoints: lifecycle, turns, config, and the loopback driver

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, patch, post},
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use super::{ApiState, auth::require_api_key};
use crate::Error;
use crate::config::{BotConfig, ConfigSnapshot, ConfigUpdate, PresetConfig, mask_secret};
use crate::driver::{InboundEvent, SentMessage};
use crate::orchestrator::{StatusReport, TurnRecord};
use crate::registry::ConversationSummary;
use crate::upstream::PresetStatus;

/// Turns returned when `limit` is not given
const DEFAULT_TURN_LIMIT: usize = 20;

// --- Request/Response types ---

#[derive(Debug, Default, Deserialize)]
pub struct PauseRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TurnsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub conversation_id: String,
    pub content: String,
}

#[derive(Serialize)]
pub struct SendResponse {
    pub conversation_id: String,
    pub sent: bool,
}

/// Operator flags for one conversation; omitted fields stay unchanged
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFlagsRequest {
    #[serde(default)]
    pub muted: Option<bool>,
    #[serde(default)]
    pub whitelisted: Option<bool>,
}

#[derive(Serialize)]
pub struct InjectResponse {
    pub queued: bool,
}

/// Config as shown to editors, with credentials masked
#[derive(Serialize)]
pub struct ConfigView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub server: ServerView,
    pub active_preset: Option<String>,
    pub presets: Vec<PresetView>,
    pub bot: BotConfig,
}

#[derive(Serialize)]
pub struct ServerView {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub api_key: Option<String>,
}

#[derive(Serialize)]
pub struct PresetView {
    pub name: String,
    pub alias: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_sec: f64,
    pub max_retries: u32,
    pub temperature: f32,
    pub max_tokens: u32,
    pub allow_empty_key: bool,
    pub priority: i32,
}

impl From<&PresetConfig> for PresetView {
    fn from(p: &PresetConfig) -> Self {
        Self {
            name: p.name.clone(),
            alias: p.alias.clone(),
            base_url: p.base_url.clone(),
            api_key: p.api_key.as_ref().map(|k| mask_secret(k.expose_secret())),
            model: p.model.clone(),
            timeout_sec: p.timeout_sec,
            max_retries: p.max_retries,
            temperature: p.temperature,
            max_tokens: p.max_tokens,
            allow_empty_key: p.allow_empty_key,
            priority: p.priority,
        }
    }
}

impl ConfigView {
    #[must_use]
    pub fn new(snapshot: &ConfigSnapshot, path: Option<&std::path::Path>) -> Self {
        Self {
            path: path.map(|p| p.display().to_string()),
            server: ServerView {
                host: snapshot.server.host.to_string(),
                port: snapshot.server.port,
                db_path: snapshot.server.db_path.display().to_string(),
                api_key: snapshot.server.api_key.as_deref().map(mask_secret),
            },
            active_preset: snapshot.active_preset.clone(),
            presets: snapshot.presets.iter().map(PresetView::from).collect(),
            bot: snapshot.bot.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

impl ErrorResponse {
    #[must_use]
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            error: ErrorDetail {
                code: code.to_string(),
                message: message.to_string(),
            },
        }
    }
}

fn error_response(code: &str, message: &str) -> Json<ErrorResponse> {
    Json(ErrorResponse::new(code, message))
}

/// Map a gateway error onto a status code and error code
fn api_error(e: &Error) -> ApiError {
    let (status, code) = match e {
        Error::InvalidTransition(_) => (StatusCode::CONFLICT, "invalid_transition"),
        Error::Credential(_) => (StatusCode::BAD_REQUEST, "invalid_credential"),
        Error::Config(_) | Error::Toml(_) => (StatusCode::BAD_REQUEST, "invalid_config"),
        Error::Dispatch(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        Error::NoUsablePreset(_) => (StatusCode::SERVICE_UNAVAILABLE, "no_usable_preset"),
        Error::Driver(_) | Error::Reconnect(_) => (StatusCode::BAD_GATEWAY, "driver_error"),
        Error::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    if status.is_server_error() {
        tracing::error!(error = %e, code, "control request failed");
    } else {
        tracing::debug!(error = %e, code, "control request rejected");
    }
    (status, error_response(code, &e.to_string()))
}

fn no_loopback() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        error_response("no_loopback", "the active driver does not accept injected events"),
    )
}

// --- Handlers ---

/// Orchestrator status
async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusReport> {
    Json(state.orchestrator.status())
}

/// Start polling
async fn start(State(state): State<Arc<ApiState>>) -> Result<Json<StatusReport>, ApiError> {
    state.orchestrator.start().await.map_err(|e| api_error(&e))?;
    Ok(Json(state.orchestrator.status()))
}

/// Stop polling and drain in-flight turns
async fn stop(State(state): State<Arc<ApiState>>) -> Result<Json<StatusReport>, ApiError> {
    state.orchestrator.stop().await.map_err(|e| api_error(&e))?;
    Ok(Json(state.orchestrator.status()))
}

/// Suspend replies
async fn pause(
    State(state): State<Arc<ApiState>>,
    body: Option<Json<PauseRequest>>,
) -> Result<Json<StatusReport>, ApiError> {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .filter(|r| !r.trim().is_empty());
    state.orchestrator.pause(reason).map_err(|e| api_error(&e))?;
    Ok(Json(state.orchestrator.status()))
}

/// Resume replies
async fn resume(State(state): State<Arc<ApiState>>) -> Result<Json<StatusReport>, ApiError> {
    state.orchestrator.resume().map_err(|e| api_error(&e))?;
    Ok(Json(state.orchestrator.status()))
}

/// Recent turns, newest first
async fn turns(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TurnsQuery>,
) -> Json<Vec<TurnRecord>> {
    let limit = query.limit.unwrap_or(DEFAULT_TURN_LIMIT);
    Json(state.orchestrator.recent_turns(limit))
}

/// Tracked conversations
async fn conversations(State(state): State<Arc<ApiState>>) -> Json<Vec<ConversationSummary>> {
    Json(state.orchestrator.conversations())
}

/// Mute or whitelist a tracked conversation
async fn update_conversation(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<ConversationFlagsRequest>,
) -> Result<Json<ConversationSummary>, ApiError> {
    let summary = state
        .orchestrator
        .set_conversation_flags(&id, req.muted, req.whitelisted)
        .map_err(|e| api_error(&e))?;
    Ok(Json(summary))
}

/// Current config with credentials masked
async fn get_config(State(state): State<Arc<ApiState>>) -> Json<ConfigView> {
    let store = state.orchestrator.config();
    Json(ConfigView::new(&store.current(), store.path()))
}

/// Apply an edit and persist it
async fn put_config(
    State(state): State<Arc<ApiState>>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<ConfigView>, ApiError> {
    let store = state.orchestrator.config();
    let snapshot = store.apply_update(update).map_err(|e| api_error(&e))?;
    Ok(Json(ConfigView::new(&snapshot, store.path())))
}

/// Re-run preset selection
async fn probe(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<PresetStatus>>, ApiError> {
    let statuses = state.orchestrator.reprobe().await.map_err(|e| api_error(&e))?;
    Ok(Json(statuses))
}

/// Send an operator message
async fn send(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    state
        .orchestrator
        .send_manual(&req.conversation_id, &req.content)
        .await
        .map_err(|e| api_error(&e))?;
    Ok(Json(SendResponse {
        conversation_id: req.conversation_id,
        sent: true,
    }))
}

/// Queue an inbound event on the loopback driver
async fn inject(
    State(state): State<Arc<ApiState>>,
    Json(event): Json<InboundEvent>,
) -> Result<(StatusCode, Json<InjectResponse>), ApiError> {
    let driver = state.loopback.as_ref().ok_or_else(no_loopback)?;
    if event.conversation_id.trim().is_empty() || event.sender_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            error_response("invalid_request", "conversation_id and sender_id are required"),
        ));
    }
    driver.inject(event);
    Ok((StatusCode::ACCEPTED, Json(InjectResponse { queued: true })))
}

/// Messages sent through the loopback driver
async fn outbox(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<SentMessage>>, ApiError> {
    let driver = state.loopback.as_ref().ok_or_else(no_loopback)?;
    Ok(Json(driver.outbox()))
}

/// Build the control router with auth middleware
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/turns", get(turns))
        .route("/conversations", get(conversations))
        .route("/conversations/{id}", patch(update_conversation))
        .route("/config", get(get_config).put(put_config))
        .route("/presets/probe", post(probe))
        .route("/send", post(send))
        .route("/driver/events", post(inject))
        .route("/driver/outbox", get(outbox))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}
