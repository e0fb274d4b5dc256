//! Upstream language-model client
//!
//! Selects the active preset by probing candidates, bounds in-flight calls
//! with a global semaphore, and retries transient failures with backoff.
//! Buffered and streamed replies come back as the same ordered delta
//! stream, a buffered reply being a stream of one.

mod http;
pub mod preset;
pub mod retry;
pub mod sse;

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;

pub use http::HttpBackend;
pub use preset::{PresetHealth, PresetStatus};
pub use retry::RetryPolicy;

use crate::config::{ConfigSnapshot, PresetConfig};
use crate::context::ChatMessage;

/// How an upstream failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retry with backoff
    Transient,
    /// Give up on this turn
    FatalForTurn,
}

/// Failure talking to the language-model endpoint
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// Non-success HTTP status
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },

    /// Request or stream read timed out
    #[error("timed out")]
    Timeout,

    /// Connection failed or was reset
    #[error("connection error: {0}")]
    Connect(String),

    /// Stream broke off or reported an in-band error
    #[error("stream error: {0}")]
    Stream(String),

    /// Endpoint answered with no text
    #[error("empty reply")]
    EmptyReply,

    /// Endpoint refused the content
    #[error("content policy rejection: {0}")]
    ContentPolicy(String),

    /// Response body could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Preset cannot be used as configured
    #[error("preset not usable: {0}")]
    Unconfigured(String),

    /// No preset is active
    #[error("no active preset")]
    NoActivePreset,
}

impl UpstreamError {
    /// Classify for retry
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Status { status, body } => {
                if retry::is_transient_status(*status) && !retry::is_content_policy(body) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::FatalForTurn
                }
            }
            Self::Timeout | Self::Connect(_) | Self::Stream(_) | Self::EmptyReply => {
                ErrorClass::Transient
            }
            Self::ContentPolicy(_) | Self::Decode(_) | Self::Unconfigured(_) | Self::NoActivePreset => {
                ErrorClass::FatalForTurn
            }
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// HTTP status, when the failure carried one
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            Self::Connect(e.to_string())
        }
    }
}

/// Chat-completion request body
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

impl ChatRequest {
    #[must_use]
    pub fn for_preset(preset: &PresetConfig, messages: &[ChatMessage], stream: bool) -> Self {
        Self {
            model: preset.model.clone(),
            messages: messages.to_vec(),
            temperature: preset.temperature,
            max_tokens: preset.max_tokens,
            stream,
        }
    }
}

/// Ordered text deltas
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, UpstreamError>> + Send>>;

/// Transport to one OpenAI-compatible endpoint
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Single buffered completion; may return empty text
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    async fn complete(&self, preset: &PresetConfig, request: &ChatRequest) -> Result<String, UpstreamError>;

    /// Streamed completion
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started
    async fn stream(&self, preset: &PresetConfig, request: &ChatRequest) -> Result<DeltaStream, UpstreamError>;
}

/// A buffered reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// Preset that produced it
    pub preset: String,
}

/// A reply as ordered deltas
pub struct ReplyStream {
    /// Preset that produced it
    pub preset: String,
    deltas: DeltaStream,
}

impl ReplyStream {
    fn single(reply: Reply) -> Self {
        Self {
            preset: reply.preset,
            deltas: Box::pin(futures::stream::iter([Ok(reply.text)])),
        }
    }

    /// Next delta
    pub async fn next(&mut self) -> Option<Result<String, UpstreamError>> {
        self.deltas.next().await
    }

    /// Concatenate every delta
    ///
    /// # Errors
    ///
    /// Returns the first error the stream yields
    pub async fn collect_text(mut self) -> Result<String, UpstreamError> {
        let mut text = String::new();
        while let Some(delta) = self.next().await {
            text.push_str(&delta?);
        }
        Ok(text)
    }
}

impl std::fmt::Debug for ReplyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyStream")
            .field("preset", &self.preset)
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client shared by every conversation
pub struct UpstreamClient {
    backend: Arc<dyn ChatBackend>,
    active: RwLock<Option<Arc<PresetConfig>>>,
    statuses: Mutex<Vec<PresetStatus>>,
    limiter: RwLock<Arc<Semaphore>>,
    max_concurrency: AtomicUsize,
}

impl UpstreamClient {
    #[must_use]
    pub fn new(backend: Arc<dyn ChatBackend>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            backend,
            active: RwLock::new(None),
            statuses: Mutex::new(Vec::new()),
            limiter: RwLock::new(Arc::new(Semaphore::new(max_concurrency))),
            max_concurrency: AtomicUsize::new(max_concurrency),
        }
    }

    /// Client over the HTTP backend
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn http(max_concurrency: usize) -> crate::Result<Self> {
        Ok(Self::new(Arc::new(HttpBackend::new()?), max_concurrency))
    }

    /// Change the in-flight limit
    ///
    /// Calls already holding a permit finish under the old limit.
    pub fn set_max_concurrency(&self, n: usize) {
        let n = n.max(1);
        if self.max_concurrency.swap(n, Ordering::SeqCst) != n {
            *self
                .limiter
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Arc::new(Semaphore::new(n));
            tracing::info!(max_concurrency = n, "upstream concurrency limit changed");
        }
    }

    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.load(Ordering::SeqCst)
    }

    /// Permits currently free
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.limiter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .available_permits()
    }

    /// The preset consulted by new calls
    #[must_use]
    pub fn active(&self) -> Option<Arc<PresetConfig>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the active preset without probing
    pub fn set_active(&self, preset: Option<PresetConfig>) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = preset.map(Arc::new);
    }

    /// Latest probe results, in probe order
    #[must_use]
    pub fn statuses(&self) -> Vec<PresetStatus> {
        lock(&self.statuses).clone()
    }

    /// Probe candidates in order and activate the first that answers
    ///
    /// Presets that cannot work as configured are skipped without a request.
    /// On failure no preset is active.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NoUsablePreset`] if no candidate answers
    pub async fn probe(&self, snapshot: &ConfigSnapshot) -> crate::Result<Arc<PresetConfig>> {
        let mut statuses = Vec::with_capacity(snapshot.presets.len());
        let mut selected: Option<Arc<PresetConfig>> = None;

        for candidate in preset::candidate_order(snapshot) {
            if selected.is_some() {
                statuses.push(PresetStatus::new(candidate, PresetHealth::Unprobed, None));
                continue;
            }

            if let Some(reason) = preset::unusable_reason(candidate) {
                tracing::info!(preset = %candidate.name, reason, "skipping preset");
                statuses.push(PresetStatus::new(
                    candidate,
                    PresetHealth::Failed,
                    Some(reason.to_string()),
                ));
                continue;
            }

            let request = preset::probe_request(candidate);
            match self.backend.complete(candidate, &request).await {
                Ok(_) => {
                    tracing::info!(preset = %candidate.name, model = %candidate.model, "preset probe succeeded");
                    let mut status = PresetStatus::new(candidate, PresetHealth::Probed, None);
                    status.active = true;
                    statuses.push(status);
                    selected = Some(Arc::new(candidate.clone()));
                }
                Err(e) => {
                    tracing::warn!(preset = %candidate.name, error = %e, "preset probe failed");
                    statuses.push(PresetStatus::new(
                        candidate,
                        PresetHealth::Failed,
                        Some(e.to_string()),
                    ));
                }
            }
        }

        *lock(&self.statuses) = statuses;
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = selected.clone();

        selected.ok_or_else(|| {
            crate::Error::NoUsablePreset(format!(
                "{} preset(s) configured, none answered",
                snapshot.presets.len()
            ))
        })
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, UpstreamError> {
        let limiter = self
            .limiter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        limiter
            .acquire_owned()
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))
    }

    fn active_or_err(&self) -> Result<Arc<PresetConfig>, UpstreamError> {
        self.active().ok_or(UpstreamError::NoActivePreset)
    }

    /// Whether to retry after `err` on `attempt` (zero-based); sleeps if so
    async fn backoff(preset: &PresetConfig, policy: &RetryPolicy, attempt: u32, err: &UpstreamError) -> bool {
        if !err.is_transient() || attempt >= policy.max_retries {
            return false;
        }
        let delay = retry::delay_for_attempt(policy, attempt);
        tracing::warn!(
            preset = %preset.name,
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "upstream call failed, retrying"
        );
        tokio::time::sleep(delay).await;
        true
    }

    /// Buffered completion against the active preset
    ///
    /// Blocks while the concurrency limit is reached.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or the first
    /// fatal-for-turn error
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<Reply, UpstreamError> {
        let preset = self.active_or_err()?;
        let _permit = self.acquire().await?;

        let request = ChatRequest::for_preset(&preset, messages, false);
        let policy = RetryPolicy::for_preset(&preset);

        let mut attempt = 0;
        loop {
            let result = match self.backend.complete(&preset, &request).await {
                Ok(text) if text.trim().is_empty() => Err(UpstreamError::EmptyReply),
                other => other,
            };
            match result {
                Ok(text) => {
                    return Ok(Reply {
                        text,
                        preset: preset.name.clone(),
                    });
                }
                Err(e) => {
                    if !Self::backoff(&preset, &policy, attempt, &e).await {
                        return Err(e);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Streamed completion against the active preset
    ///
    /// Retries until the first delta arrives; after that, errors end the
    /// stream. The concurrency permit is held until the stream ends or is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns the last error if no delta could be obtained
    pub async fn stream(&self, messages: &[ChatMessage]) -> Result<ReplyStream, UpstreamError> {
        let preset = self.active_or_err()?;
        let permit = self.acquire().await?;

        let request = ChatRequest::for_preset(&preset, messages, true);
        let policy = RetryPolicy::for_preset(&preset);

        let mut attempt = 0;
        loop {
            let err = match self.backend.stream(&preset, &request).await {
                Ok(mut deltas) => match deltas.next().await {
                    Some(Ok(first)) => {
                        return Ok(ReplyStream {
                            preset: preset.name.clone(),
                            deltas: forward(first, deltas, permit),
                        });
                    }
                    Some(Err(e)) => e,
                    None => UpstreamError::EmptyReply,
                },
                Err(e) => e,
            };
            if !Self::backoff(&preset, &policy, attempt, &err).await {
                return Err(err);
            }
            attempt += 1;
        }
    }

    /// Reply as deltas, streamed or buffered
    ///
    /// # Errors
    ///
    /// See [`Self::complete`] and [`Self::stream`]
    pub async fn deltas(&self, messages: &[ChatMessage], stream: bool) -> Result<ReplyStream, UpstreamError> {
        if stream {
            self.stream(messages).await
        } else {
            self.complete(messages).await.map(ReplyStream::single)
        }
    }
}

/// Move the rest of a stream onto a task that owns the permit
fn forward(first: String, mut rest: DeltaStream, permit: OwnedSemaphorePermit) -> DeltaStream {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let _permit = permit;
        if tx.send(Ok(first)).await.is_err() {
            return;
        }
        while let Some(item) = rest.next().await {
            let stop = item.is_err();
            if tx.send(item).await.is_err() || stop {
                break;
            }
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("active", &self.active().map(|p| p.name.clone()))
            .field("max_concurrency", &self.max_concurrency())
            .finish_non_exhaustive()
    }
}
