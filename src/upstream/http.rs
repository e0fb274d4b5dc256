//! OpenAI-compatible HTTP backend

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::sse::{self, SseEvent, SseParser};
use super::{ChatBackend, ChatRequest, DeltaStream, UpstreamError, retry};
use crate::config::PresetConfig;

const MAX_ERROR_BODY: usize = 300;

/// `POST {base_url}/chat/completions` over reqwest
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    /// Create a backend with a shared connection pool
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new() -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("parley/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn post(&self, preset: &PresetConfig, request: &ChatRequest) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", preset.base_url.trim_end_matches('/'));
        let mut builder = self.client.post(url).json(request);
        if let Some(key) = &preset.api_key {
            let key = key.expose_secret();
            if !key.is_empty() {
                builder = builder.bearer_auth(key);
            }
        }
        builder
    }
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// Turn a non-success response into a classified error
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::debug!(status = status.as_u16(), body = %truncate(&body), "upstream error response");

    if retry::is_content_policy(&body) {
        return Err(UpstreamError::ContentPolicy(truncate(&body)));
    }
    Err(UpstreamError::Status {
        status: status.as_u16(),
        body: truncate(&body),
    })
}

/// Forward one SSE event; returns whether the stream continues
async fn forward_event(tx: &mpsc::Sender<Result<String, UpstreamError>>, event: SseEvent) -> bool {
    match event {
        SseEvent::Delta(text) => tx.send(Ok(text)).await.is_ok(),
        SseEvent::Done => false,
        SseEvent::ContentFilter => {
            let _ = tx
                .send(Err(UpstreamError::ContentPolicy("stopped by content filter".to_string())))
                .await;
            false
        }
        SseEvent::Error(message) => {
            let _ = tx.send(Err(UpstreamError::Stream(message))).await;
            false
        }
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn complete(&self, preset: &PresetConfig, request: &ChatRequest) -> Result<String, UpstreamError> {
        let response = self
            .post(preset, request)
            .timeout(preset.timeout())
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(&e))?;
        let response = check_status(response).await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::from_reqwest(&e))?;
        if let Some(err) = body.get("error") {
            return Err(UpstreamError::Stream(err.to_string()));
        }

        Ok(sse::completion_text(&body).unwrap_or_default().to_string())
    }

    async fn stream(&self, preset: &PresetConfig, request: &ChatRequest) -> Result<DeltaStream, UpstreamError> {
        let idle = preset.timeout();
        let response = tokio::time::timeout(idle, self.post(preset, request).send())
            .await
            .map_err(|_| UpstreamError::Timeout)?
            .map_err(|e| UpstreamError::from_reqwest(&e))?;
        let response = check_status(response).await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut parser = SseParser::new();
            loop {
                let chunk = match tokio::time::timeout(idle, body.next()).await {
                    Err(_) => {
                        let _ = tx.send(Err(UpstreamError::Timeout)).await;
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        let _ = tx.send(Err(UpstreamError::from_reqwest(&e))).await;
                        return;
                    }
                    Ok(Some(Ok(bytes))) => bytes,
                };
                for event in parser.push(&chunk) {
                    if !forward_event(&tx, event).await {
                        return;
                    }
                }
            }
            if let Some(event) = parser.finish() {
                forward_event(&tx, event).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_bodies_on_char_boundary() {
        let body = "é".repeat(MAX_ERROR_BODY + 10);
        let out = truncate(&body);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), MAX_ERROR_BODY + 3);
        assert_eq!(truncate("short"), "short");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let backend = HttpBackend::new().unwrap();
        let preset = PresetConfig {
            timeout_sec: 2.0,
            ..PresetConfig::new("p", "http://127.0.0.1:9", "m")
        };
        let request = super::super::preset::probe_request(&preset);

        let err = backend.complete(&preset, &request).await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
