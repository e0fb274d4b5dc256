//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parley_gateway::config::{BotConfig, ConfigSnapshot, ConfigStore, PresetConfig};
use parley_gateway::context::Role;
use parley_gateway::upstream::{ChatBackend, ChatRequest, DeltaStream, UpstreamClient, UpstreamError};
use parley_gateway::{InboundEvent, LoopbackDriver, MemoryStore, Orchestrator, RunState, TurnRecord};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Chat backend answering from a script
///
/// Preset health checks always succeed unless `fail_health_check` is set. Other requests
/// pop the next scripted result, falling back to `echo: <last user message>`.
/// Streams yield one word per delta, `stream_gap` apart.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<String, UpstreamError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    pub fail_health_check: AtomicBool,
    health_checks: AtomicUsize,
    latency: Mutex<Duration>,
    stream_gap: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, result: Result<String, UpstreamError>) {
        lock(&self.script).push_back(result);
    }

    pub fn reply(&self, text: &str) {
        self.push(Ok(text.to_string()));
    }

    /// Delay applied to every other call
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Delay before each streamed delta
    pub fn set_stream_gap(&self, gap: Duration) {
        *lock(&self.stream_gap) = gap;
    }

    /// Preset health checks answered so far
    #[must_use]
    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    /// Requests other than health checks seen so far
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    /// Last user message of each recorded request
    #[must_use]
    pub fn user_messages(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r.messages.iter().rev().find(|m| m.role == Role::User))
            .map(|m| m.content.clone())
            .collect()
    }

    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn answer(&self, request: &ChatRequest) -> Result<String, UpstreamError> {
        if is_health_check(request) {
            self.health_checks.fetch_add(1, Ordering::SeqCst);
            return if self.fail_health_check.load(Ordering::SeqCst) {
                Err(UpstreamError::Status {
                    status: 401,
                    body: "invalid api key".to_string(),
                })
            } else {
                Ok("pong".to_string())
            };
        }

        lock(&self.requests).push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = lock(&self.script).pop_front();
        scripted.unwrap_or_else(|| {
            let last = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(format!("echo: {last}"))
        })
    }
}

fn is_health_check(request: &ChatRequest) -> bool {
    request.max_tokens == 1
        && request.messages.len() == 1
        && request.messages[0].content == "ping"
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(&self, _preset: &PresetConfig, request: &ChatRequest) -> Result<String, UpstreamError> {
        self.answer(request).await
    }

    async fn stream(&self, _preset: &PresetConfig, request: &ChatRequest) -> Result<DeltaStream, UpstreamError> {
        let text = self.answer(request).await?;
        let deltas: Vec<Result<String, UpstreamError>> =
            text.split_inclusive(' ').map(|s| Ok(s.to_string())).collect();
        let gap = *lock(&self.stream_gap);
        if gap.is_zero() {
            return Ok(Box::pin(futures::stream::iter(deltas)));
        }
        Ok(Box::pin(futures::stream::iter(deltas).then(move |delta| async move {
            tokio::time::sleep(gap).await;
            delta
        })))
    }
}

/// Pipeline settings with no random pacing and fast polling
#[must_use]
pub fn test_bot() -> BotConfig {
    BotConfig {
        self_name: "Parley".to_string(),
        system_prompt: "You are {self_name}, chatting with {sender}.".to_string(),
        poll_interval_min_sec: 0.05,
        poll_interval_max_sec: 0.2,
        random_delay_range_sec: [0.0, 0.0],
        min_reply_interval_sec: 0.0,
        reply_chunk_delay_sec: 0.0,
        reconnect_base_delay_sec: 1.0,
        reconnect_max_delay_sec: 4.0,
        config_reload_sec: 60.0,
        shutdown_grace_sec: 1.0,
        ..BotConfig::default()
    }
}

/// Snapshot with one usable preset
#[must_use]
pub fn test_snapshot(bot: BotConfig) -> ConfigSnapshot {
    let mut snapshot = ConfigSnapshot::default();
    snapshot.presets.push(
        PresetConfig::new("main", "http://upstream.test/v1", "test-model")
            .with_api_key("sk-test-0123456789abcdef"),
    );
    snapshot.active_preset = Some("main".to_string());
    snapshot.bot = bot;
    snapshot
}

/// Orchestrator wired to a loopback driver and a scripted backend
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub driver: Arc<LoopbackDriver>,
    pub backend: Arc<ScriptedBackend>,
    pub config: Arc<ConfigStore>,
}

impl Harness {
    #[must_use]
    pub fn new(bot: BotConfig) -> Self {
        let config = Arc::new(ConfigStore::from_snapshot(test_snapshot(bot.clone())));
        let driver = Arc::new(LoopbackDriver::new());
        let backend = ScriptedBackend::new();
        let upstream = Arc::new(UpstreamClient::new(backend.clone(), bot.max_concurrency));
        let store = MemoryStore::in_memory().expect("failed to init test db");
        let orchestrator = Orchestrator::new(config.clone(), driver.clone(), upstream, store);
        Self {
            orchestrator,
            driver,
            backend,
            config,
        }
    }

    /// Start and wait until running
    pub async fn start(&self) {
        self.orchestrator.start().await.expect("orchestrator failed to start");
    }

    pub fn say(&self, conversation: &str, sender: &str, content: &str) {
        self.driver.inject(InboundEvent::text(conversation, sender, content));
    }

    /// Wait (on the test clock) for `count` outbox messages
    pub async fn expect_sent(&self, count: usize) {
        assert!(
            self.driver.wait_for_sent(count, Duration::from_secs(30)).await,
            "expected {count} sent message(s), outbox: {:?}",
            self.driver.outbox().iter().map(|m| &m.text).collect::<Vec<_>>()
        );
    }

    /// Wait (on the test clock) until `count` turns are recorded; newest first
    pub async fn wait_for_turns(&self, count: usize) -> Vec<TurnRecord> {
        for _ in 0..600 {
            let turns = self.orchestrator.recent_turns(usize::MAX);
            if turns.len() >= count {
                return turns;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "expected {count} turn(s), got {}",
            self.orchestrator.recent_turns(usize::MAX).len()
        );
    }

    /// Wait (on the test clock) for the orchestrator to reach `state`
    pub async fn wait_for_state(&self, state: RunState) {
        let mut rx = self.orchestrator.subscribe_state();
        let reached = tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == state)).await;
        assert!(
            matches!(reached, Ok(Ok(_))),
            "state {} never reached, now {}",
            state,
            self.orchestrator.state()
        );
    }
}
