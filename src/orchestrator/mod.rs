//! Orchestrator - supervises the reply pipeline
//!
//! Owns the run state machine and a supervisor task. The supervisor polls the
//! driver with adaptive backoff, feeds events through the merge buffer,
//! schedules one worker per conversation, reconnects the driver when it
//! drops or goes idle, and hot-applies configuration snapshots.
//!
//! ```text
//! driver ─poll─▶ MergeBuffer ─Turn─▶ queue(conversation) ─worker─▶ pipeline
//!                                                       filter → context → upstream → dispatch
//! ```

mod control;
mod pipeline;
mod state;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

pub use pipeline::{FactExtraction, TurnOutcome, TurnRecord, fact_extraction_prompt};
pub use state::{RunState, StateMachine};

use crate::config::{BotConfig, ConfigSnapshot, ConfigStore, secs};
use crate::db::MemoryStore;
use crate::dispatch::{Chunk, Pacer};
use crate::driver::{ConversationKind, Driver, InboundEvent};
use crate::merge::{MergeBuffer, Turn};
use crate::registry::{ConversationHandle, ConversationRegistry, ConversationSummary, PipelineStage};
use crate::upstream::UpstreamClient;
use crate::upstream::preset::PresetStatus;
use crate::{Error, Result};

/// Processed turns kept for the control API
pub const TURN_HISTORY: usize = 50;

/// How often idle conversations are evicted
const EVICT_INTERVAL: Duration = Duration::from_secs(60);

/// Reconnect backoff growth per attempt
const RECONNECT_BACKOFF_FACTOR: f64 = 1.5;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delay before reconnect attempt `attempt` (zero-based)
///
/// `base * 1.5^attempt`, capped at the configured maximum.
#[must_use]
pub fn reconnect_delay(bot: &BotConfig, attempt: u32) -> Duration {
    let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
    let delay = bot.reconnect_base_delay_sec * RECONNECT_BACKOFF_FACTOR.powi(exp);
    secs(delay.min(bot.reconnect_max_delay_sec))
}

/// Next idle poll delay: grow by the backoff factor up to the maximum
#[must_use]
pub fn next_poll_delay(current: Duration, bot: &BotConfig) -> Duration {
    let min = secs(bot.poll_interval_min_sec);
    let max = secs(bot.poll_interval_max_sec).max(min);
    current.mul_f64(bot.poll_backoff_factor.max(1.0)).clamp(min, max)
}

#[derive(Debug, Default)]
struct Stats {
    replies: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Counters reported by `/api/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_replies: u64,
    pub failed_turns: u64,
    pub rejected_turns: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
}

/// Orchestrator status for the control API and `/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: RunState,
    pub pause_reason: Option<String>,
    pub last_error: Option<String>,
    pub stats: StatsSnapshot,
    pub active_preset: Option<String>,
    pub active_model: Option<String>,
    pub presets: Vec<PresetStatus>,
    pub driver: &'static str,
    pub driver_connected: bool,
    pub conversations: usize,
    pub upstream_in_flight: usize,
    pub max_concurrency: usize,
}

struct RunHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum Poll {
    Events,
    Idle,
    Disconnected(String),
}

enum Reconnect {
    Restored,
    Exhausted(Error),
    Cancelled,
}

/// State shared by the orchestrator handle, its supervisor, and workers
pub(crate) struct Shared {
    config: Arc<ConfigStore>,
    driver: Arc<dyn Driver>,
    upstream: Arc<UpstreamClient>,
    store: MemoryStore,
    registry: ConversationRegistry,
    state: StateMachine,
    stats: Stats,
    started_at: Mutex<Option<DateTime<Utc>>>,
    turns: Mutex<VecDeque<TurnRecord>>,
    pause_reason: Mutex<Option<String>>,
    last_error: Mutex<Option<String>>,
    run: AsyncMutex<Option<RunHandle>>,
}

/// Handle to the pipeline supervisor
///
/// Cheap to clone; every clone drives the same state machine.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: Arc<ConfigStore>,
        driver: Arc<dyn Driver>,
        upstream: Arc<UpstreamClient>,
        store: MemoryStore,
    ) -> Self {
        let capacity = config.current().bot.history_max_chats;
        Self {
            shared: Arc::new(Shared {
                config,
                driver,
                upstream,
                store,
                registry: ConversationRegistry::new(capacity),
                state: StateMachine::new(),
                stats: Stats::default(),
                started_at: Mutex::new(None),
                turns: Mutex::new(VecDeque::with_capacity(TURN_HISTORY)),
                pause_reason: Mutex::new(None),
                last_error: Mutex::new(None),
                run: AsyncMutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.shared.state.get()
    }

    /// Receiver notified on every state change
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.shared.config
    }

    #[must_use]
    pub fn upstream(&self) -> &Arc<UpstreamClient> {
        &self.shared.upstream
    }

    #[must_use]
    pub fn store(&self) -> &MemoryStore {
        &self.shared.store
    }

    #[must_use]
    pub fn registry(&self) -> &ConversationRegistry {
        &self.shared.registry
    }

    /// Probe presets and begin polling the driver
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless stopped, or
    /// [`Error::NoUsablePreset`] if no preset answers; the orchestrator is
    /// stopped again in that case
    pub async fn start(&self) -> Result<()> {
        let mut run = self.shared.run.lock().await;
        self.shared
            .state
            .transition_from(&[RunState::Stopped], RunState::Starting)?;

        let snapshot = self.shared.config.current();
        self.shared.apply_limits(&snapshot.bot);
        if let Err(e) = self.shared.upstream.probe(&snapshot).await {
            tracing::error!(error = %e, "startup probe failed, staying stopped");
            *lock(&self.shared.last_error) = Some(e.to_string());
            self.shared.state.transition(RunState::Stopped)?;
            return Err(e);
        }

        *lock(&self.shared.started_at) = Some(Utc::now());
        *lock(&self.shared.pause_reason) = None;
        *lock(&self.shared.last_error) = None;
        self.shared.state.transition(RunState::Running)?;

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(self.shared.clone(), stop_rx));
        *run = Some(RunHandle { stop, task });
        Ok(())
    }

    /// Stop polling, let in-flight turns finish within the grace period,
    /// then abandon the rest
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if not running, paused, or
    /// reconnecting
    pub async fn stop(&self) -> Result<()> {
        let mut run = self.shared.run.lock().await;
        self.shared.state.transition_from(
            &[RunState::Running, RunState::Paused, RunState::Reconnecting],
            RunState::Stopping,
        )?;

        if let Some(handle) = run.take() {
            let _ = handle.stop.send(true);
            if let Err(e) = handle.task.await
                && e.is_panic()
            {
                tracing::error!(error = %e, "supervisor panicked");
            }
        }

        self.shared.state.transition(RunState::Stopped)?;
        Ok(())
    }

    /// Suspend new turns; the driver stays connected
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless running
    pub fn pause(&self, reason: Option<String>) -> Result<()> {
        self.shared.pause(reason)
    }

    /// Resume turn processing
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless paused
    pub fn resume(&self) -> Result<()> {
        self.shared.resume()
    }

    /// Re-run preset selection against the current snapshot
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoUsablePreset`] if no preset answers
    pub async fn reprobe(&self) -> Result<Vec<PresetStatus>> {
        let snapshot = self.shared.config.current();
        let result = self.shared.upstream.probe(&snapshot).await;
        if let Err(e) = &result {
            *lock(&self.shared.last_error) = Some(e.to_string());
        }
        result.map(|_| self.shared.upstream.statuses())
    }

    #[must_use]
    pub fn status(&self) -> StatusReport {
        self.shared.status()
    }

    /// Most recent processed turns, newest first
    #[must_use]
    pub fn recent_turns(&self, limit: usize) -> Vec<TurnRecord> {
        lock(&self.shared.turns).iter().rev().take(limit).cloned().collect()
    }

    #[must_use]
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.shared.registry.summaries()
    }

    /// Set operator mute and whitelist flags on a tracked conversation
    ///
    /// # Errors
    ///
    /// Returns error if the conversation has not been seen
    pub fn set_conversation_flags(
        &self,
        conversation_id: &str,
        muted: Option<bool>,
        whitelisted: Option<bool>,
    ) -> Result<ConversationSummary> {
        let conversation = self
            .shared
            .registry
            .get(conversation_id)
            .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))?;
        if let Some(muted) = muted {
            conversation.set_muted(muted);
        }
        if let Some(whitelisted) = whitelisted {
            conversation.set_whitelisted(whitelisted);
        }
        tracing::info!(
            conversation = %conversation_id,
            muted = conversation.is_muted(),
            whitelisted = conversation.is_whitelisted(),
            "conversation flags updated"
        );
        Ok(ConversationSummary::from(conversation.as_ref()))
    }

    /// Send an operator-written message under the conversation lock
    ///
    /// Waits behind any in-flight turn for the same conversation and honours
    /// the minimum reply interval.
    ///
    /// # Errors
    ///
    /// Returns error if the text is empty or the driver rejects the send
    pub async fn send_manual(&self, conversation_id: &str, text: &str) -> Result<()> {
        let text = text.trim();
        if conversation_id.trim().is_empty() || text.is_empty() {
            return Err(Error::Dispatch("conversation id and content are required".to_string()));
        }

        let conversation = self.shared.registry.get(conversation_id).unwrap_or_else(|| {
            self.shared
                .registry
                .get_or_create(conversation_id, ConversationKind::Direct, conversation_id)
        });
        let started_at = Utc::now();

        let _turn = conversation.lock_turn().await;
        conversation.set_stage(PipelineStage::Dispatching);
        let pacer = Pacer::new(self.shared.config.current().bot.min_reply_interval());
        let chunk = Chunk {
            text: text.to_string(),
            delay: Duration::ZERO,
            quote: None,
        };
        let result = pacer
            .send_chunk(self.shared.driver.as_ref(), &conversation, &chunk)
            .await;
        conversation.set_stage(PipelineStage::Idle);

        self.shared.record(TurnRecord {
            conversation_id: conversation_id.to_string(),
            sender: "operator".to_string(),
            input: String::new(),
            reply: result.is_ok().then(|| text.to_string()),
            outcome: match &result {
                Ok(()) => TurnOutcome::Manual,
                Err(e) => TurnOutcome::Failed { error: e.to_string() },
            },
            preset: None,
            chunks: usize::from(result.is_ok()),
            started_at,
            finished_at: Utc::now(),
        });
        result
    }
}

impl Shared {
    fn pause(&self, reason: Option<String>) -> Result<()> {
        self.state
            .transition_from(&[RunState::Running], RunState::Paused)?;
        tracing::info!(reason = reason.as_deref().unwrap_or(""), "auto replies paused");
        *lock(&self.pause_reason) = reason;
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.state
            .transition_from(&[RunState::Paused], RunState::Running)?;
        *lock(&self.pause_reason) = None;
        Ok(())
    }

    fn status(&self) -> StatusReport {
        let started_at = *lock(&self.started_at);
        let uptime_secs = match (self.state.get(), started_at) {
            (RunState::Stopped, _) | (_, None) => 0,
            (_, Some(at)) => u64::try_from((Utc::now() - at).num_seconds()).unwrap_or(0),
        };
        let active = self.upstream.active();
        let max_concurrency = self.upstream.max_concurrency();

        StatusReport {
            state: self.state.get(),
            pause_reason: lock(&self.pause_reason).clone(),
            last_error: lock(&self.last_error).clone(),
            stats: StatsSnapshot {
                total_replies: self.stats.replies.load(Ordering::Relaxed),
                failed_turns: self.stats.failed.load(Ordering::Relaxed),
                rejected_turns: self.stats.rejected.load(Ordering::Relaxed),
                started_at,
                uptime_secs,
            },
            active_preset: active.as_ref().map(|p| p.name.clone()),
            active_model: active.as_ref().map(|p| p.model.clone()),
            presets: self.upstream.statuses(),
            driver: self.driver.name(),
            driver_connected: self.driver.is_connected(),
            conversations: self.registry.len(),
            upstream_in_flight: max_concurrency.saturating_sub(self.upstream.available_permits()),
            max_concurrency,
        }
    }

    fn record(&self, record: TurnRecord) {
        match &record.outcome {
            TurnOutcome::Replied | TurnOutcome::AutoReplied => {
                self.stats.replies.fetch_add(1, Ordering::Relaxed);
            }
            TurnOutcome::Rejected { .. } | TurnOutcome::Paused => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            }
            TurnOutcome::Failed { .. } | TurnOutcome::Fallback { .. } => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            TurnOutcome::Command | TurnOutcome::Manual => {}
        }

        let mut turns = lock(&self.turns);
        if turns.len() == TURN_HISTORY {
            turns.pop_front();
        }
        turns.push_back(record);
    }

    fn apply_limits(&self, bot: &BotConfig) {
        self.registry.set_capacity(bot.history_max_chats);
        self.upstream.set_max_concurrency(bot.max_concurrency);
    }

    /// Hot-apply a new snapshot, re-probing when the presets changed
    async fn apply_snapshot(&self, previous: &ConfigSnapshot, next: &ConfigSnapshot) {
        self.apply_limits(&next.bot);
        if next.bot.reload_ai_client_on_change && previous.api_signature() != next.api_signature() {
            tracing::info!("upstream presets changed, re-probing");
            if let Err(e) = self.upstream.probe(next).await {
                tracing::error!(error = %e, "re-probe failed, turns will fail until a preset answers");
                *lock(&self.last_error) = Some(e.to_string());
            }
        }
    }

    fn ingest(&self, event: InboundEvent, merge: &MergeBuffer, bot: &BotConfig) {
        let conversation = self
            .registry
            .get_or_create(&event.conversation_id, event.kind, &event.chat_name);
        if conversation.stage() == PipelineStage::Idle {
            conversation.set_stage(PipelineStage::Buffering);
        }
        merge.push(event, bot.merge_window(), bot.merge_max_wait());
    }

    async fn poll_once(&self, merge: &MergeBuffer, bot: &BotConfig) -> Poll {
        if !self.driver.is_connected() {
            return Poll::Disconnected("driver reports disconnect".to_string());
        }
        match self.driver.poll_events().await {
            Ok(events) if events.is_empty() => Poll::Idle,
            Ok(events) => {
                tracing::trace!(count = events.len(), "events polled");
                for event in events {
                    self.ingest(event, merge, bot);
                }
                Poll::Events
            }
            Err(e) => Poll::Disconnected(e.to_string()),
        }
    }

    /// Queue a flushed turn, starting a worker when none is draining
    fn schedule(self: &Arc<Self>, turn: Turn, workers: &mut JoinSet<()>) {
        let conversation = self
            .registry
            .get_or_create(&turn.conversation_id, turn.kind, &turn.chat_name);
        if conversation.enqueue(turn) {
            conversation.set_stage(PipelineStage::Queued);
            let shared = self.clone();
            workers.spawn(async move { shared.drain(conversation).await });
        }
    }

    /// Process queued turns for one conversation in order
    async fn drain(self: Arc<Self>, conversation: ConversationHandle) {
        let _turn = conversation.lock_turn().await;
        while let Some(turn) = conversation.next_turn() {
            pipeline::run_turn(&self, &conversation, turn).await;
        }
        conversation.set_stage(PipelineStage::Idle);
    }

    async fn reconnect(&self, bot: &BotConfig, reason: &str, stop: &mut watch::Receiver<bool>) -> Reconnect {
        let Ok(resume_to) = self
            .state
            .transition_from(&[RunState::Running, RunState::Paused], RunState::Reconnecting)
        else {
            return Reconnect::Cancelled;
        };
        tracing::warn!(reason, "driver connection lost, reconnecting");

        for attempt in 0..bot.reconnect_max_retries {
            let delay = reconnect_delay(bot, attempt);
            tokio::select! {
                _ = stop.changed() => return Reconnect::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }

            match self.driver.reconnect().await {
                Ok(()) if self.driver.is_connected() => {
                    tracing::info!(attempt = attempt + 1, "driver reconnected");
                    return match self
                        .state
                        .transition_from(&[RunState::Reconnecting], resume_to)
                    {
                        Ok(_) => Reconnect::Restored,
                        Err(_) => Reconnect::Cancelled,
                    };
                }
                Ok(()) => {
                    tracing::warn!(attempt = attempt + 1, "driver still disconnected after reconnect");
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "reconnect attempt failed");
                }
            }
        }

        tracing::error!(retries = bot.reconnect_max_retries, "reconnect budget exhausted, stopping");
        Reconnect::Exhausted(Error::Reconnect(format!(
            "driver still down after {} attempt(s): {reason}",
            bot.reconnect_max_retries
        )))
    }

    fn purge_memory(&self) {
        match self.store.memory().purge_expired() {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "expired memory records purged"),
            Err(e) => tracing::warn!(error = %e, "memory purge failed"),
        }
    }

    fn evict_idle(&self, bot: &BotConfig) {
        if let Some(ttl) = bot.history_ttl() {
            let evicted = self.registry.evict_idle(ttl);
            if !evicted.is_empty() {
                tracing::debug!(count = evicted.len(), "idle conversations evicted");
            }
        }
    }

    /// Drop pending work, wait out the grace period, then abort stragglers
    async fn shutdown(&self, merge: &MergeBuffer, mut workers: JoinSet<()>, grace: Duration) {
        let discarded = merge.discard_all();
        let dropped: usize = self.registry.handles().iter().map(|c| c.clear_queue()).sum();
        tracing::info!(
            discarded_buffers = discarded,
            dropped_turns = dropped,
            in_flight = workers.len(),
            "stopping, waiting for in-flight turns"
        );

        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(abandoned = workers.len(), "grace period elapsed, abandoning in-flight turns");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        for conversation in self.registry.handles() {
            conversation.set_stage(PipelineStage::Idle);
        }
    }
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn purge_period(bot: &BotConfig) -> Duration {
    Duration::from_secs(bot.memory_cleanup_interval_sec.max(1))
}

/// Supervisor loop; runs until stopped or the reconnect budget is exhausted
async fn supervise(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let (turn_tx, mut turn_rx) = mpsc::unbounded_channel();
    let merge = MergeBuffer::new(turn_tx);
    let mut workers = JoinSet::new();

    let mut config_rx = shared.config.subscribe();
    let mut snapshot = shared.config.current();

    let mut poll_delay = secs(snapshot.bot.poll_interval_min_sec);
    let mut next_poll = Instant::now();
    let mut last_activity = Instant::now();
    let mut reload = interval(snapshot.bot.config_reload_interval());
    let mut purge = interval(purge_period(&snapshot.bot));
    let mut evict = interval(EVICT_INTERVAL);

    tracing::info!(driver = shared.driver.name(), "supervisor started");

    let fatal = loop {
        tokio::select! {
            _ = stop.changed() => break None,

            Some(turn) = turn_rx.recv() => shared.schedule(turn, &mut workers),

            () = tokio::time::sleep_until(next_poll) => {
                let bot = &snapshot.bot;
                let lost = match shared.poll_once(&merge, bot).await {
                    Poll::Events => {
                        poll_delay = secs(bot.poll_interval_min_sec);
                        last_activity = Instant::now();
                        None
                    }
                    Poll::Idle => {
                        poll_delay = next_poll_delay(poll_delay, bot);
                        bot.keepalive_idle()
                            .filter(|idle| last_activity.elapsed() >= *idle)
                            .map(|_| "keepalive idle timeout".to_string())
                    }
                    Poll::Disconnected(reason) => Some(reason),
                };

                if let Some(reason) = lost {
                    match shared.reconnect(bot, &reason, &mut stop).await {
                        Reconnect::Restored => {
                            poll_delay = secs(bot.poll_interval_min_sec);
                            last_activity = Instant::now();
                        }
                        Reconnect::Exhausted(error) => break Some(error),
                        Reconnect::Cancelled => break None,
                    }
                }
                next_poll = Instant::now() + poll_delay;
            }

            _ = reload.tick() => {
                if let Err(e) = shared.config.reload_if_changed() {
                    tracing::warn!(error = %e, "config reload failed, keeping current snapshot");
                }
            }

            Ok(()) = config_rx.changed() => {
                let next = config_rx.borrow_and_update().clone();
                shared.apply_snapshot(&snapshot, &next).await;
                if next.bot.config_reload_interval() != snapshot.bot.config_reload_interval() {
                    reload = interval(next.bot.config_reload_interval());
                }
                if next.bot.memory_cleanup_interval_sec != snapshot.bot.memory_cleanup_interval_sec {
                    purge = interval(purge_period(&next.bot));
                }
                snapshot = next;
            }

            _ = purge.tick() => shared.purge_memory(),

            _ = evict.tick() => shared.evict_idle(&snapshot.bot),

            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    tracing::error!(error = %e, "conversation worker panicked");
                }
            }
        }
    };

    shared.shutdown(&merge, workers, snapshot.bot.shutdown_grace()).await;

    if let Some(error) = fatal {
        *lock(&shared.last_error) = Some(error.to_string());
        if shared.state.transition_from(&[RunState::Reconnecting], RunState::Stopped).is_ok() {
            tracing::error!(error = %error, "orchestrator stopped after driver loss");
        }
    }
    tracing::info!("supervisor exited");
}
