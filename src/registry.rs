//! Conversation registry
//!
//! Maps conversation ids to shared per-conversation state. Each handle owns
//! the conversation's turn lock and FIFO turn queue; the orchestrator runs at
//! most one worker per conversation, which drains the queue while holding the
//! lock. Capacity eviction drops the least-recently-active conversation that
//! is idle and referenced only by the registry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::context::ChatMessage;
use crate::driver::ConversationKind;
use crate::merge::Turn;

/// Shared handle to one conversation
pub type ConversationHandle = Arc<Conversation>;

/// Where a conversation currently is in the pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    #[default]
    Idle,
    Buffering,
    Queued,
    Filtering,
    Assembling,
    AwaitingUpstream,
    Dispatching,
}

#[derive(Debug, Default)]
struct TurnQueue {
    pending: VecDeque<Turn>,
    draining: bool,
}

/// Per-conversation state
#[derive(Debug)]
pub struct Conversation {
    id: String,
    kind: ConversationKind,
    display_name: Mutex<String>,
    muted: AtomicBool,
    whitelisted: AtomicBool,
    last_activity: Mutex<Instant>,
    last_reply: Mutex<Option<Instant>>,
    stage: Mutex<PipelineStage>,
    turn_lock: Arc<AsyncMutex<()>>,
    queue: Mutex<TurnQueue>,
    history: Mutex<VecDeque<ChatMessage>>,
}

impl Conversation {
    fn new(id: String, kind: ConversationKind, display_name: String) -> Self {
        Self {
            id,
            kind,
            display_name: Mutex::new(display_name),
            muted: AtomicBool::new(false),
            whitelisted: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            last_reply: Mutex::new(None),
            stage: Mutex::new(PipelineStage::Idle),
            turn_lock: Arc::new(AsyncMutex::new(())),
            queue: Mutex::new(TurnQueue::default()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Conversation identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Conversation kind
    #[must_use]
    pub const fn kind(&self) -> ConversationKind {
        self.kind
    }

    /// Current display name
    #[must_use]
    pub fn display_name(&self) -> String {
        lock(&self.display_name).clone()
    }

    pub fn set_display_name(&self, name: &str) {
        if !name.is_empty() {
            let mut current = lock(&self.display_name);
            if *current != name {
                *current = name.to_string();
            }
        }
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_whitelisted(&self) -> bool {
        self.whitelisted.load(Ordering::SeqCst)
    }

    pub fn set_whitelisted(&self, whitelisted: bool) {
        self.whitelisted.store(whitelisted, Ordering::SeqCst);
    }

    /// Record inbound activity
    pub fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    /// Time of the last inbound activity
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    /// Time of the last outbound send
    #[must_use]
    pub fn last_reply(&self) -> Option<Instant> {
        *lock(&self.last_reply)
    }

    pub fn mark_replied(&self, at: Instant) {
        *lock(&self.last_reply) = Some(at);
    }

    #[must_use]
    pub fn stage(&self) -> PipelineStage {
        *lock(&self.stage)
    }

    pub fn set_stage(&self, stage: PipelineStage) {
        *lock(&self.stage) = stage;
    }

    /// Acquire the conversation's execution lock
    ///
    /// Waiters are served in FIFO order.
    pub async fn lock_turn(&self) -> OwnedMutexGuard<()> {
        self.turn_lock.clone().lock_owned().await
    }

    /// Whether a pipeline run currently holds the lock
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.turn_lock.try_lock().is_err()
    }

    /// Append a turn to the queue
    ///
    /// Returns `true` when no worker is draining the queue and the caller
    /// must start one.
    pub fn enqueue(&self, turn: Turn) -> bool {
        let mut queue = lock(&self.queue);
        queue.pending.push_back(turn);
        if queue.draining {
            false
        } else {
            queue.draining = true;
            true
        }
    }

    /// Pop the next queued turn; marks the queue idle when empty
    pub fn next_turn(&self) -> Option<Turn> {
        let mut queue = lock(&self.queue);
        let next = queue.pending.pop_front();
        if next.is_none() {
            queue.draining = false;
        }
        next
    }

    /// Drop queued turns (used when stopping)
    pub fn clear_queue(&self) -> usize {
        let mut queue = lock(&self.queue);
        let dropped = queue.pending.len();
        queue.pending.clear();
        queue.draining = false;
        dropped
    }

    /// Turns waiting behind the running one
    #[must_use]
    pub fn queued(&self) -> usize {
        lock(&self.queue).pending.len()
    }

    /// In-memory recent turns, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<ChatMessage> {
        lock(&self.history).iter().cloned().collect()
    }

    /// Record one completed exchange, keeping at most `rounds` pairs
    pub fn push_exchange(&self, user: ChatMessage, assistant: ChatMessage, rounds: usize) {
        let mut history = lock(&self.history);
        history.push_back(user);
        history.push_back(assistant);
        let cap = rounds.saturating_mul(2);
        while history.len() > cap {
            history.pop_front();
        }
    }

    fn is_evictable(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) == 1 && !self.is_locked() && lock(&self.queue).pending.is_empty()
    }
}

/// Serializable view of a conversation for the control API
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub kind: ConversationKind,
    pub display_name: String,
    pub muted: bool,
    pub whitelisted: bool,
    pub stage: PipelineStage,
    pub queued: usize,
    pub idle_ms: u128,
}

impl From<&Conversation> for ConversationSummary {
    fn from(c: &Conversation) -> Self {
        Self {
            id: c.id.clone(),
            kind: c.kind,
            display_name: c.display_name(),
            muted: c.is_muted(),
            whitelisted: c.is_whitelisted(),
            stage: c.stage(),
            queued: c.queued(),
            idle_ms: c.last_activity().elapsed().as_millis(),
        }
    }
}

/// Registry of live conversations, ordered by recent activity
#[derive(Debug)]
pub struct ConversationRegistry {
    entries: Mutex<LruCache<String, ConversationHandle>>,
    capacity: AtomicUsize,
}

impl ConversationRegistry {
    /// Create a registry holding at most `capacity` idle conversations
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            capacity: AtomicUsize::new(capacity.max(1)),
        }
    }

    /// Change the capacity; takes effect on the next insert
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::SeqCst);
    }

    /// Fetch a conversation, creating it on first sight
    ///
    /// Marks the conversation as most recently active.
    pub fn get_or_create(
        &self,
        id: &str,
        kind: ConversationKind,
        display_name: &str,
    ) -> ConversationHandle {
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries.get(id) {
            existing.touch();
            existing.set_display_name(display_name);
            return existing.clone();
        }

        let handle = Arc::new(Conversation::new(
            id.to_string(),
            kind,
            if display_name.is_empty() { id } else { display_name }.to_string(),
        ));
        entries.put(id.to_string(), handle.clone());
        tracing::debug!(conversation = %id, "conversation registered");

        let capacity = self.capacity.load(Ordering::SeqCst);
        while entries.len() > capacity {
            let victim = entries
                .iter()
                .rev()
                .find(|(_, c)| c.is_evictable())
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else {
                tracing::debug!(
                    size = entries.len(),
                    capacity,
                    "registry over capacity, every conversation busy"
                );
                break;
            };
            entries.pop(&victim);
            tracing::debug!(conversation = %victim, "conversation evicted");
        }

        handle
    }

    /// Fetch without creating or promoting
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ConversationHandle> {
        lock(&self.entries).peek(id).cloned()
    }

    /// Remove a conversation unless it is busy
    ///
    /// Returns `true` if it was removed.
    pub fn remove(&self, id: &str) -> bool {
        let mut entries = lock(&self.entries);
        let evictable = entries.peek(id).is_some_and(Conversation::is_evictable);
        if evictable {
            entries.pop(id);
        }
        evictable
    }

    /// Evict idle conversations whose last activity is older than `ttl`
    pub fn evict_idle(&self, ttl: Duration) -> Vec<String> {
        let mut entries = lock(&self.entries);
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, c)| c.last_activity().elapsed() >= ttl && c.is_evictable())
            .map(|(k, _)| k.clone())
            .collect();
        for id in &stale {
            entries.pop(id);
        }
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "evicted idle conversations");
        }
        stale
    }

    /// All conversations, most recently active first
    #[must_use]
    pub fn handles(&self) -> Vec<ConversationHandle> {
        lock(&self.entries).iter().map(|(_, c)| c.clone()).collect()
    }

    /// Serializable listing, most recently active first
    #[must_use]
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        lock(&self.entries)
            .iter()
            .map(|(_, c)| ConversationSummary::from(c.as_ref()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
