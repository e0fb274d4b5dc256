//! Merge buffer
//!
//! Folds rapid successive events for one conversation into a single
//! [`Turn`]. The first event opens a buffer and arms a debounce timer; each
//! further event re-arms it, but never past `max_wait` from the buffer open
//! time. A zero window passes events straight through. Voice events bypass
//! the buffer after flushing whatever is pending for that conversation, so
//! arrival order is kept.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::driver::{ContentKind, ConversationKind, InboundEvent};

/// One event folded into a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnPart {
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub mentions_me: bool,
}

/// One logical unit of input submitted for a single reply cycle
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub id: Uuid,
    pub conversation_id: String,
    pub kind: ConversationKind,
    pub chat_name: String,
    /// Sender of the last folded event (the reply target)
    pub sender_id: String,
    pub sender_name: String,
    /// Folded content, one line per event in arrival order
    pub content: String,
    pub content_kind: ContentKind,
    /// Whether any folded event mentioned the gateway account
    pub mentions_me: bool,
    /// Whether every folded event came from the gateway account
    pub is_self: bool,
    pub chat_type: Option<String>,
    pub parts: Vec<TurnPart>,
}

impl Turn {
    /// Fold events (in arrival order) into one turn
    ///
    /// In group chats with more than one distinct sender each line is
    /// prefixed with its sender's name.
    #[must_use]
    pub fn from_events(events: Vec<InboundEvent>) -> Self {
        let first = events.first();
        let last = events.last();

        let mut senders: Vec<&str> = events.iter().map(|e| e.sender_id.as_str()).collect();
        senders.sort_unstable();
        senders.dedup();
        let kind = first.map(|e| e.kind).unwrap_or_default();
        let label_lines = kind == ConversationKind::Group && senders.len() > 1;

        let content = events
            .iter()
            .map(|e| {
                if label_lines {
                    format!("{}: {}", display(e), e.content)
                } else {
                    e.content.clone()
                }
            })
            .collect::<Vec<_>>()
            .join("\n");

        let content_kind = if events.len() == 1 {
            first.map(|e| e.content_kind).unwrap_or_default()
        } else {
            ContentKind::Text
        };

        Self {
            id: Uuid::new_v4(),
            conversation_id: first.map(|e| e.conversation_id.clone()).unwrap_or_default(),
            kind,
            chat_name: last.map(|e| e.chat_name.clone()).unwrap_or_default(),
            sender_id: last.map(|e| e.sender_id.clone()).unwrap_or_default(),
            sender_name: last.map(|e| display(e).to_string()).unwrap_or_default(),
            content,
            content_kind,
            mentions_me: events.iter().any(|e| e.mentions_me),
            is_self: !events.is_empty() && events.iter().all(|e| e.is_self),
            chat_type: last.and_then(|e| e.chat_type.clone()),
            parts: events
                .iter()
                .map(|e| TurnPart {
                    sender_id: e.sender_id.clone(),
                    sender_name: display(e).to_string(),
                    content: e.content.clone(),
                    timestamp: e.timestamp,
                    mentions_me: e.mentions_me,
                })
                .collect(),
        }
    }

    /// Number of raw events folded into this turn
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.parts.len()
    }
}

fn display(event: &InboundEvent) -> &str {
    if event.sender_name.is_empty() {
        &event.sender_id
    } else {
        &event.sender_name
    }
}

#[derive(Debug)]
struct PendingBuffer {
    events: Vec<InboundEvent>,
    opened_at: Instant,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Per-conversation debounce buffers feeding a turn channel
#[derive(Debug, Clone)]
pub struct MergeBuffer {
    pending: Arc<Mutex<HashMap<String, PendingBuffer>>>,
    out: mpsc::UnboundedSender<Turn>,
}

impl MergeBuffer {
    /// Create a buffer that emits flushed turns on `out`
    #[must_use]
    pub fn new(out: mpsc::UnboundedSender<Turn>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            out,
        }
    }

    /// Accept one event
    ///
    /// Must be called from within a Tokio runtime; timers are spawned tasks.
    pub fn push(&self, event: InboundEvent, window: Duration, max_wait: Duration) {
        let key = event.conversation_id.clone();

        if window.is_zero() || event.content_kind == ContentKind::Voice {
            let mut pending = lock(&self.pending);
            if let Some(buffer) = pending.remove(&key) {
                self.emit(buffer);
            }
            drop(pending);
            self.send(Turn::from_events(vec![event]));
            return;
        }

        let mut pending = lock(&self.pending);
        let buffer = pending.entry(key.clone()).or_insert_with(|| PendingBuffer {
            events: Vec::new(),
            opened_at: Instant::now(),
            generation: 0,
            timer: None,
        });
        buffer.events.push(event);
        buffer.generation += 1;
        if let Some(timer) = buffer.timer.take() {
            timer.abort();
        }

        let remaining = max_wait.saturating_sub(buffer.opened_at.elapsed());
        if remaining.is_zero() {
            if let Some(buffer) = pending.remove(&key) {
                self.emit(buffer);
            }
            return;
        }

        let delay = window.min(remaining);
        let generation = buffer.generation;
        let this = self.clone();
        buffer.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire(&key, generation);
        }));
    }

    /// Flush every open buffer immediately
    pub fn flush_all(&self) {
        let drained: Vec<PendingBuffer> = lock(&self.pending).drain().map(|(_, b)| b).collect();
        for buffer in drained {
            self.emit(buffer);
        }
    }

    /// Drop every open buffer without emitting
    pub fn discard_all(&self) -> usize {
        let drained: Vec<PendingBuffer> = lock(&self.pending).drain().map(|(_, b)| b).collect();
        for buffer in &drained {
            if let Some(timer) = &buffer.timer {
                timer.abort();
            }
        }
        drained.len()
    }

    /// Conversations with an open buffer
    #[must_use]
    pub fn open_buffers(&self) -> usize {
        lock(&self.pending).len()
    }

    fn fire(&self, key: &str, generation: u64) {
        let mut pending = lock(&self.pending);
        // a newer event re-armed the buffer after this timer woke
        if pending.get(key).is_none_or(|b| b.generation != generation) {
            return;
        }
        if let Some(mut buffer) = pending.remove(key) {
            drop(pending);
            // this task is the timer; do not abort it
            buffer.timer = None;
            self.emit(buffer);
        }
    }

    fn emit(&self, mut buffer: PendingBuffer) {
        if let Some(timer) = buffer.timer.take() {
            timer.abort();
        }
        if buffer.events.is_empty() {
            return;
        }
        let count = buffer.events.len();
        let turn = Turn::from_events(buffer.events);
        tracing::debug!(
            conversation = %turn.conversation_id,
            events = count,
            waited_ms = buffer.opened_at.elapsed().as_millis(),
            "merge buffer flushed"
        );
        self.send(turn);
    }

    fn send(&self, turn: Turn) {
        if self.out.send(turn).is_err() {
            tracing::warn!("turn receiver dropped, merged turn discarded");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(content: &str) -> InboundEvent {
        InboundEvent::text("A", "alice", content)
    }

    async fn at(start: Instant, secs: f64) {
        tokio::time::sleep_until(start + Duration::from_secs_f64(secs)).await;
    }

    // -- turn folding ---------------------------------------------------------

    #[test]
    fn folds_contents_in_arrival_order() {
        let turn = Turn::from_events(vec![event("one"), event("two"), event("three")]);
        assert_eq!(turn.content, "one\ntwo\nthree");
        assert_eq!(turn.event_count(), 3);
        assert_eq!(turn.sender_id, "alice");
    }

    #[test]
    fn labels_lines_for_multi_sender_groups() {
        let a = InboundEvent::text("G", "alice", "hi").in_group(false);
        let mut b = InboundEvent::text("G", "bob", "@bot hello").in_group(true);
        b.sender_name = "Bob".to_string();

        let turn = Turn::from_events(vec![a, b]);
        assert_eq!(turn.content, "alice: hi\nBob: @bot hello");
        assert!(turn.mentions_me);
        assert_eq!(turn.sender_name, "Bob");
    }

    // -- debounce -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn zero_window_passes_through() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = MergeBuffer::new(tx);

        buffer.push(event("a"), Duration::ZERO, Duration::from_secs(10));
        buffer.push(event("b"), Duration::ZERO, Duration::from_secs(10));

        assert_eq!(rx.recv().await.unwrap().content, "a");
        assert_eq!(rx.recv().await.unwrap().content, "b");
        assert_eq!(buffer.open_buffers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_events_produce_one_turn() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = MergeBuffer::new(tx);
        let window = Duration::from_secs(3);
        let max_wait = Duration::from_secs(10);
        let start = Instant::now();

        for (t, text) in [(0.0, "m1"), (1.0, "m2"), (2.0, "m3"), (3.5, "m4")] {
            at(start, t).await;
            buffer.push(event(text), window, max_wait);
        }

        // the last event re-armed the window
        at(start, 6.4).await;
        assert!(rx.try_recv().is_err());

        let turn = rx.recv().await.unwrap();
        let flushed = start.elapsed().as_secs_f64();
        assert!((6.4..=6.6).contains(&flushed), "flushed at {flushed}");
        assert_eq!(turn.content, "m1\nm2\nm3\nm4");

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_caps_the_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = MergeBuffer::new(tx);
        let window = Duration::from_secs(3);
        let max_wait = Duration::from_secs(5);
        let start = Instant::now();

        for (t, text) in [(0.0, "a"), (2.0, "b"), (4.0, "c")] {
            at(start, t).await;
            buffer.push(event(text), window, max_wait);
        }

        let turn = rx.recv().await.unwrap();
        let flushed = start.elapsed().as_secs_f64();
        assert!((4.9..=5.1).contains(&flushed), "flushed at {flushed}");
        assert_eq!(turn.content, "a\nb\nc");

        at(start, 6.0).await;
        buffer.push(event("d"), window, max_wait);
        assert_eq!(rx.recv().await.unwrap().content, "d");
    }

    #[tokio::test(start_paused = true)]
    async fn conversations_buffer_independently() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = MergeBuffer::new(tx);
        let window = Duration::from_secs(1);

        buffer.push(InboundEvent::text("A", "a", "from a"), window, window * 10);
        buffer.push(InboundEvent::text("B", "b", "from b"), window, window * 10);

        let mut got = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        got.sort_by(|x, y| x.conversation_id.cmp(&y.conversation_id));
        assert_eq!(got[0].content, "from a");
        assert_eq!(got[1].content, "from b");
    }

    #[tokio::test(start_paused = true)]
    async fn voice_flushes_pending_then_bypasses() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = MergeBuffer::new(tx);
        let window = Duration::from_secs(5);

        buffer.push(event("typed"), window, window * 2);
        buffer.push(event("spoken").voice(), window, window * 2);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.content, "typed");
        assert_eq!(second.content, "spoken");
        assert_eq!(second.content_kind, ContentKind::Voice);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_emits_open_buffers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = MergeBuffer::new(tx);
        buffer.push(event("pending"), Duration::from_secs(60), Duration::from_secs(60));

        buffer.flush_all();
        assert_eq!(rx.recv().await.unwrap().content, "pending");

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }
}
