//! In-process driver backed by queues
//!
//! Inbound events are pushed with [`LoopbackDriver::inject`] (the control API
//! exposes this) and every send lands in an outbox that can be inspected.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Driver, InboundEvent};
use crate::{Error, Result};

/// A message delivered through the loopback driver
#[derive(Debug, Clone, Serialize)]
pub struct SentMessage {
    pub conversation_id: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    /// Monotonic send time (follows the paused clock in tests)
    #[serde(skip)]
    pub instant: Instant,
}

/// Queue-backed [`Driver`]
#[derive(Debug)]
pub struct LoopbackDriver {
    inbound: Mutex<VecDeque<InboundEvent>>,
    outbox: Mutex<Vec<SentMessage>>,
    sent: Notify,
    connected: AtomicBool,
    refuse_reconnect: AtomicBool,
    reconnects: AtomicU32,
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackDriver {
    /// Create a connected driver with empty queues
    #[must_use]
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(VecDeque::new()),
            outbox: Mutex::new(Vec::new()),
            sent: Notify::new(),
            connected: AtomicBool::new(true),
            refuse_reconnect: AtomicBool::new(false),
            reconnects: AtomicU32::new(0),
        }
    }

    /// Queue an inbound event for the next poll
    pub fn inject(&self, event: InboundEvent) {
        lock(&self.inbound).push_back(event);
    }

    /// Snapshot of everything sent so far
    #[must_use]
    pub fn outbox(&self) -> Vec<SentMessage> {
        lock(&self.outbox).clone()
    }

    /// Messages sent to one conversation
    #[must_use]
    pub fn sent_to(&self, conversation_id: &str) -> Vec<String> {
        lock(&self.outbox)
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.text.clone())
            .collect()
    }

    /// Wait until at least `count` messages were sent, or the timeout elapses
    ///
    /// Returns `true` when the count was reached.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.sent.notified();
            if lock(&self.outbox).len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return lock(&self.outbox).len() >= count;
            }
        }
    }

    /// Simulate a dropped client session
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every reconnect attempt fail
    pub fn refuse_reconnect(&self, refuse: bool) {
        self.refuse_reconnect.store(refuse, Ordering::SeqCst);
    }

    /// Number of reconnect attempts observed
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for LoopbackDriver {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn poll_events(&self) -> Result<Vec<InboundEvent>> {
        if !self.is_connected() {
            return Err(Error::Driver("loopback driver disconnected".to_string()));
        }
        Ok(lock(&self.inbound).drain(..).collect())
    }

    async fn send(&self, conversation_id: &str, text: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Driver("loopback driver disconnected".to_string()));
        }
        lock(&self.outbox).push(SentMessage {
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            sent_at: Utc::now(),
            instant: Instant::now(),
        });
        self.sent.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_reconnect.load(Ordering::SeqCst) {
            return Err(Error::Driver("reconnect refused".to_string()));
        }
        self.set_connected(true);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
