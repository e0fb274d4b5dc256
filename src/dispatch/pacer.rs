//! Paced delivery of reply chunks

use std::time::Duration;

use tokio::time::Instant;

use super::planner::{Chunk, ReplyPlan};
use crate::driver::Driver;
use crate::registry::Conversation;
use crate::{Error, Result};

/// A plan that stopped part way through
#[derive(Debug)]
pub struct PartialDelivery {
    pub error: Error,
    /// Chunks delivered before the failure
    pub sent: usize,
}

/// Enforces per-conversation send spacing
///
/// A chunk goes out no earlier than its own delay after the previous send,
/// and never within `min_interval` of the conversation's last reply.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    min_interval: Duration,
}

impl Pacer {
    #[must_use]
    pub const fn new(min_interval: Duration) -> Self {
        Self { min_interval }
    }

    /// Earliest instant the next chunk may be sent
    #[must_use]
    pub fn earliest_send(&self, conversation: &Conversation, delay: Duration, now: Instant) -> Instant {
        let by_delay = now + delay;
        conversation
            .last_reply()
            .map(|last| last + self.min_interval)
            .map_or(by_delay, |by_interval| by_delay.max(by_interval))
    }

    /// Wait for the chunk's slot, send it, and stamp the conversation
    ///
    /// # Errors
    ///
    /// Returns error if the driver rejects the send
    pub async fn send_chunk(&self, driver: &dyn Driver, conversation: &Conversation, chunk: &Chunk) -> Result<()> {
        let at = self.earliest_send(conversation, chunk.delay, Instant::now());
        tokio::time::sleep_until(at).await;

        match &chunk.quote {
            Some(quote) => driver.send_quoted(conversation.id(), &chunk.text, quote).await?,
            None => driver.send(conversation.id(), &chunk.text).await?,
        }
        conversation.mark_replied(Instant::now());
        Ok(())
    }

    /// Deliver a whole plan in order
    ///
    /// The caller must hold the conversation's turn lock. Stops at the first
    /// failed send; chunks already sent stay sent and are counted in the error.
    ///
    /// # Errors
    ///
    /// Returns [`PartialDelivery`] if a send fails
    pub async fn dispatch(
        &self,
        driver: &dyn Driver,
        conversation: &Conversation,
        plan: &ReplyPlan,
    ) -> std::result::Result<usize, PartialDelivery> {
        for (sent, chunk) in plan.chunks.iter().enumerate() {
            if let Err(error) = self.send_chunk(driver, conversation, chunk).await {
                tracing::warn!(
                    conversation = %conversation.id(),
                    sent,
                    total = plan.len(),
                    error = %error,
                    "reply dispatch interrupted"
                );
                return Err(PartialDelivery { error, sent });
            }
        }
        tracing::debug!(conversation = %conversation.id(), chunks = plan.len(), "reply dispatched");
        Ok(plan.len())
    }
}
