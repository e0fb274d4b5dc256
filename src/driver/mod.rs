//! Chat-client driver adapters
//!
//! A driver is the message source and sink of the pipeline. The orchestrator
//! polls it for [`InboundEvent`]s and hands it finished reply chunks; it owns
//! reconnection policy, the driver only offers the primitive.

mod loopback;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use loopback::{LoopbackDriver, SentMessage};

use crate::Result;

/// Conversation kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// One-to-one chat
    #[default]
    Direct,
    /// Multi-party chat
    Group,
}

/// Kind of inbound content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Plain text (images are delivered as text placeholders)
    #[default]
    Text,
    /// Voice note; `content` holds the driver-provided transcript
    Voice,
    /// Anything else (files, cards, system notices)
    Other,
}

/// One raw message observed by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Conversation identifier
    pub conversation_id: String,

    /// Conversation kind
    #[serde(default)]
    pub kind: ConversationKind,

    /// Conversation display name (group name or contact name)
    #[serde(default)]
    pub chat_name: String,

    /// Sender identifier
    pub sender_id: String,

    /// Sender display name
    #[serde(default)]
    pub sender_name: String,

    /// Observation time
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Message text
    pub content: String,

    /// Content kind
    #[serde(default)]
    pub content_kind: ContentKind,

    /// Whether the message mentions the gateway account
    #[serde(default)]
    pub mentions_me: bool,

    /// Message sent by the gateway account itself
    #[serde(default)]
    pub is_self: bool,

    /// Platform chat type (e.g. "friend", "group", "official")
    #[serde(default)]
    pub chat_type: Option<String>,
}

impl InboundEvent {
    /// Create a direct-chat text event
    #[must_use]
    pub fn text(
        conversation_id: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let sender = sender.into();
        Self {
            chat_name: conversation_id.clone(),
            conversation_id,
            kind: ConversationKind::Direct,
            sender_name: sender.clone(),
            sender_id: sender,
            timestamp: Utc::now(),
            content: content.into(),
            content_kind: ContentKind::Text,
            mentions_me: false,
            is_self: false,
            chat_type: None,
        }
    }

    /// Mark as a group message
    #[must_use]
    pub fn in_group(mut self, mentions_me: bool) -> Self {
        self.kind = ConversationKind::Group;
        self.mentions_me = mentions_me;
        self
    }

    /// Mark as a voice message
    #[must_use]
    pub const fn voice(mut self) -> Self {
        self.content_kind = ContentKind::Voice;
        self
    }
}

/// Message source and sink for one chat client
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver name for logs
    fn name(&self) -> &'static str;

    /// Drain events observed since the last poll; empty when idle
    ///
    /// # Errors
    ///
    /// Returns error if the client cannot be read
    async fn poll_events(&self) -> Result<Vec<InboundEvent>>;

    /// Send one message to a conversation
    ///
    /// # Errors
    ///
    /// Returns error if the client rejects the send
    async fn send(&self, conversation_id: &str, text: &str) -> Result<()>;

    /// Send a message quoting an earlier one
    ///
    /// Clients without native quoting get the rendered quote prepended.
    ///
    /// # Errors
    ///
    /// Returns error if the client rejects the send
    async fn send_quoted(&self, conversation_id: &str, text: &str, quote: &str) -> Result<()> {
        self.send(conversation_id, &format!("{quote}{text}")).await
    }

    /// Whether the client session is alive
    fn is_connected(&self) -> bool;

    /// Re-establish the client session
    ///
    /// # Errors
    ///
    /// Returns error if the attempt fails
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }
}
