//! Prompt context assembly
//!
//! Builds the bounded, role-preserving message list sent upstream for one
//! turn from the system template, in-memory history, persisted memory, the
//! conversation profile, and the detected emotion.

mod builder;
pub mod emotion;
pub mod tokens;

use serde::{Deserialize, Serialize};

pub use builder::{AssembledContext, ContextAssembler, ContextInputs, ContextLimits, PromptVars, render_template};
pub use emotion::{Emotion, EmotionState, detect_emotion, emotion_analysis_prompt, parse_emotion_reply};
pub use tokens::{MESSAGE_OVERHEAD_TOKENS, estimate_message_tokens, estimate_messages, estimate_tokens};

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message in a chat-completion request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}
