//! Parley Gateway - auto-reply orchestration between chat clients and
//! language models
//!
//! This library provides the reply pipeline behind the `parley` binary:
//! - Conversation registry with per-conversation turn ordering
//! - Message merging, filtering, and context assembly
//! - Preset selection and retrying calls to chat-completion endpoints
//! - Reply splitting and paced delivery
//! - A control API for lifecycle, config edits, and the loopback driver
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Driver (chat client)                 │
//! └────────────────────┬────────────────────────────────┘
//!                      │ inbound events
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Orchestrator                      │
//! │  Registry │ Merge │ Filter │ Context │ Dispatch     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          Upstream (OpenAI-compatible presets)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod context;
pub mod db;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod filter;
pub mod merge;
pub mod orchestrator;
pub mod registry;
pub mod upstream;

pub use config::{BotConfig, ConfigSnapshot, ConfigStore, PresetConfig};
pub use db::{DbConn, DbPool, MemoryStore};
pub use driver::{Driver, InboundEvent, LoopbackDriver};
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, RunState, StatusReport, TurnOutcome, TurnRecord};
pub use upstream::{ChatBackend, UpstreamClient, UpstreamError};
