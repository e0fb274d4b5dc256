//! Configuration management for the Parley gateway
//!
//! Configuration is consumed as immutable [`ConfigSnapshot`] values. A reload
//! or an edit through the control API builds a new snapshot and swaps it in
//! through [`ConfigStore`]; running stages never see fields change under them.

pub mod file;
mod store;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

pub use store::{ConfigStore, ConfigUpdate, PresetUpdate, mask_secret};

/// Default API server port
pub const DEFAULT_PORT: u16 = 18790;

/// Upper bound applied to every preset's `timeout_sec`
pub const MAX_TIMEOUT_SEC: f64 = 10.0;

/// Lower bound applied to every preset's `timeout_sec`
pub const MIN_TIMEOUT_SEC: f64 = 1.0;

/// Upper bound applied to every preset's `max_retries`
pub const MAX_RETRIES_CAP: u32 = 2;

/// Immutable view of the full runtime configuration
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// HTTP API server and storage settings
    pub server: ServerConfig,

    /// Name of the preset to try first when probing
    pub active_preset: Option<String>,

    /// Upstream presets in file order
    pub presets: Vec<PresetConfig>,

    /// Pipeline behaviour
    pub bot: BotConfig,

    /// Log output settings
    pub logging: LoggingConfig,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            active_preset: None,
            presets: Vec::new(),
            bot: BotConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ConfigSnapshot {
    /// Look up a preset by name
    #[must_use]
    pub fn preset(&self, name: &str) -> Option<&PresetConfig> {
        self.presets.iter().find(|p| p.name == name)
    }

    /// Fingerprint of everything that influences preset selection
    ///
    /// Two snapshots with the same signature select the same preset, so a
    /// reload that leaves it unchanged does not trigger re-probing.
    #[must_use]
    pub fn api_signature(&self) -> String {
        let presets: Vec<serde_json::Value> = self
            .presets
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "base_url": p.base_url,
                    "model": p.model,
                    "api_key": p.api_key.as_ref().map(|k| k.expose_secret().to_string()),
                    "timeout_sec": p.timeout_sec,
                    "max_retries": p.max_retries,
                    "temperature": p.temperature,
                    "max_tokens": p.max_tokens,
                    "allow_empty_key": p.allow_empty_key,
                    "priority": p.priority,
                })
            })
            .collect();

        serde_json::json!({
            "active_preset": self.active_preset,
            "presets": presets,
        })
        .to_string()
    }
}

/// HTTP API server and storage configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the control API binds to
    pub host: IpAddr,

    /// Port to listen on
    pub port: u16,

    /// Bearer key required by the control API (from `PARLEY_API_KEY`)
    pub api_key: Option<String>,

    /// `SQLite` database path
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            api_key: None,
            db_path: default_db_path(),
        }
    }
}

/// A named upstream language-model configuration
#[derive(Debug)]
pub struct PresetConfig {
    /// Unique preset name
    pub name: String,

    /// Display alias used in reply suffixes
    pub alias: String,

    /// Endpoint base URL (e.g. `https://api.openai.com/v1`)
    pub base_url: String,

    /// Bearer credential
    pub api_key: Option<SecretString>,

    /// Model identifier
    pub model: String,

    /// Request timeout in seconds
    pub timeout_sec: f64,

    /// Retries for transient failures
    pub max_retries: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Completion token limit
    pub max_tokens: u32,

    /// Accept presets without a credential (local endpoints)
    pub allow_empty_key: bool,

    /// Probe priority; lower goes first after the active preset
    pub priority: i32,
}

impl Clone for PresetConfig {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            alias: self.alias.clone(),
            base_url: self.base_url.clone(),
            api_key: self
                .api_key
                .as_ref()
                .map(|k| SecretString::from(k.expose_secret().to_string())),
            model: self.model.clone(),
            timeout_sec: self.timeout_sec,
            max_retries: self.max_retries,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            allow_empty_key: self.allow_empty_key,
            priority: self.priority,
        }
    }
}

impl PresetConfig {
    /// Create a preset with default tuning values
    #[must_use]
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            alias: name.clone(),
            name,
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            timeout_sec: MAX_TIMEOUT_SEC,
            max_retries: MAX_RETRIES_CAP,
            temperature: 0.6,
            max_tokens: 512,
            allow_empty_key: false,
            priority: 0,
        }
    }

    /// Attach a credential
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    /// Request timeout as a [`Duration`], within `[MIN_TIMEOUT_SEC, MAX_TIMEOUT_SEC]`
    #[must_use]
    pub fn timeout(&self) -> Duration {
        secs(clamp_timeout(self.timeout_sec))
    }

    /// Whether the credential is missing or an obvious placeholder
    #[must_use]
    pub fn has_placeholder_key(&self) -> bool {
        self.api_key
            .as_ref()
            .is_none_or(|k| is_placeholder_key(k.expose_secret()))
    }
}

/// Detect credentials that were never filled in
///
/// Empty strings, template values such as `YOUR_API_KEY`, and short strings
/// containing `KEY` are treated as unset.
#[must_use]
pub fn is_placeholder_key(key: &str) -> bool {
    let key = key.trim();
    if key.is_empty() {
        return true;
    }
    let upper = key.to_uppercase();
    upper.starts_with("YOUR_") || (upper.contains("KEY") && key.len() < 10)
}

/// How quoted replies are rendered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteMode {
    /// No quote
    #[default]
    None,
    /// Prefix the first chunk with a rendered quote
    Text,
}

/// Emoji handling in outgoing replies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmojiPolicy {
    /// Send emoji unchanged
    #[default]
    Keep,
    /// Remove emoji
    Strip,
}

/// Emotion detection mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionMode {
    /// Disabled
    #[default]
    Off,
    /// Keyword matching against the turn content
    Keywords,
    /// Ask the active preset, falling back to keywords
    Ai,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level directive when `RUST_LOG` is unset and `-v` is not given
    pub level: String,

    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Pipeline behaviour
///
/// Durations are stored as fractional seconds, matching the file format;
/// accessor methods convert them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct BotConfig {
    /// Display name of the account the gateway replies as
    pub self_name: String,
    /// Base system prompt template
    pub system_prompt: String,
    /// Per-conversation prompt templates keyed by display name
    pub system_prompt_overrides: std::collections::BTreeMap<String, String>,
    /// Suffix appended to each reply; `{alias}` and `{model}` are substituted
    pub reply_suffix: String,
    pub emoji_policy: EmojiPolicy,
    /// Strip boilerplate assistant phrasing from replies
    pub refine_replies: bool,
    pub reply_quote_mode: QuoteMode,
    /// Template for quoted source text; `{content}` is substituted
    pub reply_quote_template: String,
    pub reply_quote_max_chars: usize,

    /// Persisted records injected per turn
    pub memory_context_limit: usize,
    /// Record lifetime; 0 keeps records forever
    pub memory_ttl_sec: u64,
    pub memory_cleanup_interval_sec: u64,

    /// In-memory rounds (user + assistant pairs) kept per conversation
    pub context_rounds: usize,
    /// Estimated token budget for the assembled prompt; 0 disables the cap
    pub context_max_tokens: usize,
    /// Profile facts injected into the prompt
    pub profile_max_facts: usize,

    pub profile_enabled: bool,
    /// Message-count cadence for profile fact refresh
    pub profile_update_every: u64,
    /// Facts retained per profile
    pub max_profile_facts: usize,
    pub emotion_mode: EmotionMode,

    /// Registry capacity
    pub history_max_chats: usize,
    /// Idle time before a conversation is evicted; 0 disables
    pub history_ttl_sec: u64,

    pub poll_interval_min_sec: f64,
    pub poll_interval_max_sec: f64,
    pub poll_backoff_factor: f64,

    /// Minimum spacing between two sends to one conversation
    pub min_reply_interval_sec: f64,
    /// Random pre-send delay range
    pub random_delay_range_sec: [f64; 2],

    /// Global bound on in-flight upstream calls
    pub max_concurrency: usize,

    /// Idle time after which the driver is reconnected; 0 disables
    pub keepalive_idle_sec: u64,
    pub reconnect_max_retries: u32,
    pub reconnect_base_delay_sec: f64,
    pub reconnect_max_delay_sec: f64,

    /// Debounce window; 0 passes events through
    pub merge_user_messages_sec: f64,
    /// Ceiling measured from buffer open
    pub merge_user_messages_max_wait_sec: f64,

    /// Mute every conversation
    pub filter_mute: bool,
    pub ignore_names: Vec<String>,
    pub ignore_keywords: Vec<String>,
    pub ignore_chat_types: Vec<String>,
    pub group_reply_only_when_at: bool,
    pub whitelist_enabled: bool,
    pub whitelist: Vec<String>,

    pub quiet_hours_enabled: bool,
    /// `HH:MM`
    pub quiet_hours_start: String,
    /// `HH:MM`
    pub quiet_hours_end: String,
    /// Canned reply sent during quiet hours; empty drops silently
    pub quiet_hours_reply: String,

    pub natural_split_enabled: bool,
    pub natural_split_min_chars: usize,
    pub natural_split_max_chars: usize,
    pub natural_split_max_segments: usize,
    pub natural_split_delay_sec: [f64; 2],
    /// Fixed chunk length in characters
    pub reply_chunk_size: usize,
    pub reply_chunk_delay_sec: f64,

    /// Dispatch deltas as they arrive instead of waiting for the full reply
    pub stream_reply: bool,
    /// Buffered characters before a streamed chunk may be cut
    pub stream_buffer_chars: usize,
    /// Hard cut for streamed chunks without punctuation
    pub stream_chunk_max_chars: usize,

    /// Reply sent when a turn fails; empty sends nothing
    pub fallback_reply: String,

    pub control_commands_enabled: bool,
    pub control_command_prefix: String,
    /// Senders allowed to issue control commands; empty allows everyone
    pub control_allowed_users: Vec<String>,

    /// Config file poll interval
    pub config_reload_sec: f64,
    /// Re-probe presets when upstream settings change
    pub reload_ai_client_on_change: bool,

    /// Time granted to in-flight turns on stop
    pub shutdown_grace_sec: f64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            self_name: String::new(),
            system_prompt: "You are {self_name}, chatting with {sender} in {name}. Reply naturally and briefly.".to_string(),
            system_prompt_overrides: std::collections::BTreeMap::new(),
            reply_suffix: String::new(),
            emoji_policy: EmojiPolicy::Keep,
            refine_replies: true,
            reply_quote_mode: QuoteMode::None,
            reply_quote_template: "> {content}\n".to_string(),
            reply_quote_max_chars: 120,
            memory_context_limit: 12,
            memory_ttl_sec: 0,
            memory_cleanup_interval_sec: 3600,
            context_rounds: 4,
            context_max_tokens: 1200,
            profile_max_facts: 5,
            profile_enabled: true,
            profile_update_every: 10,
            max_profile_facts: 20,
            emotion_mode: EmotionMode::Off,
            history_max_chats: 120,
            history_ttl_sec: 0,
            poll_interval_min_sec: 0.05,
            poll_interval_max_sec: 1.0,
            poll_backoff_factor: 1.2,
            min_reply_interval_sec: 0.1,
            random_delay_range_sec: [0.1, 0.3],
            max_concurrency: 5,
            keepalive_idle_sec: 0,
            reconnect_max_retries: 3,
            reconnect_base_delay_sec: 2.0,
            reconnect_max_delay_sec: 20.0,
            merge_user_messages_sec: 0.0,
            merge_user_messages_max_wait_sec: 10.0,
            filter_mute: false,
            ignore_names: Vec::new(),
            ignore_keywords: Vec::new(),
            ignore_chat_types: vec!["official".to_string(), "service".to_string()],
            group_reply_only_when_at: true,
            whitelist_enabled: false,
            whitelist: Vec::new(),
            quiet_hours_enabled: false,
            quiet_hours_start: "23:00".to_string(),
            quiet_hours_end: "07:00".to_string(),
            quiet_hours_reply: String::new(),
            natural_split_enabled: false,
            natural_split_min_chars: 30,
            natural_split_max_chars: 150,
            natural_split_max_segments: 5,
            natural_split_delay_sec: [0.8, 2.0],
            reply_chunk_size: 500,
            reply_chunk_delay_sec: 0.2,
            stream_reply: false,
            stream_buffer_chars: 40,
            stream_chunk_max_chars: 300,
            fallback_reply: String::new(),
            control_commands_enabled: true,
            control_command_prefix: "/".to_string(),
            control_allowed_users: Vec::new(),
            config_reload_sec: 2.0,
            reload_ai_client_on_change: true,
            shutdown_grace_sec: 5.0,
        }
    }
}

impl BotConfig {
    /// Merge debounce window
    #[must_use]
    pub fn merge_window(&self) -> Duration {
        secs(self.merge_user_messages_sec)
    }

    /// Merge ceiling from buffer open
    #[must_use]
    pub fn merge_max_wait(&self) -> Duration {
        secs(self.merge_user_messages_max_wait_sec)
    }

    /// Minimum spacing between sends to one conversation
    #[must_use]
    pub fn min_reply_interval(&self) -> Duration {
        secs(self.min_reply_interval_sec)
    }

    /// Memory record lifetime, if any
    #[must_use]
    pub const fn memory_ttl(&self) -> Option<Duration> {
        if self.memory_ttl_sec == 0 {
            None
        } else {
            Some(Duration::from_secs(self.memory_ttl_sec))
        }
    }

    /// Registry idle eviction, if any
    #[must_use]
    pub const fn history_ttl(&self) -> Option<Duration> {
        if self.history_ttl_sec == 0 {
            None
        } else {
            Some(Duration::from_secs(self.history_ttl_sec))
        }
    }

    /// Keepalive idle timeout, if any
    #[must_use]
    pub const fn keepalive_idle(&self) -> Option<Duration> {
        if self.keepalive_idle_sec == 0 {
            None
        } else {
            Some(Duration::from_secs(self.keepalive_idle_sec))
        }
    }

    /// Config file poll interval
    #[must_use]
    pub fn config_reload_interval(&self) -> Duration {
        secs(self.config_reload_sec.max(0.1))
    }

    /// Grace period granted to in-flight turns on stop
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        secs(self.shutdown_grace_sec)
    }
}

/// Convert fractional seconds to a [`Duration`], clamping negatives and NaN to zero
#[must_use]
/// Bound a timeout setting; non-finite values fall back to the maximum
#[must_use]
pub fn clamp_timeout(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(MIN_TIMEOUT_SEC, MAX_TIMEOUT_SEC)
    } else {
        MAX_TIMEOUT_SEC
    }
}

pub fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

/// Default database location: `<data dir>/parley/parley.db`
#[must_use]
pub fn default_db_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("parley.db"),
        |d| d.data_dir().join("parley").join("parley.db"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_keys_are_detected() {
        assert!(is_placeholder_key(""));
        assert!(is_placeholder_key("   "));
        assert!(is_placeholder_key("YOUR_API_KEY_HERE"));
        assert!(is_placeholder_key("your_key"));
        assert!(is_placeholder_key("API_KEY"));
        assert!(!is_placeholder_key("sk-live-0123456789abcdef"));
        assert!(!is_placeholder_key("sk-KEY-0123456789"));
    }

    #[test]
    fn preset_without_key_is_placeholder() {
        let preset = PresetConfig::new("p", "http://localhost", "m");
        assert!(preset.has_placeholder_key());
        let preset = preset.with_api_key("sk-0123456789abcdef");
        assert!(!preset.has_placeholder_key());
    }

    #[test]
    fn api_signature_tracks_credentials() {
        let mut a = ConfigSnapshot::default();
        a.presets
            .push(PresetConfig::new("p", "http://localhost", "m").with_api_key("sk-aaaaaaaaaaaa"));
        let mut b = a.clone();
        assert_eq!(a.api_signature(), b.api_signature());

        b.presets[0] = PresetConfig::new("p", "http://localhost", "m").with_api_key("sk-bbbbbbbbbbbb");
        assert_ne!(a.api_signature(), b.api_signature());

        a.bot.self_name = "bot".to_string();
        b.presets[0] = a.presets[0].clone();
        assert_eq!(a.api_signature(), b.api_signature());
    }

    #[test]
    fn secs_clamps_invalid_values() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(1.5), Duration::from_millis(1500));
    }

    #[test]
    fn bot_config_optional_durations() {
        let mut bot = BotConfig::default();
        assert!(bot.memory_ttl().is_none());
        assert!(bot.keepalive_idle().is_none());
        bot.memory_ttl_sec = 60;
        assert_eq!(bot.memory_ttl(), Some(Duration::from_secs(60)));
    }
}
