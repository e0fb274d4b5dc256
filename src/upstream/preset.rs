//! Preset candidate ordering and health

use serde::Serialize;

use super::ChatRequest;
use crate::config::{ConfigSnapshot, PresetConfig};
use crate::context::ChatMessage;

/// Last known health of a preset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetHealth {
    /// Not probed since the last selection
    #[default]
    Unprobed,
    /// Answered the probe
    Probed,
    /// Skipped or failed the probe
    Failed,
}

/// Probe result for one preset
#[derive(Debug, Clone, Serialize)]
pub struct PresetStatus {
    pub name: String,
    pub alias: String,
    pub model: String,
    pub priority: i32,
    pub health: PresetHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub active: bool,
}

impl PresetStatus {
    #[must_use]
    pub fn new(preset: &PresetConfig, health: PresetHealth, last_error: Option<String>) -> Self {
        Self {
            name: preset.name.clone(),
            alias: preset.alias.clone(),
            model: preset.model.clone(),
            priority: preset.priority,
            health,
            last_error,
            active: false,
        }
    }
}

/// Presets in probe order
///
/// The active preset comes first, then the rest by ascending priority;
/// ties keep file order.
#[must_use]
pub fn candidate_order(snapshot: &ConfigSnapshot) -> Vec<&PresetConfig> {
    let active = snapshot.active_preset.as_deref();

    let mut rest: Vec<&PresetConfig> = snapshot
        .presets
        .iter()
        .filter(|p| Some(p.name.as_str()) != active)
        .collect();
    rest.sort_by_key(|p| p.priority);

    let mut order: Vec<&PresetConfig> = active
        .and_then(|name| snapshot.preset(name))
        .into_iter()
        .collect();
    order.extend(rest);
    order
}

/// Why a preset cannot be used without contacting it, if it cannot
#[must_use]
pub fn unusable_reason(preset: &PresetConfig) -> Option<&'static str> {
    if preset.base_url.trim().is_empty() {
        return Some("missing base_url");
    }
    if preset.model.trim().is_empty() {
        return Some("missing model");
    }
    if !preset.allow_empty_key {
        if preset.api_key.is_none() {
            return Some("missing api_key");
        }
        if preset.has_placeholder_key() {
            return Some("placeholder api_key");
        }
    }
    None
}

/// Minimal request used to check a preset answers
#[must_use]
pub fn probe_request(preset: &PresetConfig) -> ChatRequest {
    ChatRequest {
        model: preset.model.clone(),
        messages: vec![ChatMessage::user("ping")],
        temperature: 0.0,
        max_tokens: 1,
        stream: false,
    }
}
