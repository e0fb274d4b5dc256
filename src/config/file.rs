//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as the persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use super::{
    BotConfig, ConfigSnapshot, LoggingConfig, MAX_RETRIES_CAP, MAX_TIMEOUT_SEC, PresetConfig,
    ServerConfig, clamp_timeout,
};
use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ParleyConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Upstream preset configuration
    #[serde(default)]
    pub api: ApiFileConfig,

    /// Pipeline configuration
    #[serde(default)]
    pub bot: BotConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    /// API bind address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// API server port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Control API bearer key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// `SQLite` database path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

/// Upstream configuration
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ApiFileConfig {
    /// Preset tried first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_preset: Option<String>,

    /// Known presets
    #[serde(default)]
    pub presets: Vec<PresetFileConfig>,
}

/// One `[[api.presets]]` entry
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PresetFileConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_empty_key: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl PresetFileConfig {
    /// Resolve against defaults, applying the timeout and retry caps
    #[must_use]
    pub fn resolve(&self) -> PresetConfig {
        let mut preset = PresetConfig::new(
            self.name.clone(),
            self.base_url.clone().unwrap_or_default(),
            self.model.clone().unwrap_or_default(),
        );
        if let Some(alias) = self.alias.as_ref().filter(|a| !a.trim().is_empty()) {
            preset.alias.clone_from(alias);
        }
        if let Some(key) = &self.api_key {
            preset = preset.with_api_key(key.clone());
        }
        preset.timeout_sec = clamp_timeout(self.timeout_sec.unwrap_or(MAX_TIMEOUT_SEC));
        preset.max_retries = self.max_retries.unwrap_or(MAX_RETRIES_CAP).min(MAX_RETRIES_CAP);
        if let Some(t) = self.temperature {
            preset.temperature = t;
        }
        if let Some(m) = self.max_tokens {
            preset.max_tokens = m;
        }
        preset.allow_empty_key = self.allow_empty_key.unwrap_or(false);
        preset.priority = self.priority.unwrap_or(0);
        preset
    }

    /// File representation of a resolved preset, credentials included
    #[must_use]
    pub fn from_preset(preset: &PresetConfig) -> Self {
        Self {
            name: preset.name.clone(),
            alias: Some(preset.alias.clone()),
            base_url: Some(preset.base_url.clone()),
            api_key: preset.api_key.as_ref().map(|k| k.expose_secret().to_string()),
            model: Some(preset.model.clone()),
            timeout_sec: Some(preset.timeout_sec),
            max_retries: Some(preset.max_retries),
            temperature: Some(preset.temperature),
            max_tokens: Some(preset.max_tokens),
            allow_empty_key: Some(preset.allow_empty_key),
            priority: Some(preset.priority),
        }
    }
}

impl ParleyConfigFile {
    /// Parse a TOML document
    ///
    /// # Errors
    ///
    /// Returns error if the document is not valid TOML for this schema
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a config file; a missing file yields defaults
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let parsed = Self::parse(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(parsed)
    }

    /// Build a runtime snapshot from the file contents
    ///
    /// # Errors
    ///
    /// Returns error if two presets share a name
    pub fn into_snapshot(self) -> Result<ConfigSnapshot> {
        let mut presets: Vec<PresetConfig> = Vec::with_capacity(self.api.presets.len());
        for entry in &self.api.presets {
            if entry.name.trim().is_empty() {
                return Err(Error::Config("preset without a name".to_string()));
            }
            if presets.iter().any(|p| p.name == entry.name) {
                return Err(Error::Config(format!("duplicate preset name: {}", entry.name)));
            }
            presets.push(entry.resolve());
        }

        let defaults = ServerConfig::default();
        let host = match self.server.host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
            Some(h) => h
                .parse()
                .map_err(|_| Error::Config(format!("invalid server.host: {h}")))?,
            None => defaults.host,
        };
        let server = ServerConfig {
            host,
            port: self.server.port.unwrap_or(defaults.port),
            api_key: self.server.api_key.filter(|k| !k.is_empty()),
            db_path: self
                .server
                .db_path
                .map_or(defaults.db_path, PathBuf::from),
        };

        Ok(ConfigSnapshot {
            server,
            active_preset: self.api.active_preset.filter(|n| !n.is_empty()),
            presets,
            bot: self.bot,
            logging: self.logging,
        })
    }

    /// File representation of a snapshot, used when persisting edits
    #[must_use]
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Self {
        Self {
            server: ServerFileConfig {
                host: Some(snapshot.server.host.to_string()),
                port: Some(snapshot.server.port),
                api_key: snapshot.server.api_key.clone(),
                db_path: Some(snapshot.server.db_path.display().to_string()),
            },
            api: ApiFileConfig {
                active_preset: snapshot.active_preset.clone(),
                presets: snapshot
                    .presets
                    .iter()
                    .map(PresetFileConfig::from_preset)
                    .collect(),
            },
            bot: snapshot.bot.clone(),
            logging: snapshot.logging.clone(),
        }
    }

    /// Write the file atomically (temp file + rename)
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the write fails
    pub fn write(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Return the default config file path: `~/.config/parley/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parley").join("config.toml"))
}
