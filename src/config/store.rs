//! Snapshot store with file polling and control-API edits
//!
//! Credential merge-on-edit: an incoming preset whose `api_key` is absent,
//! empty, or masked (contains `****`) keeps the key stored for the preset of
//! the same name, as long as its `base_url` is unchanged. Moving a preset to
//! another endpoint requires a fresh key, and a masked key with no stored
//! counterpart is rejected. Keys are only removed through an explicit
//! `clear_api_key`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::watch;

use super::file::{ParleyConfigFile, PresetFileConfig};
use super::{BotConfig, ConfigSnapshot, PresetConfig};
use crate::{Error, Result};

/// Marker that identifies a masked credential
const MASK: &str = "****";

/// Mask a credential for display: `abcd****wxyz`, or `****` when short
#[must_use]
pub fn mask_secret(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 12 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}{MASK}{tail}")
    } else {
        MASK.to_string()
    }
}

/// Environment overrides applied on every load (env > toml > default)
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    host: Option<IpAddr>,
    port: Option<u16>,
    api_key: Option<String>,
    db_path: Option<PathBuf>,
    active_preset: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            host: std::env::var("PARLEY_HOST").ok().and_then(|h| h.trim().parse().ok()),
            port: std::env::var("PARLEY_PORT").ok().and_then(|p| p.parse().ok()),
            api_key: std::env::var("PARLEY_API_KEY").ok().filter(|k| !k.is_empty()),
            db_path: std::env::var("PARLEY_DB").ok().map(PathBuf::from),
            active_preset: std::env::var("PARLEY_ACTIVE_PRESET")
                .ok()
                .filter(|p| !p.is_empty()),
        }
    }

    fn apply(&self, snapshot: &mut ConfigSnapshot) {
        if let Some(host) = self.host {
            snapshot.server.host = host;
        }
        if let Some(port) = self.port {
            snapshot.server.port = port;
        }
        if let Some(key) = &self.api_key {
            snapshot.server.api_key = Some(key.clone());
        }
        if let Some(path) = &self.db_path {
            snapshot.server.db_path.clone_from(path);
        }
        if let Some(name) = &self.active_preset {
            snapshot.active_preset = Some(name.clone());
        }
    }
}

/// Edit submitted through the control API
#[derive(Debug, Default, Deserialize)]
pub struct ConfigUpdate {
    /// New active preset name
    #[serde(default)]
    pub active_preset: Option<String>,

    /// Replacement preset list
    #[serde(default)]
    pub presets: Option<Vec<PresetUpdate>>,

    /// Replacement pipeline settings
    #[serde(default)]
    pub bot: Option<BotConfig>,
}

/// A preset as submitted by an editor
#[derive(Debug, Default, Deserialize)]
pub struct PresetUpdate {
    #[serde(flatten)]
    pub preset: PresetFileConfig,

    /// Remove the stored credential
    #[serde(default)]
    pub clear_api_key: bool,
}

/// Holder of the current [`ConfigSnapshot`]
///
/// Readers take cheap `Arc` clones through [`ConfigStore::current`] or watch
/// for swaps through [`ConfigStore::subscribe`].
pub struct ConfigStore {
    path: Option<PathBuf>,
    overrides: EnvOverrides,
    tx: watch::Sender<Arc<ConfigSnapshot>>,
    last_mtime: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    /// Load from a file path (or defaults when `None`), applying env overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be parsed
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let overrides = EnvOverrides::from_env();
        let mut snapshot = match &path {
            Some(p) => ParleyConfigFile::read(p)?.into_snapshot()?,
            None => ConfigSnapshot::default(),
        };
        overrides.apply(&mut snapshot);

        let mtime = path.as_deref().and_then(modified_at);
        let (tx, _rx) = watch::channel(Arc::new(snapshot));
        Ok(Self {
            path,
            overrides,
            tx,
            last_mtime: Mutex::new(mtime),
        })
    }

    /// Wrap a fixed snapshot with no backing file
    #[must_use]
    pub fn from_snapshot(snapshot: ConfigSnapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(snapshot));
        Self {
            path: None,
            overrides: EnvOverrides::default(),
            tx,
            last_mtime: Mutex::new(None),
        }
    }

    /// Backing file, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current snapshot
    #[must_use]
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every snapshot swap
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.tx.subscribe()
    }

    /// Swap in a new snapshot
    pub fn replace(&self, snapshot: ConfigSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    /// Re-read the backing file when its modification time changed
    ///
    /// Returns `true` when a new snapshot was installed. A file that fails
    /// to parse leaves the current snapshot in place.
    ///
    /// # Errors
    ///
    /// Returns error if the changed file cannot be read or parsed
    pub fn reload_if_changed(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let mtime = modified_at(path);
        {
            let mut last = self
                .last_mtime
                .lock()
                .map_err(|_| Error::Config("config mtime lock poisoned".to_string()))?;
            if *last == mtime {
                return Ok(false);
            }
            *last = mtime;
        }

        let mut snapshot = ParleyConfigFile::read(path)?.into_snapshot()?;
        self.overrides.apply(&mut snapshot);
        tracing::info!(path = %path.display(), "config reloaded");
        self.replace(snapshot);
        Ok(true)
    }

    /// Apply an edit from the control API and persist it
    ///
    /// # Errors
    ///
    /// Returns error if a masked credential cannot be resolved, the active
    /// preset does not exist, or the file cannot be written
    pub fn apply_update(&self, update: ConfigUpdate) -> Result<Arc<ConfigSnapshot>> {
        let current = self.current();
        let mut next = (*current).clone();

        if let Some(presets) = update.presets {
            next.presets = merge_presets(&current.presets, presets)?;
        }
        if let Some(name) = update.active_preset {
            next.active_preset = if name.is_empty() { None } else { Some(name) };
        }
        if let Some(bot) = update.bot {
            next.bot = bot;
        }
        if let Some(active) = &next.active_preset
            && next.preset(active).is_none()
        {
            return Err(Error::Config(format!("unknown active preset: {active}")));
        }

        if let Some(path) = &self.path {
            ParleyConfigFile::from_snapshot(&next).write(path)?;
            if let Ok(mut last) = self.last_mtime.lock() {
                *last = modified_at(path);
            }
        }

        let next = Arc::new(next);
        self.tx.send_replace(next.clone());
        tracing::info!("config updated through control api");
        Ok(next)
    }
}

/// Resolve submitted presets against the stored ones
fn merge_presets(stored: &[PresetConfig], incoming: Vec<PresetUpdate>) -> Result<Vec<PresetConfig>> {
    let mut merged = Vec::with_capacity(incoming.len());
    for update in incoming {
        let name = update.preset.name.clone();
        if name.trim().is_empty() {
            return Err(Error::Config("preset without a name".to_string()));
        }
        if merged.iter().any(|p: &PresetConfig| p.name == name) {
            return Err(Error::Config(format!("duplicate preset name: {name}")));
        }

        let mut preset = update.preset.resolve();
        let submitted = update.preset.api_key.as_deref().map(str::trim);
        let keeps_stored = submitted.is_none_or(|k| k.is_empty() || k.contains(MASK));

        preset.api_key = if update.clear_api_key {
            None
        } else if keeps_stored {
            let existing = stored.iter().find(|p| p.name == name);
            match (existing.and_then(|p| p.api_key.as_ref().map(|k| (p, k))), submitted) {
                (Some((previous, _)), _) if !same_endpoint(&previous.base_url, &preset.base_url) => {
                    return Err(Error::Credential(format!(
                        "preset {name} moved to a new endpoint, a new api key is required"
                    )));
                }
                (Some((_, key)), _) => Some(SecretString::from(key.expose_secret().to_string())),
                (None, Some(k)) if k.contains(MASK) => {
                    return Err(Error::Credential(format!(
                        "masked api key for preset {name} has no stored value"
                    )));
                }
                (None, _) => None,
            }
        } else {
            preset.api_key
        };
        merged.push(preset);
    }
    Ok(merged)
}

/// Endpoints compare equal ignoring surrounding whitespace and trailing slashes
fn same_endpoint(a: &str, b: &str) -> bool {
    a.trim().trim_end_matches('/').eq_ignore_ascii_case(b.trim().trim_end_matches('/'))
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored() -> ConfigSnapshot {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.presets.push(
            PresetConfig::new("main", "https://api.example.com/v1", "m")
                .with_api_key("sk-stored-0123456789"),
        );
        snapshot.active_preset = Some("main".to_string());
        snapshot
    }

    fn update_with_key(name: &str, key: Option<&str>) -> ConfigUpdate {
        ConfigUpdate {
            presets: Some(vec![PresetUpdate {
                preset: PresetFileConfig {
                    name: name.to_string(),
                    base_url: Some("https://api.example.com/v1".to_string()),
                    model: Some("m2".to_string()),
                    api_key: key.map(ToString::to_string),
                    ..PresetFileConfig::default()
                },
                clear_api_key: false,
            }]),
            ..ConfigUpdate::default()
        }
    }

    fn key_of(snapshot: &ConfigSnapshot, name: &str) -> Option<String> {
        snapshot
            .preset(name)
            .and_then(|p| p.api_key.as_ref())
            .map(|k| k.expose_secret().to_string())
    }

    // -- masking --------------------------------------------------------------

    #[test]
    fn masks_long_and_short_keys() {
        assert_eq!(mask_secret("sk-0123456789abcd"), "sk-0****abcd");
        assert_eq!(mask_secret("short"), "****");
        assert_eq!(mask_secret(""), "****");
    }

    // -- merge-on-edit --------------------------------------------------------

    #[test]
    fn masked_key_keeps_stored_secret() {
        let store = ConfigStore::from_snapshot(stored());
        let masked = mask_secret("sk-stored-0123456789");
        let next = store.apply_update(update_with_key("main", Some(&masked))).unwrap();

        assert_eq!(key_of(&next, "main").as_deref(), Some("sk-stored-0123456789"));
        assert_eq!(next.preset("main").unwrap().model, "m2");
    }

    #[test]
    fn absent_or_empty_key_keeps_stored_secret() {
        let store = ConfigStore::from_snapshot(stored());
        let next = store.apply_update(update_with_key("main", None)).unwrap();
        assert_eq!(key_of(&next, "main").as_deref(), Some("sk-stored-0123456789"));

        let next = store.apply_update(update_with_key("main", Some(""))).unwrap();
        assert_eq!(key_of(&next, "main").as_deref(), Some("sk-stored-0123456789"));
    }

    #[test]
    fn new_key_replaces_stored_secret() {
        let store = ConfigStore::from_snapshot(stored());
        let next = store
            .apply_update(update_with_key("main", Some("sk-new-abcdefghijkl")))
            .unwrap();
        assert_eq!(key_of(&next, "main").as_deref(), Some("sk-new-abcdefghijkl"));
    }

    #[test]
    fn masked_key_for_unknown_preset_is_rejected() {
        let store = ConfigStore::from_snapshot(stored());
        let mut update = update_with_key("other", Some("sk-s****6789"));
        update.active_preset = Some("other".to_string());

        let err = store.apply_update(update).unwrap_err();
        assert!(matches!(err, Error::Credential(_)));
        // stored snapshot untouched
        assert_eq!(key_of(&store.current(), "main").as_deref(), Some("sk-stored-0123456789"));
    }

    #[test]
    fn stored_key_does_not_follow_a_new_endpoint() {
        let store = ConfigStore::from_snapshot(stored());
        let masked = mask_secret("sk-stored-0123456789");

        for key in [Some(masked.as_str()), Some(""), None] {
            let mut update = update_with_key("main", key);
            if let Some(presets) = update.presets.as_mut() {
                presets[0].preset.base_url = Some("https://elsewhere.invalid/v1".to_string());
            }
            let err = store.apply_update(update).unwrap_err();
            assert!(matches!(err, Error::Credential(_)), "key {key:?}");
        }

        let current = store.current();
        assert_eq!(current.preset("main").unwrap().base_url, "https://api.example.com/v1");
        assert_eq!(key_of(&current, "main").as_deref(), Some("sk-stored-0123456789"));
    }

    #[test]
    fn new_endpoint_with_fresh_key_is_accepted() {
        let store = ConfigStore::from_snapshot(stored());
        let mut update = update_with_key("main", Some("sk-fresh-abcdefghijkl"));
        if let Some(presets) = update.presets.as_mut() {
            presets[0].preset.base_url = Some("https://elsewhere.example/v1".to_string());
        }

        let next = store.apply_update(update).unwrap();
        assert_eq!(key_of(&next, "main").as_deref(), Some("sk-fresh-abcdefghijkl"));
    }

    #[test]
    fn trailing_slash_is_the_same_endpoint() {
        let store = ConfigStore::from_snapshot(stored());
        let mut update = update_with_key("main", None);
        if let Some(presets) = update.presets.as_mut() {
            presets[0].preset.base_url = Some("https://api.example.com/v1/".to_string());
        }

        let next = store.apply_update(update).unwrap();
        assert_eq!(key_of(&next, "main").as_deref(), Some("sk-stored-0123456789"));
    }

    #[test]
    fn clear_flag_removes_key() {
        let store = ConfigStore::from_snapshot(stored());
        let mut update = update_with_key("main", Some("sk-s****6789"));
        if let Some(presets) = update.presets.as_mut() {
            presets[0].clear_api_key = true;
        }
        let next = store.apply_update(update).unwrap();
        assert!(key_of(&next, "main").is_none());
    }

    #[test]
    fn unknown_active_preset_is_rejected() {
        let store = ConfigStore::from_snapshot(stored());
        let update = ConfigUpdate {
            active_preset: Some("missing".to_string()),
            ..ConfigUpdate::default()
        };
        assert!(store.apply_update(update).is_err());
    }

    // -- reload ---------------------------------------------------------------

    #[test]
    fn reload_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[bot]\nself_name = \"first\"\n").unwrap();

        let store = ConfigStore::load(Some(path.clone())).unwrap();
        let mut rx = store.subscribe();
        assert_eq!(store.current().bot.self_name, "first");
        assert!(!store.reload_if_changed().unwrap());

        // force a distinct mtime
        std::fs::write(&path, "[bot]\nself_name = \"second\"\n").unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(5);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(later).unwrap();

        assert!(store.reload_if_changed().unwrap());
        assert_eq!(store.current().bot.self_name, "second");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().bot.self_name, "second");
    }

    #[test]
    fn broken_file_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[bot]\nself_name = \"ok\"\n").unwrap();
        let store = ConfigStore::load(Some(path.clone())).unwrap();

        std::fs::write(&path, "[bot\n").unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(5);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(later).unwrap();

        assert!(store.reload_if_changed().is_err());
        assert_eq!(store.current().bot.self_name, "ok");
    }
}
