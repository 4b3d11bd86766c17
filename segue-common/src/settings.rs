//! Settings store
//!
//! Key/value settings backed by a TOML document. Keys use the
//! `section/name` form (`player/volume`), which maps onto a TOML table
//! `[player]` with key `volume`. Writes broadcast a `SettingChanged`
//! notification so interested components can reload.
//!
//! The player only reads settings; writes come from the host application.

use crate::{Error, Result};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use toml::{Table, Value};
use tracing::debug;

/// Setting keys consumed by the player
pub mod keys {
    /// Playback engine variant: "normal", "gapless" or "unified"
    pub const ENGINE: &str = "player/engine";
    /// Restore the saved player state at startup
    pub const RESUME_PLAYBACK: &str = "player/resume_playback";
    /// Always come back paused after a restore
    pub const RESUME_PAUSED: &str = "player/resume_paused";
    /// Master volume [0.0, 1.0]
    pub const VOLUME: &str = "player/volume";
    /// Automatic crossfade between tracks
    pub const CROSSFADING: &str = "player/crossfading";
    /// Crossfade duration in milliseconds
    pub const CROSSFADE_DURATION: &str = "player/crossfade_duration";
    /// Fade when the user skips tracks
    pub const USER_FADE_ENABLED: &str = "player/user_fade_enabled";
    /// User fade duration in milliseconds
    pub const USER_FADE: &str = "player/user_fade";
    /// Output buffer size in milliseconds of audio
    pub const QUEUE_DURATION: &str = "player/queue_duration";
    /// Audio sink preset name
    pub const AUDIO_SINK: &str = "player/audiosink";
    /// How long a stream may take to reach Playing before giving up (ms)
    pub const SETTLE_TIMEOUT: &str = "player/settle_timeout";

    /// Per-sink option list key, e.g. `player/alsa_sink_options`
    pub fn sink_options(sink: &str) -> String {
        format!("player/{}_sink_options", sink)
    }
}

/// Notification sent whenever a setting is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingChanged {
    pub key: String,
}

/// TOML-backed settings with change broadcast
pub struct SettingsStore {
    values: RwLock<Table>,
    tx: broadcast::Sender<SettingChanged>,
}

impl SettingsStore {
    /// Create an empty store (every getter returns its default)
    pub fn new() -> Self {
        Self::from_table(Table::new())
    }

    fn from_table(table: Table) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            values: RwLock::new(table),
            tx,
        }
    }

    /// Parse settings from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: Table = toml::from_str(content)?;
        Ok(Self::from_table(table))
    }

    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let store = Self::from_toml_str(&content)?;
        debug!("Loaded settings from {}", path.display());
        Ok(store)
    }

    /// Write the current settings to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(&*self.read())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SettingChanged> {
        self.tx.subscribe()
    }

    /// Raw lookup
    pub fn get(&self, key: &str) -> Option<Value> {
        let values = self.read();
        match split_key(key) {
            (Some(section), name) => values
                .get(section)
                .and_then(|v| v.as_table())
                .and_then(|t| t.get(name))
                .cloned(),
            (None, name) => values.get(name).cloned(),
        }
    }

    /// Write a setting and notify subscribers
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        {
            let mut values = self.write();
            match split_key(key) {
                (Some(section), name) => {
                    let entry = values
                        .entry(section.to_string())
                        .or_insert_with(|| Value::Table(Table::new()));
                    let table = entry.as_table_mut().ok_or_else(|| {
                        Error::InvalidInput(format!("'{}' is not a settings section", section))
                    })?;
                    table.insert(name.to_string(), value.into());
                }
                (None, name) => {
                    values.insert(name.to_string(), value.into());
                }
            }
        }
        debug!("Setting changed: {}", key);
        // No subscribers is fine
        let _ = self.tx.send(SettingChanged {
            key: key.to_string(),
        });
        Ok(())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    /// Unsigned integer setting; negative or non-integer values fall back to the default
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.as_integer())
            .and_then(|i| u64::try_from(i).ok())
            .unwrap_or(default)
    }

    /// Float setting; integer values are accepted
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(Value::Float(f)) => f,
            Some(Value::Integer(i)) => i as f64,
            _ => default,
        }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| default.to_string())
    }

    /// String list setting; non-string entries are skipped
    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(|v| v.as_array().cloned())
            .map(|items| {
                items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.values.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((section, name)) => (Some(section), name),
        None => (None, key),
    }
}
