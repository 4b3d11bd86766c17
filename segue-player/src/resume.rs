//! Persisted player state
//!
//! Written at shutdown and read at startup so playback can continue where
//! it left off. Stored as JSON.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use segue_common::events::PlaybackState;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub state: PlaybackState,
    /// Seconds into the current track
    pub position: f64,
    /// When the current track last started crediting playtime
    pub playtime_stamp: Option<DateTime<Utc>>,
}

impl ResumeState {
    /// Read a saved state; Ok(None) when no file exists
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No saved player state at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let state: ResumeState = serde_json::from_str(&content)
            .map_err(|e| Error::ResumeState(format!("{}: {}", path.display(), e)))?;
        if !state.position.is_finite() || state.position < 0.0 {
            return Err(Error::ResumeState(format!(
                "invalid position {}",
                state.position
            )));
        }
        Ok(Some(state))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!("Saved player state to {}", path.display());
        Ok(())
    }
}

/// Steps still to run once the first restored stream settles
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RestorePlan {
    pub(crate) position: f64,
    pub(crate) paused: bool,
    /// Volume to put back after the muted start
    pub(crate) volume: f64,
}
