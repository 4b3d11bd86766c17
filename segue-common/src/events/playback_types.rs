//! Playback-related type definitions

use serde::{Deserialize, Serialize};

/// Playback state enumeration
///
/// Always derived from what the rendering backend reports for the output
/// pipeline; the player never stores it separately.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Paused,
    Playing,
}

impl PlaybackState {
    /// Parse the lowercase name used in persisted state files
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "stopped" => Some(PlaybackState::Stopped),
            "paused" => Some(PlaybackState::Paused),
            "playing" => Some(PlaybackState::Playing),
            _ => None,
        }
    }

    /// True for Playing and Paused (a track is loaded)
    pub fn is_active(&self) -> bool {
        !matches!(self, PlaybackState::Stopped)
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Stopped => write!(f, "stopped"),
            PlaybackState::Paused => write!(f, "paused"),
            PlaybackState::Playing => write!(f, "playing"),
        }
    }
}

/// How control moved from one track to the next
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Same pipeline redirected to the next locator
    Gapless,
    /// Automatic two-stream overlap at end of track
    Crossfade,
    /// Two-stream overlap on a user skip
    UserFade,
    /// Previous stream removed before the new one starts
    HardCut,
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionKind::Gapless => write!(f, "gapless"),
            TransitionKind::Crossfade => write!(f, "crossfade"),
            TransitionKind::UserFade => write!(f, "user_fade"),
            TransitionKind::HardCut => write!(f, "hard_cut"),
        }
    }
}
