//! Transition engine
//!
//! **Module Structure:**
//! - `core.rs`: engine struct, construction, loop step, accessors
//! - `playback.rs`: play/stop/pause/unpause/seek and gapless queueing
//! - `fades.rs`: volume ramps and the predictive crossfade timer
//! - `messages.rs`: backend message dispatch
//!
//! The engine owns up to two streams. Its phase is never stored; it is read
//! off how many streams are attached to the mixer.

mod core;
mod fades;
mod messages;
mod playback;

pub use self::core::TransitionEngine;

use crate::stream::StreamId;
use crate::track::TrackRef;
use segue_common::events::TransitionKind;
use segue_common::settings::keys;
use segue_common::SettingsStore;
use tracing::{debug, warn};

/// Playback engine variant, from `player/engine`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineVariant {
    /// One stream, hard cut between tracks
    Normal,
    /// One stream; the decoder continues with the next track
    Gapless,
    /// Two streams with crossfade and fade-on-skip
    Unified,
}

impl EngineVariant {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "normal" => Some(EngineVariant::Normal),
            "gapless" => Some(EngineVariant::Gapless),
            "unified" => Some(EngineVariant::Unified),
            _ => None,
        }
    }

    /// Variant named in settings; unknown names fall back to normal
    pub fn from_settings(settings: &SettingsStore) -> Self {
        let name = settings.get_string(keys::ENGINE, "normal");
        match Self::from_name(&name) {
            Some(variant) => {
                debug!("{} playback engine selected", name);
                variant
            }
            None => {
                warn!(
                    "Couldn't find playback engine '{}', falling back to normal",
                    name
                );
                EngineVariant::Normal
            }
        }
    }

    /// Most streams this variant keeps attached at once
    pub fn max_streams(&self) -> usize {
        match self {
            EngineVariant::Unified => 2,
            EngineVariant::Normal | EngineVariant::Gapless => 1,
        }
    }
}

/// Engine phase, derived from the attached stream count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Single,
    Fading,
}

impl Phase {
    pub(crate) fn from_attached(count: usize) -> Self {
        match count {
            0 => Phase::Idle,
            1 => Phase::Single,
            _ => Phase::Fading,
        }
    }
}

/// Who asked for a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayCause {
    /// Explicit play/skip
    User,
    /// End of track or crossfade point
    Automatic,
}

/// How a transition is carried out, decided per transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionIntent {
    GaplessReplace,
    Crossfade { duration_ms: u64 },
    UserFade { duration_ms: u64 },
    HardCut,
}

impl TransitionIntent {
    pub fn fade_duration_ms(&self) -> Option<u64> {
        match self {
            TransitionIntent::Crossfade { duration_ms }
            | TransitionIntent::UserFade { duration_ms } => Some(*duration_ms),
            _ => None,
        }
    }

    pub fn kind(&self) -> TransitionKind {
        match self {
            TransitionIntent::GaplessReplace => TransitionKind::Gapless,
            TransitionIntent::Crossfade { .. } => TransitionKind::Crossfade,
            TransitionIntent::UserFade { .. } => TransitionKind::UserFade,
            TransitionIntent::HardCut => TransitionKind::HardCut,
        }
    }
}

/// Work the engine hands back to the player after a loop step
#[derive(Debug, Clone)]
pub enum EngineRequest {
    /// The current track ran out; choose and play what follows
    Advance { finished: Option<TrackRef> },
    /// Crossfade point of the current track reached
    Crossfade,
    /// The decoder will take a next URI now
    Gapless,
    /// A stream's settle wait resolved
    StreamReady(StreamId),
}

/// Timer classes; arming one replaces the previous timer of its class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    Crossfade,
    Fade(StreamId),
}

/// Scheduled and deferred work
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Task {
    FadeStep(StreamId),
    Crossfade { generation: u64, stream: StreamId },
    SettlePoll(StreamId),
}
