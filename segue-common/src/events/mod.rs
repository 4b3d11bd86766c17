//! Event types for the segue event system
//!
//! Provides the lifecycle event enum published by the player and the
//! broadcast `EventBus` used to fan it out.

mod playback_types;

pub use playback_types::{PlaybackState, TransitionKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Player lifecycle events
///
/// Events are broadcast via EventBus and can be serialized as JSON lines.
/// Track references are carried as locators (the track identity).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    /// A track became the rendering track
    PlaybackStart {
        locator: String,
        transition: TransitionKind,
        timestamp: DateTime<Utc>,
    },

    /// Playback stopped (explicitly, at end of queue, or after a fatal error)
    PlaybackEnd {
        /// Track that was rendering when playback ended
        locator: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Output paused by the user
    PlaybackPause {
        locator: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Output resumed by the user
    PlaybackResume {
        locator: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Emitted after every toggle request, whichever way it went
    PlaybackTogglePause {
        locator: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Backend or configure failure surfaced to the application
    PlaybackError {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Network buffering progress, emitted on 5% boundaries
    PlaybackBuffering {
        percent: u8,
        timestamp: DateTime<Utc>,
    },

    /// A track could not be configured for playback
    TrackUnplayable {
        locator: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The one-shot stop marker was reached and playback halted
    StopTrack {
        locator: String,
        timestamp: DateTime<Utc>,
    },

    /// Tags decoded by the backend for the rendering track
    TagsParsed {
        locator: Option<String>,
        tags: Vec<(String, String)>,
        timestamp: DateTime<Utc>,
    },

    /// A stream reached the Playing state it was asked for
    StreamSettled {
        stream_id: u64,
        timestamp: DateTime<Utc>,
    },
}

impl PlayerEvent {
    /// Short snake_case name, used for logging and CLI output
    pub fn event_type(&self) -> &'static str {
        match self {
            PlayerEvent::PlaybackStart { .. } => "playback_start",
            PlayerEvent::PlaybackEnd { .. } => "playback_end",
            PlayerEvent::PlaybackPause { .. } => "playback_pause",
            PlayerEvent::PlaybackResume { .. } => "playback_resume",
            PlayerEvent::PlaybackTogglePause { .. } => "playback_toggle_pause",
            PlayerEvent::PlaybackError { .. } => "playback_error",
            PlayerEvent::PlaybackBuffering { .. } => "playback_buffering",
            PlayerEvent::TrackUnplayable { .. } => "track_unplayable",
            PlayerEvent::StopTrack { .. } => "stop_track",
            PlayerEvent::TagsParsed { .. } => "tags_parsed",
            PlayerEvent::StreamSettled { .. } => "stream_settled",
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Event distribution bus built on tokio::broadcast
///
/// - Non-blocking publish (slow subscribers don't block the player loop)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use segue_common::events::{EventBus, PlayerEvent};
///
/// let bus = EventBus::new(100);
/// let mut rx = bus.subscribe();
///
/// bus.emit_lossy(PlayerEvent::PlaybackBuffering {
///     percent: 40,
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(matches!(
///     rx.try_recv(),
///     Ok(PlayerEvent::PlaybackBuffering { percent: 40, .. })
/// ));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PlayerEvent,
    ) -> Result<usize, broadcast::error::SendError<PlayerEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
