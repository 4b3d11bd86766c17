//! Playback queue
//!
//! Decides which track comes next: explicitly queued tracks first, then the
//! current playlist. Also holds the one-shot "stop after this track" marker.
//!
//! The queue never drives the player itself. It answers with a decision and
//! the player acts on it, so the queue can be exercised without a backend.

use crate::playlist::{lock_playlist, SharedPlaylist};
use crate::track::{same_track, TrackRef};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Seconds into a track after which "previous" restarts it instead
pub const RESTART_THRESHOLD_SECS: f64 = 5.0;

/// Outcome of advancing the queue
#[derive(Debug, Clone)]
pub enum Advance {
    /// Play this track
    Track(TrackRef),
    /// The rendering track carried the stop marker; playback must stop.
    /// The marker has been cleared.
    StopTrack(TrackRef),
    /// Queue and playlist are exhausted
    Exhausted,
}

impl Advance {
    pub fn track(&self) -> Option<&TrackRef> {
        match self {
            Advance::Track(track) => Some(track),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct PlayQueue {
    tracks: VecDeque<TrackRef>,
    /// Track most recently taken from the explicit queue
    current: Option<TrackRef>,
    current_playing: bool,
    playlist: Option<SharedPlaylist>,
    stop_track: Option<TrackRef>,
}

impl PlayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, track: TrackRef) {
        debug!("Enqueued {}", track.locator());
        self.tracks.push_back(track);
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Queued tracks, head first
    pub fn tracks(&self) -> impl Iterator<Item = &TrackRef> {
        self.tracks.iter()
    }

    pub fn set_current_playlist(&mut self, playlist: Option<SharedPlaylist>) {
        self.playlist = playlist;
    }

    pub fn current_playlist(&self) -> Option<&SharedPlaylist> {
        self.playlist.as_ref()
    }

    /// Set or clear the stop marker
    pub fn set_stop_track(&mut self, track: Option<TrackRef>) {
        self.stop_track = track;
    }

    pub fn stop_track(&self) -> Option<&TrackRef> {
        self.stop_track.as_ref()
    }

    /// Whether the explicit queue is the live sequencing source
    pub fn current_playing(&self) -> bool {
        self.current_playing
    }

    /// Whether `track` carries the stop marker
    pub fn is_stop_track(&self, track: &TrackRef) -> bool {
        self.stop_track
            .as_ref()
            .map(|marker| same_track(marker, track))
            .unwrap_or(false)
    }

    /// Next track without consuming anything
    pub fn peek(&self) -> Option<TrackRef> {
        if let Some(head) = self.tracks.front() {
            return Some(head.clone());
        }
        self.playlist.as_ref().and_then(|p| lock_playlist(p).peek())
    }

    /// Advance the sequence
    ///
    /// `rendering` is the track currently audible. An explicit track always
    /// wins. Otherwise reaching the stop marker yields `StopTrack` once and
    /// clears the marker.
    pub fn next(&mut self, rendering: Option<&TrackRef>, explicit: Option<TrackRef>) -> Advance {
        if let Some(track) = explicit {
            return Advance::Track(track);
        }

        if let Some(current) = rendering {
            if self.is_stop_track(current) {
                info!("Stop marker reached at {}", current.locator());
                self.stop_track = None;
                return Advance::StopTrack(current.clone());
            }
        }

        match self.tracks.pop_front() {
            Some(track) => {
                self.current = Some(track.clone());
                self.current_playing = true;
                if let Some(playlist) = &self.playlist {
                    lock_playlist(playlist).set_current_playing(false);
                }
                Advance::Track(track)
            }
            None => {
                let Some(playlist) = &self.playlist else {
                    return Advance::Exhausted;
                };
                let mut playlist = lock_playlist(playlist);
                let track = playlist.next();
                playlist.set_current_playing(true);
                self.current_playing = false;
                match track {
                    Some(track) => Advance::Track(track),
                    None => Advance::Exhausted,
                }
            }
        }
    }

    /// Track "previous" should play
    ///
    /// With a rendering track more than a few seconds in, that track again;
    /// otherwise the playlist's previous. With nothing rendering, the
    /// current accessor.
    pub fn prev(&mut self, rendering: Option<&TrackRef>, elapsed_secs: f64) -> Option<TrackRef> {
        match rendering {
            Some(track) if elapsed_secs > RESTART_THRESHOLD_SECS => Some(track.clone()),
            Some(_) => self.playlist.as_ref().and_then(|p| lock_playlist(p).prev()),
            None => self.current(),
        }
    }

    /// Queue's current track while it is the live source, else the playlist's
    pub fn current(&self) -> Option<TrackRef> {
        if self.current_playing {
            if let Some(track) = &self.current {
                return Some(track.clone());
            }
        }
        self.playlist.as_ref().and_then(|p| lock_playlist(p).current())
    }
}
