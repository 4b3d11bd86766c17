//! Playlist collaborator
//!
//! Playlists are owned by the application; the queue only holds a shared
//! reference to the one currently used for sequencing.

use crate::track::TrackRef;
use std::sync::{Arc, Mutex, MutexGuard};

/// Sequencing contract the queue relies on
pub trait Playlist: Send {
    /// Track `next()` would return, without moving
    fn peek(&self) -> Option<TrackRef>;

    /// Move forward; None once past the end
    fn next(&mut self) -> Option<TrackRef>;

    /// Move back; stays on the first track
    fn prev(&mut self) -> Option<TrackRef>;

    fn current(&self) -> Option<TrackRef>;

    /// Whether this playlist is the live sequencing source
    fn current_playing(&self) -> bool;
    fn set_current_playing(&mut self, playing: bool);
}

pub type SharedPlaylist = Arc<Mutex<dyn Playlist>>;

pub(crate) fn lock_playlist(playlist: &SharedPlaylist) -> MutexGuard<'_, dyn Playlist + 'static> {
    playlist
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ordered track list with a cursor
#[derive(Debug, Default)]
pub struct TrackList {
    tracks: Vec<TrackRef>,
    /// None before the first `next()`; `tracks.len()` once exhausted
    cursor: Option<usize>,
    current_playing: bool,
}

impl TrackList {
    pub fn new(tracks: Vec<TrackRef>) -> Self {
        Self {
            tracks,
            cursor: None,
            current_playing: false,
        }
    }

    pub fn shared(self) -> SharedPlaylist {
        Arc::new(Mutex::new(self))
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn position(&self) -> Option<usize> {
        self.cursor.filter(|c| *c < self.tracks.len())
    }
}

impl Playlist for TrackList {
    fn peek(&self) -> Option<TrackRef> {
        let index = self.cursor.map(|c| c + 1).unwrap_or(0);
        self.tracks.get(index).cloned()
    }

    fn next(&mut self) -> Option<TrackRef> {
        let index = self.cursor.map(|c| c + 1).unwrap_or(0);
        if index < self.tracks.len() {
            self.cursor = Some(index);
            self.tracks.get(index).cloned()
        } else {
            self.cursor = Some(self.tracks.len());
            None
        }
    }

    fn prev(&mut self) -> Option<TrackRef> {
        if self.tracks.is_empty() {
            return None;
        }
        let index = match self.cursor {
            Some(c) => c.saturating_sub(1).min(self.tracks.len() - 1),
            None => 0,
        };
        self.cursor = Some(index);
        self.tracks.get(index).cloned()
    }

    fn current(&self) -> Option<TrackRef> {
        self.position().and_then(|c| self.tracks.get(c).cloned())
    }

    fn current_playing(&self) -> bool {
        self.current_playing
    }

    fn set_current_playing(&mut self, playing: bool) {
        self.current_playing = playing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::MediaTrack;

    fn list(n: usize) -> TrackList {
        TrackList::new(
            (0..n)
                .map(|i| MediaTrack::new(format!("file:///{}.flac", i), None).unwrap().into_ref())
                .collect(),
        )
    }

    fn loc(track: Option<TrackRef>) -> Option<String> {
        track.map(|t| t.locator().to_string())
    }

    #[test]
    fn test_walk_forward_to_exhaustion() {
        let mut pl = list(2);
        assert_eq!(loc(pl.peek()).as_deref(), Some("file:///0.flac"));
        assert_eq!(loc(pl.next()).as_deref(), Some("file:///0.flac"));
        assert_eq!(loc(pl.next()).as_deref(), Some("file:///1.flac"));
        assert!(pl.next().is_none());
        assert!(pl.current().is_none());
        assert!(pl.peek().is_none());
    }

    #[test]
    fn test_prev_stops_at_first() {
        let mut pl = list(3);
        pl.next();
        pl.next();
        assert_eq!(loc(pl.prev()).as_deref(), Some("file:///0.flac"));
        assert_eq!(loc(pl.prev()).as_deref(), Some("file:///0.flac"));
        assert_eq!(pl.position(), Some(0));
    }

    #[test]
    fn test_empty_list_never_fails() {
        let mut pl = list(0);
        assert!(pl.peek().is_none());
        assert!(pl.next().is_none());
        assert!(pl.prev().is_none());
        assert!(pl.current().is_none());
    }
}
