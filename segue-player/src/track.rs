//! Tracks as seen by the player
//!
//! The player only needs a locator, an existence check, a duration and a
//! playtime counter it can credit. Everything else about a track belongs to
//! the application.

use crate::error::Result;
use crate::uri;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

/// Track collaborator
pub trait Track: Send + Sync + fmt::Debug {
    /// Absolute URI; also the track's identity
    fn locator(&self) -> &str;

    /// Whether the track lives on local storage
    fn is_local(&self) -> bool {
        uri::scheme(self.locator())
            .map(|s| s.eq_ignore_ascii_case(uri::FILE_SCHEME))
            .unwrap_or(false)
    }

    /// Whether local media is present (non-local tracks always exist)
    fn exists(&self) -> bool;

    /// Length in seconds, if known
    fn duration(&self) -> Option<f64>;

    /// Accumulated playtime in seconds
    fn playtime(&self) -> f64;

    /// Credit playtime
    fn add_playtime(&self, seconds: f64);
}

pub type TrackRef = Arc<dyn Track>;

/// Identity comparison by locator
pub fn same_track(a: &TrackRef, b: &TrackRef) -> bool {
    a.locator() == b.locator()
}

/// Plain track backed by a locator and an optional known duration
pub struct MediaTrack {
    locator: String,
    duration: Option<f64>,
    playtime_ms: AtomicU64,
}

impl MediaTrack {
    /// Track for an absolute URI
    pub fn new(locator: impl Into<String>, duration: Option<f64>) -> Result<Self> {
        let locator = locator.into();
        uri::require_absolute(&locator)?;
        Ok(Self {
            locator,
            duration,
            playtime_ms: AtomicU64::new(0),
        })
    }

    /// Track for a local file, with the duration read from its container
    pub fn from_path(path: &Path) -> Result<Self> {
        let locator = uri::path_to_uri(path)?;
        let duration = probe_duration(path);
        Self::new(locator, duration)
    }

    pub fn into_ref(self) -> TrackRef {
        Arc::new(self)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("locator", &self.locator)
            .field("duration", &self.duration)
            .finish()
    }
}

impl Track for MediaTrack {
    fn locator(&self) -> &str {
        &self.locator
    }

    fn exists(&self) -> bool {
        if !self.is_local() {
            return true;
        }
        uri::uri_to_path(&self.locator)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn playtime(&self) -> f64 {
        self.playtime_ms.load(Ordering::Relaxed) as f64 / 1000.0
    }

    fn add_playtime(&self, seconds: f64) {
        if seconds > 0.0 {
            self.playtime_ms
                .fetch_add((seconds * 1000.0).round() as u64, Ordering::Relaxed);
        }
    }
}

/// Read the duration from a file's container headers
///
/// Returns None when the file cannot be probed or the container does not
/// state a frame count.
pub fn probe_duration(path: &Path) -> Option<f64> {
    let file = std::fs::File::open(path).ok()?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(p) => p,
        Err(e) => {
            debug!("Cannot probe {}: {}", path.display(), e);
            return None;
        }
    };

    let track = probed.format.default_track()?;
    let params = &track.codec_params;
    let frames = params.n_frames?;
    let time_base = params.time_base?;
    let time = time_base.calc_time(frames);
    Some(time.seconds as f64 + time.frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_must_be_absolute() {
        assert!(MediaTrack::new("music/a.flac", None).is_err());
        assert!(MediaTrack::new("http://radio.example/live", None).is_ok());
    }

    #[test]
    fn test_local_existence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song one.flac");
        std::fs::write(&path, b"not really audio").unwrap();

        let track = MediaTrack::from_path(&path).unwrap();
        assert!(track.is_local());
        assert!(track.exists());
        // garbage content cannot be probed
        assert_eq!(track.duration(), None);

        std::fs::remove_file(&path).unwrap();
        assert!(!track.exists());
    }

    #[test]
    fn test_remote_always_exists() {
        let track = MediaTrack::new("http://radio.example/live", None).unwrap();
        assert!(!track.is_local());
        assert!(track.exists());
    }

    #[test]
    fn test_playtime_accumulates() {
        let track = MediaTrack::new("file:///a.flac", Some(180.0)).unwrap();
        track.add_playtime(10.0);
        track.add_playtime(5.25);
        track.add_playtime(-3.0);
        assert!((track.playtime() - 15.25).abs() < 1e-9);
    }

    #[test]
    fn test_identity_by_locator() {
        let a: TrackRef = Arc::new(MediaTrack::new("file:///a.flac", None).unwrap());
        let a2: TrackRef = Arc::new(MediaTrack::new("file:///a.flac", Some(3.0)).unwrap());
        let b: TrackRef = Arc::new(MediaTrack::new("file:///b.flac", None).unwrap());
        assert!(same_track(&a, &a2));
        assert!(!same_track(&a, &b));
    }
}
