//! Shared rig for segue-player integration tests
//!
//! Drives a `Player` over the simulated backend with a hand-advanced clock.
//! Each `step()` moves time forward by `STEP_MS` and runs one loop
//! iteration, which is what the host loop does in production.

#![allow(dead_code)]

use segue_common::events::{PlayerEvent, TransitionKind};
use segue_common::settings::keys;
use segue_common::SettingsStore;
use segue_player::backend::sim::{SimBackend, SimConfig};
use segue_player::clock::ManualClock;
use segue_player::track::{MediaTrack, TrackRef};
use segue_player::{uri, Player};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Loop period used by every test
pub const STEP_MS: u64 = 5;

pub struct Rig {
    pub clock: Arc<ManualClock>,
    pub sim: SimBackend,
    pub settings: Arc<SettingsStore>,
    pub player: Player,
    pub events: broadcast::Receiver<PlayerEvent>,
}

impl Rig {
    /// Normal engine, default settings
    pub fn new() -> Self {
        Self::with_settings(SettingsStore::new())
    }

    pub fn with_settings(settings: SettingsStore) -> Self {
        Self::with_config(settings, SimConfig::default())
    }

    pub fn with_config(settings: SettingsStore, config: SimConfig) -> Self {
        let clock = Arc::new(ManualClock::new());
        let sim = SimBackend::with_config(clock.clone(), config);
        let settings = Arc::new(settings);
        let player = Player::new(Box::new(sim.clone()), clock.clone(), settings.clone())
            .expect("player should build on the simulated backend");
        let events = player.subscribe();
        Self {
            clock,
            sim,
            settings,
            player,
            events,
        }
    }

    /// Register media with the backend and return a matching track
    pub fn track(&self, uri: &str, secs: u64) -> TrackRef {
        self.track_with_media(uri, secs, secs * 1000)
    }

    /// Track whose stated duration differs from what the backend decodes
    pub fn track_with_media(&self, uri: &str, secs: u64, media_ms: u64) -> TrackRef {
        self.sim.add_media(uri, Some(media_ms));
        MediaTrack::new(uri, Some(secs as f64)).unwrap().into_ref()
    }

    /// Live source without a known length
    pub fn live_track(&self, uri: &str) -> TrackRef {
        self.sim.add_media(uri, None);
        MediaTrack::new(uri, None).unwrap().into_ref()
    }

    /// Track backed by a real file under `dir`, so it counts as local
    pub fn local_track(&self, dir: &Path, name: &str, secs: u64) -> TrackRef {
        let path = dir.join(name);
        std::fs::write(&path, b"RIFF").unwrap();
        let locator = uri::path_to_uri(&path).unwrap();
        self.sim.add_media(&locator, Some(secs * 1000));
        MediaTrack::new(locator, Some(secs as f64)).unwrap().into_ref()
    }

    pub fn enqueue(&mut self, tracks: &[&TrackRef]) {
        for track in tracks {
            self.player.queue_mut().enqueue(Arc::clone(track));
        }
    }

    pub fn step(&mut self) {
        self.clock.advance(STEP_MS);
        self.player.iterate();
    }

    pub fn run(&mut self, ms: u64) {
        for _ in 0..ms / STEP_MS {
            self.step();
        }
    }

    /// Step until `done` holds; false if `limit_ms` passes first
    pub fn run_until(&mut self, limit_ms: u64, mut done: impl FnMut(&Player) -> bool) -> bool {
        for _ in 0..limit_ms / STEP_MS {
            if done(&self.player) {
                return true;
            }
            self.step();
        }
        done(&self.player)
    }

    pub fn now(&self) -> u64 {
        use segue_player::clock::Clock;
        self.clock.now_ms()
    }

    /// Events emitted since the last call
    pub fn events(&mut self) -> Vec<PlayerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn event_types(&mut self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.event_type()).collect()
    }

    pub fn current_locator(&self) -> Option<String> {
        self.player.current().map(|t| t.locator().to_string())
    }
}

/// Settings for the unified engine with end-of-track crossfades
pub fn crossfade_settings(crossfade_ms: i64) -> SettingsStore {
    let settings = SettingsStore::new();
    settings.set(keys::ENGINE, "unified").unwrap();
    settings.set(keys::CROSSFADING, true).unwrap();
    settings.set(keys::CROSSFADE_DURATION, crossfade_ms).unwrap();
    settings
}

pub fn gapless_settings() -> SettingsStore {
    let settings = SettingsStore::new();
    settings.set(keys::ENGINE, "gapless").unwrap();
    settings
}

/// (locator, transition) of every PlaybackStart in `events`
pub fn starts(events: &[PlayerEvent]) -> Vec<(String, TransitionKind)> {
    events
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::PlaybackStart {
                locator,
                transition,
                ..
            } => Some((locator.clone(), *transition)),
            _ => None,
        })
        .collect()
}

pub fn count(events: &[PlayerEvent], event_type: &str) -> usize {
    events
        .iter()
        .filter(|e| e.event_type() == event_type)
        .count()
}
