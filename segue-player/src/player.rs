//! Transport facade
//!
//! `Player` is what an application talks to. It owns the transition engine
//! and the playback queue and turns engine requests (track finished,
//! crossfade point reached, decoder ready for a next URI) into queue
//! decisions.
//!
//! The player does no work on its own; the host calls [`Player::iterate`]
//! from its loop.

use crate::backend::Backend;
use crate::clock::SharedClock;
use crate::engine::{EngineRequest, PlayCause, TransitionEngine};
use crate::error::Result;
use crate::observers::ObserverId;
use crate::providers::{ElementProvider, ProviderRegistry};
use crate::queue::{Advance, PlayQueue};
use crate::resume::{RestorePlan, ResumeState};
use crate::stream::StreamId;
use crate::track::TrackRef;
use chrono::Utc;
use segue_common::events::{PlaybackState, PlayerEvent};
use segue_common::settings::{keys, SettingChanged, SettingsStore};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

/// Setting keys the engine reacts to, reapplied after a lagged receiver
const WATCHED_KEYS: &[&str] = &[
    keys::VOLUME,
    keys::QUEUE_DURATION,
    keys::CROSSFADING,
    keys::CROSSFADE_DURATION,
];

pub struct Player {
    engine: TransitionEngine,
    queue: PlayQueue,
    settings: Arc<SettingsStore>,
    settings_rx: broadcast::Receiver<SettingChanged>,
    restore: Option<RestorePlan>,
}

impl Player {
    pub fn new(
        backend: Box<dyn Backend>,
        clock: SharedClock,
        settings: Arc<SettingsStore>,
    ) -> Result<Self> {
        Self::with_providers(backend, clock, settings, ProviderRegistry::new())
    }

    pub fn with_providers(
        backend: Box<dyn Backend>,
        clock: SharedClock,
        settings: Arc<SettingsStore>,
        providers: ProviderRegistry,
    ) -> Result<Self> {
        let settings_rx = settings.subscribe();
        let engine = TransitionEngine::new(backend, clock, settings.clone(), providers)?;
        Ok(Self {
            engine,
            queue: PlayQueue::new(),
            settings,
            settings_rx,
            restore: None,
        })
    }

    // ----- transport -----

    /// Play `track`, or continue with the queue
    ///
    /// Without a track this is a no-op while already playing; otherwise the
    /// queue's current track is played, or the next one when there is none.
    pub fn play(&mut self, track: Option<TrackRef>) -> Result<()> {
        if let Some(track) = track {
            self.engine.play(track, PlayCause::User)?;
            return Ok(());
        }
        if self.engine.state() == PlaybackState::Playing {
            return Ok(());
        }
        match self.queue.current() {
            Some(track) => {
                self.engine.play(track, PlayCause::User)?;
            }
            None => {
                self.next()?;
            }
        }
        Ok(())
    }

    /// Skip to the next track; stops when nothing follows
    pub fn next(&mut self) -> Result<Option<TrackRef>> {
        let rendering = self.engine.current_track().cloned();
        let advance = self.queue.next(rendering.as_ref(), None);
        self.follow(advance, PlayCause::User)
    }

    /// Restart the current track, or go back in the playlist
    pub fn prev(&mut self) -> Result<Option<TrackRef>> {
        let rendering = self.engine.current_track().cloned();
        let elapsed = self.engine.time();
        let Some(track) = self.queue.prev(rendering.as_ref(), elapsed) else {
            debug!("Nothing to go back to");
            return Ok(None);
        };
        self.engine.play(track.clone(), PlayCause::User)?;
        Ok(Some(track))
    }

    fn follow(&mut self, advance: Advance, cause: PlayCause) -> Result<Option<TrackRef>> {
        match advance {
            Advance::Track(track) => {
                self.engine.play(track.clone(), cause)?;
                Ok(Some(track))
            }
            Advance::StopTrack(track) => {
                self.engine.stop();
                self.engine.emit(PlayerEvent::StopTrack {
                    locator: track.locator().to_string(),
                    timestamp: Utc::now(),
                });
                Ok(None)
            }
            Advance::Exhausted => {
                info!("End of queue");
                self.engine.stop();
                Ok(None)
            }
        }
    }

    pub fn pause(&mut self) -> bool {
        self.engine.pause()
    }

    pub fn unpause(&mut self) -> bool {
        self.engine.unpause()
    }

    /// Pause when playing, unpause when paused
    pub fn toggle_pause(&mut self) -> bool {
        let changed = if self.engine.state() == PlaybackState::Paused {
            self.engine.unpause()
        } else {
            self.engine.pause()
        };
        let locator = self.current().map(|t| t.locator().to_string());
        self.engine.emit(PlayerEvent::PlaybackTogglePause {
            locator,
            timestamp: Utc::now(),
        });
        changed
    }

    pub fn stop(&mut self) -> bool {
        self.restore = None;
        self.engine.stop()
    }

    pub fn seek(&mut self, seconds: f64) -> Result<()> {
        self.engine.seek(seconds)
    }

    // ----- state -----

    pub fn set_volume(&mut self, volume: f64) -> Result<()> {
        self.engine.set_volume(volume)
    }

    pub fn volume(&self) -> f64 {
        self.engine.volume()
    }

    pub fn state(&self) -> PlaybackState {
        self.engine.state()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state() == PlaybackState::Paused
    }

    /// Position in backend ticks
    pub fn position(&self) -> i64 {
        self.engine.position()
    }

    /// Position in seconds
    pub fn time(&self) -> f64 {
        self.engine.time()
    }

    /// Fraction of the current track played; 0 without a known duration
    pub fn progress(&self) -> f64 {
        let Some(track) = self.engine.current_track() else {
            return 0.0;
        };
        match track.duration() {
            Some(duration) if duration > 0.0 => self.engine.time() / duration,
            _ => 0.0,
        }
    }

    /// Rendering track
    pub fn current(&self) -> Option<TrackRef> {
        self.engine.current_track().cloned()
    }

    pub fn queue(&self) -> &PlayQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut PlayQueue {
        &mut self.queue
    }

    pub fn engine(&self) -> &TransitionEngine {
        &self.engine
    }

    // ----- observers and providers -----

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.engine.subscribe()
    }

    pub fn observe<F>(&mut self, callback: F) -> ObserverId
    where
        F: FnMut(&PlayerEvent) + Send + 'static,
    {
        self.engine.observe(callback)
    }

    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        self.engine.unobserve(id)
    }

    /// Add a provider; every chain of its service is rebuilt
    pub fn register_provider(&mut self, service: &str, provider: Arc<dyn ElementProvider>) {
        let mut registry = self.engine.registry().clone();
        registry.register(service, provider);
        self.engine.set_providers(registry);
    }

    pub fn unregister_provider(&mut self, service: &str, name: &str) -> bool {
        let mut registry = self.engine.registry().clone();
        if !registry.unregister(service, name) {
            return false;
        }
        self.engine.set_providers(registry);
        true
    }

    // ----- loop -----

    /// Run one loop step
    pub fn iterate(&mut self) {
        self.apply_setting_changes();
        for request in self.engine.iterate() {
            self.handle_request(request);
        }
    }

    fn apply_setting_changes(&mut self) {
        loop {
            match self.settings_rx.try_recv() {
                Ok(change) => self.engine.apply_setting(&change.key),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!("Missed {} setting changes; reloading", missed);
                    for key in WATCHED_KEYS {
                        self.engine.apply_setting(key);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    fn handle_request(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Advance { finished } => {
                let advance = self.queue.next(finished.as_ref(), None);
                if let Err(e) = self.follow(advance, PlayCause::Automatic) {
                    warn!("Could not continue with the next track: {}", e);
                }
            }
            EngineRequest::Crossfade => {
                if self.rendering_stop_track() {
                    debug!("Stop marker on the current track; letting it finish");
                    return;
                }
                let rendering = self.current();
                match self.queue.next(rendering.as_ref(), None) {
                    Advance::Exhausted => debug!("Nothing to crossfade into"),
                    advance => {
                        if let Err(e) = self.follow(advance, PlayCause::Automatic) {
                            warn!("Crossfade into the next track failed: {}", e);
                        }
                    }
                }
            }
            EngineRequest::Gapless => {
                if self.rendering_stop_track() {
                    debug!("Stop marker on the current track; not continuing");
                    return;
                }
                let rendering = self.current();
                match self.queue.next(rendering.as_ref(), None) {
                    Advance::Track(track) => {
                        if let Err(e) = self.engine.queue_gapless(track) {
                            warn!("Could not queue gapless track: {}", e);
                        }
                    }
                    Advance::Exhausted => debug!("Nothing to continue with"),
                    Advance::StopTrack(_) => {}
                }
            }
            EngineRequest::StreamReady(id) => self.on_stream_ready(id),
        }
    }

    fn rendering_stop_track(&self) -> bool {
        self.engine
            .current_track()
            .map(|t| self.queue.is_stop_track(t))
            .unwrap_or(false)
    }

    fn on_stream_ready(&mut self, id: StreamId) {
        let is_current = self.engine.current_stream().map(|s| s.id()) == Some(id);
        if !is_current {
            return;
        }
        let Some(plan) = self.restore.take() else {
            return;
        };

        if let Err(e) = self.engine.seek(plan.position) {
            warn!("Could not seek to the saved position: {}", e);
        }
        if plan.paused {
            self.engine.pause();
        }
        if let Err(e) = self.engine.set_volume(plan.volume) {
            warn!("Could not restore volume: {}", e);
        }
        info!("Resumed at {:.1}s", plan.position);
    }

    // ----- resume -----

    pub fn save_state(&self, path: &Path) -> Result<()> {
        ResumeState {
            state: self.state(),
            position: self.time(),
            playtime_stamp: self.engine.playtime_started_at(),
        }
        .save(path)
    }

    /// Pick up where a saved state left off
    ///
    /// Starts muted, waits for the first stream to settle, then seeks,
    /// pauses if needed and restores the volume. Returns whether a restore
    /// was started.
    pub fn restore_state(&mut self, path: &Path) -> Result<bool> {
        if !self.settings.get_bool(keys::RESUME_PLAYBACK, true) {
            return Ok(false);
        }
        let Some(saved) = ResumeState::load(path)? else {
            return Ok(false);
        };
        if !saved.state.is_active() {
            return Ok(false);
        }

        let volume = self.engine.volume();
        self.engine.set_volume(0.0)?;
        let started = self.play(None);
        if started.is_err() || self.engine.current_track().is_none() {
            self.engine.set_volume(volume)?;
            return started.map(|_| false);
        }

        let paused = saved.state == PlaybackState::Paused
            || self.settings.get_bool(keys::RESUME_PAUSED, false);
        if let Some(stamp) = saved.playtime_stamp {
            debug!("Saved playtime stamp {} is informational only", stamp);
        }
        self.restore = Some(RestorePlan {
            position: saved.position,
            paused,
            volume,
        });
        Ok(true)
    }
}
