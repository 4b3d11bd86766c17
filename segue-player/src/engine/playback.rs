//! Transport operations on the engine
//!
//! play/stop/pause/unpause/seek plus gapless queueing. Everything here
//! runs on the loop thread; backend state changes it requests complete
//! later and are confirmed through settle polling.

use super::core::{RampDirection, TransitionEngine};
use super::{EngineVariant, PlayCause, Task, TimerKey, TransitionIntent};
use crate::backend::NodeState;
use crate::error::{Error, Result};
use crate::stream::{Stream, StreamId};
use crate::track::TrackRef;
use chrono::Utc;
use segue_common::events::{PlaybackState, PlayerEvent};
use segue_common::settings::keys;
use tracing::{debug, info, warn};

impl TransitionEngine {
    /// Decide how the next play is carried out
    pub(super) fn intent_for(&self, cause: PlayCause) -> TransitionIntent {
        if self.variant != EngineVariant::Unified {
            return TransitionIntent::HardCut;
        }
        match cause {
            PlayCause::User if self.settings.get_bool(keys::USER_FADE_ENABLED, false) => {
                TransitionIntent::UserFade {
                    duration_ms: self.settings.get_u64(keys::USER_FADE, 1000),
                }
            }
            PlayCause::Automatic if self.settings.get_bool(keys::CROSSFADING, false) => {
                TransitionIntent::Crossfade {
                    duration_ms: self.crossfade_duration_ms(),
                }
            }
            _ => TransitionIntent::HardCut,
        }
    }

    pub(super) fn crossfade_duration_ms(&self) -> u64 {
        self.settings.get_u64(keys::CROSSFADE_DURATION, 3000)
    }

    /// Make `track` the rendering track
    ///
    /// The incoming stream is configured before anything else is touched:
    /// an unplayable track leaves the current audio as it was.
    pub fn play(&mut self, track: TrackRef, cause: PlayCause) -> Result<StreamId> {
        let intent = self.intent_for(cause);
        debug!("Attempting to play {} ({:?})", track.locator(), intent);

        let id = self.allocate_stream_id();
        let timeout = self.settle_timeout_ms();
        let mut stream = match Stream::new(
            id,
            self.backend.as_mut(),
            &self.registry,
            self.clock.clone(),
            timeout,
        ) {
            Ok(stream) => stream,
            Err(e) => {
                self.report_error(&e);
                return Err(e);
            }
        };

        if let Err(e) = stream.configure(self.backend.as_mut(), track.clone()) {
            stream.destroy(self.backend.as_mut());
            self.report_unplayable(&track, &e);
            if self.attached_count() == 0 {
                self.halt_pipeline();
            }
            return Err(e);
        }

        // a fade still in progress is cut short
        if let Some(old) = self.outgoing.take() {
            self.retire(old);
        }
        let fade = intent.fade_duration_ms();
        if let Some(previous) = self.current.take() {
            match fade {
                Some(_) if self.variant.max_streams() > 1 => self.outgoing = Some(previous),
                _ => self.retire(previous),
            }
        }

        let initial_volume = if fade.is_some() { 0.0 } else { 1.0 };
        if let Err(e) = self.launch(&mut stream, initial_volume) {
            self.mixer.detach(self.backend.as_mut(), &mut stream);
            stream.destroy(self.backend.as_mut());
            self.report_error(&e);
            if self.attached_count() == 0 {
                self.halt_pipeline();
            }
            return Err(e);
        }
        self.scheduler.defer(Task::SettlePoll(id));

        self.buffering_paused = false;
        self.last_buffering_bucket = None;
        self.current = Some(stream);
        self.last_track = Some(track.clone());

        if let Some(duration_ms) = fade {
            self.start_ramp(id, RampDirection::In, duration_ms);
            if let Some(out) = self.outgoing.as_ref().map(|s| s.id()) {
                self.start_ramp(out, RampDirection::Out, duration_ms);
            }
        }

        self.emit(PlayerEvent::PlaybackStart {
            locator: track.locator().to_string(),
            transition: intent.kind(),
            timestamp: Utc::now(),
        });
        self.reset_crossfade_timer();
        Ok(id)
    }

    /// Attach a configured stream and ask for Playing
    fn launch(&mut self, stream: &mut Stream, volume: f64) -> Result<()> {
        let start_pipeline = !self.pipeline_playing();
        stream.set_volume(self.backend.as_mut(), volume)?;
        self.mixer.attach(self.backend.as_mut(), stream)?;
        if start_pipeline {
            self.mixer.set_state(self.backend.as_mut(), NodeState::Playing)?;
        }
        stream.set_state(self.backend.as_mut(), PlaybackState::Playing)
    }

    /// Stop everything
    ///
    /// Returns false when there was nothing to stop.
    pub fn stop(&mut self) -> bool {
        let active =
            self.state().is_active() || self.current.is_some() || self.outgoing.is_some();
        let locator = self.current_locator();

        self.scheduler.clear();
        self.ramps.clear();
        self.crossfade_generation += 1;
        self.buffering_paused = false;
        self.last_buffering_bucket = None;

        for stream in [self.outgoing.take(), self.current.take()]
            .into_iter()
            .flatten()
        {
            self.retire(stream);
        }
        self.halt_pipeline();

        if !active {
            return false;
        }
        info!("Playback stopped");
        self.emit(PlayerEvent::PlaybackEnd {
            locator,
            timestamp: Utc::now(),
        });
        true
    }

    /// Pause output; does not toggle
    ///
    /// Running fades are completed first.
    pub fn pause(&mut self) -> bool {
        if !self.pipeline_playing() && !self.buffering_paused {
            return false;
        }
        self.buffering_paused = false;
        self.finish_fades();
        if self.attached_count() == 0 {
            // only a fading-out stream was left; finishing it ended playback
            return true;
        }

        if let Some(stream) = self.current.as_mut() {
            if let Err(e) = stream.set_state(self.backend.as_mut(), PlaybackState::Paused) {
                warn!("Pausing {} failed: {}", stream.id(), e);
            }
        }
        if let Err(e) = self.mixer.set_state(self.backend.as_mut(), NodeState::Paused) {
            warn!("Pausing pipeline failed: {}", e);
        }
        self.reset_crossfade_timer();

        let locator = self.current_locator();
        self.emit(PlayerEvent::PlaybackPause {
            locator,
            timestamp: Utc::now(),
        });
        true
    }

    /// Resume output
    ///
    /// Network streams are not buffered while paused, so their pipeline is
    /// dropped to Ready first and playback restarts.
    pub fn unpause(&mut self) -> bool {
        if self.state() != PlaybackState::Paused {
            return false;
        }
        self.buffering_paused = false;

        let local = self.current_track().map(|t| t.is_local()).unwrap_or(true);
        if !local {
            debug!("Restarting network stream on unpause");
            if let Err(e) = self.mixer.set_state(self.backend.as_mut(), NodeState::Ready) {
                warn!("Resetting pipeline failed: {}", e);
            }
            if let Some(stream) = self.current.as_ref() {
                stream.restart_position();
            }
        }
        if let Err(e) = self.mixer.set_state(self.backend.as_mut(), NodeState::Playing) {
            warn!("Resuming pipeline failed: {}", e);
        }
        if let Some(stream) = self.current.as_mut() {
            match stream.set_state(self.backend.as_mut(), PlaybackState::Playing) {
                Ok(()) => self.scheduler.defer(Task::SettlePoll(stream.id())),
                Err(e) => warn!("Resuming {} failed: {}", stream.id(), e),
            }
        }
        self.reset_crossfade_timer();

        let locator = self.current_locator();
        self.emit(PlayerEvent::PlaybackResume {
            locator,
            timestamp: Utc::now(),
        });
        true
    }

    /// Seek the current stream; a no-op with nothing playing
    pub fn seek(&mut self, seconds: f64) -> Result<()> {
        let Some(stream) = self.current.as_mut() else {
            debug!("Seek to {:.3}s with nothing playing", seconds);
            return Ok(());
        };
        stream.seek(self.backend.as_mut(), seconds)?;
        self.reset_crossfade_timer();
        Ok(())
    }

    /// Give the current decoder the track to continue with
    pub fn queue_gapless(&mut self, track: TrackRef) -> Result<()> {
        let Some(stream) = self.current.as_mut() else {
            return Err(Error::InvalidState("no stream to continue".into()));
        };
        if let Err(e) = stream.queue_next(self.backend.as_mut(), track.clone()) {
            self.report_unplayable(&track, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Detach and discard a stream
    pub(super) fn retire(&mut self, mut stream: Stream) {
        let id = stream.id();
        self.mixer.detach(self.backend.as_mut(), &mut stream);
        self.scheduler.cancel(&TimerKey::Fade(id));
        self.ramps.remove(&id);
        stream.cancel_settle();
        stream.destroy(self.backend.as_mut());
        debug!("Retired {}", id);
    }

    pub(super) fn halt_pipeline(&mut self) {
        if let Err(e) = self.mixer.set_state(self.backend.as_mut(), NodeState::Null) {
            warn!("Stopping pipeline failed: {}", e);
        }
    }

    fn report_unplayable(&mut self, track: &TrackRef, error: &Error) {
        let reason = match error {
            Error::Unplayable { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        warn!("Failed to start playing {}: {}", track.locator(), reason);
        self.emit(PlayerEvent::TrackUnplayable {
            locator: track.locator().to_string(),
            reason,
            timestamp: Utc::now(),
        });
        self.report_error(error);
    }

    pub(super) fn report_error(&mut self, error: &Error) {
        self.emit(PlayerEvent::PlaybackError {
            message: error.to_string(),
            timestamp: Utc::now(),
        });
    }
}
