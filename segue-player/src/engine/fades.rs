//! Volume ramps and the predictive crossfade timer
//!
//! A ramp moves a stream's volume by 0.01 per tick of a repeating timer
//! whose period is the fade duration divided by 100. The outgoing stream
//! is retired on the tick that takes it to zero.
//!
//! The crossfade timer is recomputed from the current position whenever
//! playback moves (play, seek, pause, unpause). Each recompute bumps a
//! generation; a fire carrying an older generation, or computed for a
//! stream that is no longer current, does nothing.

use super::core::{Ramp, RampDirection, TransitionEngine};
use super::{EngineRequest, EngineVariant, Task, TimerKey};
use crate::stream::{Stream, StreamId};
use segue_common::settings::keys;
use tracing::{debug, info, trace, warn};

/// Steps in a full ramp
const RAMP_STEPS: u64 = 100;

impl TransitionEngine {
    pub(super) fn stream(&self, id: StreamId) -> Option<&Stream> {
        [self.current.as_ref(), self.outgoing.as_ref()]
            .into_iter()
            .flatten()
            .find(|s| s.id() == id)
    }

    /// Start ramping a stream from its present volume
    pub(super) fn start_ramp(&mut self, id: StreamId, direction: RampDirection, duration_ms: u64) {
        let level = match direction {
            RampDirection::In => 0,
            RampDirection::Out => match self.stream(id) {
                Some(stream) => {
                    let volume = stream.volume(self.backend.as_ref());
                    (volume.clamp(0.0, 1.0) * 100.0).round() as u8
                }
                None => return,
            },
        };
        let period = (duration_ms / RAMP_STEPS).max(1);
        debug!(
            "Fading {} {:?} over {} ms ({} ms steps)",
            id, direction, duration_ms, period
        );
        self.ramps.insert(id, Ramp { level, direction });
        let now = self.clock.now_ms();
        self.scheduler
            .arm_repeating(TimerKey::Fade(id), now, period, Task::FadeStep(id));
    }

    pub(super) fn fade_step(&mut self, id: StreamId) {
        let Some(ramp) = self.ramps.get_mut(&id) else {
            debug!("Fade step for {} without a ramp", id);
            self.scheduler.cancel(&TimerKey::Fade(id));
            return;
        };
        ramp.level = match ramp.direction {
            RampDirection::In => (ramp.level + 1).min(100),
            RampDirection::Out => ramp.level.saturating_sub(1),
        };
        let Ramp { level, direction } = *ramp;
        let volume = f64::from(level) / 100.0;

        let backend = self.backend.as_mut();
        match [self.current.as_mut(), self.outgoing.as_mut()]
            .into_iter()
            .flatten()
            .find(|s| s.id() == id)
        {
            Some(stream) => {
                if let Err(e) = stream.set_volume(backend, volume) {
                    warn!("Fade step on {} failed: {}", id, e);
                }
            }
            None => {
                debug!("Fade step for retired {}", id);
                self.ramps.remove(&id);
                self.scheduler.cancel(&TimerKey::Fade(id));
                return;
            }
        }
        trace!("{} volume {:.2}", id, volume);

        match direction {
            RampDirection::In if level >= 100 => {
                self.ramps.remove(&id);
                self.scheduler.cancel(&TimerKey::Fade(id));
                debug!("{} faded in", id);
            }
            RampDirection::Out if level == 0 => self.retire_outgoing(id),
            _ => {}
        }
    }

    fn retire_outgoing(&mut self, id: StreamId) {
        match self.outgoing.take() {
            Some(stream) if stream.id() == id => {
                self.retire(stream);
                if self.current.is_none() {
                    info!("Faded out with nothing left to play");
                    self.stop();
                }
            }
            other => {
                self.outgoing = other;
                self.ramps.remove(&id);
                self.scheduler.cancel(&TimerKey::Fade(id));
                debug!("{} faded out but is not the outgoing stream", id);
            }
        }
    }

    /// Complete every running ramp at once
    pub(super) fn finish_fades(&mut self) {
        let ramps: Vec<(StreamId, Ramp)> = self.ramps.drain().collect();
        for (id, ramp) in ramps {
            self.scheduler.cancel(&TimerKey::Fade(id));
            match ramp.direction {
                RampDirection::In => {
                    let backend = self.backend.as_mut();
                    if let Some(stream) = self.current.as_mut().filter(|s| s.id() == id) {
                        if let Err(e) = stream.set_volume(backend, 1.0) {
                            warn!("Completing fade on {} failed: {}", id, e);
                        }
                    }
                }
                RampDirection::Out => self.retire_outgoing(id),
            }
        }
    }

    /// Recompute when the current track reaches its crossfade point
    ///
    /// Only armed while playing in the unified engine with crossfading
    /// enabled and a known duration; otherwise the drained notification
    /// ends the track.
    pub(super) fn reset_crossfade_timer(&mut self) {
        self.crossfade_generation += 1;
        self.scheduler.cancel(&TimerKey::Crossfade);

        if self.variant != EngineVariant::Unified
            || !self.settings.get_bool(keys::CROSSFADING, false)
            || !self.pipeline_playing()
        {
            return;
        }
        let Some(stream) = self.current.as_ref() else {
            return;
        };
        let Some(duration) = stream.track().and_then(|t| t.duration()) else {
            debug!("{} has no known duration; waiting for drain", stream.id());
            return;
        };

        let fade_ms = self.crossfade_duration_ms() as i64;
        let duration_ms = (duration * 1000.0) as i64;
        let elapsed_ms = (stream.effective_time(self.backend.as_ref()) * 1000.0) as i64;
        let delay = duration_ms - fade_ms - elapsed_ms;
        let task = Task::Crossfade {
            generation: self.crossfade_generation,
            stream: stream.id(),
        };

        if delay <= 0 {
            debug!("Crossfade point of {} already passed", stream.id());
            self.scheduler.defer(task);
        } else {
            debug!("Crossfade for {} in {} ms", stream.id(), delay);
            let now = self.clock.now_ms();
            self.scheduler
                .arm_once(TimerKey::Crossfade, now, delay as u64, task);
        }
    }

    pub(super) fn crossfade_due(&mut self, generation: u64, stream: StreamId) {
        let current = self.current.as_ref().map(|s| s.id());
        if generation != self.crossfade_generation || current != Some(stream) {
            debug!(
                "Ignoring stale crossfade timer for {} (generation {})",
                stream, generation
            );
            return;
        }
        info!("Crossfade point reached on {}", stream);
        self.requests.push(EngineRequest::Crossfade);
    }
}
