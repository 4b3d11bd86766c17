//! Backend message dispatch
//!
//! Messages are matched to the stream that owns the originating node.
//! Messages from nodes that no longer exist (a retired stream) are
//! dropped with a debug log.

use super::core::TransitionEngine;
use super::{EngineRequest, EngineVariant, TimerKey};
use crate::backend::{BackendMessage, NodeId, NodeState};
use crate::stream::StreamId;
use chrono::Utc;
use segue_common::events::{PlayerEvent, TransitionKind};
use tracing::{debug, error, info, trace, warn};

/// Buffering progress is reported in steps of this many percent
const BUFFERING_STEP: u8 = 5;

/// Which of the engine's streams a node belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Current(StreamId),
    Outgoing(StreamId),
    Output,
    Unknown,
}

impl TransitionEngine {
    fn owner(&self, node: NodeId) -> Owner {
        if let Some(stream) = self.current.as_ref().filter(|s| s.contains(node)) {
            return Owner::Current(stream.id());
        }
        if let Some(stream) = self.outgoing.as_ref().filter(|s| s.contains(node)) {
            return Owner::Outgoing(stream.id());
        }
        if self.mixer.contains(node) {
            return Owner::Output;
        }
        Owner::Unknown
    }

    pub(super) fn handle_message(&mut self, message: BackendMessage) {
        trace!("Bus message: {:?}", message);
        let owner = self.owner(message.origin());

        match message {
            BackendMessage::Drained { .. } => self.on_drained(owner),
            BackendMessage::AboutToFinish { .. } => self.on_about_to_finish(owner),
            BackendMessage::StreamStart { .. } => self.on_stream_start(owner),
            BackendMessage::Tag { tags, .. } => self.on_tags(owner, tags),
            BackendMessage::Error { message, .. } => self.on_error(owner, message),
            BackendMessage::Buffering { percent, .. } => self.on_buffering(percent),
            BackendMessage::SourceReady { decoder, source } => {
                self.on_source_ready(decoder, source)
            }
            BackendMessage::Eos { node } => debug!("End of stream from {}", node),
        }
    }

    fn on_drained(&mut self, owner: Owner) {
        match owner {
            Owner::Current(id) => {
                debug!("{} drained", id);
                let mut finished = None;
                if let Some(stream) = self.current.take() {
                    finished = stream.track().cloned();
                    self.retire(stream);
                }
                self.scheduler.cancel(&TimerKey::Crossfade);
                self.crossfade_generation += 1;
                self.requests.push(EngineRequest::Advance { finished });
            }
            Owner::Outgoing(id) => {
                debug!("{} drained while fading out", id);
                if let Some(stream) = self.outgoing.take() {
                    self.retire(stream);
                }
            }
            _ => debug!("Drain from a retired stream"),
        }
    }

    fn on_about_to_finish(&mut self, owner: Owner) {
        let Owner::Current(id) = owner else {
            return;
        };
        if self.variant != EngineVariant::Gapless || !self.backend.supports_gapless() {
            return;
        }
        let queued = self
            .current
            .as_ref()
            .map(|s| s.queued_next().is_some())
            .unwrap_or(true);
        if !queued {
            debug!("{} about to finish; asking for the next track", id);
            self.requests.push(EngineRequest::Gapless);
        }
    }

    fn on_stream_start(&mut self, owner: Owner) {
        let Owner::Current(id) = owner else {
            return;
        };
        let Some(next) = self.current.as_mut().and_then(|s| s.take_queued_next()) else {
            debug!("{} started without a queued track", id);
            return;
        };

        let new_id = self.allocate_stream_id();
        if let Some(stream) = self.current.take() {
            self.current = Some(stream.handoff(new_id, next.clone()));
        }
        info!("Gapless handoff {} -> {} ({})", id, new_id, next.locator());
        self.last_track = Some(next.clone());
        self.emit(PlayerEvent::PlaybackStart {
            locator: next.locator().to_string(),
            transition: TransitionKind::Gapless,
            timestamp: Utc::now(),
        });
        self.reset_crossfade_timer();
    }

    fn on_source_ready(&mut self, decoder: NodeId, source: NodeId) {
        let backend = self.backend.as_mut();
        match [self.current.as_mut(), self.outgoing.as_mut()]
            .into_iter()
            .flatten()
            .find(|s| s.decoder() == decoder)
        {
            Some(stream) => {
                stream.on_source_ready(backend, source);
            }
            None => debug!("Source announced for retired decoder {}", decoder),
        }
    }

    fn on_tags(&mut self, owner: Owner, tags: Vec<(String, String)>) {
        let locator = match owner {
            Owner::Current(id) | Owner::Outgoing(id) => self
                .stream(id)
                .and_then(|s| s.track())
                .map(|t| t.locator().to_string()),
            Owner::Output => None,
            Owner::Unknown => return,
        };
        self.emit(PlayerEvent::TagsParsed {
            locator,
            tags,
            timestamp: Utc::now(),
        });
    }

    fn on_error(&mut self, owner: Owner, message: String) {
        match owner {
            Owner::Current(id) | Owner::Outgoing(id) => {
                error!("Playback error on {}: {}", id, message);
                self.emit(PlayerEvent::PlaybackError {
                    message,
                    timestamp: Utc::now(),
                });
                let stream = match owner {
                    Owner::Current(_) => self.current.take(),
                    _ => self.outgoing.take(),
                };
                if let Some(stream) = stream {
                    self.retire(stream);
                }
                if self.attached_count() == 0 {
                    self.stop();
                } else if self.current.is_none() {
                    // the outgoing stream finishes its ramp, then playback ends
                    self.reset_crossfade_timer();
                }
            }
            Owner::Output => {
                error!("Output error: {}", message);
                self.emit(PlayerEvent::PlaybackError {
                    message,
                    timestamp: Utc::now(),
                });
                self.stop();
            }
            Owner::Unknown => debug!("Error from a retired node: {}", message),
        }
    }

    /// Hold output below 100 %, release it at 100 %
    fn on_buffering(&mut self, percent: u8) {
        let percent = percent.min(100);
        if percent < 100 {
            if !self.buffering_paused && self.pipeline_playing() {
                debug!("Buffering; holding output");
                let backend = self.backend.as_ref();
                for stream in [self.current.as_mut(), self.outgoing.as_mut()]
                    .into_iter()
                    .flatten()
                {
                    // cache the position before the decoder stops reporting it
                    stream.position(backend);
                    stream.flush_playtime();
                }
                match self.mixer.set_state(self.backend.as_mut(), NodeState::Paused) {
                    Ok(()) => self.buffering_paused = true,
                    Err(e) => warn!("Could not hold output while buffering: {}", e),
                }
            }
        } else if self.buffering_paused {
            self.buffering_paused = false;
            if let Err(e) = self.mixer.set_state(self.backend.as_mut(), NodeState::Playing) {
                warn!("Could not resume output after buffering: {}", e);
            }
            for stream in [self.current.as_mut(), self.outgoing.as_mut()]
                .into_iter()
                .flatten()
            {
                stream.resume_playtime();
            }
            info!("Buffering complete");
        }

        let bucket = percent / BUFFERING_STEP * BUFFERING_STEP;
        if self.last_buffering_bucket != Some(bucket) {
            self.last_buffering_bucket = Some(bucket);
            self.emit(PlayerEvent::PlaybackBuffering {
                percent: bucket,
                timestamp: Utc::now(),
            });
        }
        if percent == 100 {
            self.last_buffering_bucket = None;
        }
    }
}
