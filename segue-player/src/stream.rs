//! One track's pipeline segment
//!
//! decoder -> resampler -> stream providers -> volume, inside a bin whose
//! output feeds one mixer pad. A stream is bound to exactly one track; a
//! gapless handoff produces a new `Stream` value that takes over the nodes.
//!
//! Requesting Playing does not mean Playing was reached. Every Playing
//! request arms a settle wait that the engine polls once per loop
//! iteration until the bin reports Playing or the wait times out. Seeks
//! issued meanwhile are held (latest wins) and applied once it resolves.

use crate::backend::{Backend, NodeId, NodeKind, NodeState, PadHandle, SeekFlags, Ticks};
use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::providers::{services, ProviderChain, ProviderRegistry};
use crate::track::TrackRef;
use crate::uri;
use segue_common::events::PlaybackState;
use segue_common::timing::{seconds_to_ticks, ticks_to_seconds};
use std::cell::Cell;
use std::fmt;
use tracing::{debug, info, trace, warn};

/// Engine-unique stream identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

/// Outstanding Playing request
#[derive(Debug, Clone, Copy)]
struct SettleWait {
    generation: u64,
    deadline_ms: u64,
}

/// Result of polling a settle wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlePoll {
    /// No wait armed (finished or cancelled)
    Idle,
    /// Still waiting; poll again next iteration
    Pending,
    /// The bin reached Playing
    Settled { generation: u64 },
    /// Gave up waiting
    TimedOut { generation: u64 },
}

pub struct Stream {
    id: StreamId,
    bin: NodeId,
    decoder: NodeId,
    resampler: NodeId,
    chain: ProviderChain,
    volume: NodeId,
    pad: Option<PadHandle>,

    track: Option<TrackRef>,
    next_track: Option<TrackRef>,
    last_position: Cell<Ticks>,
    /// Clock time playback last (re)started; None while not crediting
    playtime_stamp: Option<u64>,

    settle: Option<SettleWait>,
    settle_generation: u64,
    settle_timeout_ms: u64,
    pending_seek: Option<f64>,
    /// Disc drive still to be applied to the source node
    pending_device: Option<String>,

    clock: SharedClock,
}

impl Stream {
    /// Build the stream's nodes; nothing is attached yet
    pub fn new(
        id: StreamId,
        backend: &mut dyn Backend,
        registry: &ProviderRegistry,
        clock: SharedClock,
        settle_timeout_ms: u64,
    ) -> Result<Self> {
        let bin = backend.make_node(NodeKind::Bin, &id.to_string())?;
        let decoder = backend.make_node(NodeKind::Decode, &format!("{}-decoder", id))?;
        let resampler = backend.make_node(NodeKind::Resample, &format!("{}-resampler", id))?;
        let chain = ProviderChain::new(
            backend,
            registry,
            services::STREAM_ELEMENT,
            &format!("{}-providers", id),
        )?;
        let volume = backend.make_node(NodeKind::Volume, &format!("{}-volume", id))?;

        for node in [decoder, resampler, chain.slot(), volume] {
            backend.add_to_bin(bin, node)?;
        }
        backend.link(decoder, resampler)?;
        backend.link(resampler, chain.slot())?;
        backend.link(chain.slot(), volume)?;

        trace!("Built {}", id);
        Ok(Self {
            id,
            bin,
            decoder,
            resampler,
            chain,
            volume,
            pad: None,
            track: None,
            next_track: None,
            last_position: Cell::new(0),
            playtime_stamp: None,
            settle: None,
            settle_generation: 0,
            settle_timeout_ms,
            pending_seek: None,
            pending_device: None,
            clock,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Output node, linked into the mixer
    pub fn bin(&self) -> NodeId {
        self.bin
    }

    pub fn decoder(&self) -> NodeId {
        self.decoder
    }

    pub fn volume_node(&self) -> NodeId {
        self.volume
    }

    pub fn pad(&self) -> Option<PadHandle> {
        self.pad
    }

    pub(crate) fn set_pad(&mut self, pad: Option<PadHandle>) {
        self.pad = pad;
    }

    pub fn track(&self) -> Option<&TrackRef> {
        self.track.as_ref()
    }

    /// Whether a backend node belongs to this stream
    pub fn contains(&self, node: NodeId) -> bool {
        node == self.bin
            || node == self.decoder
            || node == self.resampler
            || node == self.volume
            || node == self.chain.slot()
            || self.chain.nodes().contains(&node)
    }

    /// Bind the stream to a track
    ///
    /// Fails without touching the graph when local media is missing or the
    /// locator is not an absolute URI.
    pub fn configure(&mut self, backend: &mut dyn Backend, track: TrackRef) -> Result<()> {
        let locator = track.locator().to_string();
        validate(&track)?;

        let (input, device) = uri::split_disc_device(&locator);
        backend
            .set_uri(self.decoder, input)
            .map_err(|e| Error::unplayable(&locator, e.to_string()))?;

        info!("Playing {}", locator);
        self.pending_device = device.map(str::to_string);
        self.track = Some(track);
        self.playtime_stamp = Some(self.clock.now_ms());
        Ok(())
    }

    /// Source node announced by the backend
    ///
    /// Applies the disc drive once; later announcements are ignored.
    pub fn on_source_ready(&mut self, backend: &mut dyn Backend, source: NodeId) -> bool {
        let Some(device) = self.pending_device.take() else {
            return false;
        };
        if let Err(e) = backend.set_property(source, "device", &device) {
            warn!("Could not set disc device {} on {}: {}", device, self.id, e);
        } else {
            debug!("{} reading from {}", self.id, device);
        }
        true
    }

    pub fn set_state(&mut self, backend: &mut dyn Backend, target: PlaybackState) -> Result<()> {
        debug!("Setting state on {} to {}", self.id, target);
        self.settle = None;
        match target {
            PlaybackState::Playing => {
                backend.set_state(self.bin, NodeState::Playing)?;
                self.arm_settle();
                self.flush_playtime();
                self.playtime_stamp = Some(self.clock.now_ms());
            }
            PlaybackState::Paused => {
                self.refresh_position(backend);
                self.flush_playtime();
                backend.set_state(self.bin, NodeState::Paused)?;
                self.replay_pending_seek(backend);
            }
            PlaybackState::Stopped => {
                self.flush_playtime();
                self.pending_seek = None;
                backend.set_state(self.bin, NodeState::Null)?;
            }
        }
        Ok(())
    }

    fn arm_settle(&mut self) {
        self.settle_generation += 1;
        self.settle = Some(SettleWait {
            generation: self.settle_generation,
            deadline_ms: self.clock.now_ms() + self.settle_timeout_ms,
        });
    }

    /// Whether a Playing request is still unconfirmed
    pub fn is_settling(&self) -> bool {
        self.settle.is_some()
    }

    pub fn settle_generation(&self) -> u64 {
        self.settle_generation
    }

    /// Drop the settle wait without resolving it
    pub fn cancel_settle(&mut self) {
        if self.settle.take().is_some() {
            debug!("{} settle wait cancelled", self.id);
        }
    }

    /// Check the outstanding Playing request
    ///
    /// A bin that came to rest in Paused is asked for Playing again.
    pub fn poll_settle(&mut self, backend: &mut dyn Backend) -> SettlePoll {
        let Some(wait) = self.settle else {
            return SettlePoll::Idle;
        };

        let state = backend.state(self.bin);
        let pending = backend.pending_state(self.bin);

        if state == NodeState::Playing && pending.is_none() {
            self.settle = None;
            self.replay_pending_seek(backend);
            return SettlePoll::Settled {
                generation: wait.generation,
            };
        }

        if self.clock.now_ms() >= wait.deadline_ms {
            warn!(
                "{} did not reach PLAYING within {} ms (state {})",
                self.id, self.settle_timeout_ms, state
            );
            self.settle = None;
            self.replay_pending_seek(backend);
            return SettlePoll::TimedOut {
                generation: wait.generation,
            };
        }

        if state == NodeState::Paused && pending.is_none() {
            debug!("Settling state on {}", self.id);
            if let Err(e) = backend.set_state(self.bin, NodeState::Playing) {
                warn!("Re-requesting PLAYING on {} failed: {}", self.id, e);
            }
        }
        SettlePoll::Pending
    }

    /// Seek to `seconds`; held until the settle wait resolves
    pub fn seek(&mut self, backend: &mut dyn Backend, seconds: f64) -> Result<()> {
        let seconds = seconds.max(0.0);
        if self.is_settling() {
            debug!("{} settling, holding seek to {:.3}s", self.id, seconds);
            self.pending_seek = Some(seconds);
            return Ok(());
        }
        self.seek_now(backend, seconds)
    }

    fn seek_now(&mut self, backend: &mut dyn Backend, seconds: f64) -> Result<()> {
        let target = seconds_to_ticks(seconds);
        backend.seek(self.decoder, target, SeekFlags::FLUSH_ACCURATE)?;
        self.last_position.set(target);
        Ok(())
    }

    fn replay_pending_seek(&mut self, backend: &mut dyn Backend) {
        if let Some(seconds) = self.pending_seek.take() {
            debug!("{} applying held seek to {:.3}s", self.id, seconds);
            if let Err(e) = self.seek_now(backend, seconds) {
                warn!("Held seek on {} failed: {}", self.id, e);
            }
        }
    }

    /// Seek still waiting for the settle wait, in seconds
    pub fn pending_seek(&self) -> Option<f64> {
        self.pending_seek
    }

    /// Position in ticks; the cached value while paused
    pub fn position(&self, backend: &dyn Backend) -> Ticks {
        let paused = backend.state(self.bin) == NodeState::Paused
            && backend.pending_state(self.bin).is_none();
        if paused {
            return self.last_position.get();
        }
        self.refresh_position(backend)
    }

    fn refresh_position(&self, backend: &dyn Backend) -> Ticks {
        match backend.query_position(self.decoder) {
            Ok(position) => self.last_position.set(position),
            Err(e) => trace!("{} position query: {}", self.id, e),
        }
        self.last_position.get()
    }

    /// Forget the cached position after the decoder was restarted
    pub(crate) fn restart_position(&self) {
        self.last_position.set(0);
    }

    /// Position in seconds, counting a held seek as already applied
    pub fn effective_time(&self, backend: &dyn Backend) -> f64 {
        match self.pending_seek {
            Some(seconds) => seconds,
            None => ticks_to_seconds(self.position(backend)),
        }
    }

    pub fn volume(&self, backend: &dyn Backend) -> f64 {
        backend.volume(self.volume).unwrap_or(0.0)
    }

    pub fn set_volume(&self, backend: &mut dyn Backend, volume: f64) -> Result<()> {
        backend.set_volume(self.volume, volume.clamp(0.0, 1.0))
    }

    /// Credit the time since the last stamp to the track
    pub fn flush_playtime(&mut self) {
        if let (Some(track), Some(stamp)) = (&self.track, self.playtime_stamp.take()) {
            let elapsed = self.clock.now_ms().saturating_sub(stamp) as f64 / 1000.0;
            track.add_playtime(elapsed);
            trace!("{} credited {:.3}s to {}", self.id, elapsed, track.locator());
        }
    }

    /// Start crediting playtime again after output was held
    pub(crate) fn resume_playtime(&mut self) {
        if self.playtime_stamp.is_none() {
            self.playtime_stamp = Some(self.clock.now_ms());
        }
    }

    pub fn playtime_stamp(&self) -> Option<u64> {
        self.playtime_stamp
    }

    // ----- gapless -----

    /// Hand the decoder its next URI
    pub fn queue_next(&mut self, backend: &mut dyn Backend, track: TrackRef) -> Result<()> {
        validate(&track)?;
        let (input, _) = uri::split_disc_device(track.locator());
        backend
            .set_next_uri(self.decoder, input)
            .map_err(|e| Error::unplayable(track.locator(), e.to_string()))?;
        debug!("{} will continue with {}", self.id, track.locator());
        self.next_track = Some(track);
        Ok(())
    }

    pub fn queued_next(&self) -> Option<&TrackRef> {
        self.next_track.as_ref()
    }

    pub fn take_queued_next(&mut self) -> Option<TrackRef> {
        self.next_track.take()
    }

    /// Close out this stream's track and give its nodes to `track`
    pub fn handoff(mut self, id: StreamId, track: TrackRef) -> Stream {
        self.flush_playtime();
        let now = self.clock.now_ms();
        Stream {
            id,
            track: Some(track),
            next_track: None,
            last_position: Cell::new(0),
            playtime_stamp: Some(now),
            settle: None,
            pending_seek: None,
            pending_device: None,
            ..self
        }
    }

    // ----- teardown -----

    pub fn rebuild_providers(
        &mut self,
        backend: &mut dyn Backend,
        registry: &ProviderRegistry,
    ) -> Result<()> {
        self.chain.rebuild(backend, registry)
    }

    /// Stop and remove every node; the stream must already be detached
    pub fn destroy(mut self, backend: &mut dyn Backend) {
        self.flush_playtime();
        if let Err(e) = backend.set_state(self.bin, NodeState::Null) {
            debug!("{} teardown state change: {}", self.id, e);
        }
        if let Err(e) = backend.remove_node(self.bin) {
            debug!("{} removal: {}", self.id, e);
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("track", &self.track.as_ref().map(|t| t.locator().to_string()))
            .field("settling", &self.settle.is_some())
            .field("pending_seek", &self.pending_seek)
            .finish()
    }
}

fn validate(track: &TrackRef) -> Result<()> {
    let locator = track.locator();
    uri::require_absolute(locator).map_err(|e| Error::unplayable(locator, e.to_string()))?;
    if track.is_local() && !track.exists() {
        return Err(Error::unplayable(locator, "file does not exist"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimBackend, SimConfig};
    use crate::clock::{Clock, ManualClock};
    use crate::track::MediaTrack;
    use std::sync::Arc;

    struct Rig {
        clock: Arc<ManualClock>,
        sim: SimBackend,
        stream: Stream,
    }

    fn rig(config: SimConfig) -> Rig {
        let clock = Arc::new(ManualClock::new());
        let mut sim = SimBackend::with_config(clock.clone(), config);
        let stream = Stream::new(
            StreamId(1),
            &mut sim,
            &ProviderRegistry::new(),
            clock.clone(),
            5000,
        )
        .unwrap();
        Rig { clock, sim, stream }
    }

    fn remote(uri: &str) -> TrackRef {
        MediaTrack::new(uri, Some(120.0)).unwrap().into_ref()
    }

    /// Poll the settle wait the way the engine loop does
    fn settle(rig: &mut Rig) -> SettlePoll {
        for _ in 0..200 {
            rig.clock.advance(5);
            match rig.stream.poll_settle(&mut rig.sim) {
                SettlePoll::Pending => continue,
                other => return other,
            }
        }
        panic!("stream never settled");
    }

    #[test]
    fn test_missing_local_file_leaves_graph_alone() {
        let mut rig = rig(SimConfig::default());
        let track = MediaTrack::new("file:///nowhere/missing.flac", None)
            .unwrap()
            .into_ref();

        let err = rig.stream.configure(&mut rig.sim, track).unwrap_err();
        assert!(matches!(err, Error::Unplayable { .. }));
        assert!(rig.stream.track().is_none());
        assert_eq!(rig.sim.uri(rig.stream.decoder()), None);
    }

    #[test]
    fn test_backend_rejection_is_unplayable() {
        let mut rig = rig(SimConfig::default());
        rig.sim.fail_uri("http://radio.example/x");
        let err = rig
            .stream
            .configure(&mut rig.sim, remote("http://radio.example/x"))
            .unwrap_err();
        assert!(matches!(err, Error::Unplayable { .. }));
    }

    #[test]
    fn test_settle_survives_paused_glitch() {
        let mut rig = rig(SimConfig {
            settle_glitch: true,
            ..SimConfig::default()
        });
        let pipeline = rig.sim.make_node(NodeKind::Bin, "pipeline").unwrap();
        rig.sim.add_to_bin(pipeline, rig.stream.bin()).unwrap();
        rig.sim.add_media("http://radio.example/a", Some(120_000));
        rig.stream
            .configure(&mut rig.sim, remote("http://radio.example/a"))
            .unwrap();

        rig.stream.set_state(&mut rig.sim, PlaybackState::Playing).unwrap();
        assert!(rig.stream.is_settling());

        assert!(matches!(settle(&mut rig), SettlePoll::Settled { generation: 1 }));
        assert!(!rig.stream.is_settling());
        assert_eq!(rig.sim.state(rig.stream.bin()), NodeState::Playing);
    }

    #[test]
    fn test_seek_held_until_settled() {
        let mut rig = rig(SimConfig::default());
        rig.sim.add_media("http://radio.example/a", Some(120_000));
        rig.stream
            .configure(&mut rig.sim, remote("http://radio.example/a"))
            .unwrap();
        rig.stream.set_state(&mut rig.sim, PlaybackState::Playing).unwrap();

        rig.stream.seek(&mut rig.sim, 10.0).unwrap();
        rig.stream.seek(&mut rig.sim, 30.0).unwrap();
        assert_eq!(rig.stream.pending_seek(), Some(30.0));
        assert_eq!(rig.stream.effective_time(&rig.sim), 30.0);

        settle(&mut rig);
        assert_eq!(rig.stream.pending_seek(), None);
        let position = ticks_to_seconds(rig.stream.position(&rig.sim));
        assert!((position - 30.0).abs() < 0.1, "position {}", position);
    }

    #[test]
    fn test_settle_times_out() {
        let mut rig = rig(SimConfig {
            preroll_ms: 60_000,
            ..SimConfig::default()
        });
        rig.sim.add_media("http://radio.example/a", Some(120_000));
        rig.stream
            .configure(&mut rig.sim, remote("http://radio.example/a"))
            .unwrap();
        rig.stream.set_state(&mut rig.sim, PlaybackState::Playing).unwrap();

        let mut outcome = SettlePoll::Pending;
        for _ in 0..2_000 {
            rig.clock.advance(5);
            outcome = rig.stream.poll_settle(&mut rig.sim);
            if outcome != SettlePoll::Pending {
                break;
            }
        }
        assert_eq!(outcome, SettlePoll::TimedOut { generation: 1 });
        assert_eq!(rig.clock.now_ms(), 5_000);
        assert_eq!(rig.stream.poll_settle(&mut rig.sim), SettlePoll::Idle);
    }

    #[test]
    fn test_position_cached_while_paused() {
        let mut rig = rig(SimConfig::default());
        rig.sim.add_media("http://radio.example/a", Some(120_000));
        rig.stream
            .configure(&mut rig.sim, remote("http://radio.example/a"))
            .unwrap();
        rig.stream.set_state(&mut rig.sim, PlaybackState::Playing).unwrap();
        settle(&mut rig);

        rig.clock.advance(2_000);
        rig.stream.set_state(&mut rig.sim, PlaybackState::Paused).unwrap();
        let paused_at = rig.stream.position(&rig.sim);
        rig.clock.advance(3_000);
        assert_eq!(rig.stream.position(&rig.sim), paused_at);
        assert!(ticks_to_seconds(paused_at) > 1.9);
    }

    #[test]
    fn test_playtime_not_double_counted() {
        let mut rig = rig(SimConfig::default());
        let track = remote("http://radio.example/a");
        rig.sim.add_media("http://radio.example/a", Some(120_000));
        rig.stream.configure(&mut rig.sim, track.clone()).unwrap();

        rig.stream.set_state(&mut rig.sim, PlaybackState::Playing).unwrap();
        rig.clock.advance(10_000);
        rig.stream.set_state(&mut rig.sim, PlaybackState::Paused).unwrap();
        rig.clock.advance(60_000);
        rig.stream.set_state(&mut rig.sim, PlaybackState::Paused).unwrap();
        rig.stream.set_state(&mut rig.sim, PlaybackState::Playing).unwrap();
        rig.clock.advance(5_000);
        rig.stream.set_state(&mut rig.sim, PlaybackState::Stopped).unwrap();

        assert!((track.playtime() - 15.0).abs() <= 1.0, "playtime {}", track.playtime());
    }

    #[test]
    fn test_disc_device_applied_once() {
        let mut rig = rig(SimConfig::default());
        let track = remote("cdda://3#/dev/sr1");
        rig.stream.configure(&mut rig.sim, track).unwrap();
        assert_eq!(rig.sim.uri(rig.stream.decoder()).as_deref(), Some("cdda://3"));

        let source = rig
            .sim
            .make_node(NodeKind::Effect("cdparanoiasrc".into()), "source")
            .unwrap();
        assert!(rig.stream.on_source_ready(&mut rig.sim, source));
        assert_eq!(rig.sim.property(source, "device").as_deref(), Some("/dev/sr1"));

        rig.sim.set_property(source, "device", "/dev/sr0").unwrap();
        assert!(!rig.stream.on_source_ready(&mut rig.sim, source));
        assert_eq!(rig.sim.property(source, "device").as_deref(), Some("/dev/sr0"));
    }

    #[test]
    fn test_handoff_keeps_nodes() {
        let mut rig = rig(SimConfig::default());
        let a = remote("http://radio.example/a");
        let b = remote("http://radio.example/b");
        rig.stream.configure(&mut rig.sim, a.clone()).unwrap();
        rig.stream.queue_next(&mut rig.sim, b.clone()).unwrap();
        let decoder = rig.stream.decoder();

        let queued = rig.stream.take_queued_next().unwrap();
        rig.clock.advance(4_000);
        let next = rig.stream.handoff(StreamId(2), queued);

        assert_eq!(next.id(), StreamId(2));
        assert_eq!(next.decoder(), decoder);
        assert_eq!(next.track().map(|t| t.locator()), Some(b.locator()));
        assert!((a.playtime() - 4.0).abs() < 1e-9);
    }
}
