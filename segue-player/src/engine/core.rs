//! Core transition engine - construction, loop step, accessors
//!
//! **Responsibilities:**
//! - TransitionEngine struct definition and initialization
//! - The cooperative loop step (`iterate`)
//! - Event emission to the bus and engine-scoped observers
//! - Setting reloads

use super::{EngineRequest, EngineVariant, Phase, Task, TimerKey};
use crate::backend::{Backend, BackendMessage, NodeState};
use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::mixer::MixerGraph;
use crate::observers::{ObserverId, ObserverRegistry};
use crate::providers::ProviderRegistry;
use crate::scheduler::Scheduler;
use crate::stream::{Stream, StreamId};
use crate::track::TrackRef;
use chrono::{DateTime, Utc};
use segue_common::events::{EventBus, PlaybackState, PlayerEvent};
use segue_common::settings::keys;
use segue_common::timing::{seconds_to_ticks, ticks_to_seconds};
use segue_common::SettingsStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Default wait for a stream to reach Playing
pub const DEFAULT_SETTLE_TIMEOUT_MS: u64 = 5000;

const EVENT_CAPACITY: usize = 256;

/// Which way a volume ramp moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RampDirection {
    In,
    Out,
}

/// Volume ramp in hundredths
#[derive(Debug, Clone, Copy)]
pub(super) struct Ramp {
    pub(super) level: u8,
    pub(super) direction: RampDirection,
}

/// Transition engine
///
/// Owns the mixer graph and up to two streams. `current` is the stream the
/// player reports on; `outgoing` is only ever set while a fade is running.
pub struct TransitionEngine {
    pub(super) backend: Box<dyn Backend>,
    pub(super) bus: mpsc::UnboundedReceiver<BackendMessage>,
    pub(super) clock: SharedClock,
    pub(super) settings: Arc<SettingsStore>,
    pub(super) registry: ProviderRegistry,
    pub(super) mixer: MixerGraph,
    pub(super) variant: EngineVariant,

    pub(super) current: Option<Stream>,
    pub(super) outgoing: Option<Stream>,
    pub(super) next_stream_id: u64,
    /// Track most recently started, kept for end-of-playback events
    pub(super) last_track: Option<TrackRef>,

    pub(super) scheduler: Scheduler<TimerKey, Task>,
    pub(super) ramps: HashMap<StreamId, Ramp>,
    /// Bumped whenever the crossfade timer is recomputed
    pub(super) crossfade_generation: u64,

    pub(super) buffering_paused: bool,
    pub(super) last_buffering_bucket: Option<u8>,

    pub(super) events: EventBus,
    pub(super) observers: ObserverRegistry,
    pub(super) requests: Vec<EngineRequest>,
}

impl TransitionEngine {
    /// Build the engine around a backend
    ///
    /// Takes the backend's message bus; a backend whose bus was already
    /// taken cannot be driven and is rejected.
    pub fn new(
        mut backend: Box<dyn Backend>,
        clock: SharedClock,
        settings: Arc<SettingsStore>,
        registry: ProviderRegistry,
    ) -> Result<Self> {
        let bus = backend
            .take_bus()
            .ok_or_else(|| Error::InvalidState("backend message bus already taken".into()))?;

        let mixer = MixerGraph::new(backend.as_mut(), &registry, &settings)?;
        let variant = EngineVariant::from_settings(&settings);
        if variant == EngineVariant::Gapless && !backend.supports_gapless() {
            warn!("Backend cannot continue decoders with a next URI; gapless degrades to stop-then-start");
        }

        let mut engine = Self {
            backend,
            bus,
            clock,
            settings,
            registry,
            mixer,
            variant,
            current: None,
            outgoing: None,
            next_stream_id: 1,
            last_track: None,
            scheduler: Scheduler::new(),
            ramps: HashMap::new(),
            crossfade_generation: 0,
            buffering_paused: false,
            last_buffering_bucket: None,
            events: EventBus::new(EVENT_CAPACITY),
            observers: ObserverRegistry::new(),
            requests: Vec::new(),
        };
        engine.load_volume();
        info!("Transition engine ready ({:?})", variant);
        Ok(engine)
    }

    /// Run one loop step
    ///
    /// Backend messages are drained before any deferred work or timer runs.
    /// Returns what the player has to decide on.
    pub fn iterate(&mut self) -> Vec<EngineRequest> {
        self.backend.pump();

        while let Ok(message) = self.bus.try_recv() {
            self.handle_message(message);
        }

        for task in self.scheduler.take_deferred() {
            self.run_task(task);
        }

        let now = self.clock.now_ms();
        for task in self.scheduler.take_due(now) {
            self.run_task(task);
        }

        std::mem::take(&mut self.requests)
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::FadeStep(id) => self.fade_step(id),
            Task::Crossfade { generation, stream } => self.crossfade_due(generation, stream),
            Task::SettlePoll(id) => self.poll_settle(id),
        }
    }

    fn poll_settle(&mut self, id: StreamId) {
        use crate::stream::SettlePoll;

        let backend = self.backend.as_mut();
        let Some(stream) = [self.current.as_mut(), self.outgoing.as_mut()]
            .into_iter()
            .flatten()
            .find(|s| s.id() == id)
        else {
            debug!("Settle poll for retired {}", id);
            return;
        };

        match stream.poll_settle(backend) {
            SettlePoll::Pending => self.scheduler.defer(Task::SettlePoll(id)),
            SettlePoll::Settled { generation } => {
                debug!("{} settled (generation {})", id, generation);
                self.emit(PlayerEvent::StreamSettled {
                    stream_id: id.0,
                    timestamp: Utc::now(),
                });
                self.requests.push(EngineRequest::StreamReady(id));
            }
            SettlePoll::TimedOut { .. } => {
                self.requests.push(EngineRequest::StreamReady(id));
            }
            SettlePoll::Idle => {}
        }
    }

    pub(super) fn allocate_stream_id(&mut self) -> StreamId {
        let id = StreamId(self.next_stream_id);
        self.next_stream_id += 1;
        id
    }

    pub(super) fn settle_timeout_ms(&self) -> u64 {
        self.settings
            .get_u64(keys::SETTLE_TIMEOUT, DEFAULT_SETTLE_TIMEOUT_MS)
    }

    // ----- events -----

    /// Publish to the broadcast bus and every observer
    pub(crate) fn emit(&mut self, event: PlayerEvent) {
        debug!("Event: {}", event.event_type());
        self.observers.notify(&event);
        self.events.emit_lossy(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn observe<F>(&mut self, callback: F) -> ObserverId
    where
        F: FnMut(&PlayerEvent) + Send + 'static,
    {
        self.observers.observe(callback)
    }

    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        self.observers.unobserve(id)
    }

    pub(super) fn current_locator(&self) -> Option<String> {
        self.current_track()
            .or(self.last_track.as_ref())
            .map(|t| t.locator().to_string())
    }

    // ----- settings -----

    /// React to a changed setting
    pub fn apply_setting(&mut self, key: &str) {
        match key {
            keys::VOLUME => self.load_volume(),
            keys::QUEUE_DURATION => {
                self.mixer
                    .load_queue_duration(self.backend.as_mut(), &self.settings)
            }
            keys::CROSSFADING | keys::CROSSFADE_DURATION => self.reset_crossfade_timer(),
            keys::ENGINE | keys::AUDIO_SINK => {
                info!("{} changed; takes effect when the player is restarted", key)
            }
            _ if key == keys::sink_options(self.mixer.sink().preset().key) => {
                self.mixer
                    .sink()
                    .load_options(self.backend.as_mut(), &self.settings)
            }
            _ => {}
        }
    }

    fn load_volume(&mut self) {
        let volume = self.settings.get_f64(keys::VOLUME, 1.0);
        if let Err(e) = self.set_volume(volume) {
            warn!("Could not apply volume setting: {}", e);
        }
    }

    /// Rebuild every provider chain after a registration change
    pub fn set_providers(&mut self, registry: ProviderRegistry) {
        self.registry = registry;
        let backend = self.backend.as_mut();
        if let Err(e) = self.mixer.rebuild_providers(backend, &self.registry) {
            warn!("Rebuilding output providers failed: {}", e);
        }
        for stream in [self.current.as_mut(), self.outgoing.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = stream.rebuild_providers(backend, &self.registry) {
                warn!("Rebuilding providers of {} failed: {}", stream.id(), e);
            }
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    // ----- accessors -----

    pub fn variant(&self) -> EngineVariant {
        self.variant
    }

    pub fn attached_count(&self) -> usize {
        [self.current.as_ref(), self.outgoing.as_ref()]
            .into_iter()
            .flatten()
            .filter(|s| s.pad().is_some())
            .count()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_attached(self.attached_count())
    }

    pub fn current_stream(&self) -> Option<&Stream> {
        self.current.as_ref()
    }

    pub fn outgoing_stream(&self) -> Option<&Stream> {
        self.outgoing.as_ref()
    }

    /// Track of the rendering stream
    pub fn current_track(&self) -> Option<&TrackRef> {
        self.current.as_ref().and_then(|s| s.track())
    }

    pub fn mixer(&self) -> &MixerGraph {
        &self.mixer
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Deadline of the armed crossfade timer, in clock milliseconds
    pub fn crossfade_deadline(&self) -> Option<u64> {
        self.scheduler.deadline(&TimerKey::Crossfade)
    }

    /// Player state, read off the pipeline (a pending target counts)
    pub fn state(&self) -> PlaybackState {
        let backend = self.backend.as_ref();
        let state = self
            .mixer
            .pending_state(backend)
            .unwrap_or_else(|| self.mixer.state(backend));
        match state {
            NodeState::Playing => PlaybackState::Playing,
            NodeState::Paused => PlaybackState::Paused,
            NodeState::Ready | NodeState::Null => PlaybackState::Stopped,
        }
    }

    pub(super) fn pipeline_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    /// Position of the current stream in ticks
    pub fn position(&self) -> i64 {
        match &self.current {
            Some(stream) => match stream.pending_seek() {
                Some(seconds) => seconds_to_ticks(seconds),
                None => stream.position(self.backend.as_ref()),
            },
            None => 0,
        }
    }

    /// Position of the current stream in seconds
    pub fn time(&self) -> f64 {
        ticks_to_seconds(self.position())
    }

    pub fn set_volume(&mut self, volume: f64) -> Result<()> {
        self.mixer.set_volume(self.backend.as_mut(), volume)
    }

    pub fn volume(&self) -> f64 {
        self.mixer.volume(self.backend.as_ref())
    }

    /// Wall-clock time the current stream last started crediting playtime
    pub fn playtime_started_at(&self) -> Option<DateTime<Utc>> {
        let stamp = self.current.as_ref()?.playtime_stamp()?;
        let ago = self.clock.now_ms().saturating_sub(stamp);
        Some(Utc::now() - chrono::Duration::milliseconds(ago as i64))
    }
}

impl Drop for TransitionEngine {
    fn drop(&mut self) {
        if let Err(e) = self.mixer.set_state(self.backend.as_mut(), NodeState::Null) {
            debug!("Pipeline shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimBackend;
    use crate::clock::ManualClock;

    fn engine(settings: SettingsStore) -> (SimBackend, TransitionEngine) {
        let clock = Arc::new(ManualClock::new());
        let sim = SimBackend::new(clock.clone());
        let engine = TransitionEngine::new(
            Box::new(sim.clone()),
            clock,
            Arc::new(settings),
            ProviderRegistry::new(),
        )
        .unwrap();
        (sim, engine)
    }

    #[test]
    fn test_new_engine_is_idle() {
        let (_, engine) = engine(SettingsStore::new());
        assert_eq!(engine.phase(), Phase::Idle);
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(engine.position(), 0);
        assert_eq!(engine.variant(), EngineVariant::Normal);
    }

    #[test]
    fn test_bus_can_only_be_taken_once() {
        let clock = Arc::new(ManualClock::new());
        let mut sim = SimBackend::new(clock.clone());
        assert!(sim.take_bus().is_some());
        let result = TransitionEngine::new(
            Box::new(sim),
            clock,
            Arc::new(SettingsStore::new()),
            ProviderRegistry::new(),
        );
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_volume_setting_applied_to_sink() {
        let settings = SettingsStore::new();
        settings.set(keys::VOLUME, 0.4).unwrap();
        let (sim, mut engine) = engine(settings);

        let sink_volume = engine.mixer().sink().volume_node();
        assert_eq!(sim.volume_history(sink_volume).last().copied(), Some(0.4));

        engine.settings.set(keys::VOLUME, 0.7).unwrap();
        engine.apply_setting(keys::VOLUME);
        assert!((engine.volume() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_queue_duration_reload() {
        let (sim, mut engine) = engine(SettingsStore::new());
        let buffer = engine.mixer().buffer();
        assert_eq!(sim.property(buffer, "max-size-time").as_deref(), Some("100000000"));

        engine.settings.set(keys::QUEUE_DURATION, 250_i64).unwrap();
        engine.apply_setting(keys::QUEUE_DURATION);
        assert_eq!(sim.property(buffer, "max-size-time").as_deref(), Some("250000000"));
    }

    #[test]
    fn test_observer_sees_emitted_events() {
        let (_, mut engine) = engine(SettingsStore::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.observe(move |e| sink.lock().unwrap().push(e.event_type()));
        let mut rx = engine.subscribe();

        engine.emit(PlayerEvent::PlaybackError {
            message: "boom".into(),
            timestamp: Utc::now(),
        });

        assert_eq!(*seen.lock().unwrap(), vec!["playback_error"]);
        assert!(matches!(rx.try_recv(), Ok(PlayerEvent::PlaybackError { .. })));
    }
}
