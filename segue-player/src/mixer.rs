//! Mixer graph: the always-resident tail every stream feeds into
//!
//! ```text
//! stream bins --> mix --> buffer --> postprocessing --> audio sink
//!                                                      (sink providers -> master volume -> device)
//! ```
//!
//! The audio sink's volume node is the only master volume. Per-stream
//! volumes live on the streams.

use crate::backend::{Backend, NodeId, NodeKind, NodeState, PadHandle};
use crate::error::{Error, Result};
use crate::providers::{services, ProviderChain, ProviderRegistry};
use crate::stream::Stream;
use segue_common::settings::keys;
use segue_common::SettingsStore;
use tracing::{debug, info, warn};

/// Default output buffer, in milliseconds of audio
pub const DEFAULT_QUEUE_DURATION_MS: u64 = 100;

/// Named device sink configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkPreset {
    /// Settings value selecting the preset
    pub key: &'static str,
    pub name: &'static str,
    /// Backend factory for the device node
    pub element: &'static str,
}

pub const SINK_PRESETS: &[SinkPreset] = &[
    SinkPreset {
        key: "auto",
        name: "Automatic",
        element: "autoaudiosink",
    },
    SinkPreset {
        key: "alsa",
        name: "Alsa",
        element: "alsasink",
    },
    SinkPreset {
        key: "oss",
        name: "Oss",
        element: "osssink",
    },
    SinkPreset {
        key: "pulse",
        name: "Pulseaudio",
        element: "pulsesink",
    },
];

pub fn sink_preset(key: &str) -> Option<&'static SinkPreset> {
    SINK_PRESETS.iter().find(|p| p.key == key)
}

/// Sink provider chain, master volume and device sink in one bin
pub struct AudioSink {
    preset: &'static SinkPreset,
    bin: NodeId,
    chain: ProviderChain,
    volume: NodeId,
    device: NodeId,
}

impl AudioSink {
    pub fn from_preset(
        backend: &mut dyn Backend,
        registry: &ProviderRegistry,
        settings: &SettingsStore,
        key: &str,
    ) -> Result<Self> {
        let preset = sink_preset(key)
            .ok_or_else(|| Error::backend(format!("unknown sink preset '{}'", key)))?;

        let bin = backend.make_node(NodeKind::Bin, "audiosink")?;
        match Self::populate(backend, registry, preset, bin) {
            Ok(sink) => {
                sink.load_options(backend, settings);
                Ok(sink)
            }
            Err(e) => {
                let _ = backend.remove_node(bin);
                Err(e)
            }
        }
    }

    fn populate(
        backend: &mut dyn Backend,
        registry: &ProviderRegistry,
        preset: &'static SinkPreset,
        bin: NodeId,
    ) -> Result<Self> {
        let chain = ProviderChain::new(backend, registry, services::SINK_ELEMENT, "sink-providers")?;
        backend.add_to_bin(bin, chain.slot())?;
        let volume = backend.make_node(NodeKind::Volume, "master-volume")?;
        backend.add_to_bin(bin, volume)?;
        let device = backend.make_node(NodeKind::Sink(preset.element.to_string()), preset.element)?;
        backend.add_to_bin(bin, device)?;

        backend.link(chain.slot(), volume)?;
        backend.link(volume, device)?;

        Ok(Self {
            preset,
            bin,
            chain,
            volume,
            device,
        })
    }

    /// Apply `player/<preset>_sink_options` ("param=value" strings)
    ///
    /// Bad entries are reported and skipped.
    pub fn load_options(&self, backend: &mut dyn Backend, settings: &SettingsStore) {
        for option in settings.get_string_list(&keys::sink_options(self.preset.key)) {
            let Some((param, value)) = option.split_once('=') else {
                warn!("Ignoring malformed sink option '{}'", option);
                continue;
            };
            if let Err(e) = backend.set_property(self.device, param.trim(), value.trim()) {
                warn!(
                    "Could not set parameter {} for {}: {}",
                    param, self.preset.element, e
                );
            }
        }
    }

    pub fn preset(&self) -> &'static SinkPreset {
        self.preset
    }

    pub fn bin(&self) -> NodeId {
        self.bin
    }

    pub fn device(&self) -> NodeId {
        self.device
    }

    pub fn volume_node(&self) -> NodeId {
        self.volume
    }

    pub fn set_volume(&self, backend: &mut dyn Backend, volume: f64) -> Result<()> {
        backend.set_volume(self.volume, volume.clamp(0.0, 1.0))
    }

    pub fn volume(&self, backend: &dyn Backend) -> f64 {
        backend.volume(self.volume).unwrap_or(1.0)
    }
}

pub struct MixerGraph {
    pipeline: NodeId,
    mix: NodeId,
    buffer: NodeId,
    postprocessing: ProviderChain,
    sink: AudioSink,
}

impl MixerGraph {
    /// Build the tail; the sink preset comes from `player/audiosink`
    ///
    /// An unknown or unbuildable preset falls back to "auto".
    pub fn new(
        backend: &mut dyn Backend,
        registry: &ProviderRegistry,
        settings: &SettingsStore,
    ) -> Result<Self> {
        let pipeline = backend.make_node(NodeKind::Bin, "pipeline")?;
        let mix = backend.make_node(NodeKind::Mix, "mix")?;
        let buffer = backend.make_node(NodeKind::Buffer, "buffer")?;
        let postprocessing = ProviderChain::new(
            backend,
            registry,
            services::POSTPROCESSING_ELEMENT,
            "postprocessing",
        )?;

        let wanted = settings.get_string(keys::AUDIO_SINK, "auto");
        let sink = match AudioSink::from_preset(backend, registry, settings, &wanted) {
            Ok(sink) => sink,
            Err(e) => {
                warn!(
                    "Could not enable {} sink, attempting to autoselect: {}",
                    wanted, e
                );
                AudioSink::from_preset(backend, registry, settings, "auto")?
            }
        };

        for node in [mix, buffer, postprocessing.slot(), sink.bin()] {
            backend.add_to_bin(pipeline, node)?;
        }
        backend.link(mix, buffer)?;
        backend.link(buffer, postprocessing.slot())?;
        backend.link(postprocessing.slot(), sink.bin())?;

        let graph = Self {
            pipeline,
            mix,
            buffer,
            postprocessing,
            sink,
        };
        graph.load_queue_duration(backend, settings);
        info!("Mixer graph ready ({} sink)", graph.sink.preset().name);
        Ok(graph)
    }

    pub fn pipeline(&self) -> NodeId {
        self.pipeline
    }

    pub fn mix(&self) -> NodeId {
        self.mix
    }

    pub fn buffer(&self) -> NodeId {
        self.buffer
    }

    pub fn sink(&self) -> &AudioSink {
        &self.sink
    }

    /// Whether a backend node belongs to the shared tail
    pub fn contains(&self, node: NodeId) -> bool {
        node == self.pipeline
            || node == self.mix
            || node == self.buffer
            || node == self.postprocessing.slot()
            || self.postprocessing.nodes().contains(&node)
            || node == self.sink.bin
            || node == self.sink.volume
            || node == self.sink.device
            || node == self.sink.chain.slot()
            || self.sink.chain.nodes().contains(&node)
    }

    /// Size the buffer from `player/queue_duration` (ms)
    pub fn load_queue_duration(&self, backend: &mut dyn Backend, settings: &SettingsStore) {
        let ms = settings.get_u64(keys::QUEUE_DURATION, DEFAULT_QUEUE_DURATION_MS);
        let nanos = ms.saturating_mul(1_000_000);
        if let Err(e) = backend.set_property(self.buffer, "max-size-time", &nanos.to_string()) {
            warn!("Could not size output buffer: {}", e);
        } else {
            debug!("Output buffer set to {} ms", ms);
        }
    }

    /// Feed a stream into the mixer
    pub fn attach(&mut self, backend: &mut dyn Backend, stream: &mut Stream) -> Result<PadHandle> {
        if let Some(pad) = stream.pad() {
            return Err(Error::InvalidState(format!(
                "{} already attached on pad {}",
                stream.id(),
                pad.index
            )));
        }

        backend.add_to_bin(self.pipeline, stream.bin())?;
        let pad = match backend.request_pad(self.mix) {
            Ok(pad) => pad,
            Err(e) => {
                let _ = backend.remove_from_bin(self.pipeline, stream.bin());
                return Err(e);
            }
        };
        if let Err(e) = backend.link_pad(stream.bin(), pad) {
            let _ = backend.release_pad(pad);
            let _ = backend.remove_from_bin(self.pipeline, stream.bin());
            return Err(e);
        }

        stream.set_pad(Some(pad));
        debug!("Attached {} to mixer pad {}", stream.id(), pad.index);
        Ok(pad)
    }

    /// Remove a stream from the mixer
    ///
    /// Detaching a stream that is not attached is a logged no-op. Returns
    /// whether anything was detached.
    pub fn detach(&mut self, backend: &mut dyn Backend, stream: &mut Stream) -> bool {
        let Some(pad) = stream.pad() else {
            debug!("{} already detached", stream.id());
            return false;
        };

        if let Err(e) = backend.unlink_pad(stream.bin(), pad) {
            debug!("Unlinking {}: {}", stream.id(), e);
        }
        if let Err(e) = backend.release_pad(pad) {
            debug!("Releasing mixer pad {}: {}", pad.index, e);
        }
        if let Err(e) = backend.remove_from_bin(self.pipeline, stream.bin()) {
            debug!("Removing {} from pipeline: {}", stream.id(), e);
        }
        stream.set_pad(None);
        debug!("Detached {}", stream.id());
        true
    }

    pub fn set_volume(&self, backend: &mut dyn Backend, volume: f64) -> Result<()> {
        self.sink.set_volume(backend, volume)
    }

    pub fn volume(&self, backend: &dyn Backend) -> f64 {
        self.sink.volume(backend)
    }

    pub fn set_state(&self, backend: &mut dyn Backend, state: NodeState) -> Result<()> {
        backend.set_state(self.pipeline, state)?;
        Ok(())
    }

    /// Current state of the whole output
    pub fn state(&self, backend: &dyn Backend) -> NodeState {
        backend.state(self.pipeline)
    }

    pub fn pending_state(&self, backend: &dyn Backend) -> Option<NodeState> {
        backend.pending_state(self.pipeline)
    }

    pub fn rebuild_providers(
        &mut self,
        backend: &mut dyn Backend,
        registry: &ProviderRegistry,
    ) -> Result<()> {
        self.postprocessing.rebuild(backend, registry)?;
        self.sink.chain.rebuild(backend, registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimBackend;
    use crate::clock::ManualClock;
    use crate::stream::StreamId;
    use std::sync::Arc;

    fn sim() -> (Arc<ManualClock>, SimBackend) {
        let clock = Arc::new(ManualClock::new());
        let sim = SimBackend::new(clock.clone());
        (clock, sim)
    }

    #[test]
    fn test_tail_is_linked() {
        let (_clock, mut sim) = sim();
        let graph = MixerGraph::new(&mut sim, &ProviderRegistry::new(), &SettingsStore::new()).unwrap();

        assert!(sim.is_linked(graph.mix(), graph.buffer()));
        assert!(sim.is_linked(graph.sink().volume_node(), graph.sink().device()));
        assert_eq!(graph.sink().preset().key, "auto");
        assert_eq!(
            sim.property(graph.buffer(), "max-size-time").as_deref(),
            Some("100000000")
        );
    }

    #[test]
    fn test_unbuildable_sink_falls_back_to_auto() {
        let (_clock, mut sim) = sim();
        sim.remove_factory("pulsesink");
        let settings = SettingsStore::new();
        settings.set(keys::AUDIO_SINK, "pulse").unwrap();

        let graph = MixerGraph::new(&mut sim, &ProviderRegistry::new(), &settings).unwrap();
        assert_eq!(graph.sink().preset().key, "auto");
        // the half-built pulse bin was cleaned up
        assert_eq!(sim.nodes_of_kind(&NodeKind::Sink("pulsesink".into())).len(), 0);
        assert_eq!(
            sim.nodes_of_kind(&NodeKind::Bin)
                .into_iter()
                .filter(|n| sim.children(*n).contains(&graph.sink().device()))
                .count(),
            1
        );
    }

    #[test]
    fn test_unknown_preset_falls_back_to_auto() {
        let (_clock, mut sim) = sim();
        let settings = SettingsStore::new();
        settings.set(keys::AUDIO_SINK, "jack").unwrap();
        let graph = MixerGraph::new(&mut sim, &ProviderRegistry::new(), &settings).unwrap();
        assert_eq!(graph.sink().preset().element, "autoaudiosink");
    }

    #[test]
    fn test_sink_options_applied_with_warnings() {
        let (_clock, mut sim) = sim();
        sim.reject_property("bogus");
        let settings = SettingsStore::from_toml_str(
            r#"
            [player]
            audiosink = "alsa"
            alsa_sink_options = ["device=hw:1", "bogus=1", "no-equals-sign"]
            "#,
        )
        .unwrap();

        let graph = MixerGraph::new(&mut sim, &ProviderRegistry::new(), &settings).unwrap();
        let device = graph.sink().device();
        assert_eq!(sim.property(device, "device").as_deref(), Some("hw:1"));
        assert_eq!(sim.property(device, "bogus"), None);
    }

    #[test]
    fn test_attach_detach_round() {
        let (clock, mut sim) = sim();
        let registry = ProviderRegistry::new();
        let mut graph = MixerGraph::new(&mut sim, &registry, &SettingsStore::new()).unwrap();
        let mut stream = Stream::new(StreamId(1), &mut sim, &registry, clock, 5000).unwrap();

        let pad = graph.attach(&mut sim, &mut stream).unwrap();
        assert_eq!(stream.pad(), Some(pad));
        assert_eq!(sim.mixer_inputs(graph.mix()), vec![stream.bin()]);
        assert!(graph.attach(&mut sim, &mut stream).is_err());

        assert!(graph.detach(&mut sim, &mut stream));
        assert!(sim.mixer_inputs(graph.mix()).is_empty());
        assert_eq!(sim.requested_pads(graph.mix()), 0);
        // second detach is a no-op
        assert!(!graph.detach(&mut sim, &mut stream));
    }

    #[test]
    fn test_master_volume_on_sink() {
        let (_clock, mut sim) = sim();
        let graph = MixerGraph::new(&mut sim, &ProviderRegistry::new(), &SettingsStore::new()).unwrap();
        graph.set_volume(&mut sim, 1.7).unwrap();
        assert_eq!(graph.volume(&sim), 1.0);
        graph.set_volume(&mut sim, 0.4).unwrap();
        assert_eq!(sim.volume(graph.sink().volume_node()).unwrap(), 0.4);
    }
}
