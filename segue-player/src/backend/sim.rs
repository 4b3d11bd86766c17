//! Simulated rendering backend
//!
//! A deterministic in-process implementation of [`Backend`] driven by a
//! [`Clock`]. It models the parts of a real media graph the player cares
//! about: asynchronous state changes with preroll latency, decoders whose
//! position advances only while Playing, about-to-finish and drained
//! notifications, next-URI handoff, and the occasional backend that parks
//! a Playing request in Paused until it is asked again.
//!
//! The binary uses it with the system clock; tests share a `ManualClock`
//! with the engine and keep a clone of the backend to inspect the graph
//! and inject messages.

use super::{
    Backend, BackendMessage, NodeId, NodeKind, NodeState, PadHandle, SeekFlags, StateChange,
    Ticks,
};
use crate::clock::SharedClock;
use crate::error::{Error, Result};
use segue_common::timing::{ms_to_ticks, ticks_to_ms};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Behavior knobs for the simulated backend
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Delay before an upward state change completes
    pub preroll_ms: u64,
    /// How long before the end a decoder announces about-to-finish
    pub about_to_finish_ms: u64,
    /// Whether decoders accept a next URI
    pub gapless: bool,
    /// Park the first Playing request of every stream bin in Paused
    pub settle_glitch: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            preroll_ms: 20,
            about_to_finish_ms: 2000,
            gapless: true,
            settle_glitch: false,
        }
    }
}

#[derive(Debug, Clone)]
struct MediaInfo {
    duration_ms: Option<u64>,
    tags: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy)]
struct PendingState {
    target: NodeState,
    ready_at_ms: u64,
}

#[derive(Debug, Default)]
struct DecoderState {
    uri: Option<String>,
    next_uri: Option<String>,
    position: Ticks,
    realized: bool,
    failed: bool,
    drained: bool,
    about_to_finish_sent: bool,
    source: Option<NodeId>,
}

#[derive(Debug)]
struct SimNode {
    kind: NodeKind,
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    state: NodeState,
    pending: Option<PendingState>,
    volume: f64,
    volume_history: Vec<f64>,
    properties: HashMap<String, String>,
    decoder: Option<DecoderState>,
    slot_targets: Option<(NodeId, NodeId)>,
    glitched: bool,
}

impl SimNode {
    fn new(kind: NodeKind, name: &str) -> Self {
        let decoder = matches!(kind, NodeKind::Decode).then(DecoderState::default);
        Self {
            kind,
            name: name.to_string(),
            parent: None,
            children: Vec::new(),
            state: NodeState::Null,
            pending: None,
            volume: 1.0,
            volume_history: Vec::new(),
            properties: HashMap::new(),
            decoder,
            slot_targets: None,
            glitched: false,
        }
    }

    fn is_container(&self) -> bool {
        matches!(self.kind, NodeKind::Bin | NodeKind::ProviderSlot)
    }
}

struct SimCore {
    config: SimConfig,
    nodes: BTreeMap<NodeId, SimNode>,
    next_node: u64,
    links: HashSet<(NodeId, NodeId)>,
    pads: HashMap<PadHandle, Option<NodeId>>,
    next_pad: HashMap<NodeId, u32>,
    media: HashMap<String, MediaInfo>,
    failing_uris: HashSet<String>,
    rejected_properties: HashSet<String>,
    missing_factories: HashSet<String>,
    tx: mpsc::UnboundedSender<BackendMessage>,
    bus: Option<mpsc::UnboundedReceiver<BackendMessage>>,
    last_update_ms: u64,
}

/// Simulated backend; clones share the same graph
#[derive(Clone)]
pub struct SimBackend {
    core: Arc<Mutex<SimCore>>,
    clock: SharedClock,
}

impl SimBackend {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_config(clock, SimConfig::default())
    }

    pub fn with_config(clock: SharedClock, config: SimConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = SimCore {
            config,
            nodes: BTreeMap::new(),
            next_node: 1,
            links: HashSet::new(),
            pads: HashMap::new(),
            next_pad: HashMap::new(),
            media: HashMap::new(),
            failing_uris: HashSet::new(),
            rejected_properties: HashSet::new(),
            missing_factories: HashSet::new(),
            tx,
            bus: Some(rx),
            last_update_ms: clock.now_ms(),
        };
        Self {
            core: Arc::new(Mutex::new(core)),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock and bring the simulation up to the current clock
    fn synced(&self) -> MutexGuard<'_, SimCore> {
        let mut core = self.lock();
        core.advance_to(self.clock.now_ms());
        core
    }

    // ----- media registry and fault injection -----

    /// Register a playable URI
    pub fn add_media(&self, uri: &str, duration_ms: Option<u64>) {
        self.add_media_with_tags(uri, duration_ms, Vec::new());
    }

    /// Register a playable URI that reports tags when it starts
    pub fn add_media_with_tags(
        &self,
        uri: &str,
        duration_ms: Option<u64>,
        tags: Vec<(String, String)>,
    ) {
        self.lock()
            .media
            .insert(uri.to_string(), MediaInfo { duration_ms, tags });
    }

    /// Make `set_uri` reject this URI
    pub fn fail_uri(&self, uri: &str) {
        self.lock().failing_uris.insert(uri.to_string());
    }

    /// Make `set_property` reject this property name
    pub fn reject_property(&self, name: &str) {
        self.lock().rejected_properties.insert(name.to_string());
    }

    /// Make sink/effect nodes of this factory unbuildable
    pub fn remove_factory(&self, factory: &str) {
        self.lock().missing_factories.insert(factory.to_string());
    }

    pub fn set_settle_glitch(&self, enabled: bool) {
        self.lock().config.settle_glitch = enabled;
    }

    /// Post a message as if a backend thread had sent it
    pub fn post(&self, message: BackendMessage) {
        let _ = self.lock().tx.send(message);
    }

    /// Bring the simulation up to the current clock
    pub fn update(&self) {
        drop(self.synced());
    }

    // ----- inspection -----

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.lock()
            .nodes
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(id, _)| *id)
    }

    pub fn node_exists(&self, node: NodeId) -> bool {
        self.lock().nodes.contains_key(&node)
    }

    pub fn kind(&self, node: NodeId) -> Option<NodeKind> {
        self.lock().nodes.get(&node).map(|n| n.kind.clone())
    }

    pub fn nodes_of_kind(&self, kind: &NodeKind) -> Vec<NodeId> {
        self.lock()
            .nodes
            .iter()
            .filter(|(_, n)| &n.kind == kind)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn children(&self, bin: NodeId) -> Vec<NodeId> {
        self.lock()
            .nodes
            .get(&bin)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn is_linked(&self, src: NodeId, sink: NodeId) -> bool {
        self.lock().links.contains(&(src, sink))
    }

    pub fn slot_targets(&self, slot: NodeId) -> Option<(NodeId, NodeId)> {
        self.lock().nodes.get(&slot).and_then(|n| n.slot_targets)
    }

    /// Nodes currently feeding requested pads of a mixer
    pub fn mixer_inputs(&self, mixer: NodeId) -> Vec<NodeId> {
        let core = self.lock();
        let mut inputs: Vec<(u32, NodeId)> = core
            .pads
            .iter()
            .filter(|(pad, _)| pad.mixer == mixer)
            .filter_map(|(pad, src)| src.map(|s| (pad.index, s)))
            .collect();
        inputs.sort();
        inputs.into_iter().map(|(_, s)| s).collect()
    }

    /// Requested pads still held on a mixer, linked or not
    pub fn requested_pads(&self, mixer: NodeId) -> usize {
        self.lock()
            .pads
            .keys()
            .filter(|pad| pad.mixer == mixer)
            .count()
    }

    /// Every volume written to a node, in order
    pub fn volume_history(&self, node: NodeId) -> Vec<f64> {
        self.lock()
            .nodes
            .get(&node)
            .map(|n| n.volume_history.clone())
            .unwrap_or_default()
    }

    pub fn property(&self, node: NodeId, name: &str) -> Option<String> {
        self.lock()
            .nodes
            .get(&node)
            .and_then(|n| n.properties.get(name).cloned())
    }

    pub fn uri(&self, decoder: NodeId) -> Option<String> {
        self.lock()
            .nodes
            .get(&decoder)
            .and_then(|n| n.decoder.as_ref())
            .and_then(|d| d.uri.clone())
    }

    pub fn source(&self, decoder: NodeId) -> Option<NodeId> {
        self.synced()
            .nodes
            .get(&decoder)
            .and_then(|n| n.decoder.as_ref())
            .and_then(|d| d.source)
    }

    /// Decoder position in milliseconds, regardless of state
    pub fn position_ms(&self, decoder: NodeId) -> Option<i64> {
        self.synced()
            .nodes
            .get(&decoder)
            .and_then(|n| n.decoder.as_ref())
            .map(|d| ticks_to_ms(d.position))
    }
}

impl SimCore {
    fn new_node(&mut self, kind: NodeKind, name: &str) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.nodes.insert(id, SimNode::new(kind, name));
        id
    }

    fn node(&self, id: NodeId) -> Result<&SimNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| Error::backend(format!("no such node {}", id)))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut SimNode> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| Error::backend(format!("no such node {}", id)))
    }

    fn decoder_mut(&mut self, id: NodeId) -> Result<&mut DecoderState> {
        self.node_mut(id)?
            .decoder
            .as_mut()
            .ok_or_else(|| Error::backend(format!("{} is not a decoder", id)))
    }

    fn send(&self, message: BackendMessage) {
        trace!("sim bus: {:?}", message);
        let _ = self.tx.send(message);
    }

    fn subtree(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                out.push(id);
                stack.extend(node.children.iter().copied());
            }
        }
        out
    }

    fn has_pending_ancestry(&self, id: NodeId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            match self.nodes.get(&current) {
                Some(node) if node.pending.is_some() => return true,
                Some(node) => cursor = node.parent,
                None => return false,
            }
        }
        false
    }

    // ----- time -----

    /// Step to `now_ms`, completing state changes at the instant they
    /// were due so decoders start counting from there
    fn advance_to(&mut self, now_ms: u64) {
        while let Some(ready_at) = self.next_pending_deadline(now_ms) {
            self.step_decoders(ready_at);
            self.resolve_pending(ready_at);
        }
        self.step_decoders(now_ms);
    }

    fn next_pending_deadline(&self, now_ms: u64) -> Option<u64> {
        self.nodes
            .values()
            .filter_map(|n| n.pending)
            .map(|p| p.ready_at_ms)
            .filter(|at| *at <= now_ms)
            .min()
    }

    fn step_decoders(&mut self, to_ms: u64) {
        let elapsed = to_ms.saturating_sub(self.last_update_ms);
        self.last_update_ms = self.last_update_ms.max(to_ms);
        if elapsed > 0 {
            self.advance_decoders(elapsed);
        }
    }

    fn advance_decoders(&mut self, elapsed_ms: u64) {
        let lead = ms_to_ticks(self.config.about_to_finish_ms as i64);
        let gapless = self.config.gapless;
        let decoders: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.decoder.is_some() && n.state == NodeState::Playing)
            .map(|(id, _)| *id)
            .collect();

        for id in decoders {
            let duration = self.current_duration(id);
            let mut messages = Vec::new();
            let mut switched = false;
            if let Some(dec) = self.nodes.get_mut(&id).and_then(|n| n.decoder.as_mut()) {
                if dec.uri.is_none() || dec.failed || dec.drained || !dec.realized {
                    continue;
                }
                dec.position += ms_to_ticks(elapsed_ms as i64);

                let Some(duration) = duration else {
                    continue;
                };
                if gapless && !dec.about_to_finish_sent && duration - dec.position <= lead {
                    dec.about_to_finish_sent = true;
                    messages.push(BackendMessage::AboutToFinish { decoder: id });
                }
                if dec.position >= duration {
                    match dec.next_uri.take() {
                        Some(next) => {
                            dec.position -= duration;
                            dec.uri = Some(next);
                            dec.about_to_finish_sent = false;
                            dec.realized = false;
                            switched = true;
                            messages.push(BackendMessage::StreamStart { decoder: id });
                        }
                        None => {
                            dec.position = duration;
                            dec.drained = true;
                            messages.push(BackendMessage::Drained { decoder: id });
                        }
                    }
                }
            }
            for message in messages {
                self.send(message);
            }
            if switched {
                self.realize(id);
            }
        }
    }

    fn current_duration(&self, decoder: NodeId) -> Option<Ticks> {
        let uri = self.nodes.get(&decoder)?.decoder.as_ref()?.uri.as_ref()?;
        self.media
            .get(uri)
            .and_then(|m| m.duration_ms)
            .map(|ms| ms_to_ticks(ms as i64))
    }

    fn resolve_pending(&mut self, now_ms: u64) {
        let due: Vec<(NodeId, NodeState)> = self
            .nodes
            .iter()
            .filter_map(|(id, n)| match n.pending {
                Some(p) if p.ready_at_ms <= now_ms => Some((*id, p.target)),
                _ => None,
            })
            .collect();

        for (id, target) in due {
            // an ancestor resolving first may already have handled this node
            if self.nodes.get(&id).and_then(|n| n.pending).is_some() {
                self.apply_state(id, target);
            }
        }
    }

    /// Put a subtree into `target`, honoring the settle glitch
    fn apply_state(&mut self, id: NodeId, target: NodeState) {
        let glitch = self.config.settle_glitch;
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };

        let mut effective = target;
        if target == NodeState::Playing
            && glitch
            && node.kind == NodeKind::Bin
            && node.parent.is_some()
            && !node.glitched
        {
            node.glitched = true;
            effective = NodeState::Paused;
            debug!("sim: {} ({}) parked in PAUSED", id, node.name);
        }

        let children = node.children.clone();
        node.state = effective;
        node.pending = None;

        if effective >= NodeState::Paused {
            self.realize(id);
        } else {
            self.reset_decoder(id);
        }
        for child in children {
            self.apply_state(child, effective);
        }
    }

    fn reset_decoder(&mut self, id: NodeId) {
        let mut stale_source = None;
        if let Some(dec) = self.nodes.get_mut(&id).and_then(|n| n.decoder.as_mut()) {
            dec.position = 0;
            dec.realized = false;
            dec.failed = false;
            dec.drained = false;
            dec.about_to_finish_sent = false;
            stale_source = dec.source.take();
        }
        if let Some(source) = stale_source {
            self.nodes.remove(&source);
        }
    }

    /// First preroll of a decoder's current URI
    fn realize(&mut self, id: NodeId) {
        let uri = match self.nodes.get(&id).and_then(|n| n.decoder.as_ref()) {
            Some(dec) if !dec.realized => match &dec.uri {
                Some(uri) => uri.clone(),
                None => return,
            },
            _ => return,
        };

        let media = self.media.get(&uri).cloned();
        let is_disc = uri.starts_with("cdda://");
        let source = is_disc.then(|| self.new_node(NodeKind::Effect("cdparanoiasrc".into()), "source"));

        if let Some(dec) = self.nodes.get_mut(&id).and_then(|n| n.decoder.as_mut()) {
            dec.realized = true;
            dec.failed = media.is_none();
            if source.is_some() {
                dec.source = source;
            }
        }

        if let Some(source) = source {
            self.send(BackendMessage::SourceReady { decoder: id, source });
        }
        match media {
            None => self.send(BackendMessage::Error {
                node: id,
                message: format!("Resource not found: {}", uri),
            }),
            Some(info) if !info.tags.is_empty() => self.send(BackendMessage::Tag {
                node: id,
                tags: info.tags,
            }),
            Some(_) => {}
        }
    }
}

impl Backend for SimBackend {
    fn make_node(&mut self, kind: NodeKind, name: &str) -> Result<NodeId> {
        let mut core = self.lock();
        if let NodeKind::Sink(factory) | NodeKind::Effect(factory) = &kind {
            if core.missing_factories.contains(factory) {
                return Err(Error::backend(format!("no element factory '{}'", factory)));
            }
        }
        let id = core.new_node(kind, name);
        trace!("sim: created {} ({})", id, name);
        Ok(id)
    }

    fn remove_node(&mut self, node: NodeId) -> Result<()> {
        let mut core = self.synced();
        let parent = core.node(node)?.parent;
        let doomed: HashSet<NodeId> = core.subtree(node).into_iter().collect();

        // cdda sources hang off their decoder, not a bin
        let sources: Vec<NodeId> = doomed
            .iter()
            .filter_map(|id| core.nodes.get(id))
            .filter_map(|n| n.decoder.as_ref().and_then(|d| d.source))
            .collect();

        for id in doomed.iter().chain(sources.iter()) {
            core.nodes.remove(id);
        }
        core.links
            .retain(|(a, b)| !doomed.contains(a) && !doomed.contains(b));
        for src in core.pads.values_mut() {
            if matches!(src, Some(s) if doomed.contains(s)) {
                *src = None;
            }
        }
        core.pads.retain(|pad, _| !doomed.contains(&pad.mixer));
        if let Some(parent) = parent.and_then(|p| core.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != node);
        }
        Ok(())
    }

    fn add_to_bin(&mut self, bin: NodeId, node: NodeId) -> Result<()> {
        let mut core = self.lock();
        if !core.node(bin)?.is_container() {
            return Err(Error::backend(format!("{} is not a bin", bin)));
        }
        let child = core.node_mut(node)?;
        if let Some(parent) = child.parent {
            return Err(Error::backend(format!("{} already belongs to {}", node, parent)));
        }
        child.parent = Some(bin);
        core.node_mut(bin)?.children.push(node);
        Ok(())
    }

    fn remove_from_bin(&mut self, bin: NodeId, node: NodeId) -> Result<()> {
        let mut core = self.lock();
        let child = core.node_mut(node)?;
        if child.parent != Some(bin) {
            return Err(Error::backend(format!("{} is not in {}", node, bin)));
        }
        child.parent = None;
        core.node_mut(bin)?.children.retain(|c| *c != node);
        Ok(())
    }

    fn link(&mut self, src: NodeId, sink: NodeId) -> Result<()> {
        let mut core = self.lock();
        core.node(src)?;
        core.node(sink)?;
        if !core.links.insert((src, sink)) {
            return Err(Error::backend(format!("{} already linked to {}", src, sink)));
        }
        Ok(())
    }

    fn unlink(&mut self, src: NodeId, sink: NodeId) -> Result<()> {
        let mut core = self.lock();
        if !core.links.remove(&(src, sink)) {
            return Err(Error::backend(format!("{} is not linked to {}", src, sink)));
        }
        Ok(())
    }

    fn set_slot_targets(&mut self, slot: NodeId, first: NodeId, last: NodeId) -> Result<()> {
        let mut core = self.lock();
        core.node(first)?;
        core.node(last)?;
        let node = core.node_mut(slot)?;
        if node.kind != NodeKind::ProviderSlot {
            return Err(Error::backend(format!("{} is not a provider slot", slot)));
        }
        node.slot_targets = Some((first, last));
        Ok(())
    }

    fn request_pad(&mut self, mixer: NodeId) -> Result<PadHandle> {
        let mut core = self.lock();
        if core.node(mixer)?.kind != NodeKind::Mix {
            return Err(Error::backend(format!("{} has no request pads", mixer)));
        }
        let index = core.next_pad.entry(mixer).or_insert(0);
        let pad = PadHandle {
            mixer,
            index: *index,
        };
        *index += 1;
        core.pads.insert(pad, None);
        Ok(pad)
    }

    fn release_pad(&mut self, pad: PadHandle) -> Result<()> {
        match self.lock().pads.remove(&pad) {
            Some(_) => Ok(()),
            None => Err(Error::backend(format!("pad {:?} was not requested", pad))),
        }
    }

    fn link_pad(&mut self, src: NodeId, pad: PadHandle) -> Result<()> {
        let mut core = self.lock();
        core.node(src)?;
        match core.pads.get_mut(&pad) {
            Some(slot @ None) => {
                *slot = Some(src);
                Ok(())
            }
            Some(Some(existing)) => Err(Error::backend(format!(
                "pad {:?} already fed by {}",
                pad, existing
            ))),
            None => Err(Error::backend(format!("pad {:?} was not requested", pad))),
        }
    }

    fn unlink_pad(&mut self, src: NodeId, pad: PadHandle) -> Result<()> {
        let mut core = self.lock();
        match core.pads.get_mut(&pad) {
            Some(slot) if *slot == Some(src) => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::backend(format!("{} does not feed pad {:?}", src, pad))),
        }
    }

    fn set_uri(&mut self, decoder: NodeId, uri: &str) -> Result<()> {
        let mut core = self.lock();
        if core.failing_uris.contains(uri) {
            return Err(Error::backend(format!("cannot handle URI {}", uri)));
        }
        let dec = core.decoder_mut(decoder)?;
        dec.uri = Some(uri.to_string());
        dec.next_uri = None;
        dec.position = 0;
        dec.realized = false;
        dec.failed = false;
        dec.drained = false;
        dec.about_to_finish_sent = false;
        Ok(())
    }

    fn set_next_uri(&mut self, decoder: NodeId, uri: &str) -> Result<()> {
        let mut core = self.lock();
        if !core.config.gapless {
            return Err(Error::backend("gapless playback not supported"));
        }
        if core.failing_uris.contains(uri) {
            return Err(Error::backend(format!("cannot handle URI {}", uri)));
        }
        core.decoder_mut(decoder)?.next_uri = Some(uri.to_string());
        Ok(())
    }

    fn supports_gapless(&self) -> bool {
        self.lock().config.gapless
    }

    fn set_property(&mut self, node: NodeId, name: &str, value: &str) -> Result<()> {
        let mut core = self.lock();
        if core.rejected_properties.contains(name) {
            return Err(Error::backend(format!("no property '{}' on {}", name, node)));
        }
        core.node_mut(node)?
            .properties
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn set_volume(&mut self, node: NodeId, volume: f64) -> Result<()> {
        let mut core = self.lock();
        let target = core.node_mut(node)?;
        if target.kind != NodeKind::Volume {
            return Err(Error::backend(format!("{} has no volume", node)));
        }
        target.volume = volume;
        target.volume_history.push(volume);
        Ok(())
    }

    fn volume(&self, node: NodeId) -> Result<f64> {
        let core = self.lock();
        let target = core.node(node)?;
        if target.kind != NodeKind::Volume {
            return Err(Error::backend(format!("{} has no volume", node)));
        }
        Ok(target.volume)
    }

    fn set_state(&mut self, node: NodeId, state: NodeState) -> Result<StateChange> {
        let now = self.clock.now_ms();
        let mut core = self.synced();
        let (current, pending) = {
            let n = core.node(node)?;
            (n.state, n.pending)
        };

        if state <= current {
            core.apply_state(node, state);
            return Ok(StateChange::Success);
        }
        if let Some(p) = pending {
            if p.target == state {
                return Ok(StateChange::Async);
            }
        }

        let preroll = core.config.preroll_ms;
        if preroll == 0 {
            core.apply_state(node, state);
            return Ok(StateChange::Success);
        }
        core.node_mut(node)?.pending = Some(PendingState {
            target: state,
            ready_at_ms: now + preroll,
        });
        Ok(StateChange::Async)
    }

    fn state(&self, node: NodeId) -> NodeState {
        self.synced()
            .nodes
            .get(&node)
            .map(|n| n.state)
            .unwrap_or(NodeState::Null)
    }

    fn pending_state(&self, node: NodeId) -> Option<NodeState> {
        self.synced()
            .nodes
            .get(&node)
            .and_then(|n| n.pending)
            .map(|p| p.target)
    }

    fn query_position(&self, decoder: NodeId) -> Result<Ticks> {
        let core = self.synced();
        let node = core.node(decoder)?;
        let dec = node
            .decoder
            .as_ref()
            .ok_or_else(|| Error::backend(format!("{} is not a decoder", decoder)))?;
        if node.state < NodeState::Paused || !dec.realized {
            return Err(Error::backend("position query failed"));
        }
        Ok(dec.position)
    }

    fn seek(&mut self, decoder: NodeId, position: Ticks, flags: SeekFlags) -> Result<()> {
        let mut core = self.synced();
        let state = core.node(decoder)?.state;
        if state < NodeState::Paused || core.has_pending_ancestry(decoder) {
            return Err(Error::backend("seek while not prerolled"));
        }
        let duration = core.current_duration(decoder);
        let lead = ms_to_ticks(core.config.about_to_finish_ms as i64);
        let dec = core.decoder_mut(decoder)?;
        if dec.uri.is_none() {
            return Err(Error::backend("seek without a URI"));
        }
        let target = match duration {
            Some(d) => position.clamp(0, d),
            None => position.max(0),
        };
        dec.position = target;
        dec.drained = false;
        if duration.map(|d| d - target > lead).unwrap_or(true) {
            dec.about_to_finish_sent = false;
        }
        debug!(
            "sim: seek {} to {} ms (flush={}, accurate={})",
            decoder,
            ticks_to_ms(target),
            flags.flush,
            flags.accurate
        );
        Ok(())
    }

    fn take_bus(&mut self) -> Option<mpsc::UnboundedReceiver<BackendMessage>> {
        self.lock().bus.take()
    }

    fn pump(&mut self) {
        self.update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn rig(config: SimConfig) -> (Arc<ManualClock>, SimBackend) {
        let clock = Arc::new(ManualClock::new());
        let sim = SimBackend::with_config(clock.clone(), config);
        (clock, sim)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<BackendMessage>) -> Vec<BackendMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    fn playing_decoder(sim: &mut SimBackend, uri: &str) -> (NodeId, NodeId) {
        let bin = sim.make_node(NodeKind::Bin, "pipeline").unwrap();
        let dec = sim.make_node(NodeKind::Decode, "decoder").unwrap();
        sim.add_to_bin(bin, dec).unwrap();
        sim.set_uri(dec, uri).unwrap();
        sim.set_state(bin, NodeState::Playing).unwrap();
        (bin, dec)
    }

    #[test]
    fn test_state_change_is_async() {
        let (clock, mut sim) = rig(SimConfig::default());
        sim.add_media("file:///a.flac", Some(10_000));
        let (bin, dec) = playing_decoder(&mut sim, "file:///a.flac");

        assert_eq!(sim.state(bin), NodeState::Null);
        assert_eq!(sim.pending_state(bin), Some(NodeState::Playing));

        clock.advance(20);
        assert_eq!(sim.state(bin), NodeState::Playing);
        assert_eq!(sim.state(dec), NodeState::Playing);
        assert_eq!(sim.pending_state(bin), None);
    }

    #[test]
    fn test_position_advances_only_while_playing() {
        let (clock, mut sim) = rig(SimConfig::default());
        sim.add_media("file:///a.flac", Some(10_000));
        let (bin, dec) = playing_decoder(&mut sim, "file:///a.flac");
        clock.advance(20);

        clock.advance(1000);
        assert_eq!(ticks_to_ms(sim.query_position(dec).unwrap()), 1000);

        sim.set_state(bin, NodeState::Paused).unwrap();
        clock.advance(1000);
        assert_eq!(ticks_to_ms(sim.query_position(dec).unwrap()), 1000);
    }

    #[test]
    fn test_about_to_finish_then_drained() {
        let (clock, mut sim) = rig(SimConfig::default());
        let mut rx = sim.take_bus().unwrap();
        sim.add_media("file:///a.flac", Some(5_000));
        let (_, dec) = playing_decoder(&mut sim, "file:///a.flac");
        clock.advance(20);

        clock.advance(3_100);
        sim.update();
        assert_eq!(drain(&mut rx), vec![BackendMessage::AboutToFinish { decoder: dec }]);

        clock.advance(2_000);
        sim.update();
        assert_eq!(drain(&mut rx), vec![BackendMessage::Drained { decoder: dec }]);
    }

    #[test]
    fn test_next_uri_switches_without_drain() {
        let (clock, mut sim) = rig(SimConfig::default());
        let mut rx = sim.take_bus().unwrap();
        sim.add_media("file:///a.flac", Some(3_000));
        sim.add_media("file:///b.flac", Some(3_000));
        let (_, dec) = playing_decoder(&mut sim, "file:///a.flac");
        clock.advance(20);
        sim.set_next_uri(dec, "file:///b.flac").unwrap();

        clock.advance(3_500);
        sim.update();

        let messages = drain(&mut rx);
        assert!(messages.contains(&BackendMessage::StreamStart { decoder: dec }));
        assert!(!messages.contains(&BackendMessage::Drained { decoder: dec }));
        assert_eq!(sim.uri(dec).as_deref(), Some("file:///b.flac"));
        assert_eq!(sim.position_ms(dec), Some(500));
    }

    #[test]
    fn test_unknown_media_reports_error() {
        let (clock, mut sim) = rig(SimConfig::default());
        let mut rx = sim.take_bus().unwrap();
        let (_, dec) = playing_decoder(&mut sim, "file:///missing.flac");
        clock.advance(20);
        sim.update();

        match drain(&mut rx).as_slice() {
            [BackendMessage::Error { node, .. }] => assert_eq!(*node, dec),
            other => panic!("unexpected messages: {:?}", other),
        }
    }

    #[test]
    fn test_settle_glitch_parks_stream_bin_once() {
        let (clock, mut sim) = rig(SimConfig {
            settle_glitch: true,
            ..SimConfig::default()
        });
        let pipeline = sim.make_node(NodeKind::Bin, "pipeline").unwrap();
        let stream = sim.make_node(NodeKind::Bin, "stream").unwrap();
        sim.add_to_bin(pipeline, stream).unwrap();

        sim.set_state(stream, NodeState::Playing).unwrap();
        clock.advance(20);
        assert_eq!(sim.state(stream), NodeState::Paused);

        sim.set_state(stream, NodeState::Playing).unwrap();
        clock.advance(20);
        assert_eq!(sim.state(stream), NodeState::Playing);
    }

    #[test]
    fn test_seek_rejected_while_prerolling() {
        let (clock, mut sim) = rig(SimConfig::default());
        sim.add_media("file:///a.flac", Some(60_000));
        let (_, dec) = playing_decoder(&mut sim, "file:///a.flac");
        assert!(sim.seek(dec, ms_to_ticks(30_000), SeekFlags::FLUSH_ACCURATE).is_err());

        clock.advance(20);
        sim.seek(dec, ms_to_ticks(30_000), SeekFlags::FLUSH_ACCURATE).unwrap();
        assert_eq!(sim.position_ms(dec), Some(30_000));
    }

    #[test]
    fn test_pads_and_removal() {
        let (_clock, mut sim) = rig(SimConfig::default());
        let mix = sim.make_node(NodeKind::Mix, "mix").unwrap();
        let vol = sim.make_node(NodeKind::Volume, "volume").unwrap();
        let pad = sim.request_pad(mix).unwrap();
        sim.link_pad(vol, pad).unwrap();
        assert!(sim.link_pad(vol, pad).is_err());
        assert_eq!(sim.mixer_inputs(mix), vec![vol]);

        sim.remove_node(vol).unwrap();
        assert!(sim.mixer_inputs(mix).is_empty());
        sim.release_pad(pad).unwrap();
        assert!(sim.release_pad(pad).is_err());
    }

    #[test]
    fn test_cdda_source_announced() {
        let (clock, mut sim) = rig(SimConfig::default());
        let mut rx = sim.take_bus().unwrap();
        sim.add_media("cdda://2", Some(60_000));
        let (_, dec) = playing_decoder(&mut sim, "cdda://2");
        clock.advance(20);
        sim.update();

        let source = sim.source(dec).unwrap();
        assert!(drain(&mut rx).contains(&BackendMessage::SourceReady {
            decoder: dec,
            source
        }));
    }
}
