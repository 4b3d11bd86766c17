//! Rendering backend abstraction
//!
//! The player never touches a native media library directly. It builds its
//! graph from a handful of node kinds, links them, drives their state and
//! listens to a message channel. Everything native lives behind [`Backend`].
//!
//! Backends run their own worker threads; the only thing they share with the
//! player loop is the unbounded message channel returned by
//! [`Backend::take_bus`]. The loop drains it once per iteration before any
//! engine state is touched.

pub mod sim;

use crate::error::Result;
use std::fmt;
use tokio::sync::mpsc;

/// Backend position/time unit (see `segue_common::timing`)
pub type Ticks = i64;

/// Opaque node handle issued by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Requested input on a mix node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PadHandle {
    pub mixer: NodeId,
    pub index: u32,
}

/// Node kinds the player knows how to build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Container; state changes apply to every child
    Bin,
    /// URI decoder with optional gapless next-URI support
    Decode,
    Resample,
    Volume,
    /// N-input mixer with request pads
    Mix,
    /// Output buffer queue
    Buffer,
    /// Pass-through, used to close an empty provider slot
    Identity,
    /// Externally supplied processing node, by factory name
    Effect(String),
    /// Device sink, by factory name ("autoaudiosink", "alsasink", ...)
    Sink(String),
    /// Bin whose inner chain can be replaced while its outer links stay put
    ProviderSlot,
}

/// Node state, ordered from coldest to hottest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Null => "NULL",
            NodeState::Ready => "READY",
            NodeState::Paused => "PAUSED",
            NodeState::Playing => "PLAYING",
        };
        f.write_str(name)
    }
}

/// Outcome of a state request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// Target reached before the call returned
    Success,
    /// Target will be reached later; poll `state()`/`pending_state()`
    Async,
}

/// Seek behavior flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekFlags {
    pub flush: bool,
    pub accurate: bool,
}

impl SeekFlags {
    pub const FLUSH_ACCURATE: SeekFlags = SeekFlags {
        flush: true,
        accurate: true,
    };
}

/// Messages posted by backend threads
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    /// The whole output reached end of stream
    Eos { node: NodeId },
    /// A decoder ran out of input
    Drained { decoder: NodeId },
    /// A decoder is about to run out; a next URI may be supplied now
    AboutToFinish { decoder: NodeId },
    /// A decoder switched to its next URI
    StreamStart { decoder: NodeId },
    Tag {
        node: NodeId,
        tags: Vec<(String, String)>,
    },
    Error { node: NodeId, message: String },
    Buffering { node: NodeId, percent: u8 },
    /// A decoder realized its source node
    SourceReady { decoder: NodeId, source: NodeId },
}

impl BackendMessage {
    /// Node the message originates from
    pub fn origin(&self) -> NodeId {
        match self {
            BackendMessage::Eos { node }
            | BackendMessage::Tag { node, .. }
            | BackendMessage::Error { node, .. }
            | BackendMessage::Buffering { node, .. } => *node,
            BackendMessage::Drained { decoder }
            | BackendMessage::AboutToFinish { decoder }
            | BackendMessage::StreamStart { decoder }
            | BackendMessage::SourceReady { decoder, .. } => *decoder,
        }
    }
}

/// Node-graph capability contract
pub trait Backend: Send {
    fn make_node(&mut self, kind: NodeKind, name: &str) -> Result<NodeId>;

    /// Remove a node, dropping its links and bin membership
    fn remove_node(&mut self, node: NodeId) -> Result<()>;

    fn add_to_bin(&mut self, bin: NodeId, node: NodeId) -> Result<()>;
    fn remove_from_bin(&mut self, bin: NodeId, node: NodeId) -> Result<()>;

    fn link(&mut self, src: NodeId, sink: NodeId) -> Result<()>;
    fn unlink(&mut self, src: NodeId, sink: NodeId) -> Result<()>;

    /// Point a provider slot's outer pads at the first/last inner nodes
    fn set_slot_targets(&mut self, slot: NodeId, first: NodeId, last: NodeId) -> Result<()>;

    fn request_pad(&mut self, mixer: NodeId) -> Result<PadHandle>;
    fn release_pad(&mut self, pad: PadHandle) -> Result<()>;
    fn link_pad(&mut self, src: NodeId, pad: PadHandle) -> Result<()>;
    fn unlink_pad(&mut self, src: NodeId, pad: PadHandle) -> Result<()>;

    fn set_uri(&mut self, decoder: NodeId, uri: &str) -> Result<()>;

    /// Queue the URI a decoder continues with after its current one
    fn set_next_uri(&mut self, decoder: NodeId, uri: &str) -> Result<()>;

    /// Whether decoders can continue with a next URI without re-linking
    fn supports_gapless(&self) -> bool;

    fn set_property(&mut self, node: NodeId, name: &str, value: &str) -> Result<()>;

    fn set_volume(&mut self, node: NodeId, volume: f64) -> Result<()>;
    fn volume(&self, node: NodeId) -> Result<f64>;

    /// Request a state; bins apply it to every child
    fn set_state(&mut self, node: NodeId, state: NodeState) -> Result<StateChange>;

    /// Last state the node reached
    fn state(&self, node: NodeId) -> NodeState;

    /// State the node is still moving toward, if any
    fn pending_state(&self, node: NodeId) -> Option<NodeState>;

    fn query_position(&self, decoder: NodeId) -> Result<Ticks>;
    fn seek(&mut self, decoder: NodeId, position: Ticks, flags: SeekFlags) -> Result<()>;

    /// Hand over the message channel; only the first call returns it
    fn take_bus(&mut self) -> Option<mpsc::UnboundedReceiver<BackendMessage>>;

    /// Called once per loop iteration before the bus is drained
    fn pump(&mut self) {}
}
