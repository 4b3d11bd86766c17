//! # Segue Player Library (segue-player)
//!
//! Playback-transition core: decides which track is audible and how control
//! moves from one track to the next (hard cut, gapless handoff or timed
//! crossfade) over an asynchronously driven node-graph backend.
//!
//! **Architecture:** a single cooperative loop. Backend threads post
//! messages on a channel; each `Player::iterate` drains them, runs deferred
//! work and due timers, then acts on what the engine asks for.
//!
//! **Layers (leaves first):** `Stream` -> `MixerGraph` -> `TransitionEngine`
//! -> `PlayQueue` -> `Player`.

pub mod backend;
pub mod clock;
pub mod engine;
pub mod error;
pub mod mixer;
pub mod observers;
pub mod player;
pub mod playlist;
pub mod providers;
pub mod queue;
pub mod resume;
pub mod scheduler;
pub mod stream;
pub mod track;
pub mod uri;

pub use error::{Error, Result};
pub use player::Player;
pub use track::{MediaTrack, Track, TrackRef};
