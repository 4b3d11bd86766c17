//! # Segue Common Library
//!
//! Shared code for the segue player crates:
//! - Lifecycle event types (`PlayerEvent`) and the broadcast `EventBus`
//! - Settings store with change notification
//! - Configuration file resolution
//! - Backend time units (ticks) and conversions

pub mod config;
pub mod error;
pub mod events;
pub mod settings;
pub mod timing;

pub use error::{Error, Result};
pub use events::{EventBus, PlaybackState, PlayerEvent};
pub use settings::{SettingChanged, SettingsStore};
