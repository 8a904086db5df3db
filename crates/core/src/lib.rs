//! Control core for the Storybox appliance.
//!
//! The [`controller`] owns the device state machine and reacts to
//! [`events`] coming from readers, the encoder and the network probe. The
//! [`render`] module drives the LED strip from [`pattern`]s, and story
//! playback can hand it a [`timeline`] translated through [`mapping`].
//! Network access goes through the [`provider`] seam and audio through the
//! traits in [`audio`], so the core runs the same on hardware and in the
//! console simulator.

pub mod assets;
pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod mapping;
pub mod pattern;
pub mod provider;
pub mod render;
pub mod session;
pub mod timeline;

#[cfg(test)]
mod testing;

pub use assets::{CharacterInfo, CharacterRegistry, StoryAssets};
pub use audio::{Playback, PositionSource, Prompt, PromptPlayer};
pub use config::AppConfig;
pub use controller::{Controller, ControllerParts};
pub use error::{Result, StoryboxError};
pub use events::{DeviceEvent, DurationSelector, EventHandler, EventSender};
pub use pattern::{PatternInstance, PatternSpec, Rgb};
pub use provider::{HttpStoryProvider, StoryProvider, StoryRequest};
pub use render::{LedStrip, LightingEngine};
pub use session::{DeviceState, DurationMode, StorySession, TagId};
pub use timeline::{StoryTimeline, TimelinePlayer};
