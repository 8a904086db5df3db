use std::{fmt, path::Path, sync::Arc};

use crate::{session::DurationMode, Result};

/// Supplies the current playback position in seconds.
pub type PositionSource = Arc<dyn Fn() -> Result<f32> + Send + Sync>;

/// Audio transport used for stories.
///
/// Implementations own their own synchronisation. The position is monotonic
/// within one story and resets on `stop` or a new `play`. A natural end of
/// media must be reported exactly once, as a
/// [`DeviceEvent::StoryFinished`](crate::events::DeviceEvent::StoryFinished).
pub trait Playback: Send + Sync {
    fn play(&self, path: &Path) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn position(&self) -> Result<f32>;
    /// Volume in `[0, 1]`.
    fn set_volume(&self, volume: f32) -> Result<()>;
}

/// Wraps a playback facade so the lighting engine can sample it every frame.
pub fn position_source(playback: Arc<dyn Playback>) -> PositionSource {
    Arc::new(move || playback.position())
}

/// Short system voice lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    InternetConnected,
    NoInternet,
    PreparingStory,
    TagRemoved,
    /// Name of the character whose figurine was just placed.
    Character(String),
    Duration(DurationMode),
    ConfirmStop,
    StoryWaiting,
    StoryStart,
    NoCharacters,
    Error,
}

impl Prompt {
    /// Asset key, relative to the prompt library root and without extension.
    pub fn key(&self) -> String {
        match self {
            Prompt::InternetConnected => "internet_connected".into(),
            Prompt::NoInternet => "no_internet".into(),
            Prompt::PreparingStory => "preparing_story".into(),
            Prompt::TagRemoved => "tag_removed".into(),
            Prompt::Character(name) => format!("characters/{name}"),
            Prompt::Duration(mode) => format!("duration/{}", mode.as_str()),
            Prompt::ConfirmStop => "stop_story".into(),
            Prompt::StoryWaiting => "story_waiting".into(),
            Prompt::StoryStart => "story_start".into(),
            Prompt::NoCharacters => "no_characters".into(),
            Prompt::Error => "error".into(),
        }
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Plays system prompts without blocking the caller for the whole clip.
pub trait PromptPlayer: Send + Sync {
    fn play(&self, prompt: &Prompt) -> Result<()>;
}
