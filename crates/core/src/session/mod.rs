use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{assets::CharacterInfo, StoryboxError};

/// Identifier read from a figurine tag.
pub type TagId = u64;

/// Authoritative device state owned by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Booting,
    WaitingNetwork,
    IdleReady,
    PreparingStory,
    RequestingStory,
    PlayingStory,
    Paused,
    ConfirmStop,
}

impl DeviceState {
    /// States in which a story is loaded in the playback facade.
    pub fn has_story(self) -> bool {
        matches!(
            self,
            DeviceState::PlayingStory | DeviceState::Paused | DeviceState::ConfirmStop
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Booting => "BOOTING",
            DeviceState::WaitingNetwork => "WAITING_NETWORK",
            DeviceState::IdleReady => "IDLE_READY",
            DeviceState::PreparingStory => "PREPARING_STORY",
            DeviceState::RequestingStory => "REQUESTING_STORY",
            DeviceState::PlayingStory => "PLAYING_STORY",
            DeviceState::Paused => "PAUSED",
            DeviceState::ConfirmStop => "CONFIRM_STOP",
        };
        f.write_str(name)
    }
}

/// Story length category chosen on the duration selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationMode {
    Short,
    #[default]
    Medium,
    Long,
}

impl DurationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DurationMode::Short => "short",
            DurationMode::Medium => "medium",
            DurationMode::Long => "long",
        }
    }

    /// Story length in minutes requested from the provider.
    pub fn minutes(self) -> u32 {
        match self {
            DurationMode::Short => 1,
            DurationMode::Medium => 5,
            DurationMode::Long => 10,
        }
    }
}

impl FromStr for DurationMode {
    type Err = StoryboxError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "short" => Ok(DurationMode::Short),
            "medium" => Ok(DurationMode::Medium),
            "long" => Ok(DurationMode::Long),
            other => Err(StoryboxError::msg(format!("unknown duration mode `{other}`"))),
        }
    }
}

impl fmt::Display for DurationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data collected while the child prepares a story. Rebuilt from scratch on
/// every stop or natural finish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorySession {
    /// Active tags, ordered by the group index of the reader holding them.
    pub characters: Vec<TagId>,
    pub duration: DurationMode,
    pub audio_path: Option<PathBuf>,
    pub timeline_path: Option<PathBuf>,
}

impl StorySession {
    pub fn new(duration: DurationMode) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }
}

/// A tag currently resting on a reader, with its resolved character once
/// the controller has looked it up.
#[derive(Debug, Clone, PartialEq)]
pub struct HeldTag {
    pub tag: TagId,
    pub info: Option<CharacterInfo>,
}

/// One physical reader position bound to an LED group.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderSlot {
    pub group: usize,
    pub held: Option<HeldTag>,
}

impl ReaderSlot {
    pub fn new(group: usize) -> Self {
        Self { group, held: None }
    }

    pub fn tag(&self) -> Option<TagId> {
        self.held.as_ref().map(|held| held.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_modes_case_insensitively() {
        assert_eq!("Short".parse::<DurationMode>().unwrap(), DurationMode::Short);
        assert_eq!(" long ".parse::<DurationMode>().unwrap(), DurationMode::Long);
        assert!("unknown".parse::<DurationMode>().is_err());
    }

    #[test]
    fn fresh_session_keeps_only_the_duration() {
        let session = StorySession::new(DurationMode::Long);
        assert!(session.characters.is_empty());
        assert!(session.audio_path.is_none());
        assert!(session.timeline_path.is_none());
        assert_eq!(session.duration, DurationMode::Long);
    }

    #[test]
    fn story_states_are_flagged() {
        assert!(DeviceState::PlayingStory.has_story());
        assert!(DeviceState::ConfirmStop.has_story());
        assert!(!DeviceState::PreparingStory.has_story());
        assert_eq!(DeviceState::WaitingNetwork.to_string(), "WAITING_NETWORK");
    }
}
