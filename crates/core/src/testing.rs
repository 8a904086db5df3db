//! Recording fakes shared by the unit tests.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crate::{
    assets::{CharacterInfo, StoryAssets},
    audio::{Playback, Prompt, PromptPlayer},
    events::DurationSelector,
    pattern::Rgb,
    provider::{StoryProvider, StoryRequest},
    render::LedStrip,
    session::{DurationMode, TagId},
    Result, StoryboxError,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackCall {
    Play(PathBuf),
    Pause,
    Resume,
    Stop,
    Volume(f32),
}

#[derive(Default)]
pub struct RecordingPlayback {
    calls: Mutex<Vec<PlaybackCall>>,
    position: Mutex<f32>,
}

impl RecordingPlayback {
    pub fn calls(&self) -> Vec<PlaybackCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_position(&self, seconds: f32) {
        *self.position.lock().unwrap() = seconds;
    }

    fn record(&self, call: PlaybackCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl Playback for RecordingPlayback {
    fn play(&self, path: &Path) -> Result<()> {
        self.set_position(0.0);
        self.record(PlaybackCall::Play(path.to_path_buf()))
    }

    fn pause(&self) -> Result<()> {
        self.record(PlaybackCall::Pause)
    }

    fn resume(&self) -> Result<()> {
        self.record(PlaybackCall::Resume)
    }

    fn stop(&self) -> Result<()> {
        self.set_position(0.0);
        self.record(PlaybackCall::Stop)
    }

    fn position(&self) -> Result<f32> {
        Ok(*self.position.lock().unwrap())
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        self.record(PlaybackCall::Volume(volume))
    }
}

#[derive(Default)]
pub struct RecordingPrompts {
    played: Mutex<Vec<Prompt>>,
}

impl RecordingPrompts {
    pub fn played(&self) -> Vec<Prompt> {
        self.played.lock().unwrap().clone()
    }

    pub fn count(&self, prompt: &Prompt) -> usize {
        self.played.lock().unwrap().iter().filter(|p| *p == prompt).count()
    }
}

impl PromptPlayer for RecordingPrompts {
    fn play(&self, prompt: &Prompt) -> Result<()> {
        self.played.lock().unwrap().push(prompt.clone());
        Ok(())
    }
}

/// Provider answering from in-memory tables.
#[derive(Default)]
pub struct ScriptedProvider {
    characters: Mutex<HashMap<TagId, CharacterInfo>>,
    character_calls: Mutex<usize>,
    lookup_delay: Mutex<Duration>,
    story: Mutex<Option<StoryAssets>>,
    delay: Mutex<Duration>,
    requests: Mutex<Vec<StoryRequest>>,
}

impl ScriptedProvider {
    pub fn add_character(&self, tag: TagId, info: CharacterInfo) {
        self.characters.lock().unwrap().insert(tag, info);
    }

    pub fn character_calls(&self) -> usize {
        *self.character_calls.lock().unwrap()
    }

    pub fn set_lookup_delay(&self, delay: Duration) {
        *self.lookup_delay.lock().unwrap() = delay;
    }

    /// `None` makes generation fail.
    pub fn set_story(&self, story: Option<StoryAssets>) {
        *self.story.lock().unwrap() = story;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn requests(&self) -> Vec<StoryRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl StoryProvider for ScriptedProvider {
    fn character(&self, tag: TagId) -> Result<CharacterInfo> {
        *self.character_calls.lock().unwrap() += 1;
        let delay = *self.lookup_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.characters
            .lock()
            .unwrap()
            .get(&tag)
            .cloned()
            .ok_or_else(|| StoryboxError::provider(format!("unknown tag {tag}")))
    }

    fn generate(&self, request: &StoryRequest) -> Result<StoryAssets> {
        self.requests.lock().unwrap().push(request.clone());
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.story
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| StoryboxError::provider("generation failed"))
    }
}

pub struct FixedSelector {
    value: Mutex<Option<DurationMode>>,
}

impl FixedSelector {
    pub fn new(value: Option<DurationMode>) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    pub fn set(&self, value: Option<DurationMode>) {
        *self.value.lock().unwrap() = value;
    }
}

impl DurationSelector for FixedSelector {
    fn read(&self) -> Option<DurationMode> {
        *self.value.lock().unwrap()
    }
}

#[derive(Debug, Default)]
struct StripLog {
    last: Option<Vec<Rgb>>,
    writes: usize,
    offs: usize,
}

/// Strip that remembers what it was sent. Clones share the same log.
#[derive(Debug, Clone)]
pub struct MemoryStrip {
    pixels: usize,
    log: Arc<Mutex<StripLog>>,
}

impl MemoryStrip {
    pub fn new(pixels: usize) -> Self {
        Self {
            pixels,
            log: Arc::default(),
        }
    }

    pub fn last(&self) -> Option<Vec<Rgb>> {
        self.log.lock().unwrap().last.clone()
    }

    pub fn writes(&self) -> usize {
        self.log.lock().unwrap().writes
    }

    pub fn off_count(&self) -> usize {
        self.log.lock().unwrap().offs
    }
}

impl LedStrip for MemoryStrip {
    fn pixel_count(&self) -> usize {
        self.pixels
    }

    fn write(&mut self, pixels: &[Rgb]) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.writes += 1;
        log.last = Some(pixels.to_vec());
        Ok(())
    }

    fn off(&mut self) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.offs += 1;
        log.last = Some(vec![Rgb::BLACK; self.pixels]);
        Ok(())
    }
}
