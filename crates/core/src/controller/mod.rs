//! Session controller: the device's finite-state machine.
//!
//! Every event goes through [`Controller::handle`], which takes one coarse
//! lock around the state and the session so concurrent sources never
//! interleave. Work that may block (story generation, the connected hold,
//! the story-start grace period, waiting prompts) runs on helper threads
//! that capture the generation counter and give up if it moved on.

use std::{
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    thread,
    time::Duration,
};

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::{
    assets::{CharacterInfo, CharacterRegistry, StoryAssets},
    audio::{self, Playback, Prompt, PromptPlayer},
    config::AppConfig,
    events::{DeviceEvent, DurationSelector, EventHandler},
    pattern::{PatternSpec, Rgb},
    provider::{StoryProvider, StoryRequest},
    render::LightingEngine,
    session::{DeviceState, DurationMode, HeldTag, ReaderSlot, StorySession, TagId},
    timeline::StoryTimeline,
    Result, StoryboxError,
};

const BUTTON_FLASH: PatternSpec = PatternSpec::InstantFlash {
    color: Rgb::new(80, 160, 255),
    duration: 1.0,
};
const CONNECTED_FLASH_COLOR: Rgb = Rgb::new(0, 255, 0);
const CONFIRM_STOP_COLOR: Rgb = Rgb::new(255, 0, 0);

/// Collaborators the controller drives.
pub struct ControllerParts {
    pub config: AppConfig,
    pub lighting: Arc<LightingEngine>,
    pub playback: Arc<dyn Playback>,
    pub prompts: Arc<dyn PromptPlayer>,
    pub provider: Arc<dyn StoryProvider>,
    pub selector: Arc<dyn DurationSelector>,
}

struct Inner {
    state: DeviceState,
    session: StorySession,
    slots: BTreeMap<String, ReaderSlot>,
    volume: f32,
    pending_stop: bool,
}

impl Inner {
    fn active_characters(&self) -> Vec<TagId> {
        let mut held: Vec<(usize, TagId)> = self
            .slots
            .values()
            .filter_map(|slot| slot.tag().map(|tag| (slot.group, tag)))
            .collect();
        held.sort_by_key(|(group, _)| *group);
        held.into_iter().map(|(_, tag)| tag).collect()
    }
}

struct StoryJob {
    generation: u64,
    request: StoryRequest,
}

/// Single-slot executor for story requests. A newer job replaces one that
/// has not started yet.
struct StoryWorker {
    channel: Mutex<Option<(Sender<StoryJob>, Receiver<StoryJob>)>>,
}

impl StoryWorker {
    fn new() -> Self {
        Self {
            channel: Mutex::new(None),
        }
    }

    fn start(&self, controller: Weak<Controller>) -> Result<()> {
        let (tx, rx) = flume::bounded::<StoryJob>(1);
        let jobs = rx.clone();
        thread::Builder::new()
            .name("story-worker".into())
            .spawn(move || {
                for job in jobs.iter() {
                    let Some(controller) = controller.upgrade() else {
                        break;
                    };
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| controller.run_story_job(job)));
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!(error = %err, "story job failed"),
                        Err(_) => error!("story job panicked"),
                    }
                }
                debug!("story worker stopped");
            })?;
        *self.lock()? = Some((tx, rx));
        Ok(())
    }

    fn submit(&self, mut job: StoryJob) -> Result<()> {
        let channel = self.lock()?;
        let Some((tx, rx)) = channel.as_ref() else {
            return Err(StoryboxError::msg("story worker is not running"));
        };
        loop {
            match tx.try_send(job) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(pending)) => {
                    if let Ok(stale) = rx.try_recv() {
                        debug!(generation = stale.generation, "superseding queued story request");
                    }
                    job = pending;
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(StoryboxError::msg("story worker has stopped"))
                }
            }
        }
    }

    fn stop(&self) {
        if let Ok(mut channel) = self.lock() {
            channel.take();
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<(Sender<StoryJob>, Receiver<StoryJob>)>>> {
        self.channel
            .lock()
            .map_err(|_| StoryboxError::Poisoned("story worker"))
    }
}

/// Owns the device state and the story session.
pub struct Controller {
    this: Weak<Controller>,
    config: AppConfig,
    lighting: Arc<LightingEngine>,
    playback: Arc<dyn Playback>,
    prompts: Arc<dyn PromptPlayer>,
    characters: CharacterRegistry,
    provider: Arc<dyn StoryProvider>,
    selector: Arc<dyn DurationSelector>,
    inner: Mutex<Inner>,
    generation: AtomicU64,
    worker: StoryWorker,
    waiting: Mutex<Option<Sender<()>>>,
}

impl Controller {
    pub fn new(parts: ControllerParts) -> Result<Arc<Self>> {
        parts.config.validate()?;
        let ControllerParts {
            config,
            lighting,
            playback,
            prompts,
            provider,
            selector,
        } = parts;

        let slots = config
            .readers
            .iter()
            .map(|reader| (reader.id.clone(), ReaderSlot::new(reader.group)))
            .collect();
        let duration = selector.read().unwrap_or_default();
        let volume = config.session.initial_volume;

        let controller = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            characters: CharacterRegistry::new(Arc::clone(&provider)),
            config,
            lighting,
            playback,
            prompts,
            provider,
            selector,
            inner: Mutex::new(Inner {
                state: DeviceState::Booting,
                session: StorySession::new(duration),
                slots,
                volume,
                pending_stop: false,
            }),
            generation: AtomicU64::new(0),
            worker: StoryWorker::new(),
            waiting: Mutex::new(None),
        });

        controller.worker.start(Arc::downgrade(&controller))?;
        if let Err(err) = controller.playback.set_volume(volume) {
            warn!(error = %err, "could not apply initial volume");
        }
        controller.light(|lighting| lighting.apply_state(DeviceState::Booting));
        info!(readers = controller.config.readers.len(), "controller ready");
        Ok(controller)
    }

    pub fn state(&self) -> Result<DeviceState> {
        Ok(self.lock()?.state)
    }

    pub fn session(&self) -> Result<StorySession> {
        Ok(self.lock()?.session.clone())
    }

    pub fn volume(&self) -> Result<f32> {
        Ok(self.lock()?.volume)
    }

    /// Whether playback is paused awaiting a stop confirmation.
    pub fn stop_pending(&self) -> Result<bool> {
        Ok(self.lock()?.pending_stop)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn reader_slot(&self, reader: &str) -> Result<Option<ReaderSlot>> {
        Ok(self.lock()?.slots.get(reader).cloned())
    }

    /// Cancels outstanding work and stops the story.
    pub fn shutdown(&self) -> Result<()> {
        self.bump();
        self.stop_waiting_prompts();
        self.worker.stop();
        if self.lock()?.state.has_story() {
            self.playback.stop()?;
        }
        info!("controller stopped");
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoryboxError::Poisoned("controller"))
    }

    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    fn light(&self, action: impl FnOnce(&LightingEngine) -> Result<()>) {
        if let Err(err) = action(&self.lighting) {
            warn!(error = %err, "lighting command failed");
        }
    }

    fn set_state(&self, inner: &mut Inner, state: DeviceState) {
        let previous = inner.state;
        inner.state = state;
        let generation = self.bump();
        info!(from = %previous, to = %state, generation, "state change");
        self.light(|lighting| lighting.apply_state(state));
    }

    /// Plays a system prompt unless a story is playing.
    fn say(&self, inner: &Inner, prompt: Prompt) {
        if inner.state == DeviceState::PlayingStory {
            debug!(%prompt, "prompt suppressed during story");
            return;
        }
        if let Err(err) = self.prompts.play(&prompt) {
            warn!(%prompt, error = %err, "prompt failed");
        }
    }

    /// Reads the selector, keeping `previous` when the reading is invalid.
    fn read_duration(&self, previous: DurationMode) -> DurationMode {
        match self.selector.read() {
            Some(mode) => mode,
            None => {
                warn!(kept = %previous, "invalid duration selector reading");
                previous
            }
        }
    }

    fn on_connectivity(&self, online: bool) -> Result<()> {
        let mut inner = self.lock()?;
        if online {
            if !matches!(inner.state, DeviceState::Booting | DeviceState::WaitingNetwork) {
                debug!(state = %inner.state, "connectivity restored, nothing to do");
                return Ok(());
            }
            self.say(&inner, Prompt::InternetConnected);
            let hold = Duration::from_millis(self.config.session.connected_hold_ms);
            if hold.is_zero() {
                return self.finish_boot(&mut inner);
            }
            self.light(|lighting| {
                lighting.trigger_event(PatternSpec::InstantFlash {
                    color: CONNECTED_FLASH_COLOR,
                    duration: hold.as_secs_f32(),
                })
            });

            let generation = self.generation();
            drop(inner);
            let this = self.this.clone();
            thread::Builder::new()
                .name("connected-hold".into())
                .spawn(move || {
                    thread::sleep(hold);
                    let Some(controller) = this.upgrade() else {
                        return;
                    };
                    if let Err(err) = controller.connected_hold_elapsed(generation) {
                        warn!(error = %err, "could not leave connected hold");
                    }
                })?;
            Ok(())
        } else {
            if inner.state.has_story() {
                debug!("connectivity lost during story, ignoring");
                return Ok(());
            }
            self.stop_waiting_prompts();
            self.set_state(&mut inner, DeviceState::WaitingNetwork);
            self.say(&inner, Prompt::NoInternet);
            Ok(())
        }
    }

    fn connected_hold_elapsed(&self, generation: u64) -> Result<()> {
        let mut inner = self.lock()?;
        if !self.is_current(generation)
            || !matches!(inner.state, DeviceState::Booting | DeviceState::WaitingNetwork)
        {
            debug!("connected hold superseded");
            return Ok(());
        }
        self.finish_boot(&mut inner)
    }

    fn finish_boot(&self, inner: &mut Inner) -> Result<()> {
        self.set_state(inner, DeviceState::IdleReady);
        self.start_preparing(inner);
        Ok(())
    }

    fn start_preparing(&self, inner: &mut Inner) {
        let duration = self.read_duration(inner.session.duration);
        inner.session = StorySession::new(duration);
        self.set_state(inner, DeviceState::PreparingStory);
        self.say(inner, Prompt::PreparingStory);
        self.replay_feedback(inner);
    }

    /// Re-applies group colours for every held tag and rebuilds the active
    /// character list. Tags not resolved yet light with their group colour
    /// and are looked up in the background.
    fn replay_feedback(&self, inner: &mut Inner) {
        self.light(|lighting| lighting.clear_group_colors());
        let mut pending = Vec::new();
        for (reader, slot) in inner.slots.iter_mut() {
            let Some(held) = slot.held.as_mut() else {
                continue;
            };
            if held.info.is_none() {
                match self.characters.cached(held.tag) {
                    Ok(cached) => held.info = cached,
                    Err(err) => warn!(error = %err, "character cache unavailable"),
                }
            }
            let color = held
                .info
                .as_ref()
                .and_then(|info| info.color)
                .unwrap_or_else(|| self.lighting.settings().group_color(slot.group));
            let group = slot.group;
            self.light(|lighting| lighting.set_group_color(group, color).map(|_| ()));
            if held.info.is_none() {
                pending.push((reader.clone(), held.tag));
            }
        }
        inner.session.characters = inner.active_characters();
        debug!(characters = ?inner.session.characters, unresolved = pending.len(), "feedback replayed");
        if !pending.is_empty() {
            self.resolve_in_background(pending);
        }
    }

    fn resolve_in_background(&self, pending: Vec<(String, TagId)>) {
        let generation = self.generation();
        let this = self.this.clone();
        let spawned = thread::Builder::new()
            .name("character-lookup".into())
            .spawn(move || {
                for (reader, tag) in pending {
                    let Some(controller) = this.upgrade() else {
                        return;
                    };
                    let info = controller.characters.resolve(tag);
                    if let Err(err) = controller.apply_lookup(generation, &reader, tag, info) {
                        warn!(reader = %reader, tag, error = %err, "could not apply character lookup");
                    }
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "could not start character lookups");
        }
    }

    /// Stores a background lookup if the reader still holds the tag, and
    /// lights its group if the same preparation is still running.
    fn apply_lookup(&self, generation: u64, reader: &str, tag: TagId, info: CharacterInfo) -> Result<()> {
        let mut inner = self.lock()?;
        let Some(slot) = inner.slots.get_mut(reader) else {
            return Ok(());
        };
        let group = slot.group;
        match slot.held.as_mut() {
            Some(held) if held.tag == tag && held.info.is_none() => held.info = Some(info.clone()),
            _ => {
                debug!(reader, tag, "character lookup outdated");
                return Ok(());
            }
        }
        if !self.is_current(generation) || inner.state != DeviceState::PreparingStory {
            return Ok(());
        }
        if let Some(color) = info.color {
            self.light(|lighting| lighting.set_group_color(group, color).map(|_| ()));
        }
        debug!(reader, tag, name = %info.name, "character resolved");
        Ok(())
    }

    fn on_tag_detected(&self, reader: &str, tag: TagId) -> Result<()> {
        if !self.config.readers.iter().any(|r| r.id == reader) {
            warn!(reader, tag, "tag from unknown reader");
            return Ok(());
        }

        // Lookups can block, so they run with the lock released and the
        // state is checked again afterwards.
        let mut resolved = None;
        loop {
            let mut inner = self.lock()?;
            let known = inner
                .slots
                .get(reader)
                .and_then(|slot| slot.held.as_ref())
                .is_some_and(|held| held.tag == tag && held.info.is_some());
            if inner.state == DeviceState::PreparingStory && resolved.is_none() && !known {
                drop(inner);
                resolved = Some(self.characters.resolve(tag));
                continue;
            }
            return self.store_tag(&mut inner, reader, tag, resolved);
        }
    }

    fn store_tag(&self, inner: &mut Inner, reader: &str, tag: TagId, resolved: Option<CharacterInfo>) -> Result<()> {
        let Some(slot) = inner.slots.get_mut(reader) else {
            return Ok(());
        };
        let is_new = slot.tag() != Some(tag);
        let info = match (resolved, slot.held.take()) {
            (Some(info), _) => Some(info),
            (None, Some(previous)) if previous.tag == tag => previous.info,
            (None, _) => None,
        };
        slot.held = Some(HeldTag {
            tag,
            info: info.clone(),
        });
        let group = slot.group;

        if inner.state != DeviceState::PreparingStory {
            debug!(reader, tag, state = %inner.state, "tag stored outside preparation");
            return Ok(());
        }

        let info = info.unwrap_or_else(|| CharacterInfo::fallback(tag));
        inner.session.characters = inner.active_characters();
        let color = info
            .color
            .unwrap_or_else(|| self.lighting.settings().group_color(group));
        self.light(|lighting| lighting.set_group_color(group, color).map(|_| ()));
        info!(reader, tag, name = %info.name, characters = ?inner.session.characters, "character placed");
        if is_new {
            self.say(inner, Prompt::Character(info.name.clone()));
        }
        Ok(())
    }

    fn on_tag_removed(&self, reader: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let state = inner.state;
        let Some(slot) = inner.slots.get_mut(reader) else {
            warn!(reader, "removal from unknown reader");
            return Ok(());
        };
        let removed = slot.held.take();
        let group = slot.group;

        if state != DeviceState::PreparingStory {
            debug!(reader, %state, "tag removed outside preparation");
            return Ok(());
        }
        if removed.is_none() {
            debug!(reader, "removal on an empty reader");
        }
        self.light(|lighting| lighting.clear_group_color(group).map(|_| ()));
        self.say(&inner, Prompt::TagRemoved);
        inner.session.characters = inner.active_characters();
        info!(reader, characters = ?inner.session.characters, "character removed");
        Ok(())
    }

    fn on_duration_changed(&self, mode: DurationMode) -> Result<()> {
        let mut inner = self.lock()?;
        inner.session.duration = mode;
        info!(%mode, "duration mode changed");
        self.say(&inner, Prompt::Duration(mode));
        Ok(())
    }

    fn on_rotate(&self, delta: i32) -> Result<()> {
        let mut inner = self.lock()?;
        let volume = (inner.volume + self.config.session.volume_step * delta as f32).clamp(0.0, 1.0);
        inner.volume = volume;
        debug!(volume, "volume");
        self.playback.set_volume(volume)
    }

    fn on_click(&self) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.state {
            DeviceState::PreparingStory => {
                self.light(|lighting| lighting.trigger_event(BUTTON_FLASH));
                self.request_story(&mut inner)
            }
            DeviceState::PlayingStory => {
                self.playback.pause()?;
                inner.pending_stop = true;
                self.set_state(&mut inner, DeviceState::ConfirmStop);
                self.say(&inner, Prompt::ConfirmStop);
                self.light(|lighting| lighting.trigger_event(PatternSpec::breathe_slow(CONFIRM_STOP_COLOR)));
                Ok(())
            }
            DeviceState::ConfirmStop => {
                self.playback.resume()?;
                inner.pending_stop = false;
                self.light(|lighting| lighting.clear_event());
                self.set_state(&mut inner, DeviceState::PlayingStory);
                Ok(())
            }
            state => {
                info!(%state, "click ignored");
                Ok(())
            }
        }
    }

    fn on_long_press(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.state != DeviceState::ConfirmStop {
            info!(state = %inner.state, "long press ignored");
            return Ok(());
        }
        info!("stop confirmed");
        self.stop_and_reset(&mut inner);
        Ok(())
    }

    fn on_story_finished(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.state.has_story() {
            info!(state = %inner.state, "stale story-finished notification");
            return Ok(());
        }
        info!("story finished");
        self.reset_to_preparing(&mut inner);
        Ok(())
    }

    fn request_story(&self, inner: &mut Inner) -> Result<()> {
        if inner.session.characters.is_empty() {
            info!("story requested without characters");
            self.say(inner, Prompt::NoCharacters);
            return Ok(());
        }

        self.set_state(inner, DeviceState::RequestingStory);
        let generation = self.generation();
        let request = StoryRequest {
            duration: inner.session.duration,
            characters: inner.session.characters.clone(),
        };
        info!(generation, characters = ?request.characters, duration = %request.duration, "requesting story");
        self.say(inner, Prompt::StoryWaiting);
        self.start_waiting_prompts(generation)?;
        self.worker.submit(StoryJob { generation, request })
    }

    fn run_story_job(&self, job: StoryJob) -> Result<()> {
        if !self.is_current(job.generation) {
            debug!(generation = job.generation, "skipping superseded story request");
            return Ok(());
        }

        let outcome = self.provider.generate(&job.request);
        if !self.is_current(job.generation) {
            info!(generation = job.generation, "dropping stale story result");
            return Ok(());
        }
        self.stop_waiting_prompts();

        match outcome {
            Ok(assets) => self.story_ready(job.generation, assets),
            Err(err) => {
                warn!(error = %err, "story generation failed");
                self.story_failed(job.generation)
            }
        }
    }

    fn story_ready(&self, generation: u64, assets: StoryAssets) -> Result<()> {
        {
            let mut inner = self.lock()?;
            if !self.is_current(generation) {
                return Ok(());
            }
            info!(audio = %assets.audio.display(), timeline = ?assets.timeline, "story ready");
            inner.session.audio_path = Some(assets.audio);
            inner.session.timeline_path = assets.timeline;
            self.say(&inner, Prompt::StoryStart);
        }

        let grace = Duration::from_millis(self.config.session.story_grace_ms);
        if !grace.is_zero() {
            thread::sleep(grace);
        }

        let mut inner = self.lock()?;
        if !self.is_current(generation) {
            info!("story superseded during grace period");
            return Ok(());
        }
        self.start_story(&mut inner);
        Ok(())
    }

    fn story_failed(&self, generation: u64) -> Result<()> {
        let mut inner = self.lock()?;
        if !self.is_current(generation) {
            return Ok(());
        }

        match self.default_story() {
            Some(path) => {
                info!(path = %path.display(), "falling back to default story");
                inner.session.audio_path = Some(path);
                inner.session.timeline_path = None;
                self.say(&inner, Prompt::StoryStart);
                self.start_story(&mut inner);
            }
            None => {
                self.say(&inner, Prompt::Error);
                self.set_state(&mut inner, DeviceState::PreparingStory);
                self.replay_feedback(&mut inner);
            }
        }
        Ok(())
    }

    fn default_story(&self) -> Option<PathBuf> {
        let path = self.config.session.default_story.clone()?;
        if path.is_file() {
            Some(path)
        } else {
            warn!(path = %path.display(), "default story is missing");
            None
        }
    }

    fn start_story(&self, inner: &mut Inner) {
        let Some(audio) = inner.session.audio_path.clone() else {
            warn!("start requested without an audio path");
            return;
        };

        let timeline = inner.session.timeline_path.as_ref().and_then(|path| {
            match StoryTimeline::load(path, &self.lighting.settings().group_lengths) {
                Ok(timeline) => timeline,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unusable story timeline");
                    None
                }
            }
        });
        match timeline {
            Some(timeline) => {
                let position = audio::position_source(Arc::clone(&self.playback));
                self.light(|lighting| lighting.attach_timeline(Arc::new(timeline), position));
            }
            None => self.light(|lighting| lighting.clear_timeline()),
        }

        inner.pending_stop = false;
        self.light(|lighting| lighting.clear_event());
        self.set_state(inner, DeviceState::PlayingStory);
        if let Err(err) = self.playback.play(&audio) {
            error!(path = %audio.display(), error = %err, "story playback failed");
            self.set_state(inner, DeviceState::IdleReady);
            self.say(inner, Prompt::Error);
            self.reset_to_preparing(inner);
        }
    }

    fn stop_and_reset(&self, inner: &mut Inner) {
        if let Err(err) = self.playback.stop() {
            warn!(error = %err, "could not stop playback");
        }
        self.reset_to_preparing(inner);
    }

    fn reset_to_preparing(&self, inner: &mut Inner) {
        self.stop_waiting_prompts();
        self.light(|lighting| lighting.clear_event());
        inner.pending_stop = false;
        let duration = self.read_duration(inner.session.duration);
        inner.session = StorySession::new(duration);
        self.set_state(inner, DeviceState::IdleReady);
        self.start_preparing(inner);
    }

    /// Replays the waiting prompt at random intervals until cancelled or
    /// the generation moves on.
    fn start_waiting_prompts(&self, generation: u64) -> Result<()> {
        let (cancel_tx, cancel_rx) = flume::bounded::<()>(1);
        let min = self.config.session.waiting_prompt_min_ms;
        let max = self.config.session.waiting_prompt_max_ms.max(min);
        let this = self.this.clone();

        thread::Builder::new()
            .name("waiting-prompts".into())
            .spawn(move || loop {
                let wait = Duration::from_millis(rand::thread_rng().gen_range(min..=max));
                match cancel_rx.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let Some(controller) = this.upgrade() else {
                    break;
                };
                if !controller.is_current(generation) {
                    break;
                }
                if let Err(err) = controller.prompts.play(&Prompt::StoryWaiting) {
                    warn!(error = %err, "waiting prompt failed");
                }
            })?;

        if let Ok(mut waiting) = self.waiting.lock() {
            *waiting = Some(cancel_tx);
        }
        Ok(())
    }

    fn stop_waiting_prompts(&self) {
        if let Ok(mut waiting) = self.waiting.lock() {
            // Dropping the sender wakes the loop.
            waiting.take();
        }
    }
}

impl EventHandler for Controller {
    fn handle(&self, event: DeviceEvent) -> Result<()> {
        match event {
            DeviceEvent::TagDetected { reader, tag } => self.on_tag_detected(&reader, tag),
            DeviceEvent::TagRemoved { reader } => self.on_tag_removed(&reader),
            DeviceEvent::Rotate(delta) => self.on_rotate(delta),
            DeviceEvent::Click => self.on_click(),
            DeviceEvent::LongPress => self.on_long_press(),
            DeviceEvent::DurationChanged(mode) => self.on_duration_changed(mode),
            DeviceEvent::Connectivity(online) => self.on_connectivity(online),
            DeviceEvent::StoryFinished => self.on_story_finished(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        assets::CharacterInfo,
        config::LightingConfig,
        testing::{FixedSelector, PlaybackCall, RecordingPlayback, RecordingPrompts, ScriptedProvider},
    };

    struct Rig {
        controller: Arc<Controller>,
        lighting: Arc<LightingEngine>,
        playback: Arc<RecordingPlayback>,
        prompts: Arc<RecordingPrompts>,
        provider: Arc<ScriptedProvider>,
        selector: Arc<FixedSelector>,
    }

    fn quick_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.lighting = LightingConfig {
            frame_interval_ms: 5,
            ..LightingConfig::default()
        };
        config.session.connected_hold_ms = 0;
        config.session.story_grace_ms = 0;
        config.session.waiting_prompt_min_ms = 10;
        config.session.waiting_prompt_max_ms = 20;
        config
    }

    fn rig_with(config: AppConfig) -> Rig {
        let lighting = Arc::new(LightingEngine::new(config.lighting.clone()));
        let playback = Arc::new(RecordingPlayback::default());
        let prompts = Arc::new(RecordingPrompts::default());
        let provider = Arc::new(ScriptedProvider::default());
        let selector = Arc::new(FixedSelector::new(Some(DurationMode::Short)));
        let controller = Controller::new(ControllerParts {
            config,
            lighting: lighting.clone(),
            playback: playback.clone(),
            prompts: prompts.clone(),
            provider: provider.clone(),
            selector: selector.clone(),
        })
        .unwrap();
        Rig {
            controller,
            lighting,
            playback,
            prompts,
            provider,
            selector,
        }
    }

    fn rig() -> Rig {
        rig_with(quick_config())
    }

    fn preparing_rig() -> Rig {
        let rig = rig();
        rig.controller.handle(DeviceEvent::Connectivity(true)).unwrap();
        assert_eq!(rig.controller.state().unwrap(), DeviceState::PreparingStory);
        rig
    }

    fn place(rig: &Rig, reader: &str, tag: TagId) {
        rig.controller
            .handle(DeviceEvent::TagDetected {
                reader: reader.into(),
                tag,
            })
            .unwrap();
    }

    fn wait_for_state(controller: &Controller, wanted: DeviceState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if controller.state().unwrap() == wanted {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn story_files(dir: &std::path::Path) -> StoryAssets {
        let audio = dir.join("story.mp3");
        let timeline = dir.join("leds.json");
        fs::write(&audio, b"mp3").unwrap();
        fs::write(
            &timeline,
            r#"[{"pattern": "fill", "start_time": 0, "color": [1, 2, 3]}]"#,
        )
        .unwrap();
        StoryAssets {
            audio,
            timeline: Some(timeline),
        }
    }

    #[test]
    fn connectivity_moves_boot_into_preparation() {
        let rig = preparing_rig();
        let played = rig.prompts.played();
        assert_eq!(played[0], Prompt::InternetConnected);
        assert!(played.contains(&Prompt::PreparingStory));
        assert_eq!(rig.controller.session().unwrap().duration, DurationMode::Short);
    }

    #[test]
    fn connected_hold_is_cancelled_by_a_drop() {
        let mut config = quick_config();
        config.session.connected_hold_ms = 80;
        let rig = rig_with(config);

        rig.controller.handle(DeviceEvent::Connectivity(true)).unwrap();
        assert_eq!(rig.controller.state().unwrap(), DeviceState::Booting);
        rig.controller.handle(DeviceEvent::Connectivity(false)).unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(rig.controller.state().unwrap(), DeviceState::WaitingNetwork);

        rig.controller.handle(DeviceEvent::Connectivity(true)).unwrap();
        assert!(wait_for_state(&rig.controller, DeviceState::PreparingStory));
    }

    #[test]
    fn active_characters_follow_group_order() {
        let rig = preparing_rig();
        place(&rig, "reader2", 10); // group 3
        place(&rig, "reader4", 20); // group 0
        place(&rig, "reader1", 30); // group 2
        assert_eq!(rig.controller.session().unwrap().characters, vec![20, 30, 10]);

        rig.controller
            .handle(DeviceEvent::TagRemoved {
                reader: "reader4".into(),
            })
            .unwrap();
        assert_eq!(rig.controller.session().unwrap().characters, vec![30, 10]);
        assert_eq!(rig.prompts.count(&Prompt::TagRemoved), 1);

        place(&rig, "reader3", 40); // group 1
        assert_eq!(rig.controller.session().unwrap().characters, vec![40, 30, 10]);
    }

    #[test]
    fn placing_a_tag_announces_it_once_and_colours_its_group() {
        let rig = preparing_rig();
        rig.provider.add_character(
            5,
            CharacterInfo {
                name: "owl".into(),
                color: Some(Rgb::new(9, 8, 7)),
            },
        );
        place(&rig, "reader4", 5);
        place(&rig, "reader4", 5);
        assert_eq!(rig.prompts.count(&Prompt::Character("owl".into())), 1);

        let frame = rig.lighting.render_frame().unwrap().unwrap();
        assert!(frame[0..6].iter().all(|px| *px == Rgb::new(9, 8, 7)));

        place(&rig, "reader1", 6);
        assert_eq!(rig.prompts.count(&Prompt::Character("char_6".into())), 1);
    }

    #[test]
    fn tags_outside_preparation_are_stored_silently_and_replayed() {
        let rig = rig();
        place(&rig, "reader1", 77);
        assert!(rig.prompts.played().is_empty());
        assert_eq!(rig.controller.reader_slot("reader1").unwrap().unwrap().tag(), Some(77));

        rig.controller.handle(DeviceEvent::Connectivity(true)).unwrap();
        assert_eq!(rig.controller.session().unwrap().characters, vec![77]);
    }

    fn timed<T>(action: impl FnOnce() -> T) -> (T, Duration) {
        let started = Instant::now();
        let value = action();
        (value, started.elapsed())
    }

    #[test]
    fn slow_lookups_during_replay_leave_the_controller_responsive() {
        let rig = rig();
        rig.provider.set_lookup_delay(Duration::from_millis(400));
        rig.provider.add_character(
            9,
            CharacterInfo {
                name: "owl".into(),
                color: Some(Rgb::new(4, 5, 6)),
            },
        );
        place(&rig, "reader1", 9); // group 2, held since boot

        let (_, took) = timed(|| rig.controller.handle(DeviceEvent::Connectivity(true)).unwrap());
        assert!(took < Duration::from_millis(200), "connect blocked for {took:?}");
        let (state, took) = timed(|| rig.controller.state().unwrap());
        assert!(took < Duration::from_millis(100), "state() blocked for {took:?}");
        assert_eq!(state, DeviceState::PreparingStory);
        assert_eq!(rig.controller.session().unwrap().characters, vec![9]);

        let deadline = Instant::now() + Duration::from_secs(3);
        let resolved = || {
            rig.controller
                .reader_slot("reader1")
                .unwrap()
                .and_then(|slot| slot.held)
                .and_then(|held| held.info)
        };
        while resolved().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(resolved().map(|info| info.name), Some("owl".to_string()));
        let frame = rig.lighting.render_frame().unwrap().unwrap();
        assert!(frame[14..22].iter().all(|px| *px == Rgb::new(4, 5, 6)));
    }

    #[test]
    fn slow_lookups_for_new_tags_happen_outside_the_lock() {
        let rig = preparing_rig();
        rig.provider.set_lookup_delay(Duration::from_millis(300));

        let controller = Arc::clone(&rig.controller);
        let placing = thread::spawn(move || {
            controller
                .handle(DeviceEvent::TagDetected {
                    reader: "reader4".into(),
                    tag: 5,
                })
                .unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        let (state, took) = timed(|| rig.controller.state().unwrap());
        assert!(took < Duration::from_millis(100), "state() blocked for {took:?}");
        assert_eq!(state, DeviceState::PreparingStory);

        placing.join().unwrap();
        assert_eq!(rig.prompts.count(&Prompt::Character("char_5".into())), 1);
        assert_eq!(rig.controller.session().unwrap().characters, vec![5]);
    }

    #[test]
    fn lookups_for_lifted_tags_are_discarded() {
        let rig = rig();
        rig.provider.set_lookup_delay(Duration::from_millis(150));
        rig.provider.add_character(
            9,
            CharacterInfo {
                name: "owl".into(),
                color: None,
            },
        );
        place(&rig, "reader1", 9);
        rig.controller.handle(DeviceEvent::Connectivity(true)).unwrap();
        rig.controller
            .handle(DeviceEvent::TagRemoved {
                reader: "reader1".into(),
            })
            .unwrap();

        thread::sleep(Duration::from_millis(300));
        assert_eq!(rig.provider.character_calls(), 1);
        assert!(rig.controller.reader_slot("reader1").unwrap().unwrap().held.is_none());
        assert!(rig.controller.session().unwrap().characters.is_empty());
    }

    #[test]
    fn unknown_readers_are_ignored() {
        let rig = preparing_rig();
        place(&rig, "reader9", 1);
        assert!(rig.controller.session().unwrap().characters.is_empty());
        rig.controller
            .handle(DeviceEvent::TagRemoved {
                reader: "reader9".into(),
            })
            .unwrap();
    }

    #[test]
    fn invalid_selector_readings_keep_the_previous_mode() {
        let rig = preparing_rig();
        rig.controller
            .handle(DeviceEvent::DurationChanged(DurationMode::Long))
            .unwrap();
        assert!(rig.prompts.played().contains(&Prompt::Duration(DurationMode::Long)));

        rig.selector.set(None);
        rig.controller.handle(DeviceEvent::Connectivity(false)).unwrap();
        rig.controller.handle(DeviceEvent::Connectivity(true)).unwrap();
        assert_eq!(rig.controller.session().unwrap().duration, DurationMode::Long);
    }

    #[test]
    fn empty_request_stays_in_preparation() {
        let rig = preparing_rig();
        rig.controller.handle(DeviceEvent::Click).unwrap();
        assert_eq!(rig.controller.state().unwrap(), DeviceState::PreparingStory);
        assert_eq!(rig.prompts.count(&Prompt::NoCharacters), 1);
        assert!(rig.provider.requests().is_empty());
    }

    #[test]
    fn generated_story_plays_with_its_timeline() {
        let dir = tempfile::tempdir().unwrap();
        let rig = preparing_rig();
        let assets = story_files(dir.path());
        rig.provider.set_story(Some(assets.clone()));

        place(&rig, "reader4", 1);
        place(&rig, "reader1", 2);
        rig.controller.handle(DeviceEvent::Click).unwrap();
        assert!(wait_for_state(&rig.controller, DeviceState::PlayingStory));

        assert_eq!(
            rig.provider.requests(),
            vec![StoryRequest {
                duration: DurationMode::Short,
                characters: vec![1, 2],
            }]
        );
        assert!(rig.playback.calls().contains(&PlaybackCall::Play(assets.audio.clone())));
        assert!(rig.prompts.played().contains(&Prompt::StoryStart));
        assert!(rig.lighting.has_timeline().unwrap());
        assert_eq!(rig.lighting.render_frame().unwrap().unwrap()[3], Rgb::new(1, 2, 3));
        let session = rig.controller.session().unwrap();
        assert_eq!(session.timeline_path, assets.timeline);
    }

    #[test]
    fn failed_generation_uses_the_default_story() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = dir.path().join("default.mp3");
        fs::write(&fallback, b"mp3").unwrap();
        let mut config = quick_config();
        config.session.default_story = Some(fallback.clone());
        let rig = rig_with(config);
        rig.controller.handle(DeviceEvent::Connectivity(true)).unwrap();

        place(&rig, "reader2", 3);
        rig.controller.handle(DeviceEvent::Click).unwrap();
        assert!(wait_for_state(&rig.controller, DeviceState::PlayingStory));
        assert!(rig.playback.calls().contains(&PlaybackCall::Play(fallback)));
        assert!(!rig.lighting.has_timeline().unwrap());
        assert!(rig.controller.session().unwrap().timeline_path.is_none());
    }

    #[test]
    fn failed_generation_without_default_returns_to_preparation() {
        let rig = preparing_rig();
        place(&rig, "reader2", 3);
        rig.controller.handle(DeviceEvent::Click).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while rig.prompts.count(&Prompt::Error) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(rig.prompts.count(&Prompt::Error), 1);
        assert_eq!(rig.controller.state().unwrap(), DeviceState::PreparingStory);
        assert_eq!(rig.controller.session().unwrap().characters, vec![3]);
    }

    #[test]
    fn waiting_prompt_repeats_while_pending() {
        let rig = preparing_rig();
        rig.provider.set_delay(Duration::from_millis(150));
        place(&rig, "reader2", 3);
        rig.controller.handle(DeviceEvent::Click).unwrap();
        assert_eq!(rig.controller.state().unwrap(), DeviceState::RequestingStory);

        thread::sleep(Duration::from_millis(250));
        assert!(rig.prompts.count(&Prompt::StoryWaiting) >= 2);
    }

    #[test]
    fn stale_results_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let rig = preparing_rig();
        rig.provider.set_story(Some(story_files(dir.path())));
        rig.provider.set_delay(Duration::from_millis(100));
        place(&rig, "reader2", 3);
        rig.controller.handle(DeviceEvent::Click).unwrap();
        rig.controller.handle(DeviceEvent::Connectivity(false)).unwrap();

        thread::sleep(Duration::from_millis(250));
        assert_eq!(rig.controller.state().unwrap(), DeviceState::WaitingNetwork);
        assert!(!rig
            .playback
            .calls()
            .iter()
            .any(|call| matches!(call, PlaybackCall::Play(_))));
    }

    fn playing_rig(dir: &std::path::Path) -> Rig {
        let rig = preparing_rig();
        rig.provider.set_story(Some(story_files(dir)));
        place(&rig, "reader4", 1);
        rig.controller.handle(DeviceEvent::Click).unwrap();
        assert!(wait_for_state(&rig.controller, DeviceState::PlayingStory));
        rig
    }

    #[test]
    fn pause_confirm_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let rig = playing_rig(dir.path());

        rig.controller.handle(DeviceEvent::Click).unwrap();
        assert_eq!(rig.controller.state().unwrap(), DeviceState::ConfirmStop);
        assert_eq!(rig.prompts.count(&Prompt::ConfirmStop), 1);
        assert!(rig.playback.calls().contains(&PlaybackCall::Pause));
        assert!(rig.controller.stop_pending().unwrap());

        rig.controller.handle(DeviceEvent::Click).unwrap();
        assert_eq!(rig.controller.state().unwrap(), DeviceState::PlayingStory);
        assert!(!rig.controller.stop_pending().unwrap());
        assert!(rig.playback.calls().contains(&PlaybackCall::Resume));
    }

    #[test]
    fn long_press_outside_confirmation_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let rig = playing_rig(dir.path());
        rig.controller.handle(DeviceEvent::LongPress).unwrap();
        assert_eq!(rig.controller.state().unwrap(), DeviceState::PlayingStory);
    }

    #[test]
    fn stop_and_finish_both_reset_into_preparation() {
        let dir = tempfile::tempdir().unwrap();
        let rig = playing_rig(dir.path());
        rig.selector.set(Some(DurationMode::Medium));

        rig.controller.handle(DeviceEvent::Click).unwrap();
        rig.controller.handle(DeviceEvent::LongPress).unwrap();
        assert!(rig.playback.calls().contains(&PlaybackCall::Stop));
        let session = rig.controller.session().unwrap();
        assert_eq!(rig.controller.state().unwrap(), DeviceState::PreparingStory);
        assert_eq!(session.duration, DurationMode::Medium);
        assert!(session.audio_path.is_none());
        assert!(session.timeline_path.is_none());
        assert!(!rig.lighting.has_timeline().unwrap());

        let rig = playing_rig(dir.path());
        rig.selector.set(Some(DurationMode::Long));
        rig.controller.handle(DeviceEvent::StoryFinished).unwrap();
        let session = rig.controller.session().unwrap();
        assert_eq!(rig.controller.state().unwrap(), DeviceState::PreparingStory);
        assert_eq!(session.duration, DurationMode::Long);
        assert!(session.audio_path.is_none());
    }

    #[test]
    fn story_finished_outside_a_story_is_ignored() {
        let rig = preparing_rig();
        let generation = rig.controller.generation();
        rig.controller.handle(DeviceEvent::StoryFinished).unwrap();
        assert_eq!(rig.controller.generation(), generation);
    }

    #[test]
    fn prompts_are_silent_during_playback() {
        let dir = tempfile::tempdir().unwrap();
        let rig = playing_rig(dir.path());
        rig.controller
            .handle(DeviceEvent::DurationChanged(DurationMode::Long))
            .unwrap();
        assert_eq!(rig.prompts.count(&Prompt::Duration(DurationMode::Long)), 0);
        assert_eq!(rig.controller.session().unwrap().duration, DurationMode::Long);
    }

    #[test]
    fn connectivity_loss_is_ignored_during_stories() {
        let dir = tempfile::tempdir().unwrap();
        let rig = playing_rig(dir.path());
        rig.controller.handle(DeviceEvent::Connectivity(false)).unwrap();
        assert_eq!(rig.controller.state().unwrap(), DeviceState::PlayingStory);
    }

    #[test]
    fn rotation_clamps_volume() {
        let rig = rig();
        rig.controller.handle(DeviceEvent::Rotate(-100)).unwrap();
        assert_eq!(rig.controller.volume().unwrap(), 0.0);
        rig.controller.handle(DeviceEvent::Rotate(2)).unwrap();
        assert!((rig.controller.volume().unwrap() - 0.03).abs() < 1e-6);
        rig.controller.handle(DeviceEvent::Rotate(500)).unwrap();
        assert_eq!(rig.controller.volume().unwrap(), 1.0);
        assert_eq!(rig.playback.calls().last(), Some(&PlaybackCall::Volume(1.0)));
    }

    #[test]
    fn clicks_in_other_states_do_nothing() {
        let rig = rig();
        let generation = rig.controller.generation();
        rig.controller.handle(DeviceEvent::Click).unwrap();
        assert_eq!(rig.controller.state().unwrap(), DeviceState::Booting);
        assert_eq!(rig.controller.generation(), generation);
    }
}
