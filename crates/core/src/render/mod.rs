//! Lighting engine: pattern slots and the fixed-rate render thread.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, trace, warn};

use crate::{
    audio::PositionSource,
    config::LightingConfig,
    pattern::{PatternInstance, PatternSpec, Rgb},
    session::DeviceState,
    timeline::{StoryTimeline, TimelinePlayer},
    Result, StoryboxError,
};

const LOADING_COLOR: Rgb = Rgb::new(0, 255, 255);
const NETWORK_ALERT_COLOR: Rgb = Rgb::new(255, 60, 0);

/// Physical pixel output.
pub trait LedStrip: Send {
    fn pixel_count(&self) -> usize;
    fn write(&mut self, pixels: &[Rgb]) -> Result<()>;

    fn off(&mut self) -> Result<()> {
        let black = vec![Rgb::BLACK; self.pixel_count()];
        self.write(&black)
    }
}

/// What a device state asks of the background slot.
#[derive(Debug, Clone, PartialEq)]
pub enum StateLighting {
    Pattern(PatternSpec),
    Off,
    /// Leave whatever is running untouched.
    Keep,
}

struct Slot {
    instance: PatternInstance,
    started: Instant,
}

impl Slot {
    fn new(instance: PatternInstance) -> Self {
        Self {
            instance,
            started: Instant::now(),
        }
    }

    fn elapsed(&self) -> f32 {
        self.started.elapsed().as_secs_f32()
    }
}

struct Slots {
    state: DeviceState,
    background: Option<Slot>,
    event: Option<Slot>,
    timeline: Option<TimelinePlayer>,
}

struct Shared {
    slots: Mutex<Slots>,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Slots>> {
        self.slots
            .lock()
            .map_err(|_| StoryboxError::Poisoned("lighting slots"))
    }

    /// Picks the pattern for this frame and renders it. `None` means nothing
    /// is active. The event slot wins over the timeline, which wins over
    /// the background.
    fn render_frame(&self) -> Result<Option<Vec<Rgb>>> {
        let mut slots = self.lock()?;

        let event_done = match &slots.event {
            Some(event) => event.instance.is_finished(event.elapsed()),
            None => false,
        };
        if event_done {
            trace!("event pattern finished");
            slots.event = None;
        }
        if let Some(event) = slots.event.as_mut() {
            let elapsed = event.elapsed();
            return Ok(Some(event.instance.render(elapsed)));
        }

        if slots.state == DeviceState::PlayingStory {
            if let Some(player) = slots.timeline.as_mut() {
                return Ok(Some(player.render()));
            }
        }

        Ok(slots.background.as_mut().map(|background| {
            let elapsed = background.elapsed();
            background.instance.render(elapsed)
        }))
    }
}

/// Turns frames into strip writes, emitting "all off" once per transition
/// to idle rather than on every idle frame.
#[derive(Debug, Default)]
pub struct FrameGate {
    lit: bool,
}

impl FrameGate {
    pub fn present(&mut self, strip: &mut dyn LedStrip, frame: Option<Vec<Rgb>>) -> Result<()> {
        match frame {
            Some(pixels) => {
                self.lit = true;
                strip.write(&pixels)
            }
            None if self.lit => {
                self.lit = false;
                strip.off()
            }
            None => Ok(()),
        }
    }

    /// Forces one blank frame after a failed render.
    pub fn blank(&mut self, strip: &mut dyn LedStrip) -> Result<()> {
        self.lit = false;
        strip.off()
    }
}

struct RenderThread {
    stop: Arc<AtomicBool>,
    done: flume::Receiver<()>,
    handle: thread::JoinHandle<()>,
}

/// Owns the LED output. Device-state changes pick a background pattern,
/// feedback goes to the transient event slot, and story playback can
/// attach a timeline that follows the playback position.
pub struct LightingEngine {
    shared: Arc<Shared>,
    settings: LightingConfig,
    strip: Mutex<Option<Arc<Mutex<Box<dyn LedStrip>>>>>,
    worker: Mutex<Option<RenderThread>>,
}

impl LightingEngine {
    pub fn new(settings: LightingConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(Slots {
                    state: DeviceState::Booting,
                    background: None,
                    event: None,
                    timeline: None,
                }),
            }),
            settings,
            strip: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.settings.pixel_count
    }

    pub fn settings(&self) -> &LightingConfig {
        &self.settings
    }

    /// Default background for each device state.
    pub fn state_lighting(&self, state: DeviceState) -> StateLighting {
        match state {
            DeviceState::Booting | DeviceState::RequestingStory => {
                StateLighting::Pattern(PatternSpec::Cycle {
                    color: LOADING_COLOR,
                    background: Rgb::BLACK,
                    speed: 5.0,
                    tail: 10.0,
                })
            }
            DeviceState::WaitingNetwork => {
                StateLighting::Pattern(PatternSpec::breathe_slow(NETWORK_ALERT_COLOR))
            }
            DeviceState::IdleReady => StateLighting::Off,
            DeviceState::PreparingStory => StateLighting::Pattern(PatternSpec::GroupPulse {
                group_lengths: self.settings.group_lengths.clone(),
                palette: self.settings.preparing_palette.clone(),
                color_duration: 2.5,
                frequency: 0.6,
            }),
            DeviceState::PlayingStory => StateLighting::Pattern(PatternSpec::Pulse {
                palette: vec![Rgb::new(255, 120, 30), Rgb::new(80, 160, 255)],
                color_duration: 2.5,
                frequency: 0.6,
            }),
            DeviceState::Paused | DeviceState::ConfirmStop => StateLighting::Keep,
        }
    }

    /// Switches the lighting to match `state`. Leaving the story states
    /// detaches any timeline.
    pub fn apply_state(&self, state: DeviceState) -> Result<()> {
        let lighting = self.state_lighting(state);
        let mut slots = self.shared.lock()?;
        slots.state = state;
        if !state.has_story() && slots.timeline.take().is_some() {
            debug!(%state, "timeline detached");
        }
        match lighting {
            StateLighting::Pattern(spec) => self.install_background(&mut slots, spec),
            StateLighting::Off => {
                slots.background = None;
                Ok(())
            }
            StateLighting::Keep => Ok(()),
        }
    }

    /// Replaces the background unless the same spec is already running.
    pub fn set_background(&self, spec: PatternSpec) -> Result<()> {
        let mut slots = self.shared.lock()?;
        self.install_background(&mut slots, spec)
    }

    pub fn clear_background(&self) -> Result<()> {
        self.shared.lock()?.background = None;
        Ok(())
    }

    fn install_background(&self, slots: &mut Slots, spec: PatternSpec) -> Result<()> {
        if let Some(current) = &slots.background {
            if current.instance.spec() == &spec {
                return Ok(());
            }
        }
        match PatternInstance::new(spec, self.settings.pixel_count) {
            Ok(instance) => {
                debug!(pattern = instance.spec().name(), "background pattern");
                slots.background = Some(Slot::new(instance));
                Ok(())
            }
            Err(err) => {
                slots.background = None;
                Err(err)
            }
        }
    }

    /// Starts a transient pattern that overrides the background until it
    /// finishes or is cleared. Re-triggering restarts it.
    pub fn trigger_event(&self, spec: PatternSpec) -> Result<()> {
        let instance = PatternInstance::new(spec, self.settings.pixel_count)?;
        debug!(pattern = instance.spec().name(), "event pattern");
        self.shared.lock()?.event = Some(Slot::new(instance));
        Ok(())
    }

    pub fn clear_event(&self) -> Result<()> {
        self.shared.lock()?.event = None;
        Ok(())
    }

    /// Overrides one reader group on the background. Returns `false` when
    /// the background has no such group.
    pub fn set_group_color(&self, group: usize, color: Rgb) -> Result<bool> {
        let mut slots = self.shared.lock()?;
        Ok(slots
            .background
            .as_mut()
            .is_some_and(|slot| slot.instance.set_group_color(group, color)))
    }

    pub fn clear_group_color(&self, group: usize) -> Result<bool> {
        let mut slots = self.shared.lock()?;
        Ok(slots
            .background
            .as_mut()
            .is_some_and(|slot| slot.instance.clear_group_color(group)))
    }

    pub fn clear_group_colors(&self) -> Result<()> {
        if let Some(slot) = self.shared.lock()?.background.as_mut() {
            slot.instance.clear_group_colors();
        }
        Ok(())
    }

    /// Drives the lighting from `timeline` while the device is playing.
    /// Replaces any previously attached timeline immediately.
    pub fn attach_timeline(&self, timeline: Arc<StoryTimeline>, position: PositionSource) -> Result<()> {
        let player = TimelinePlayer::new(timeline, position, self.settings.pixel_count);
        self.shared.lock()?.timeline = Some(player);
        info!("story timeline attached");
        Ok(())
    }

    pub fn clear_timeline(&self) -> Result<()> {
        self.shared.lock()?.timeline = None;
        Ok(())
    }

    pub fn has_timeline(&self) -> Result<bool> {
        Ok(self.shared.lock()?.timeline.is_some())
    }

    pub fn state(&self) -> Result<DeviceState> {
        Ok(self.shared.lock()?.state)
    }

    /// Renders one frame without touching the strip.
    pub fn render_frame(&self) -> Result<Option<Vec<Rgb>>> {
        self.shared.render_frame()
    }

    /// Spawns the render thread writing to `strip`.
    pub fn start(&self, strip: Box<dyn LedStrip>) -> Result<()> {
        let mut worker = self.lock_worker()?;
        if worker.is_some() {
            return Err(StoryboxError::msg("render thread already running"));
        }
        if strip.pixel_count() != self.settings.pixel_count {
            warn!(
                strip = strip.pixel_count(),
                configured = self.settings.pixel_count,
                "strip length differs from configuration"
            );
        }

        let strip = Arc::new(Mutex::new(strip));
        *self.lock_strip()? = Some(Arc::clone(&strip));

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = flume::bounded(1);
        let shared = Arc::clone(&self.shared);
        let interval = self.settings.frame_interval();
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("led-render".into())
            .spawn(move || {
                render_loop(&shared, &strip, interval, &thread_stop);
                let _ = done_tx.send(());
            })?;

        *worker = Some(RenderThread {
            stop,
            done: done_rx,
            handle,
        });
        info!(interval_ms = interval.as_millis() as u64, "render thread started");
        Ok(())
    }

    /// Stops the render thread, waiting at most `timeout`, then forces the
    /// strip off.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        if let Some(worker) = self.lock_worker()?.take() {
            worker.stop.store(true, Ordering::Relaxed);
            match worker.done.recv_timeout(timeout) {
                Ok(()) => {
                    if worker.handle.join().is_err() {
                        error!("render thread panicked");
                    }
                }
                Err(_) => warn!("render thread did not stop in time, detaching"),
            }
        }

        if let Some(strip) = self.lock_strip()?.take() {
            match strip.try_lock() {
                Ok(mut strip) => strip.off()?,
                Err(_) => warn!("strip busy during shutdown, could not force off"),
            }
        }
        info!("lighting stopped");
        Ok(())
    }

    fn lock_worker(&self) -> Result<MutexGuard<'_, Option<RenderThread>>> {
        self.worker
            .lock()
            .map_err(|_| StoryboxError::Poisoned("render worker"))
    }

    fn lock_strip(&self) -> Result<MutexGuard<'_, Option<Arc<Mutex<Box<dyn LedStrip>>>>>> {
        self.strip
            .lock()
            .map_err(|_| StoryboxError::Poisoned("led strip"))
    }
}

fn render_loop(
    shared: &Shared,
    strip: &Mutex<Box<dyn LedStrip>>,
    interval: Duration,
    stop: &AtomicBool,
) {
    let mut gate = FrameGate::default();
    let mut next_frame = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        let frame = panic::catch_unwind(AssertUnwindSafe(|| shared.render_frame()));
        let frame = match frame {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err("pattern render panicked".to_string()),
        };

        // Output happens after the slot lock is released.
        match strip.lock() {
            Ok(mut strip) => {
                let written = match frame {
                    Ok(frame) => gate.present(&mut **strip, frame),
                    Err(reason) => {
                        error!(%reason, "frame render failed, blanking");
                        shared.slots.clear_poison();
                        gate.blank(&mut **strip)
                    }
                };
                if let Err(err) = written {
                    warn!(error = %err, "LED write failed");
                }
            }
            Err(_) => {
                error!("led strip lock poisoned, stopping render thread");
                return;
            }
        }

        next_frame += interval;
        let now = Instant::now();
        if next_frame > now {
            thread::sleep(next_frame - now);
        } else {
            // Behind schedule; drop the backlog instead of bursting frames.
            next_frame = now;
        }
    }

    if let Ok(mut strip) = strip.lock() {
        if let Err(err) = strip.off() {
            warn!(error = %err, "could not turn strip off");
        }
    }
    debug!("render thread exiting");
}
