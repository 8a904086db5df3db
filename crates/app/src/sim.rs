//! Console stand-ins for the appliance hardware.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

use storybox_core::{
    DeviceEvent, DurationMode, DurationSelector, EventSender, LedStrip, Playback, Prompt,
    PromptPlayer, Result, Rgb, StoryboxError, TagId,
};
use tracing::{debug, info};

const FINISH_POLL: Duration = Duration::from_millis(100);

/// Strip that logs the average colour whenever it changes.
pub struct ConsoleStrip {
    pixels: usize,
    last: Option<Rgb>,
}

impl ConsoleStrip {
    pub fn new(pixels: usize) -> Self {
        Self { pixels, last: None }
    }
}

impl LedStrip for ConsoleStrip {
    fn pixel_count(&self) -> usize {
        self.pixels
    }

    fn write(&mut self, pixels: &[Rgb]) -> Result<()> {
        let average = average(pixels);
        if self.last != Some(average) {
            debug!(color = %average, "strip");
            self.last = Some(average);
        }
        Ok(())
    }
}

fn average(pixels: &[Rgb]) -> Rgb {
    if pixels.is_empty() {
        return Rgb::BLACK;
    }
    let (r, g, b) = pixels.iter().fold((0u32, 0u32, 0u32), |(r, g, b), px| {
        (r + px.r as u32, g + px.g as u32, b + px.b as u32)
    });
    let n = pixels.len() as u32;
    Rgb::new((r / n) as u8, (g / n) as u8, (b / n) as u8)
}

struct Track {
    path: PathBuf,
    started: Instant,
    /// Seconds played before the last resume.
    offset: f32,
    paused: bool,
}

impl Track {
    fn position(&self) -> f32 {
        if self.paused {
            self.offset
        } else {
            self.offset + self.started.elapsed().as_secs_f32()
        }
    }
}

/// Playback that pretends every story lasts `length` and reports the end
/// through the event channel.
pub struct ClockPlayback {
    length: f32,
    events: EventSender,
    track: Arc<Mutex<Option<Track>>>,
    token: Arc<AtomicU64>,
}

impl ClockPlayback {
    pub fn new(length: Duration, events: EventSender) -> Self {
        Self {
            length: length.as_secs_f32(),
            events,
            track: Arc::default(),
            token: Arc::default(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Track>>> {
        lock_track(&self.track)
    }
}

fn lock_track(track: &Mutex<Option<Track>>) -> Result<MutexGuard<'_, Option<Track>>> {
    track.lock().map_err(|_| StoryboxError::Poisoned("playback clock"))
}

impl Playback for ClockPlayback {
    fn play(&self, path: &Path) -> Result<()> {
        let token = self.token.fetch_add(1, Ordering::SeqCst) + 1;
        *self.lock()? = Some(Track {
            path: path.to_path_buf(),
            started: Instant::now(),
            offset: 0.0,
            paused: false,
        });
        info!(path = %path.display(), seconds = self.length, "playing story");

        let track = Arc::clone(&self.track);
        let current = Arc::clone(&self.token);
        let events = self.events.clone();
        let length = self.length;
        thread::Builder::new()
            .name("story-clock".into())
            .spawn(move || loop {
                thread::sleep(FINISH_POLL);
                if current.load(Ordering::SeqCst) != token {
                    break;
                }
                let Ok(mut guard) = lock_track(&track) else {
                    break;
                };
                let finished = guard.as_ref().is_some_and(|t| t.position() >= length);
                if finished {
                    if let Some(done) = guard.take() {
                        debug!(path = %done.path.display(), "story clock finished");
                    }
                    events.send(DeviceEvent::StoryFinished);
                    break;
                }
            })?;
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        if let Some(track) = self.lock()?.as_mut() {
            track.offset = track.position();
            track.paused = true;
        }
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        if let Some(track) = self.lock()?.as_mut() {
            track.started = Instant::now();
            track.paused = false;
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.token.fetch_add(1, Ordering::SeqCst);
        self.lock()?.take();
        Ok(())
    }

    fn position(&self) -> Result<f32> {
        Ok(self.lock()?.as_ref().map_or(0.0, Track::position))
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        info!(volume = format!("{volume:.3}"), "volume");
        Ok(())
    }
}

pub struct LoggingPrompts;

impl PromptPlayer for LoggingPrompts {
    fn play(&self, prompt: &Prompt) -> Result<()> {
        info!(prompt = %prompt.key(), "prompt");
        Ok(())
    }
}

/// Duration selector set from the console.
#[derive(Default)]
pub struct ManualSelector {
    value: Mutex<Option<DurationMode>>,
}

impl ManualSelector {
    pub fn set(&self, mode: DurationMode) {
        if let Ok(mut value) = self.value.lock() {
            *value = Some(mode);
        }
    }
}

impl DurationSelector for ManualSelector {
    fn read(&self) -> Option<DurationMode> {
        self.value.lock().ok().and_then(|value| *value)
    }
}

/// Simulated link state polled by the connectivity probe.
#[derive(Clone)]
pub struct ManualLink(Arc<AtomicBool>);

impl ManualLink {
    pub fn new(online: bool) -> Self {
        Self(Arc::new(AtomicBool::new(online)))
    }

    pub fn set(&self, online: bool) {
        self.0.store(online, Ordering::Relaxed);
    }

    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One line typed into the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Event(DeviceEvent),
    Duration(DurationMode),
    Link(bool),
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  tag <reader> <id>     place a figurine
  remove <reader>       lift a figurine
  click | long          encoder button
  rotate <detents>      turn the encoder
  duration <mode>       short, medium or long
  net up|down           toggle the simulated link
  finish                end the current story now
  quit";

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            ["tag", reader, id] => {
                let tag = id
                    .parse::<TagId>()
                    .map_err(|_| format!("`{id}` is not a tag id"))?;
                Command::Event(DeviceEvent::TagDetected {
                    reader: reader.to_string(),
                    tag,
                })
            }
            ["remove", reader] => Command::Event(DeviceEvent::TagRemoved {
                reader: reader.to_string(),
            }),
            ["click"] => Command::Event(DeviceEvent::Click),
            ["long"] => Command::Event(DeviceEvent::LongPress),
            ["rotate", delta] => Command::Event(DeviceEvent::Rotate(
                delta
                    .parse()
                    .map_err(|_| format!("`{delta}` is not a number of detents"))?,
            )),
            ["duration", mode] => Command::Duration(mode.parse().map_err(|_| format!("unknown mode `{mode}`"))?),
            ["net", "up"] => Command::Link(true),
            ["net", "down"] => Command::Link(false),
            ["finish"] => Command::Event(DeviceEvent::StoryFinished),
            ["help"] | ["?"] => Command::Help,
            ["quit"] | ["exit"] => Command::Quit,
            _ => return Err(format!("unrecognised command `{}`", line.trim())),
        };
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_console_commands() {
        assert_eq!(
            "tag reader2 42".parse::<Command>().unwrap(),
            Command::Event(DeviceEvent::TagDetected {
                reader: "reader2".into(),
                tag: 42
            })
        );
        assert_eq!("rotate -3".parse::<Command>().unwrap(), Command::Event(DeviceEvent::Rotate(-3)));
        assert_eq!("  net down ".parse::<Command>().unwrap(), Command::Link(false));
        assert_eq!(
            "duration long".parse::<Command>().unwrap(),
            Command::Duration(DurationMode::Long)
        );
        assert!("tag reader1 fox".parse::<Command>().is_err());
        assert!("jump".parse::<Command>().is_err());
    }

    #[test]
    fn clock_tracks_pauses_and_reports_the_end() {
        let (tx, rx) = storybox_core::events::channel();
        let playback = ClockPlayback::new(Duration::from_millis(200), tx);
        playback.play(Path::new("story.mp3")).unwrap();
        playback.pause().unwrap();
        let paused_at = playback.position().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(playback.position().unwrap(), paused_at);

        playback.resume().unwrap();
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, DeviceEvent::StoryFinished);
        assert_eq!(playback.position().unwrap(), 0.0);
    }

    #[test]
    fn stopped_story_never_reports_an_end() {
        let (tx, rx) = storybox_core::events::channel();
        let playback = ClockPlayback::new(Duration::from_millis(50), tx);
        playback.play(Path::new("story.mp3")).unwrap();
        playback.stop().unwrap();
        thread::sleep(Duration::from_millis(250));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn strip_average() {
        let pixels = [Rgb::new(10, 0, 0), Rgb::new(30, 20, 0)];
        assert_eq!(average(&pixels), Rgb::new(20, 10, 0));
        assert_eq!(average(&[]), Rgb::BLACK);
    }
}
