mod sim;

use std::{
    io::{self, BufRead},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use storybox_core::{
    config::AppConfig,
    events::{self, ConnectivityProbe, EventSender, SourceThread},
    Controller, ControllerParts, DurationMode, DurationSelector, HttpStoryProvider, LightingEngine,
    StoryTimeline,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::sim::{ClockPlayback, Command, ConsoleStrip, LoggingPrompts, ManualLink, ManualSelector};

const SELECTOR_POLL: Duration = Duration::from_millis(100);
const LIGHTING_STOP_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> storybox_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            default_story,
            pixels,
            provider_url,
            story_length,
            probe,
        } => {
            let mut config = match config {
                Some(path) => AppConfig::load(&path)?,
                None => AppConfig::default(),
            };
            if let Some(pixels) = pixels {
                config.lighting.pixel_count = pixels;
            }
            if let Some(url) = provider_url {
                config.provider.base_url = url;
            }
            if default_story.is_some() {
                config.session.default_story = default_story;
            }
            run(config, Duration::from_secs(story_length), probe)
        }
        Commands::Timeline { file, at, groups } => inspect_timeline(&file, at, &groups),
    }
}

fn run(config: AppConfig, story_length: Duration, real_probe: bool) -> storybox_core::Result<()> {
    config.validate()?;
    info!(provider = %config.provider.base_url, pixels = config.lighting.pixel_count, "starting storybox");

    let (events, receiver) = events::channel();
    let lighting = Arc::new(LightingEngine::new(config.lighting.clone()));
    lighting.start(Box::new(ConsoleStrip::new(config.lighting.pixel_count)))?;

    let selector = Arc::new(ManualSelector::default());
    selector.set(DurationMode::default());
    let controller = Controller::new(ControllerParts {
        config: config.clone(),
        lighting: Arc::clone(&lighting),
        playback: Arc::new(ClockPlayback::new(story_length, events.clone())),
        prompts: Arc::new(LoggingPrompts),
        provider: Arc::new(HttpStoryProvider::new(&config.provider)),
        selector: selector.clone(),
    })?;

    let link = ManualLink::new(true);
    let probe = if real_probe {
        ConnectivityProbe::tcp(&config.network)
    } else {
        let link = link.clone();
        ConnectivityProbe::with_check(move || link.is_online())
    };
    let probe_interval = if real_probe {
        Duration::from_millis(config.network.interval_ms)
    } else {
        SELECTOR_POLL
    };
    let state_of = Arc::clone(&controller);
    let mut sources = vec![
        SourceThread::dispatcher(receiver, controller.clone())?,
        probe.spawn(probe_interval, events.clone(), move || {
            state_of
                .state()
                .unwrap_or(storybox_core::DeviceState::Booting)
        })?,
        events::watch_duration(selector.clone() as Arc<dyn DurationSelector>, SELECTOR_POLL, events.clone())?,
    ];

    println!("{}", sim::HELP);
    read_commands(&events, &selector, &link)?;

    for source in sources.iter_mut() {
        info!(source = source.name(), "stopping");
        source.stop();
    }
    controller.shutdown()?;
    lighting.shutdown(LIGHTING_STOP_TIMEOUT)?;
    Ok(())
}

fn read_commands(events: &EventSender, selector: &ManualSelector, link: &ManualLink) -> storybox_core::Result<()> {
    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(Command::Event(event)) => {
                events.send(event);
            }
            Ok(Command::Duration(mode)) => selector.set(mode),
            Ok(Command::Link(online)) => link.set(online),
            Ok(Command::Help) => println!("{}", sim::HELP),
            Ok(Command::Quit) => break,
            Err(err) => warn!("{err}"),
        }
    }
    Ok(())
}

fn inspect_timeline(path: &Path, at: Option<f32>, groups: &[u32]) -> storybox_core::Result<()> {
    let groups = if groups.is_empty() {
        AppConfig::default().lighting.group_lengths
    } else {
        groups.to_vec()
    };
    let Some(timeline) = StoryTimeline::load(path, &groups)? else {
        println!("{}: no usable segments", path.display());
        return Ok(());
    };

    for (idx, segment) in timeline.segments().iter().enumerate() {
        let end = segment
            .end
            .map_or_else(|| "open".to_string(), |end| format!("{end:.2}"));
        println!(
            "{idx:>3}  {:>8.2} .. {end:>8}  {:<16} -> {}",
            segment.start,
            segment.authored,
            segment.pattern.name()
        );
    }
    if let Some(fallback) = timeline.fallback() {
        println!("fallback -> {}", fallback.name());
    }
    if let Some(position) = at {
        match timeline.select(position) {
            Some(idx) => println!("at {position:.2}s: segment {idx}"),
            None => println!("at {position:.2}s: no segment"),
        }
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Storybox appliance controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against console-simulated hardware.
    Run {
        /// JSON configuration file. Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Story played when generation fails.
        #[arg(long)]
        default_story: Option<PathBuf>,
        /// Override the LED count.
        #[arg(long)]
        pixels: Option<usize>,
        /// Base URL of the story service.
        #[arg(long)]
        provider_url: Option<String>,
        /// Simulated story length in seconds.
        #[arg(long, default_value_t = 60)]
        story_length: u64,
        /// Probe real internet reachability instead of the `net` command.
        #[arg(long)]
        probe: bool,
    },
    /// Print how a story timeline file is read.
    Timeline {
        file: PathBuf,
        /// Show which segment is active at this position (seconds).
        #[arg(long)]
        at: Option<f32>,
        /// Group lengths used by group-aware patterns, e.g. `--groups 6,8,8,8`.
        #[arg(long, value_delimiter = ',')]
        groups: Vec<u32>,
    },
}
