use std::{collections::HashSet, fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{pattern::Rgb, Result, StoryboxError};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub readers: Vec<ReaderConfig>,
    pub lighting: LightingConfig,
    pub session: SessionConfig,
    pub provider: ProviderConfig,
    pub network: NetworkConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            readers: vec![
                ReaderConfig::new("reader1", 2),
                ReaderConfig::new("reader2", 3),
                ReaderConfig::new("reader3", 1),
                ReaderConfig::new("reader4", 0),
            ],
            lighting: LightingConfig::default(),
            session: SessionConfig::default(),
            provider: ProviderConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let lighting = &self.lighting;
        if lighting.pixel_count == 0 {
            return Err(StoryboxError::Config("pixel_count must be positive".into()));
        }
        if lighting.frame_interval_ms == 0 {
            return Err(StoryboxError::Config("frame_interval_ms must be positive".into()));
        }
        if lighting.group_lengths.is_empty() || lighting.group_lengths.iter().all(|len| *len == 0) {
            return Err(StoryboxError::Config("group_lengths must not be empty".into()));
        }
        if lighting.pixel_count < lighting.group_lengths.len() {
            return Err(StoryboxError::Config(format!(
                "pixel_count {} cannot give each of the {} groups a pixel",
                lighting.pixel_count,
                lighting.group_lengths.len()
            )));
        }

        let mut seen = HashSet::new();
        for reader in &self.readers {
            if !seen.insert(reader.id.as_str()) {
                return Err(StoryboxError::Config(format!("duplicate reader id `{}`", reader.id)));
            }
            if reader.group >= lighting.group_lengths.len() {
                return Err(StoryboxError::Config(format!(
                    "reader `{}` uses group {} but only {} groups are configured",
                    reader.id,
                    reader.group,
                    lighting.group_lengths.len()
                )));
            }
        }

        let session = &self.session;
        if session.waiting_prompt_min_ms > session.waiting_prompt_max_ms {
            return Err(StoryboxError::Config(
                "waiting_prompt_min_ms exceeds waiting_prompt_max_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&session.initial_volume) {
            return Err(StoryboxError::Config("initial_volume must be within [0, 1]".into()));
        }
        Ok(())
    }
}

/// Binds a physical reader to the LED group in front of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub id: String,
    pub group: usize,
}

impl ReaderConfig {
    pub fn new(id: impl Into<String>, group: usize) -> Self {
        Self {
            id: id.into(),
            group,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingConfig {
    pub pixel_count: usize,
    pub frame_interval_ms: u64,
    /// Relative size of each reader group along the strip.
    pub group_lengths: Vec<u32>,
    /// Highlight used for a group when the character has no colour.
    pub group_colors: Vec<Rgb>,
    pub preparing_palette: Vec<Rgb>,
}

impl Default for LightingConfig {
    fn default() -> Self {
        Self {
            pixel_count: 30,
            frame_interval_ms: 25,
            group_lengths: vec![6, 8, 8, 8],
            group_colors: vec![
                Rgb::new(255, 120, 30),
                Rgb::new(120, 220, 120),
                Rgb::new(80, 160, 255),
                Rgb::new(200, 120, 255),
            ],
            preparing_palette: vec![Rgb::new(163, 131, 13), Rgb::new(222, 97, 31)],
        }
    }
}

impl LightingConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// Default highlight for `group`, cycling through the palette.
    pub fn group_color(&self, group: usize) -> Rgb {
        if self.group_colors.is_empty() {
            return Rgb::new(255, 255, 255);
        }
        self.group_colors[group % self.group_colors.len()]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Volume change per encoder detent.
    pub volume_step: f32,
    pub initial_volume: f32,
    pub connected_hold_ms: u64,
    pub story_grace_ms: u64,
    pub waiting_prompt_min_ms: u64,
    pub waiting_prompt_max_ms: u64,
    /// Bundled story played when generation fails.
    pub default_story: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            volume_step: 0.015,
            initial_volume: 0.5,
            connected_hold_ms: 4_000,
            story_grace_ms: 5_000,
            waiting_prompt_min_ms: 12_000,
            waiting_prompt_max_ms: 15_000,
            default_story: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub output_dir: PathBuf,
    pub device_id: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            timeout_secs: 300,
            output_dir: PathBuf::from("stories"),
            device_id: "storybox-01".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub probe_host: String,
    pub probe_port: u16,
    pub probe_timeout_ms: u64,
    pub interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_host: "8.8.8.8".to_string(),
            probe_port: 53,
            probe_timeout_ms: 3_000,
            interval_ms: 10_000,
        }
    }
}
