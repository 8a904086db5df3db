//! Story provider contract and its HTTP implementation.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    assets::{CharacterInfo, StoryAssets},
    config::ProviderConfig,
    mapping,
    session::{DurationMode, TagId},
    Result, StoryboxError,
};

const AUDIO_EXTENSIONS: [&str; 4] = ["mp3", "wav", "ogg", "flac"];

/// What the controller asks for when the child presses play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryRequest {
    pub duration: DurationMode,
    /// Active tags in group order.
    pub characters: Vec<TagId>,
}

/// Network collaborator producing characters and stories. Calls block; the
/// controller never makes them while holding its state lock.
pub trait StoryProvider: Send + Sync {
    fn character(&self, tag: TagId) -> Result<CharacterInfo>;
    fn generate(&self, request: &StoryRequest) -> Result<StoryAssets>;
}

/// Talks to the story service over HTTP. Stories arrive as a zip archive
/// holding one audio file and an optional LED timeline.
pub struct HttpStoryProvider {
    agent: ureq::Agent,
    base_url: String,
    output_dir: PathBuf,
    device_id: String,
}

impl HttpStoryProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            output_dir: config.output_dir.clone(),
            device_id: config.device_id.clone(),
        }
    }

    fn download(&self, request: &StoryRequest, target: &Path) -> Result<()> {
        let url = format!("{}/stories/generate", self.base_url);
        let body = json!({
            "duration": request.duration.minutes(),
            "figure_rfid_uids": request.characters,
            "device_id": self.device_id,
        });
        info!(%url, characters = request.characters.len(), duration = %request.duration, "requesting story");

        let response = self
            .agent
            .post(&url)
            .send_json(body)
            .map_err(|err| StoryboxError::provider(err.to_string()))?;

        let mut file = File::create(target)?;
        let copied = io::copy(&mut response.into_reader(), &mut file);
        let flushed = copied.and_then(|bytes| file.flush().map(|_| bytes));
        match flushed {
            Ok(bytes) => {
                debug!(path = %target.display(), bytes, "story archive downloaded");
                Ok(())
            }
            Err(err) => {
                drop(file);
                fs::remove_file(target).ok();
                Err(err.into())
            }
        }
    }
}

impl StoryProvider for HttpStoryProvider {
    fn character(&self, tag: TagId) -> Result<CharacterInfo> {
        let url = format!("{}/characters/character_id/{tag}", self.base_url);
        let payload: Value = self
            .agent
            .get(&url)
            .call()
            .map_err(|err| StoryboxError::provider(err.to_string()))?
            .into_json()?;
        character_from_json(tag, &payload)
    }

    fn generate(&self, request: &StoryRequest) -> Result<StoryAssets> {
        fs::create_dir_all(&self.output_dir)?;
        let id = unique_story_id(&self.output_dir);
        let archive = self.output_dir.join(format!("story_{id}.zip"));

        self.download(request, &archive)?;
        let extracted = extract_story(&archive, &self.output_dir, &id);
        if let Err(err) = fs::remove_file(&archive) {
            warn!(path = %archive.display(), error = %err, "could not remove story archive");
        }
        extracted
    }
}

/// Reads a character payload: `name` (or `character_id`) plus an optional
/// `color` / `group_color`.
pub fn character_from_json(tag: TagId, payload: &Value) -> Result<CharacterInfo> {
    let Value::Object(map) = payload else {
        return Err(StoryboxError::provider(format!(
            "unexpected character payload for tag {tag}"
        )));
    };
    let name = match map.get("name").or_else(|| map.get("character_id")) {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        Some(Value::Number(number)) => number.to_string(),
        _ => {
            return Err(StoryboxError::provider(format!(
                "character payload for tag {tag} has no name"
            )))
        }
    };
    let color = map
        .get("color")
        .or_else(|| map.get("group_color"))
        .and_then(mapping::parse_color);
    Ok(CharacterInfo { name, color })
}

/// Unpacks the first audio member and the first JSON member of `archive`
/// into `output_dir` as `story_<id>.<ext>` and `leds_timing_<id>.json`.
/// Nothing is left behind on failure.
pub fn extract_story(archive: &Path, output_dir: &Path, id: &str) -> Result<StoryAssets> {
    let mut written: Vec<PathBuf> = Vec::new();
    let outcome = extract_members(archive, output_dir, id, &mut written);
    if outcome.is_err() {
        for path in &written {
            fs::remove_file(path).ok();
        }
    }
    outcome
}

fn extract_members(
    archive: &Path,
    output_dir: &Path,
    id: &str,
    written: &mut Vec<PathBuf>,
) -> Result<StoryAssets> {
    let zip_err = |err: zip::result::ZipError| StoryboxError::archive(err.to_string());
    let mut zip = zip::ZipArchive::new(File::open(archive)?).map_err(zip_err)?;

    let mut audio: Option<(usize, String)> = None;
    let mut timeline: Option<usize> = None;
    for idx in 0..zip.len() {
        let member = zip.by_index(idx).map_err(zip_err)?;
        if member.is_dir() {
            continue;
        }
        let Some(ext) = extension(member.name()) else {
            continue;
        };
        if audio.is_none() && AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            audio = Some((idx, ext));
        } else if timeline.is_none() && ext == "json" {
            timeline = Some(idx);
        }
    }

    let Some((audio_idx, audio_ext)) = audio else {
        return Err(StoryboxError::archive("no audio member in story archive"));
    };

    let audio_path = output_dir.join(format!("story_{id}.{audio_ext}"));
    copy_member(&mut zip, audio_idx, &audio_path, written)?;

    let timeline_path = match timeline {
        Some(idx) => {
            let path = output_dir.join(format!("leds_timing_{id}.json"));
            copy_member(&mut zip, idx, &path, written)?;
            Some(path)
        }
        None => {
            info!("story archive carries no LED timeline");
            None
        }
    };

    Ok(StoryAssets {
        audio: audio_path,
        timeline: timeline_path,
    })
}

fn copy_member(
    zip: &mut zip::ZipArchive<File>,
    idx: usize,
    target: &Path,
    written: &mut Vec<PathBuf>,
) -> Result<()> {
    let mut member = zip
        .by_index(idx)
        .map_err(|err| StoryboxError::archive(err.to_string()))?;
    written.push(target.to_path_buf());
    let mut out = File::create(target)?;
    io::copy(&mut member, &mut out)?;
    out.flush()?;
    Ok(())
}

fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

fn unique_story_id(dir: &Path) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let taken = |id: &str| {
        dir.join(format!("story_{id}.zip")).exists()
            || dir.join(format!("leds_timing_{id}.json")).exists()
            || AUDIO_EXTENSIONS
                .iter()
                .any(|ext| dir.join(format!("story_{id}.{ext}")).exists())
    };

    let mut id = millis.to_string();
    let mut suffix = 1;
    while taken(&id) {
        id = format!("{millis}_{suffix}");
        suffix += 1;
    }
    id
}
