use std::{fs, path::Path, sync::Arc};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{
    audio::PositionSource,
    mapping::{self, SegmentParams},
    pattern::{PatternInstance, PatternSpec, Rgb},
    Result, StoryboxError,
};

const RESERVED_KEYS: [&str; 6] = ["pattern", "start_time", "start", "end_time", "end", "color"];

/// One authored slice of a story light show.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineSegment {
    pub start: f32,
    pub end: Option<f32>,
    /// `end - start` when an explicit end was authored.
    pub duration: Option<f32>,
    /// Name as written in the document, kept for diagnostics.
    pub authored: String,
    pub pattern: PatternSpec,
}

impl TimelineSegment {
    /// Elapsed time handed to the pattern for a playback position inside
    /// this segment. Capped by the authored duration so a segment freezes on
    /// its last frame instead of running on.
    pub fn elapsed_at(&self, position: f32) -> f32 {
        let elapsed = (position - self.start).max(0.0);
        match self.duration {
            Some(duration) => elapsed.min(duration),
            None => elapsed,
        }
    }
}

/// Immutable, start-ordered list of segments with an optional fallback.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoryTimeline {
    segments: Vec<TimelineSegment>,
    fallback: Option<PatternSpec>,
}

impl StoryTimeline {
    pub fn new(mut segments: Vec<TimelineSegment>, fallback: Option<PatternSpec>) -> Self {
        // Stable, so equal starts keep document order.
        segments.sort_by(|a, b| a.start.total_cmp(&b.start));
        Self { segments, fallback }
    }

    /// Loads a timeline document from disk. `Ok(None)` means the document
    /// parsed but held no usable segment.
    pub fn load(path: impl AsRef<Path>, group_lengths: &[u32]) -> Result<Option<Self>> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let timeline = Self::from_json_str(&text, group_lengths)?;
        match &timeline {
            Some(timeline) => info!(
                path = %path.display(),
                segments = timeline.segments.len(),
                "loaded story timeline"
            ),
            None => warn!(path = %path.display(), "timeline has no valid segments"),
        }
        Ok(timeline)
    }

    /// Accepts either a top-level array of segments or an object carrying
    /// them under `audio_led_sync`, with an optional `fallback` entry.
    pub fn from_json_str(text: &str, group_lengths: &[u32]) -> Result<Option<Self>> {
        let document: Value = serde_json::from_str(text)?;
        let (entries, fallback) = match &document {
            Value::Array(entries) => (entries, None),
            Value::Object(map) => match map.get("audio_led_sync") {
                Some(Value::Array(entries)) => (entries, map.get("fallback")),
                _ => {
                    return Err(StoryboxError::Timeline(
                        "expected a segment array or an `audio_led_sync` array".into(),
                    ))
                }
            },
            _ => {
                return Err(StoryboxError::Timeline(
                    "document must be an array or an object".into(),
                ))
            }
        };

        let segments: Vec<TimelineSegment> = entries
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| parse_segment(idx, entry, group_lengths))
            .collect();
        if segments.is_empty() {
            return Ok(None);
        }

        let fallback = fallback.and_then(|value| parse_fallback(value, group_lengths));
        Ok(Some(Self::new(segments, fallback)))
    }

    pub fn segments(&self) -> &[TimelineSegment] {
        &self.segments
    }

    pub fn fallback(&self) -> Option<&PatternSpec> {
        self.fallback.as_ref()
    }

    /// Index of the segment covering `position` seconds. Negative or
    /// non-finite positions count as zero, anything before the first start
    /// selects the first segment, and the final segment never ends.
    pub fn select(&self, position: f32) -> Option<usize> {
        let position = if position.is_finite() { position.max(0.0) } else { 0.0 };
        let first = self.segments.first()?;
        if position < first.start {
            return Some(0);
        }

        let last = self.segments.len() - 1;
        self.segments.iter().enumerate().position(|(idx, segment)| {
            if position < segment.start {
                return false;
            }
            if idx == last {
                return true;
            }
            let end = segment.end.unwrap_or(self.segments[idx + 1].start);
            position < end
        })
    }
}

fn parse_segment(idx: usize, entry: &Value, group_lengths: &[u32]) -> Option<TimelineSegment> {
    let Value::Object(map) = entry else {
        debug!(index = idx, "skipping non-object timeline entry");
        return None;
    };
    let Some(name) = map.get("pattern").and_then(Value::as_str) else {
        warn!(index = idx, "timeline entry without a pattern name");
        return None;
    };
    let Some(start) = seconds(map, "start_time", "start") else {
        warn!(index = idx, pattern = %name, "timeline entry without a usable start time");
        return None;
    };
    let start = start.max(0.0);

    let end = match seconds(map, "end_time", "end") {
        Some(end) if end >= start => Some(end),
        Some(end) => {
            warn!(index = idx, start, end, "timeline end precedes start, ignoring end");
            None
        }
        None => None,
    };
    let duration = end.map(|end| end - start);

    let color = map.get("color").and_then(mapping::parse_color);
    let extra: Map<String, Value> = map
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let pattern = mapping::translate(
        name,
        &SegmentParams {
            color,
            duration,
            extra: &extra,
            group_lengths,
        },
    );

    Some(TimelineSegment {
        start,
        end,
        duration,
        authored: name.to_string(),
        pattern,
    })
}

fn parse_fallback(value: &Value, group_lengths: &[u32]) -> Option<PatternSpec> {
    let map = value.as_object()?;
    let name = map.get("pattern")?.as_str()?;
    let color = map.get("color").and_then(mapping::parse_color);
    Some(mapping::translate(
        name,
        &SegmentParams {
            color,
            duration: None,
            extra: map,
            group_lengths,
        },
    ))
}

fn seconds(map: &Map<String, Value>, key: &str, alias: &str) -> Option<f32> {
    let value = map.get(key).or_else(|| map.get(alias))?;
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }? as f32;
    number.is_finite().then_some(number)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Active {
    Segment(usize),
    Fallback { since: f32 },
}

/// Renders a timeline against a live playback position.
pub struct TimelinePlayer {
    timeline: Arc<StoryTimeline>,
    position: PositionSource,
    pixel_count: usize,
    active: Option<(Active, PatternInstance)>,
}

impl TimelinePlayer {
    pub fn new(timeline: Arc<StoryTimeline>, position: PositionSource, pixel_count: usize) -> Self {
        Self {
            timeline,
            position,
            pixel_count,
            active: None,
        }
    }

    pub fn timeline(&self) -> &Arc<StoryTimeline> {
        &self.timeline
    }

    /// Samples the playback position and renders the matching pattern.
    /// A failing position supplier counts as position zero.
    pub fn render(&mut self) -> Vec<Rgb> {
        let position = match (self.position)() {
            Ok(position) if position.is_finite() => position.max(0.0),
            Ok(_) => 0.0,
            Err(err) => {
                debug!(error = %err, "playback position unavailable");
                0.0
            }
        };
        self.render_at(position)
    }

    pub fn render_at(&mut self, position: f32) -> Vec<Rgb> {
        let black = vec![Rgb::BLACK; self.pixel_count];

        let (wanted, spec, elapsed) = match self.timeline.select(position) {
            Some(idx) => {
                let segment = &self.timeline.segments()[idx];
                (Active::Segment(idx), segment.pattern.clone(), segment.elapsed_at(position))
            }
            None => match self.timeline.fallback() {
                Some(fallback) => {
                    let since = match self.active {
                        Some((Active::Fallback { since }, _)) => since,
                        _ => position,
                    };
                    (Active::Fallback { since }, fallback.clone(), (position - since).max(0.0))
                }
                None => {
                    self.active = None;
                    return black;
                }
            },
        };

        let unchanged = matches!(&self.active, Some((active, _)) if *active == wanted);
        if !unchanged {
            match PatternInstance::new(spec, self.pixel_count) {
                Ok(instance) => {
                    debug!(selection = ?wanted, pattern = instance.spec().name(), "timeline segment change");
                    self.active = Some((wanted, instance));
                }
                Err(err) => {
                    warn!(error = %err, "could not build timeline pattern");
                    self.active = None;
                    return black;
                }
            }
        }

        match &mut self.active {
            Some((_, instance)) => instance.render(elapsed),
            None => black,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    const GROUPS: [u32; 4] = [6, 8, 8, 8];

    fn two_segments() -> StoryTimeline {
        let doc = r#"[
            {"pattern": "fill", "start_time": 5, "end_time": 10, "color": [0, 0, 255]},
            {"pattern": "fill", "start_time": 0, "end_time": 5, "color": [255, 0, 0]}
        ]"#;
        StoryTimeline::from_json_str(doc, &GROUPS).unwrap().unwrap()
    }

    #[test]
    fn selection_follows_segment_bounds() {
        let timeline = two_segments();
        assert_eq!(timeline.segments()[0].start, 0.0);
        assert_eq!(timeline.select(4.999), Some(0));
        assert_eq!(timeline.select(5.0), Some(1));
        assert_eq!(timeline.select(20.0), Some(1));
        assert_eq!(timeline.select(-1.0), Some(0));
        assert_eq!(timeline.select(f32::NAN), Some(0));
    }

    #[test]
    fn gaps_select_nothing() {
        let doc = r#"[
            {"pattern": "fill", "start": 0, "end": 2},
            {"pattern": "rain", "start": 4}
        ]"#;
        let timeline = StoryTimeline::from_json_str(doc, &GROUPS).unwrap().unwrap();
        assert_eq!(timeline.select(1.0), Some(0));
        assert_eq!(timeline.select(3.0), None);
        assert_eq!(timeline.select(4.0), Some(1));
    }

    #[test]
    fn position_before_first_start_uses_first_segment() {
        let doc = r#"[{"pattern": "fire", "start_time": 3.5}]"#;
        let timeline = StoryTimeline::from_json_str(doc, &GROUPS).unwrap().unwrap();
        assert_eq!(timeline.select(1.0), Some(0));
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let doc = r##"{"audio_led_sync": [
            {"pattern": "fill"},
            {"start_time": 1},
            "garbage",
            {"pattern": "vent", "start_time": "2.5", "color": "#zz0000"}
        ]}"##;
        let timeline = StoryTimeline::from_json_str(doc, &GROUPS).unwrap().unwrap();
        assert_eq!(timeline.segments().len(), 1);
        let segment = &timeline.segments()[0];
        assert_eq!(segment.start, 2.5);
        assert_eq!(segment.authored, "vent");
        assert_eq!(segment.pattern.name(), "cycle");
    }

    #[test]
    fn zero_valid_segments_means_no_timeline() {
        assert!(StoryTimeline::from_json_str("[]", &GROUPS).unwrap().is_none());
        assert!(StoryTimeline::from_json_str(r#"[{"pattern": 3}]"#, &GROUPS)
            .unwrap()
            .is_none());
        assert!(StoryTimeline::from_json_str(r#"{"nope": 1}"#, &GROUPS).is_err());
        assert!(StoryTimeline::from_json_str("not json", &GROUPS).is_err());
    }

    #[test]
    fn loading_twice_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leds_timing.json");
        fs::write(
            &path,
            r#"[
                {"pattern": "pulse_doux", "start_time": 8, "color": {"r": 10, "g": 20, "b": 30}},
                {"pattern": "mystery", "start_time": 0, "end_time": 8, "speed": 2},
                {"pattern": "flashing", "start_time": 8}
            ]"#,
        )
        .unwrap();
        let first = StoryTimeline::load(&path, &GROUPS).unwrap().unwrap();
        let second = StoryTimeline::load(&path, &GROUPS).unwrap().unwrap();
        assert_eq!(first, second);
        let authored: Vec<&str> = first.segments().iter().map(|s| s.authored.as_str()).collect();
        assert_eq!(authored, vec!["mystery", "pulse_doux", "flashing"]);
    }

    #[test]
    fn elapsed_is_capped_by_duration() {
        let timeline = two_segments();
        let last = &timeline.segments()[1];
        assert_eq!(last.elapsed_at(7.0), 2.0);
        assert_eq!(last.elapsed_at(30.0), 5.0);
    }

    #[test]
    fn player_switches_patterns_with_position() {
        let timeline = Arc::new(two_segments());
        let position = Arc::new(Mutex::new(1.0f32));
        let source = {
            let position = Arc::clone(&position);
            let source: PositionSource = Arc::new(move || Ok(*position.lock().unwrap()));
            source
        };
        let mut player = TimelinePlayer::new(timeline, source, 4);

        assert_eq!(player.render(), vec![Rgb::new(255, 0, 0); 4]);
        *position.lock().unwrap() = 6.0;
        assert_eq!(player.render(), vec![Rgb::new(0, 0, 255); 4]);
        *position.lock().unwrap() = 2.0;
        assert_eq!(player.render(), vec![Rgb::new(255, 0, 0); 4]);
    }

    #[test]
    fn failing_position_counts_as_zero() {
        let source: PositionSource = Arc::new(|| Err(StoryboxError::msg("mixer gone")));
        let mut player = TimelinePlayer::new(Arc::new(two_segments()), source, 2);
        assert_eq!(player.render(), vec![Rgb::new(255, 0, 0); 2]);
    }

    #[test]
    fn gap_without_fallback_renders_black() {
        let doc = r#"{"audio_led_sync": [
            {"pattern": "fill", "start": 0, "end": 1, "color": [9, 9, 9]},
            {"pattern": "fill", "start": 5, "color": [9, 9, 9]}
        ]}"#;
        let timeline = Arc::new(StoryTimeline::from_json_str(doc, &GROUPS).unwrap().unwrap());
        let source: PositionSource = Arc::new(|| Ok(0.0));
        let mut player = TimelinePlayer::new(timeline, source, 3);
        assert_eq!(player.render_at(2.0), vec![Rgb::BLACK; 3]);
    }

    #[test]
    fn gap_uses_fallback_when_present() {
        let doc = r#"{
            "fallback": {"pattern": "fill", "color": [1, 2, 3]},
            "audio_led_sync": [
                {"pattern": "fill", "start": 0, "end": 1, "color": [9, 9, 9]},
                {"pattern": "fill", "start": 5, "color": [9, 9, 9]}
            ]
        }"#;
        let timeline = Arc::new(StoryTimeline::from_json_str(doc, &GROUPS).unwrap().unwrap());
        assert!(timeline.fallback().is_some());
        let source: PositionSource = Arc::new(|| Ok(0.0));
        let mut player = TimelinePlayer::new(timeline, source, 3);
        assert_eq!(player.render_at(2.0), vec![Rgb::new(1, 2, 3); 3]);
        assert_eq!(player.render_at(6.0), vec![Rgb::new(9, 9, 9); 3]);
    }
}
