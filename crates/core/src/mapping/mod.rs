//! Translation of authored timeline pattern names into library patterns.
//!
//! Story scripts name patterns loosely ("vent", "pulse_doux", "bluecycle")
//! and carry free-form parameters. Everything funnels through one
//! name-keyed table so the same document always produces the same
//! [`PatternSpec`] list.

use serde_json::{Map, Value};
use tracing::warn;

use crate::pattern::{PatternSpec, Rgb, BREATHE_FAST_PERIOD, BREATHE_SLOW_PERIOD};

const DEFAULT_PULSE_COLOR: Rgb = Rgb::new(80, 160, 255);
const CYCLE_HIGHLIGHT: Rgb = Rgb::new(60, 140, 255);
const PULSE_DOUX_COLOR: Rgb = Rgb::new(255, 120, 30);
const CORNER_BLAST_COLOR: Rgb = Rgb::new(255, 80, 0);
const WHITE: Rgb = Rgb::new(255, 255, 255);

/// Inputs shared by every translator.
#[derive(Debug, Clone, Copy)]
pub struct SegmentParams<'a> {
    pub color: Option<Rgb>,
    /// Segment length when the author gave an explicit end.
    pub duration: Option<f32>,
    pub extra: &'a Map<String, Value>,
    /// Reader group layout, used by group-aware patterns.
    pub group_lengths: &'a [u32],
}

type Translator = fn(&SegmentParams<'_>) -> PatternSpec;

/// Current names and legacy aliases. Aliases must point at the same
/// translator as the name they replace.
const TRANSLATORS: &[(&str, Translator)] = &[
    ("cycle", translate_cycle),
    ("vent", translate_cycle),
    ("bluecycle", translate_cycle),
    ("blue_cycle", translate_cycle),
    ("loading_blue_cycle", translate_cycle),
    ("flash", translate_flash),
    ("flashing", translate_flash),
    ("strobe", translate_strobe),
    ("story_pulse", translate_default),
    ("pulse_doux", translate_pulse_doux),
    ("fill", translate_fill),
    ("breathe", translate_breathe_slow),
    ("breathe_slow", translate_breathe_slow),
    ("breathe_fast", translate_breathe_fast),
    ("fire", translate_fire),
    ("cornerblast", translate_corner_blast),
    ("corner_blast", translate_corner_blast),
    ("rain", translate_rain),
    ("sparkle", translate_sparkle),
];

/// Resolves an authored pattern name. Unknown names, and parameters the
/// chosen pattern cannot render, fall back to a gentle two-colour pulse.
pub fn translate(name: &str, params: &SegmentParams<'_>) -> PatternSpec {
    let key = name.trim().to_ascii_lowercase();
    let Some((_, translator)) = TRANSLATORS.iter().find(|(alias, _)| *alias == key) else {
        warn!(pattern = %name, "unknown timeline pattern, using default story pulse");
        return translate_default(params);
    };

    let spec = translator(params);
    match spec.validate() {
        Ok(()) => spec,
        Err(err) => {
            warn!(pattern = %name, error = %err, "timeline pattern rejected, using default story pulse");
            translate_default(params)
        }
    }
}

pub fn is_known(name: &str) -> bool {
    let key = name.trim().to_ascii_lowercase();
    TRANSLATORS.iter().any(|(alias, _)| *alias == key)
}

/// Parses an authored colour: `{ "r", "g", "b" }`, a `#rrggbb` string or a
/// three-element list. Anything malformed or out of range is logged and
/// reported as absent.
pub fn parse_color(value: &Value) -> Option<Rgb> {
    let parsed = match value {
        Value::Null => return None,
        Value::Object(map) => channels([map.get("r"), map.get("g"), map.get("b")]),
        Value::Array(items) if items.len() == 3 => {
            channels([items.first(), items.get(1), items.get(2)])
        }
        Value::String(text) => parse_hex(text),
        _ => None,
    };
    if parsed.is_none() {
        warn!(color = %value, "ignoring malformed colour");
    }
    parsed
}

fn channels(values: [Option<&Value>; 3]) -> Option<Rgb> {
    let mut out = [0u8; 3];
    for (slot, value) in out.iter_mut().zip(values) {
        let number = value?.as_f64()?;
        if !(0.0..=255.0).contains(&number) {
            return None;
        }
        *slot = number.round() as u8;
    }
    Some(Rgb::new(out[0], out[1], out[2]))
}

fn parse_hex(text: &str) -> Option<Rgb> {
    let digits = text.trim().trim_start_matches('#');
    if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&digits[range], 16).ok();
    Some(Rgb::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
}

/// Reads a numeric parameter, accepting numbers or numeric strings.
fn number(extra: &Map<String, Value>, key: &str) -> Option<f32> {
    let value = extra.get(key)?;
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    let parsed = parsed as f32;
    parsed.is_finite().then_some(parsed)
}

fn number_or(extra: &Map<String, Value>, key: &str, default: f32) -> f32 {
    number(extra, key).unwrap_or(default)
}

fn translate_default(params: &SegmentParams<'_>) -> PatternSpec {
    let base = params.color.unwrap_or(DEFAULT_PULSE_COLOR);
    PatternSpec::Pulse {
        palette: vec![base, base.lighten(0.35)],
        color_duration: positive_or(number(params.extra, "color_duration"), 2.8),
        frequency: number_or(params.extra, "pulse_frequency", 0.55),
    }
}

fn translate_cycle(params: &SegmentParams<'_>) -> PatternSpec {
    let color = params.color.unwrap_or(CYCLE_HIGHLIGHT);
    let background = params
        .extra
        .get("background")
        .and_then(parse_color)
        .unwrap_or_else(|| color.scale(0.15));
    PatternSpec::Cycle {
        color,
        background,
        speed: number(params.extra, "speed_leds_per_sec")
            .or_else(|| number(params.extra, "speed"))
            .unwrap_or(9.0),
        tail: number_or(params.extra, "tail_length", 6.0),
    }
}

fn translate_flash(params: &SegmentParams<'_>) -> PatternSpec {
    let duration = params
        .duration
        .filter(|d| *d > 0.0)
        .or_else(|| number(params.extra, "duration"))
        .unwrap_or(0.5);
    PatternSpec::InstantFlash {
        color: params.color.unwrap_or(WHITE),
        duration,
    }
}

fn translate_strobe(params: &SegmentParams<'_>) -> PatternSpec {
    PatternSpec::Strobe {
        color: params.color.unwrap_or(WHITE),
    }
}

fn translate_pulse_doux(params: &SegmentParams<'_>) -> PatternSpec {
    let base = params.color.unwrap_or(PULSE_DOUX_COLOR);
    let default_duration = params.duration.unwrap_or(2.5).max(1.5);
    PatternSpec::Pulse {
        palette: vec![base, base.lighten(0.25), base.lighten(0.5)],
        color_duration: positive_or(number(params.extra, "color_duration"), default_duration),
        frequency: number_or(params.extra, "pulse_frequency", 0.45),
    }
}

fn translate_fill(params: &SegmentParams<'_>) -> PatternSpec {
    PatternSpec::Fill {
        color: params.color.unwrap_or(WHITE),
    }
}

fn translate_breathe_slow(params: &SegmentParams<'_>) -> PatternSpec {
    PatternSpec::Breathe {
        color: params.color.unwrap_or(WHITE),
        period: number_or(params.extra, "period", BREATHE_SLOW_PERIOD),
    }
}

fn translate_breathe_fast(params: &SegmentParams<'_>) -> PatternSpec {
    PatternSpec::Breathe {
        color: params.color.unwrap_or(WHITE),
        period: number_or(params.extra, "period", BREATHE_FAST_PERIOD),
    }
}

fn translate_fire(_: &SegmentParams<'_>) -> PatternSpec {
    PatternSpec::Fire
}

fn translate_corner_blast(params: &SegmentParams<'_>) -> PatternSpec {
    PatternSpec::CornerBlast {
        color: params.color.unwrap_or(CORNER_BLAST_COLOR),
        group_lengths: params.group_lengths.to_vec(),
    }
}

fn translate_rain(_: &SegmentParams<'_>) -> PatternSpec {
    PatternSpec::Rain
}

fn translate_sparkle(params: &SegmentParams<'_>) -> PatternSpec {
    PatternSpec::Sparkle {
        color: params.color.unwrap_or(WHITE),
    }
}

fn positive_or(value: Option<f32>, default: f32) -> f32 {
    value.filter(|v| *v > 0.0).unwrap_or(default)
}
