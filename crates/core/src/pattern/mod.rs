//! LED pattern library.
//!
//! A [`PatternSpec`] names a pattern variant together with its parameters.
//! [`PatternInstance`] is the runtime half: it owns whatever state a variant
//! needs (group overrides, live raindrops, strobe schedule) and renders one
//! colour per physical pixel as a function of the elapsed time since the
//! instance was built.

use std::{f32::consts::PI, fmt, ops::Range};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{Result, StoryboxError};

pub const BREATHE_SLOW_PERIOD: f32 = 2.0;
pub const BREATHE_FAST_PERIOD: f32 = 0.4;

const STROBE_PEAK: f32 = 0.05;
const RAIN_SPAWN_CHANCE: f64 = 0.08;
const SPARKLE_SPAWN_CHANCE: f64 = 0.15;

const FIRE_PALETTE: [Rgb; 5] = [
    Rgb::new(40, 0, 0),
    Rgb::new(100, 10, 0),
    Rgb::new(160, 30, 0),
    Rgb::new(220, 50, 0),
    Rgb::new(255, 80, 0),
];

const RAIN_PALETTE: [Rgb; 4] = [
    Rgb::new(40, 80, 255),
    Rgb::new(20, 40, 180),
    Rgb::new(60, 100, 220),
    Rgb::new(10, 20, 120),
];

/// 8-bit RGB triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Builds a colour from floating point channels, rounding and clamping
    /// each to `[0, 255]`.
    pub fn from_f32(r: f32, g: f32, b: f32) -> Self {
        Self::new(clamp_channel(r), clamp_channel(g), clamp_channel(b))
    }

    pub fn scale(self, factor: f32) -> Self {
        Self::from_f32(
            f32::from(self.r) * factor,
            f32::from(self.g) * factor,
            f32::from(self.b) * factor,
        )
    }

    pub fn lerp(self, other: Rgb, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        let mix = |a: u8, b: u8| f32::from(a) + (f32::from(b) - f32::from(a)) * t;
        Self::from_f32(
            mix(self.r, other.r),
            mix(self.g, other.g),
            mix(self.b, other.b),
        )
    }

    /// Moves every channel `factor` of the way towards white.
    pub fn lighten(self, factor: f32) -> Self {
        self.lerp(Rgb::new(255, 255, 255), factor)
    }

    pub fn saturating_add(self, other: Rgb) -> Self {
        Self::new(
            self.r.saturating_add(other.r),
            self.g.saturating_add(other.g),
            self.b.saturating_add(other.b),
        )
    }

    fn jitter(self, rng: &mut StdRng, variation: f32) -> Self {
        let mut channel = |value: u8| f32::from(value) * (1.0 + rng.gen_range(-variation..=variation));
        Self::from_f32(channel(self.r), channel(self.g), channel(self.b))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

pub fn clamp_channel(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 255.0) as u8
}

/// Pattern variant plus its parameters. Two equal specs render the same
/// animation, so callers compare specs to decide whether to rebuild.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum PatternSpec {
    /// Bright head with a linear tail running around the strip.
    Cycle {
        color: Rgb,
        background: Rgb,
        /// Head speed in pixels per second.
        speed: f32,
        /// Tail length in pixels.
        tail: f32,
    },
    Fill {
        color: Rgb,
    },
    /// Full colour fading linearly to black; finishes after `duration`.
    InstantFlash {
        color: Rgb,
        duration: f32,
    },
    Breathe {
        color: Rgb,
        period: f32,
    },
    /// Palette blend with a travelling brightness wave.
    Pulse {
        palette: Vec<Rgb>,
        color_duration: f32,
        frequency: f32,
    },
    /// Dim palette blend split into per-reader groups that can be lit with
    /// an override colour.
    GroupPulse {
        group_lengths: Vec<u32>,
        palette: Vec<Rgb>,
        color_duration: f32,
        frequency: f32,
    },
    Fire,
    CornerBlast {
        color: Rgb,
        group_lengths: Vec<u32>,
    },
    Rain,
    Strobe {
        color: Rgb,
    },
    Sparkle {
        color: Rgb,
    },
}

impl PatternSpec {
    pub fn breathe_slow(color: Rgb) -> Self {
        PatternSpec::Breathe {
            color,
            period: BREATHE_SLOW_PERIOD,
        }
    }

    pub fn breathe_fast(color: Rgb) -> Self {
        PatternSpec::Breathe {
            color,
            period: BREATHE_FAST_PERIOD,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PatternSpec::Cycle { .. } => "cycle",
            PatternSpec::Fill { .. } => "fill",
            PatternSpec::InstantFlash { .. } => "instant_flash",
            PatternSpec::Breathe { .. } => "breathe",
            PatternSpec::Pulse { .. } => "pulse",
            PatternSpec::GroupPulse { .. } => "group_pulse",
            PatternSpec::Fire => "fire",
            PatternSpec::CornerBlast { .. } => "corner_blast",
            PatternSpec::Rain => "rain",
            PatternSpec::Strobe { .. } => "strobe",
            PatternSpec::Sparkle { .. } => "sparkle",
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |value: f32, field: &str| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(StoryboxError::InvalidPattern(format!(
                    "{} requires a positive `{field}`, got {value}",
                    self.name()
                )))
            }
        };
        let groups = |lengths: &[u32]| {
            if lengths.is_empty() || lengths.iter().all(|len| *len == 0) {
                Err(StoryboxError::InvalidPattern(format!(
                    "{} requires at least one non-empty group",
                    self.name()
                )))
            } else {
                Ok(())
            }
        };

        match self {
            PatternSpec::Cycle { speed, tail, .. } => {
                if !speed.is_finite() {
                    return Err(StoryboxError::InvalidPattern(format!(
                        "cycle speed must be finite, got {speed}"
                    )));
                }
                positive(*tail, "tail")
            }
            PatternSpec::InstantFlash { duration, .. } => positive(*duration, "duration"),
            PatternSpec::Breathe { period, .. } => positive(*period, "period"),
            PatternSpec::Pulse {
                palette,
                color_duration,
                ..
            } => {
                if palette.is_empty() {
                    return Err(StoryboxError::InvalidPattern("pulse palette is empty".into()));
                }
                positive(*color_duration, "color_duration")
            }
            PatternSpec::GroupPulse {
                group_lengths,
                color_duration,
                ..
            } => {
                groups(group_lengths)?;
                positive(*color_duration, "color_duration")
            }
            PatternSpec::CornerBlast { group_lengths, .. } => groups(group_lengths),
            PatternSpec::Fill { .. }
            | PatternSpec::Fire
            | PatternSpec::Rain
            | PatternSpec::Strobe { .. }
            | PatternSpec::Sparkle { .. } => Ok(()),
        }
    }
}

/// Splits `pixel_count` pixels into contiguous ranges proportional to
/// `lengths`. The ranges are gapless and non-overlapping; the last group
/// absorbs any rounding remainder. Groups that cannot get a pixel are
/// dropped.
pub fn partition(lengths: &[u32], pixel_count: usize) -> Vec<Range<usize>> {
    let total: u64 = lengths.iter().map(|len| u64::from(*len)).sum();
    if total == 0 || pixel_count == 0 {
        return Vec::new();
    }

    let scale = pixel_count as f64 / total as f64;
    let mut ranges = Vec::with_capacity(lengths.len());
    let mut cursor = 0usize;
    let mut groups_left = lengths.len();

    for length in lengths {
        groups_left -= 1;
        let remaining = pixel_count - cursor;
        let target = if groups_left == 0 {
            remaining
        } else {
            let wanted = ((f64::from(*length) * scale).round() as usize).max(1);
            wanted.min(remaining.saturating_sub(groups_left))
        };
        let stop = (cursor + target).min(pixel_count);
        if stop > cursor {
            ranges.push(cursor..stop);
        }
        cursor = stop;
    }

    ranges
}

#[derive(Debug, Clone)]
struct Spark {
    index: usize,
    born: f32,
    life: f32,
    color: Rgb,
}

#[derive(Debug)]
enum Dynamics {
    Stateless,
    Groups {
        ranges: Vec<Range<usize>>,
        overrides: Vec<Option<Rgb>>,
    },
    Corner {
        ranges: Vec<Range<usize>>,
        active: Option<usize>,
        until: f32,
        color: Rgb,
    },
    Sparks(Vec<Spark>),
    Strobe {
        next: f32,
        flash: Option<(f32, f32)>,
    },
}

/// Live pattern bound to a strip length.
pub struct PatternInstance {
    spec: PatternSpec,
    pixel_count: usize,
    dynamics: Dynamics,
    rng: StdRng,
    last_elapsed: f32,
}

impl PatternInstance {
    pub fn new(spec: PatternSpec, pixel_count: usize) -> Result<Self> {
        Self::with_rng(spec, pixel_count, StdRng::from_entropy())
    }

    /// Builds an instance with a deterministic random source.
    pub fn with_seed(spec: PatternSpec, pixel_count: usize, seed: u64) -> Result<Self> {
        Self::with_rng(spec, pixel_count, StdRng::seed_from_u64(seed))
    }

    fn with_rng(spec: PatternSpec, pixel_count: usize, rng: StdRng) -> Result<Self> {
        spec.validate()?;
        let mut instance = Self {
            dynamics: Dynamics::Stateless,
            spec,
            pixel_count,
            rng,
            last_elapsed: 0.0,
        };
        instance.dynamics = instance.fresh_dynamics();
        Ok(instance)
    }

    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }

    pub fn pixel_count(&self) -> usize {
        self.pixel_count
    }

    /// Only instant flashes ever finish; everything else loops forever.
    pub fn is_finished(&self, elapsed: f32) -> bool {
        match self.spec {
            PatternSpec::InstantFlash { duration, .. } => elapsed >= duration,
            _ => false,
        }
    }

    pub fn supports_groups(&self) -> bool {
        matches!(self.dynamics, Dynamics::Groups { .. })
    }

    /// Lights a whole group with `color`. Out-of-range indices and patterns
    /// without groups are ignored; returns whether the override was stored.
    pub fn set_group_color(&mut self, group: usize, color: Rgb) -> bool {
        match &mut self.dynamics {
            Dynamics::Groups { overrides, .. } => match overrides.get_mut(group) {
                Some(slot) => {
                    *slot = Some(color);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn clear_group_color(&mut self, group: usize) -> bool {
        match &mut self.dynamics {
            Dynamics::Groups { overrides, .. } => match overrides.get_mut(group) {
                Some(slot) => {
                    *slot = None;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn clear_group_colors(&mut self) {
        if let Dynamics::Groups { overrides, .. } = &mut self.dynamics {
            overrides.iter_mut().for_each(|slot| *slot = None);
        }
    }

    /// Renders one frame for the given elapsed time (seconds). Going back in
    /// time (a seek) restarts any stochastic state so stale sparks never
    /// linger.
    pub fn render(&mut self, elapsed: f32) -> Vec<Rgb> {
        let n = self.pixel_count;
        if n == 0 {
            return Vec::new();
        }
        let t = if elapsed.is_finite() { elapsed.max(0.0) } else { 0.0 };
        if t < self.last_elapsed {
            self.restart_stochastic();
        }
        self.last_elapsed = t;

        match &self.spec {
            PatternSpec::Cycle {
                color,
                background,
                speed,
                tail,
            } => {
                let head = (t * speed).rem_euclid(n as f32);
                (0..n)
                    .map(|idx| {
                        let distance = wrap_distance(head, idx, n);
                        let intensity = (1.0 - distance / tail).max(0.0);
                        background.lerp(*color, intensity)
                    })
                    .collect()
            }
            PatternSpec::Fill { color } => vec![*color; n],
            PatternSpec::InstantFlash { color, duration } => {
                let progress = (t / duration).min(1.0);
                vec![color.scale(1.0 - progress); n]
            }
            PatternSpec::Breathe { color, period } => {
                let phase = (t % period) / period;
                let intensity = 0.5 * (1.0 - (phase * 2.0 * PI).cos());
                vec![color.scale(intensity); n]
            }
            PatternSpec::Pulse {
                palette,
                color_duration,
                frequency,
            } => {
                let blended = palette_blend(palette, *color_duration, t);
                (0..n)
                    .map(|idx| {
                        let offset = idx as f32 / n as f32 * PI;
                        let wave = 0.5 * (1.0 + (t * frequency * 2.0 * PI + offset).sin());
                        blended.scale(0.35 + 0.65 * wave)
                    })
                    .collect()
            }
            PatternSpec::GroupPulse {
                palette,
                color_duration,
                frequency,
                ..
            } => {
                let wave = 0.5 * (1.0 + (t * frequency * 2.0 * PI).sin());
                let base = palette_blend(palette, *color_duration, t).scale(0.15 + 0.25 * wave);
                let mut pixels = vec![base; n];
                if let Dynamics::Groups { ranges, overrides } = &self.dynamics {
                    for (range, color) in ranges.iter().zip(overrides) {
                        if let Some(color) = color {
                            pixels[range.clone()].fill(*color);
                        }
                    }
                }
                pixels
            }
            PatternSpec::Fire => render_fire(&mut self.rng, t, n),
            PatternSpec::CornerBlast { color, .. } => {
                let base = *color;
                render_corner_blast(&mut self.dynamics, &mut self.rng, base, t, n)
            }
            PatternSpec::Rain => render_rain(&mut self.dynamics, &mut self.rng, t, n),
            PatternSpec::Strobe { color } => {
                let color = *color;
                render_strobe(&mut self.dynamics, &mut self.rng, color, t, n)
            }
            PatternSpec::Sparkle { color } => {
                let color = *color;
                render_sparkle(&mut self.dynamics, &mut self.rng, color, t, n)
            }
        }
    }

    fn fresh_dynamics(&mut self) -> Dynamics {
        match &self.spec {
            PatternSpec::GroupPulse { group_lengths, .. } => {
                let ranges = partition(group_lengths, self.pixel_count);
                let overrides = vec![None; ranges.len()];
                Dynamics::Groups { ranges, overrides }
            }
            PatternSpec::CornerBlast {
                group_lengths,
                color,
            } => Dynamics::Corner {
                ranges: partition(group_lengths, self.pixel_count),
                active: None,
                until: 0.0,
                color: *color,
            },
            PatternSpec::Rain | PatternSpec::Sparkle { .. } => Dynamics::Sparks(Vec::new()),
            PatternSpec::Strobe { .. } => Dynamics::Strobe {
                next: self.rng.gen_range(0.3..=1.5),
                flash: None,
            },
            _ => Dynamics::Stateless,
        }
    }

    fn restart_stochastic(&mut self) {
        match &mut self.dynamics {
            Dynamics::Sparks(sparks) => sparks.clear(),
            Dynamics::Corner { until, .. } => *until = 0.0,
            Dynamics::Strobe { next, flash } => {
                *next = 0.0;
                *flash = None;
            }
            Dynamics::Stateless | Dynamics::Groups { .. } => {}
        }
    }
}

impl fmt::Debug for PatternInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternInstance")
            .field("pattern", &self.spec.name())
            .field("pixel_count", &self.pixel_count)
            .field("dynamics", &self.dynamics)
            .finish()
    }
}

fn wrap_distance(position: f32, index: usize, modulo: usize) -> f32 {
    let raw = (position - index as f32).rem_euclid(modulo as f32);
    raw.min(modulo as f32 - raw)
}

fn palette_blend(palette: &[Rgb], color_duration: f32, t: f32) -> Rgb {
    if palette.is_empty() {
        return Rgb::BLACK;
    }
    let cycle = color_duration * palette.len() as f32;
    let position = t % cycle;
    let segment = (position / color_duration) as usize % palette.len();
    let blend = (position % color_duration) / color_duration;
    palette[segment].lerp(palette[(segment + 1) % palette.len()], blend)
}

fn render_fire(rng: &mut StdRng, t: f32, n: usize) -> Vec<Rgb> {
    const SPEED: f32 = 0.6;
    const SPATIAL: f32 = 0.35;

    (0..n)
        .map(|idx| {
            let i = idx as f32;
            let mut v = 0.6 * (i * SPATIAL + t * SPEED).sin()
                + 0.4 * (i * SPATIAL * 1.8 - t * SPEED * 0.9).sin()
                + 0.2 * (i * 0.7 + t * 1.1).sin();
            v += rng.gen_range(-0.05..=0.05);

            let ramp = (0.5 + 0.5 * v).rem_euclid(1.0) * FIRE_PALETTE.len() as f32;
            let lower = ramp as usize % FIRE_PALETTE.len();
            let upper = (lower + 1) % FIRE_PALETTE.len();
            let color = FIRE_PALETTE[lower].lerp(FIRE_PALETTE[upper], ramp.fract());

            let brightness = (0.5 + 0.5 * (t * 1.2 + i * 0.15 + v * 2.0).sin()).clamp(0.2, 1.0);
            color.scale(brightness)
        })
        .collect()
}

fn render_corner_blast(
    dynamics: &mut Dynamics,
    rng: &mut StdRng,
    base: Rgb,
    t: f32,
    n: usize,
) -> Vec<Rgb> {
    let mut pixels = vec![Rgb::BLACK; n];
    let Dynamics::Corner {
        ranges,
        active,
        until,
        color,
    } = dynamics
    else {
        return pixels;
    };
    if ranges.is_empty() {
        return pixels;
    }

    if active.is_none() || t >= *until {
        let candidates: Vec<usize> = (0..ranges.len())
            .filter(|idx| ranges.len() == 1 || Some(*idx) != *active)
            .collect();
        *active = Some(candidates[rng.gen_range(0..candidates.len())]);
        *until = t + rng.gen_range(0.1..=0.5);
        *color = base.jitter(rng, 0.4);
    }

    if let Some(range) = active.and_then(|idx| ranges.get(idx)) {
        pixels[range.clone()].fill(*color);
    }
    pixels
}

fn render_rain(dynamics: &mut Dynamics, rng: &mut StdRng, t: f32, n: usize) -> Vec<Rgb> {
    let mut pixels = vec![Rgb::BLACK; n];
    let Dynamics::Sparks(drops) = dynamics else {
        return pixels;
    };

    if rng.gen_bool(RAIN_SPAWN_CHANCE) {
        let base = RAIN_PALETTE[rng.gen_range(0..RAIN_PALETTE.len())];
        drops.push(Spark {
            index: rng.gen_range(0..n),
            born: t,
            life: rng.gen_range(0.5..=1.5),
            color: base.jitter(rng, 0.1),
        });
    }

    drops.retain(|drop| t - drop.born < drop.life);
    for drop in drops.iter() {
        let progress = (t - drop.born) / drop.life;
        let fade = 1.0 - progress;
        let radius = (1.0 + 1.5 * progress) as i64;
        for offset in -radius..=radius {
            let position = drop.index as i64 + offset;
            if position < 0 || position >= n as i64 {
                continue;
            }
            let distance = offset.abs() as f32 / (radius as f32 + 0.001);
            let intensity = fade * (1.0 - distance);
            if intensity > 0.0 {
                let slot = &mut pixels[position as usize];
                *slot = slot.saturating_add(drop.color.scale(intensity));
            }
        }
    }
    pixels
}

fn render_strobe(dynamics: &mut Dynamics, rng: &mut StdRng, color: Rgb, t: f32, n: usize) -> Vec<Rgb> {
    let Dynamics::Strobe { next, flash } = dynamics else {
        return vec![Rgb::BLACK; n];
    };

    if flash.is_none() && t >= *next {
        *flash = Some((t, rng.gen_range(0.2..=1.0)));
        *next = t + rng.gen_range(0.3..=1.5);
    }

    let Some((start, length)) = *flash else {
        return vec![Rgb::BLACK; n];
    };
    let age = t - start;
    if age > length {
        *flash = None;
        return vec![Rgb::BLACK; n];
    }
    let intensity = if age < STROBE_PEAK {
        1.0
    } else {
        (1.0 - (age - STROBE_PEAK) / (length - STROBE_PEAK)).max(0.0)
    };
    vec![color.scale(intensity); n]
}

fn render_sparkle(dynamics: &mut Dynamics, rng: &mut StdRng, color: Rgb, t: f32, n: usize) -> Vec<Rgb> {
    let mut pixels = vec![Rgb::BLACK; n];
    let Dynamics::Sparks(sparks) = dynamics else {
        return pixels;
    };

    if rng.gen_bool(SPARKLE_SPAWN_CHANCE) {
        sparks.push(Spark {
            index: rng.gen_range(0..n),
            born: t,
            life: rng.gen_range(0.3..=1.2),
            color: color.jitter(rng, 0.3),
        });
    }

    sparks.retain(|spark| t - spark.born < spark.life);
    for spark in sparks.iter() {
        let fade = 1.0 - (t - spark.born) / spark.life;
        pixels[spark.index] = spark.color.scale(fade);
    }
    pixels
}
