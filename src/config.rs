use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

// Array Geometry
pub const SENSOR_SPACING_INCHES: f32 = 7.0;
pub const METERS_PER_INCH: f32 = 0.0254;
pub const SPEED_OF_SOUND_MPS: f32 = 340.29;

// Capture Parameters
pub const SAMPLES_PER_SECOND: u32 = 16000;
pub const NUM_CHANNELS: usize = 4;
pub const TARGET_FRAME_RATE: f32 = 15.0;

// Delay Search Parameters
pub const MAX_OFFSET_SCALE: f32 = 1.25;
pub const TOP_N_OFFSETS: usize = 3;

// LUT Parameters
pub const LUT_KEY_PREC: f32 = 1.0;
pub const LUT_POINTS: usize = 65536;
pub const LUT_SHELLS: usize = 4;
pub const LUT_RANGE_METERS: f32 = 5.0;
pub const LUT_DEAD_ZONE_METERS: f32 = 0.5;
pub const LUT_MAX_RINGS: i32 = 3;

// Tracking Parameters
pub const CLUSTER_DISTANCE: f32 = 0.4;
pub const SMOOTHING_FACTOR: f32 = 1.0 / 6.0;
pub const TIMEOUT_SECONDS: f32 = 1.0;
pub const SILENCE_LOUDNESS: f32 = 250.0;
/// Longest accepted timeout, in frames.
pub const MAX_TIMEOUT_FRAMES: u64 = u32::MAX as u64;

/// Pairwise delay search algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DelayMethod {
    /// Minimum mean squared difference.
    Ssd,
    /// Maximum dot product, computed directly.
    Xcorr,
    /// Maximum dot product, computed through an FFT.
    XcorrFft,
}

/// How per-channel lags are chosen each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DelaySearch {
    /// Best lag of every channel against the loudest one.
    Pairwise,
    /// Top-N candidates per pair, then joint four-way minimization.
    Consensus,
}

/// How a reinforced sound's loudness is updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoudnessPolicy {
    /// Keep the loudest value ever observed.
    Max,
    /// Decay by `1 - smoothing_factor` per missed frame, then blend the new sample in.
    Decay,
}

/// Runtime configuration. Every field defaults to the compiled-in constant above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sensor_spacing_inches: f32,
    pub speed_of_sound_mps: f32,
    pub sample_rate: u32,
    pub channels: usize,
    pub target_frame_rate: f32,

    /// Size of one LUT key cell, in samples. 1.0 gives integer keys.
    pub lut_key_precision: f32,
    /// Golden-spiral points per shell.
    pub lut_points: usize,
    pub lut_shells: usize,
    pub lut_range_meters: f32,
    pub lut_dead_zone_meters: f32,
    pub lut_max_rings: i32,

    pub cluster_distance: f32,
    pub smoothing_factor: f32,
    pub timeout_seconds: f32,
    pub silence_loudness: f32,

    pub recenter: bool,
    pub rescale: bool,
    pub delay_method: DelayMethod,
    pub delay_search: DelaySearch,
    pub top_n: usize,
    pub loudness_policy: LoudnessPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sensor_spacing_inches: SENSOR_SPACING_INCHES,
            speed_of_sound_mps: SPEED_OF_SOUND_MPS,
            sample_rate: SAMPLES_PER_SECOND,
            channels: NUM_CHANNELS,
            target_frame_rate: TARGET_FRAME_RATE,
            lut_key_precision: LUT_KEY_PREC,
            lut_points: LUT_POINTS,
            lut_shells: LUT_SHELLS,
            lut_range_meters: LUT_RANGE_METERS,
            lut_dead_zone_meters: LUT_DEAD_ZONE_METERS,
            lut_max_rings: LUT_MAX_RINGS,
            cluster_distance: CLUSTER_DISTANCE,
            smoothing_factor: SMOOTHING_FACTOR,
            timeout_seconds: TIMEOUT_SECONDS,
            silence_loudness: SILENCE_LOUDNESS,
            recenter: true,
            rescale: false,
            delay_method: DelayMethod::Xcorr,
            delay_search: DelaySearch::Pairwise,
            top_n: TOP_N_OFFSETS,
            loudness_policy: LoudnessPolicy::Max,
        }
    }
}

impl Config {
    /// Reads a YAML config file. Missing fields take their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn sensor_spacing_meters(&self) -> f32 {
        self.sensor_spacing_inches * METERS_PER_INCH
    }

    /// Samples elapsed while sound travels one meter.
    pub fn samples_per_meter(&self) -> f32 {
        self.sample_rate as f32 / self.speed_of_sound_mps
    }

    /// Samples elapsed while sound travels from one microphone to another.
    pub fn sensor_spacing_samples(&self) -> f32 {
        self.sensor_spacing_meters() * self.samples_per_meter()
    }

    /// Largest lag searched, in samples.
    pub fn max_offset(&self) -> usize {
        (MAX_OFFSET_SCALE * self.sensor_spacing_samples()).round() as usize
    }

    /// Samples per channel in one frame.
    pub fn frame_len(&self) -> usize {
        (self.sample_rate as f32 / self.target_frame_rate).round() as usize
    }

    pub fn timeout_frames(&self) -> u64 {
        (self.timeout_seconds * self.target_frame_rate).round() as u64
    }

    /// Fatal startup check. Nothing downstream re-validates these values.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sensor_spacing_inches", self.sensor_spacing_inches),
            ("speed_of_sound_mps", self.speed_of_sound_mps),
            ("target_frame_rate", self.target_frame_rate),
            ("lut_key_precision", self.lut_key_precision),
            ("lut_range_meters", self.lut_range_meters),
            ("cluster_distance", self.cluster_distance),
            ("timeout_seconds", self.timeout_seconds),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::config(format!(
                    "{} must be a positive finite number, got {}",
                    name, value
                )));
            }
        }

        if !self.lut_dead_zone_meters.is_finite() || self.lut_dead_zone_meters < 0.0 {
            return Err(Error::config(format!(
                "lut_dead_zone_meters must be non-negative, got {}",
                self.lut_dead_zone_meters
            )));
        }
        if self.lut_dead_zone_meters >= self.lut_range_meters {
            return Err(Error::config(format!(
                "lut_dead_zone_meters ({}) must be smaller than lut_range_meters ({})",
                self.lut_dead_zone_meters, self.lut_range_meters
            )));
        }
        if !(self.smoothing_factor > 0.0 && self.smoothing_factor <= 1.0) {
            return Err(Error::config(format!(
                "smoothing_factor must be in (0, 1], got {}",
                self.smoothing_factor
            )));
        }
        if !self.silence_loudness.is_finite() || self.silence_loudness < 0.0 {
            return Err(Error::config(format!(
                "silence_loudness must be non-negative, got {}",
                self.silence_loudness
            )));
        }
        if self.sample_rate == 0 {
            return Err(Error::config("sample_rate must be non-zero"));
        }
        if self.channels != NUM_CHANNELS {
            return Err(Error::config(format!(
                "only the {}-microphone tetrahedron is supported, got {} channels",
                NUM_CHANNELS, self.channels
            )));
        }
        if self.lut_points < 2 || self.lut_shells == 0 {
            return Err(Error::config(
                "lut_points must be at least 2 and lut_shells at least 1",
            ));
        }
        if self.lut_max_rings < 0 {
            return Err(Error::config("lut_max_rings must be non-negative"));
        }
        let timeout_frames = self.timeout_seconds as f64 * self.target_frame_rate as f64;
        if timeout_frames.round() > MAX_TIMEOUT_FRAMES as f64 {
            return Err(Error::config(format!(
                "timeout_seconds {} is {:.0} frames, more than the {} allowed",
                self.timeout_seconds, timeout_frames, MAX_TIMEOUT_FRAMES
            )));
        }
        if self.top_n == 0 {
            return Err(Error::config("top_n must be at least 1"));
        }

        let max_offset = self.max_offset();
        let frame_len = self.frame_len();
        if frame_len <= 2 * max_offset {
            return Err(Error::config(format!(
                "frame length {} samples leaves no overlap for a lag range of +/-{}",
                frame_len, max_offset
            )));
        }
        Ok(())
    }
}
