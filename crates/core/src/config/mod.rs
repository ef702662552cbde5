use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, SoundError};

/// Default volume applied to clips until a caller changes it.
pub const DEFAULT_VOLUME: f32 = 0.5;

/// Top-level configuration structure for a sound registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundConfig {
    pub backend: BackendKind,
    pub volume: f32,
    pub analyser: AnalyserSettings,
    pub playback: PlaybackConfig,
}

impl Default for SoundConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            volume: DEFAULT_VOLUME,
            analyser: AnalyserSettings::default(),
            playback: PlaybackConfig::default(),
        }
    }
}

impl SoundConfig {
    /// Parses a JSON document and validates the result.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SoundError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.analyser.validate()?;
        self.playback.validate()
    }
}

/// Playback technology a registry drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Streaming media element: nothing is fetched until `play`.
    #[default]
    Element,
    /// Library sound object: the whole clip is decoded as soon as it is added.
    Library,
}

/// Fixed parameters of every analyser node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyserSettings {
    pub fft_size: usize,
    pub min_decibels: f32,
    pub max_decibels: f32,
    pub smoothing_time_constant: f32,
}

impl Default for AnalyserSettings {
    fn default() -> Self {
        Self {
            fft_size: 256,
            min_decibels: -90.0,
            max_decibels: -10.0,
            smoothing_time_constant: 0.85,
        }
    }
}

impl AnalyserSettings {
    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub fn validate(&self) -> Result<()> {
        if !self.fft_size.is_power_of_two() || !(32..=32_768).contains(&self.fft_size) {
            return Err(SoundError::Config(format!(
                "fft_size must be a power of two in 32..=32768, got {}",
                self.fft_size
            )));
        }
        if self.min_decibels >= self.max_decibels {
            return Err(SoundError::Config(
                "min_decibels must be lower than max_decibels".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.smoothing_time_constant) {
            return Err(SoundError::Config(
                "smoothing_time_constant must lie in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Whether the host lets clips start without a prior user gesture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoplayPolicy {
    #[default]
    Allowed,
    RequiresActivation,
}

/// Rendering and buffering parameters shared by both backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Frames rendered per voice step.
    pub render_quantum: usize,
    /// Buffered audio required before a streaming clip can play through.
    pub can_play_through_ms: u64,
    /// Decoded chunks a streaming clip may queue ahead of its voice.
    pub stream_capacity: usize,
    pub context_sample_rate: u32,
    pub autoplay: AutoplayPolicy,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            render_quantum: 512,
            can_play_through_ms: 250,
            stream_capacity: 64,
            context_sample_rate: 48_000,
            autoplay: AutoplayPolicy::default(),
        }
    }
}

impl PlaybackConfig {
    pub fn validate(&self) -> Result<()> {
        if self.render_quantum == 0 {
            return Err(SoundError::Config("render_quantum must be non-zero".into()));
        }
        if self.stream_capacity == 0 {
            return Err(SoundError::Config("stream_capacity must be non-zero".into()));
        }
        if self.context_sample_rate == 0 {
            return Err(SoundError::Config(
                "context_sample_rate must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
