//! Configuration types for the voice session engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for a live voice session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Noise gate settings.
    pub gate: GateConfig,
    /// Barge-in (interrupt) behavior while the assistant is speaking.
    pub barge_in: BargeInConfig,
    /// Silence-timeout escalation heuristic.
    pub silence: SilenceConfig,
    /// Remote session link settings.
    pub link: LinkConfig,
}

/// Audio I/O configuration.
///
/// The capture graph always runs at `process_sample_rate` regardless of the
/// link's outbound rate; resampling to the link rate happens at encode time
/// so the hardware device is never re-initialized per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Fixed processing sample rate for the capture graph in Hz.
    pub process_sample_rate: u32,
    /// Capture frame size in samples at the processing rate.
    pub frame_size: usize,
    /// Number of input channels (1 = mono).
    pub input_channels: u16,
    /// Output (playback) sample rate in Hz.
    pub output_sample_rate: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Request hardware/OS echo cancellation on the input stream.
    pub echo_cancellation: bool,
    /// Request OS noise suppression on the input stream.
    pub noise_suppression: bool,
    /// Request automatic gain control on the input stream.
    pub auto_gain: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            process_sample_rate: 48_000,
            frame_size: 4096,
            input_channels: 1,
            output_sample_rate: 24_000,
            input_device: None,
            output_device: None,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
        }
    }
}

/// Noise gate sensitivity preset.
///
/// Discrete presets keep gating behavior reproducible across sessions;
/// the threshold is never a free-form parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateLevel {
    /// Picks up quiet speech and some room noise.
    Low,
    /// Good for most environments.
    #[default]
    Medium,
    /// Only loud/close speech opens the gate.
    High,
}

impl GateLevel {
    /// RMS threshold for this preset (f32 samples in \[-1, 1\]).
    pub fn threshold(self) -> f32 {
        match self {
            Self::Low => 0.002,
            Self::Medium => 0.005,
            Self::High => 0.01,
        }
    }
}

/// Noise gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Sensitivity preset selecting the RMS threshold.
    pub level: GateLevel,
    /// High-pass cutoff applied before gating, in Hz.
    ///
    /// Gating unfiltered input produces false opens on low-frequency
    /// handling rumble, so the filter is unconditional.
    pub highpass_cutoff_hz: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            level: GateLevel::Medium,
            highpass_cutoff_hz: 80.0,
        }
    }
}

/// Barge-in (interrupt) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Whether barge-in is enabled.
    pub enabled: bool,
    /// Minimum RMS energy required to cut off assistant playback.
    ///
    /// Higher than any gate preset so speaker leakage does not trigger it.
    pub min_rms: f32,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_rms: 0.05,
        }
    }
}

/// Silence-timeout escalation configuration.
///
/// Escalation to the processing state is a local UI heuristic, not an
/// authoritative signal from the remote session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SilenceConfig {
    /// Whether the silence-timeout escalation fires at all.
    pub enabled: bool,
    /// Silence duration in ms before escalating listening -> processing.
    pub max_silence_ms: u64,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_silence_ms: 3000,
        }
    }
}

/// Remote session link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// WebSocket URL of the remote voice session endpoint.
    pub url: String,
    /// Outbound audio sample rate in Hz (the link rate).
    pub sample_rate: u32,
    /// MIME tag attached to outbound audio packets.
    pub mime_type: String,
    /// Prebuilt voice name requested at setup, if any.
    pub voice: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: "wss://localhost:9640/v1/live".into(),
            sample_rate: 16_000,
            mime_type: "audio/pcm;rate=16000".into(),
            voice: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::SessionError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be
    /// serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SessionError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/selkie/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("selkie").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("selkie")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/selkie-config/config.toml")
        }
    }

    /// Duration of one capture frame at the processing rate.
    pub fn frame_period(&self) -> std::time::Duration {
        let secs = self.audio.frame_size as f64 / f64::from(self.audio.process_sample_rate);
        std::time::Duration::from_secs_f64(secs)
    }
}
