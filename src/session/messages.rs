//! Message types passed between the audio stages and the engine loop.

use std::time::Instant;

/// A filtered, gate-evaluated capture frame ready for the engine.
///
/// Owned exclusively by the capture pipeline until handed to the engine
/// loop; ownership transfers with the send.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Mono f32 samples at the processing rate. Zeroed when the gate was
    /// closed — silence is sent explicitly, never withheld, so the remote
    /// side's activity detection sees clean silence frames instead of gaps.
    pub samples: Vec<f32>,
    /// RMS energy measured after filtering, before gating.
    pub rms: f32,
    /// Whether the gate was open for this frame.
    pub gate_open: bool,
    /// Timestamp when this frame was captured.
    pub captured_at: Instant,
}

/// Decoded PCM audio received from the remote session.
#[derive(Debug, Clone)]
pub struct InboundAudio {
    /// Mono-interleaved f32 samples.
    pub samples: Vec<f32>,
    /// Sample rate the remote declared for this chunk.
    pub sample_rate: u32,
    /// Channel count the remote declared for this chunk.
    pub channels: u16,
}

impl InboundAudio {
    /// Duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        let frames = self.samples.len() / usize::from(self.channels.max(1));
        frames as f64 / f64::from(self.sample_rate)
    }
}
