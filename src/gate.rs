//! Noise gate and silence tracking.
//!
//! The gate uses RMS energy thresholding with discrete sensitivity presets.
//! The silence tracker drives the listening -> processing escalation, a
//! local UI heuristic with no authoritative signal from the remote session.

use crate::config::{GateConfig, SilenceConfig};
use std::time::{Duration, Instant};

/// Amplitude gate deciding whether a frame carries voice.
#[derive(Debug, Clone)]
pub struct NoiseGate {
    threshold: f32,
}

impl NoiseGate {
    /// Create a gate from the configured sensitivity preset.
    pub fn new(config: &GateConfig) -> Self {
        Self {
            threshold: config.level.threshold(),
        }
    }

    /// Whether a frame with this RMS energy opens the gate.
    pub fn is_open(&self, rms: f32) -> bool {
        rms > self.threshold
    }

    /// Apply the gate to a frame with the given RMS. A closed gate zeroes
    /// the content in place — silence is sent as explicit zeros, never
    /// withheld. Returns whether the gate was open.
    pub fn apply(&self, samples: &mut [f32], rms: f32) -> bool {
        let open = self.is_open(rms);
        if !open {
            samples.fill(0.0);
        }
        open
    }

    /// The numeric threshold in use.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

/// Tracks time since the last voice activity or inbound message.
///
/// Reset whenever the gate opens while the user has the floor, whenever any
/// inbound link message arrives, and when playback drains. Read on every
/// capture tick to decide escalation to the processing state.
#[derive(Debug)]
pub struct SilenceTracker {
    last_activity: Instant,
    max_silence: Duration,
    enabled: bool,
}

impl SilenceTracker {
    /// Create a tracker with its clock starting now.
    pub fn new(config: &SilenceConfig) -> Self {
        Self {
            last_activity: Instant::now(),
            max_silence: Duration::from_millis(config.max_silence_ms),
            enabled: config.enabled,
        }
    }

    /// Record activity at the given instant.
    pub fn reset(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Whether the silence window has been exceeded as of `now`.
    pub fn exceeded(&self, now: Instant) -> bool {
        self.enabled && now.duration_since(self.last_activity) > self.max_silence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateLevel;

    fn gate(level: GateLevel) -> NoiseGate {
        NoiseGate::new(&GateConfig {
            level,
            ..GateConfig::default()
        })
    }

    #[test]
    fn gate_opens_above_threshold() {
        let g = gate(GateLevel::Medium);
        assert!(g.is_open(0.006));
        assert!(!g.is_open(0.005));
        assert!(!g.is_open(0.0));
    }

    #[test]
    fn closed_gate_zeroes_content_open_gate_passes_through() {
        let g = gate(GateLevel::Medium);

        let mut quiet = vec![0.003; 64];
        assert!(!g.apply(&mut quiet, 0.003));
        assert!(quiet.iter().all(|&s| s == 0.0));

        let original = vec![0.2; 64];
        let mut loud = original.clone();
        assert!(g.apply(&mut loud, 0.2));
        assert_eq!(loud, original);
    }

    #[test]
    fn gate_sensitivity_tracks_preset() {
        assert!(gate(GateLevel::Low).is_open(0.003));
        assert!(!gate(GateLevel::Medium).is_open(0.003));
        assert!(!gate(GateLevel::High).is_open(0.008));
        assert!(gate(GateLevel::High).is_open(0.011));
    }

    #[test]
    fn silence_exceeded_after_window() {
        let config = SilenceConfig {
            enabled: true,
            max_silence_ms: 3000,
        };
        let mut tracker = SilenceTracker::new(&config);
        let start = Instant::now();
        tracker.reset(start);

        assert!(!tracker.exceeded(start + Duration::from_millis(3000)));
        assert!(tracker.exceeded(start + Duration::from_millis(3001)));
    }

    #[test]
    fn silence_reset_restarts_window() {
        let config = SilenceConfig {
            enabled: true,
            max_silence_ms: 1000,
        };
        let mut tracker = SilenceTracker::new(&config);
        let start = Instant::now();
        tracker.reset(start);
        tracker.reset(start + Duration::from_millis(900));
        assert!(!tracker.exceeded(start + Duration::from_millis(1500)));
        assert!(tracker.exceeded(start + Duration::from_millis(1901)));
    }

    #[test]
    fn disabled_tracker_never_fires() {
        let config = SilenceConfig {
            enabled: false,
            max_silence_ms: 10,
        };
        let mut tracker = SilenceTracker::new(&config);
        let start = Instant::now();
        tracker.reset(start);
        assert!(!tracker.exceeded(start + Duration::from_secs(60)));
    }
}
