//! Microphone audio capture using cpal.
//!
//! The capture graph runs at a fixed processing rate (48kHz by default)
//! regardless of the link's outbound rate, so starting a session never
//! re-initializes the hardware device. The cpal callback converts to mono,
//! resamples to the processing rate, applies an unconditional high-pass
//! filter, evaluates the noise gate, and hands fixed-size frames to the
//! engine loop.

use crate::audio::dsp::{self, HighPass};
use crate::config::{AudioConfig, GateConfig};
use crate::error::{Result, SessionError};
use crate::gate::NoiseGate;
use crate::session::guard::SessionGuard;
use crate::session::messages::CapturedFrame;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Audio capture from the system microphone via cpal.
pub struct CpalCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    /// Fixed processing rate for the capture graph.
    process_rate: u32,
    /// Frame size in samples at the processing rate.
    frame_size: usize,
}

impl CpalCapture {
    /// Create a new capture instance.
    ///
    /// Uses the device's default configuration for maximum compatibility
    /// and resamples to the processing rate in software.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DeviceUnavailable`] if no input device exists
    /// or the device cannot be queried.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            host.input_devices()
                .map_err(|e| {
                    SessionError::DeviceUnavailable(format!("cannot enumerate devices: {e}"))
                })?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| {
                    SessionError::DeviceUnavailable(format!("input device '{name}' not found"))
                })?
        } else {
            host.default_input_device()
                .ok_or_else(|| SessionError::DeviceUnavailable("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device.default_input_config().map_err(|e| {
            SessionError::DeviceUnavailable(format!("no default input config: {e}"))
        })?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();

        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "native input config: {}Hz, {} channels; processing at {}Hz",
            native_rate, native_channels, config.process_sample_rate
        );

        Ok(Self {
            device,
            stream_config,
            process_rate: config.process_sample_rate,
            frame_size: config.frame_size,
        })
    }

    /// Run the capture loop, sending gate-evaluated frames to the engine.
    ///
    /// Blocks until the cancellation token is triggered; dropping the stream
    /// releases the microphone handle. Safe to cancel more than once.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DeviceUnavailable`] if the audio stream cannot
    /// be created or started (the usual shape of an OS permission denial).
    pub async fn run(
        &self,
        gate_config: &GateConfig,
        tx: mpsc::Sender<CapturedFrame>,
        guard: Arc<SessionGuard>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let native_rate = self.stream_config.sample_rate;
        let native_channels = self.stream_config.channels;
        let process_rate = self.process_rate;
        let frame_size = self.frame_size;

        let gate = NoiseGate::new(gate_config);
        let mut highpass = HighPass::new(gate_config.highpass_cutoff_hz, process_rate);
        let mut pending: Vec<f32> = Vec::with_capacity(frame_size * 2);
        let token = guard.token();

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    if !guard.is_current(token) {
                        return;
                    }

                    let mono = if native_channels > 1 {
                        dsp::to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };
                    let mut samples = if native_rate != process_rate {
                        dsp::resample(&mono, native_rate, process_rate)
                    } else {
                        mono
                    };

                    // Filter before gating: low-frequency rumble must not
                    // open the gate.
                    highpass.process(&mut samples);
                    pending.extend_from_slice(&samples);

                    while pending.len() >= frame_size {
                        let mut frame: Vec<f32> = pending.drain(..frame_size).collect();
                        let rms = dsp::rms(&frame);
                        let gate_open = gate.apply(&mut frame, rms);

                        let captured = CapturedFrame {
                            samples: frame,
                            rms,
                            gate_open,
                            captured_at: Instant::now(),
                        };
                        // try_send: the audio thread must never block.
                        if tx.try_send(captured).is_err() {
                            debug!("engine channel full, dropping capture frame");
                        }
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| {
                SessionError::DeviceUnavailable(format!("failed to build input stream: {e}"))
            })?;

        stream.play().map_err(|e| {
            SessionError::DeviceUnavailable(format!("failed to start input stream: {e}"))
        })?;

        info!(
            "audio capture started: native {}Hz -> process {}Hz, frame {} samples",
            native_rate, process_rate, frame_size
        );

        // Hold the stream alive until cancelled.
        cancel.cancelled().await;

        drop(stream);
        info!("audio capture stopped");
        Ok(())
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| SessionError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}
