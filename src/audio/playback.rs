//! Audio playback to the system output device via cpal.
//!
//! The renderer owns a frame counter advanced by the output callback — the
//! output clock all scheduling decisions are made against. Queued sources
//! are mixed sample-accurately at their scheduled start frames, so chunks
//! scheduled back-to-back by the gapless scheduler render without gaps or
//! overlaps regardless of when they arrived off the network.

use crate::audio::sched::SourceId;
use crate::config::AudioConfig;
use crate::error::{Result, SessionError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Events emitted by the renderer back to the engine loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// A source finished playing naturally.
    Completed(SourceId),
}

/// A queued unit of output audio.
struct QueuedSource {
    id: SourceId,
    /// Absolute start position on the output clock, in frames.
    start_frame: u64,
    samples: Vec<f32>,
}

/// State shared between the output callback and the render handle.
struct RenderState {
    frame_clock: u64,
    sources: Vec<QueuedSource>,
}

/// Mix all due sources into one output block and advance the clock.
///
/// Returns the ids of sources that completed within this block.
fn render_block(state: &mut RenderState, data: &mut [f32]) -> Vec<SourceId> {
    data.fill(0.0);

    let base = state.frame_clock;
    let block_len = data.len() as u64;

    for src in &state.sources {
        let src_end = src.start_frame + src.samples.len() as u64;
        let begin = src.start_frame.max(base);
        let end = src_end.min(base + block_len);
        for t in begin..end {
            data[(t - base) as usize] += src.samples[(t - src.start_frame) as usize];
        }
    }

    state.frame_clock += block_len;
    let clock = state.frame_clock;

    let mut completed = Vec::new();
    state.sources.retain(|src| {
        if src.start_frame + src.samples.len() as u64 <= clock {
            completed.push(src.id);
            false
        } else {
            true
        }
    });
    completed
}

/// Cheap handle for enqueueing and cancelling from the engine loop.
#[derive(Clone)]
pub struct RenderHandle {
    state: Arc<Mutex<RenderState>>,
    clock_frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl RenderHandle {
    /// Current output-clock reading in seconds.
    pub fn clock_secs(&self) -> f64 {
        self.clock_frames.load(Ordering::Acquire) as f64 / f64::from(self.sample_rate)
    }

    /// Queue a source to start at the given output-clock time.
    pub fn enqueue(&self, id: SourceId, start_secs: f64, samples: Vec<f32>) {
        let start_frame = (start_secs * f64::from(self.sample_rate)).round() as u64;
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        state.sources.push(QueuedSource {
            id,
            start_frame,
            samples,
        });
    }

    /// Drop every queued and playing source at once.
    ///
    /// No completion events are emitted for cancelled sources.
    pub fn cancel_all(&self) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        state.sources.clear();
    }

    /// Number of sources currently queued or playing in the renderer.
    pub fn queued_count(&self) -> usize {
        match self.state.lock() {
            Ok(s) => s.sources.len(),
            Err(p) => p.into_inner().sources.len(),
        }
    }
}

/// Audio playback renderer on the system output device.
pub struct CpalPlayback {
    device: cpal::Device,
    stream_config: StreamConfig,
    state: Arc<Mutex<RenderState>>,
    clock_frames: Arc<AtomicU64>,
}

impl CpalPlayback {
    /// Create a new renderer.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| SessionError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| {
                    SessionError::Audio(format!("output device '{name}' not found"))
                })?
        } else {
            host.default_output_device()
                .ok_or_else(|| SessionError::Audio("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: config.output_sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device,
            stream_config,
            state: Arc::new(Mutex::new(RenderState {
                frame_clock: 0,
                sources: Vec::new(),
            })),
            clock_frames: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Handle for the engine loop.
    pub fn handle(&self) -> RenderHandle {
        RenderHandle {
            state: Arc::clone(&self.state),
            clock_frames: Arc::clone(&self.clock_frames),
            sample_rate: self.stream_config.sample_rate,
        }
    }

    /// Run the output stream until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio stream cannot be created or started.
    pub async fn run(
        &self,
        event_tx: mpsc::UnboundedSender<PlaybackEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let state = Arc::clone(&self.state);
        let clock_frames = Arc::clone(&self.clock_frames);

        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut state = match state.lock() {
                        Ok(s) => s,
                        Err(p) => p.into_inner(),
                    };
                    let completed = render_block(&mut state, data);
                    clock_frames.store(state.frame_clock, Ordering::Release);
                    drop(state);

                    for id in completed {
                        let _ = event_tx.send(PlaybackEvent::Completed(id));
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| SessionError::Audio(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| SessionError::Audio(format!("failed to start output stream: {e}")))?;

        info!(
            "audio playback started at {}Hz mono",
            self.stream_config.sample_rate
        );

        cancel.cancelled().await;

        drop(stream);
        info!("audio playback stopped");
        Ok(())
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
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

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(sources: Vec<QueuedSource>) -> RenderState {
        RenderState {
            frame_clock: 0,
            sources,
        }
    }

    #[test]
    fn render_silence_with_no_sources() {
        let mut state = state_with(Vec::new());
        let mut block = [1.0f32; 64];
        let completed = render_block(&mut state, &mut block);
        assert!(completed.is_empty());
        assert!(block.iter().all(|&s| s == 0.0));
        assert_eq!(state.frame_clock, 64);
    }

    #[test]
    fn source_renders_at_scheduled_offset() {
        let mut state = state_with(vec![QueuedSource {
            id: 1,
            start_frame: 8,
            samples: vec![0.5; 4],
        }]);
        let mut block = [0.0f32; 16];
        let completed = render_block(&mut state, &mut block);

        assert!(block[..8].iter().all(|&s| s == 0.0));
        assert!(block[8..12].iter().all(|&s| s == 0.5));
        assert!(block[12..].iter().all(|&s| s == 0.0));
        assert_eq!(completed, vec![1]);
        assert!(state.sources.is_empty());
    }

    #[test]
    fn source_spans_blocks_and_completes_once() {
        let mut state = state_with(vec![QueuedSource {
            id: 7,
            start_frame: 4,
            samples: vec![0.25; 12],
        }]);

        let mut first = [0.0f32; 8];
        assert!(render_block(&mut state, &mut first).is_empty());
        assert!(first[..4].iter().all(|&s| s == 0.0));
        assert!(first[4..].iter().all(|&s| s == 0.25));

        let mut second = [0.0f32; 8];
        let completed = render_block(&mut state, &mut second);
        assert!(second.iter().all(|&s| s == 0.25));
        assert_eq!(completed, vec![7]);
        assert_eq!(state.frame_clock, 16);
    }

    #[test]
    fn back_to_back_sources_render_without_gap() {
        let mut state = state_with(vec![
            QueuedSource {
                id: 1,
                start_frame: 0,
                samples: vec![0.5; 8],
            },
            QueuedSource {
                id: 2,
                start_frame: 8,
                samples: vec![0.25; 8],
            },
        ]);
        let mut block = [0.0f32; 16];
        let completed = render_block(&mut state, &mut block);
        assert!(block[..8].iter().all(|&s| s == 0.5));
        assert!(block[8..].iter().all(|&s| s == 0.25));
        assert_eq!(completed, vec![1, 2]);
    }

    #[test]
    fn late_start_skips_missed_samples() {
        // Source scheduled before the clock reading; the missed prefix is
        // dropped rather than delaying everything behind it.
        let mut state = state_with(vec![QueuedSource {
            id: 3,
            start_frame: 0,
            samples: vec![0.5; 12],
        }]);
        state.frame_clock = 8;

        let mut block = [0.0f32; 8];
        let completed = render_block(&mut state, &mut block);
        assert!(block[..4].iter().all(|&s| s == 0.5));
        assert!(block[4..].iter().all(|&s| s == 0.0));
        assert_eq!(completed, vec![3]);
    }
}
