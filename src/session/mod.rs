//! The live session engine.
//!
//! One engine loop consumes a single merged event channel — capture frames,
//! link events, and playback completions — so cross-component state has a
//! single writer and there is no arbitrary interleaving of independent
//! callbacks to reason about. The loop owns the authoritative
//! [`SessionState`], the gapless scheduler, and the silence tracker; the UI
//! observes through read-only projections.

pub mod guard;
pub mod messages;

use crate::audio::capture::CpalCapture;
use crate::audio::dsp;
use crate::audio::playback::{CpalPlayback, PlaybackEvent, RenderHandle};
use crate::audio::sched::{GaplessScheduler, SourceId};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::events::{SessionEvent, SessionSnapshot, SessionState};
use crate::gate::SilenceTracker;
use crate::link::{LinkEvent, LinkOptions, LiveLink};
use crate::tools::{FALLBACK_TOOL_RESULT, ToolDeclaration, ToolHandler, ToolInvocation};
use crate::transcript::TranscriptWindow;
use guard::SessionGuard;
use messages::{CapturedFrame, InboundAudio};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Channel buffer sizes.
const FRAME_CHANNEL_SIZE: usize = 64;
const LINK_CHANNEL_SIZE: usize = 32;
const ENGINE_CHANNEL_SIZE: usize = 64;
const UI_CHANNEL_SIZE: usize = 64;

/// A competing audio output (the briefing/debate player) that must release
/// the output device before the live session takes it.
///
/// Only one of the two may hold the device at a time.
pub trait CompetingOutput: Send + Sync {
    /// Whether the competing output is currently playing.
    fn is_active(&self) -> bool;
    /// Stop it and release the device.
    fn stop(&self);
}

/// Caller-assembled options for a session.
#[derive(Clone)]
pub struct SessionOptions {
    /// Opaque assembled instruction string; owned by the prompt layer and
    /// not interpreted here.
    pub system_instruction: String,
    /// Tools the remote may invoke.
    pub tools: Vec<ToolDeclaration>,
    /// Application handler for tool invocations.
    pub handler: Arc<dyn ToolHandler>,
    /// Competing output to stop before the session starts.
    pub competing_output: Option<Arc<dyn CompetingOutput>>,
}

/// Outbound side of the link as seen by the engine.
trait OutboundLink: Send + Sync {
    fn send_audio(&self, samples: &[f32], src_rate: u32);
    fn send_tool_result(&self, id: &str, name: &str, result: &str);
    fn close(&self);
}

impl OutboundLink for LiveLink {
    fn send_audio(&self, samples: &[f32], src_rate: u32) {
        LiveLink::send_audio(self, samples, src_rate);
    }

    fn send_tool_result(&self, id: &str, name: &str, result: &str) {
        LiveLink::send_tool_result(self, id, name, result);
    }

    fn close(&self) {
        LiveLink::close(self);
    }
}

/// Playback rendering as seen by the engine.
trait PlaybackSink: Send + Sync {
    fn clock_secs(&self) -> f64;
    fn enqueue(&self, id: SourceId, start_secs: f64, samples: Vec<f32>);
    fn cancel_all(&self);
}

impl PlaybackSink for RenderHandle {
    fn clock_secs(&self) -> f64 {
        RenderHandle::clock_secs(self)
    }

    fn enqueue(&self, id: SourceId, start_secs: f64, samples: Vec<f32>) {
        RenderHandle::enqueue(self, id, start_secs, samples);
    }

    fn cancel_all(&self) {
        RenderHandle::cancel_all(self);
    }
}

/// Everything the engine loop reacts to, merged into one channel.
enum EngineEvent {
    /// A gate-evaluated capture frame.
    Frame(CapturedFrame),
    /// An inbound link event.
    Link(LinkEvent),
    /// A playback completion from the renderer.
    Playback(PlaybackEvent),
    /// A spawned stage died with a fatal error.
    Fatal(String),
}

/// The engine's mutable state. Single writer: the engine loop.
struct EngineCore {
    config: SessionConfig,
    state: SessionState,
    scheduler: GaplessScheduler,
    silence: SilenceTracker,
    transcript: TranscriptWindow,
    link: Arc<dyn OutboundLink>,
    playback: Arc<dyn PlaybackSink>,
    tools: Arc<dyn ToolHandler>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    ui_tx: broadcast::Sender<SessionEvent>,
    guard: Arc<SessionGuard>,
    cancel: CancellationToken,
}

impl EngineCore {
    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.snapshot_tx.send_modify(|s| s.state = state);
        let _ = self.ui_tx.send(SessionEvent::State(state));
    }

    fn set_feedback(&self, feedback: Option<&str>) {
        self.snapshot_tx
            .send_modify(|s| s.feedback = feedback.map(str::to_owned));
    }

    /// Whether the system is currently speaking (>=1 active source).
    fn speaking(&self) -> bool {
        self.scheduler.active_count() > 0
    }

    fn handle(&mut self, event: EngineEvent) -> ControlFlow<Option<String>> {
        match event {
            EngineEvent::Frame(frame) => {
                self.on_frame(frame);
                ControlFlow::Continue(())
            }
            EngineEvent::Link(event) => self.on_link(event),
            EngineEvent::Playback(PlaybackEvent::Completed(id)) => {
                self.on_completed(id);
                ControlFlow::Continue(())
            }
            EngineEvent::Fatal(message) => ControlFlow::Break(Some(message)),
        }
    }

    fn on_frame(&mut self, mut frame: CapturedFrame) {
        let now = frame.captured_at;
        self.snapshot_tx.send_modify(|s| s.last_rms = frame.rms);

        if self.speaking() {
            // Barge-in: user voice over assistant speech cuts playback in
            // this same tick. The triggering frame passes through to the
            // link so the interruption reaches the model.
            if self.config.barge_in.enabled && frame.rms >= self.config.barge_in.min_rms {
                self.interrupt();
            } else {
                // Still speaking: measure energy but never echo the
                // assistant's own voice back upstream.
                frame.samples.fill(0.0);
            }
        } else if frame.gate_open {
            self.silence.reset(now);
        } else if self.state == SessionState::Listening && self.silence.exceeded(now) {
            self.set_state(SessionState::Processing);
        }

        self.link
            .send_audio(&frame.samples, self.config.audio.process_sample_rate);
    }

    /// Cancel all playback immediately. Local barge-in and the remote
    /// `interrupted` signal take this same path.
    fn interrupt(&mut self) {
        self.scheduler.cancel_all(self.playback.clock_secs());
        self.playback.cancel_all();
        self.silence.reset(Instant::now());
        if self.state == SessionState::Speaking {
            self.set_state(SessionState::Listening);
        }
        let _ = self.ui_tx.send(SessionEvent::Interrupted);
    }

    fn on_link(&mut self, event: LinkEvent) -> ControlFlow<Option<String>> {
        // Any inbound message counts as activity.
        self.silence.reset(Instant::now());

        match event {
            LinkEvent::Ready => {
                self.set_feedback(Some("link established"));
                ControlFlow::Continue(())
            }
            LinkEvent::Audio(audio) => {
                self.on_audio(audio);
                ControlFlow::Continue(())
            }
            LinkEvent::ToolCalls(calls) => {
                self.set_state(SessionState::Processing);
                for call in calls {
                    self.dispatch_tool_call(call);
                }
                ControlFlow::Continue(())
            }
            LinkEvent::Transcript(text) => {
                self.transcript.push(&text);
                let fragments = self.transcript.fragments();
                self.snapshot_tx.send_modify(|s| s.transcript = fragments);
                let _ = self.ui_tx.send(SessionEvent::Transcript(text));
                ControlFlow::Continue(())
            }
            LinkEvent::Interrupted => {
                self.interrupt();
                ControlFlow::Continue(())
            }
            LinkEvent::Closed => ControlFlow::Break(None),
            LinkEvent::Error(message) => ControlFlow::Break(Some(message)),
        }
    }

    fn on_audio(&mut self, audio: InboundAudio) {
        let mono = if audio.channels > 1 {
            dsp::to_mono(&audio.samples, audio.channels)
        } else {
            audio.samples
        };
        let out_rate = self.config.audio.output_sample_rate;
        let samples = dsp::resample(&mono, audio.sample_rate, out_rate);
        if samples.is_empty() {
            return;
        }
        let duration = samples.len() as f64 / f64::from(out_rate);

        let now = self.playback.clock_secs();
        let (id, source) = self.scheduler.schedule(now, duration);
        self.playback.enqueue(id, source.start, samples);

        if self.state != SessionState::Speaking {
            self.set_state(SessionState::Speaking);
            self.set_feedback(None);
        }
    }

    fn on_completed(&mut self, id: SourceId) {
        if self.scheduler.complete(id) && self.state == SessionState::Speaking {
            self.set_state(SessionState::Listening);
            self.set_feedback(Some("listening"));
            self.silence.reset(Instant::now());
        }
    }

    /// Dispatch one invocation to the application handler.
    ///
    /// Exactly one result goes back per id; a handler failure degrades to
    /// the generic acknowledgment instead of failing the call.
    fn dispatch_tool_call(&self, call: ToolInvocation) {
        let _ = self.ui_tx.send(SessionEvent::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
        });

        let handler = Arc::clone(&self.tools);
        let link = Arc::clone(&self.link);
        let ui_tx = self.ui_tx.clone();
        let guard = Arc::clone(&self.guard);
        let token = guard.token();

        tokio::spawn(async move {
            let (result, success) = match handler.handle(&call).await {
                Ok(result) => (result, true),
                Err(e) => {
                    warn!("tool handler failed for '{}': {e}", call.name);
                    (FALLBACK_TOOL_RESULT.to_owned(), false)
                }
            };

            // A result for a torn-down session must not touch the link.
            if !guard.is_current(token) {
                return;
            }

            link.send_tool_result(&call.id, &call.name, &result);
            let _ = ui_tx.send(SessionEvent::ToolResult {
                id: call.id,
                name: call.name,
                success,
            });
        });
    }

    /// Tear everything down to idle. The guard is invalidated before any
    /// resource is released so late completions cannot revive the session.
    fn teardown(&mut self, error: Option<String>) {
        self.guard.invalidate();
        self.cancel.cancel();
        self.link.close();
        self.scheduler.cancel_all(self.playback.clock_secs());
        self.playback.cancel_all();
        self.transcript.clear();

        self.set_state(SessionState::Idle);
        self.snapshot_tx.send_modify(|s| {
            s.last_rms = 0.0;
            s.transcript.clear();
            s.feedback = error.as_ref().map(|_| "link failure".to_owned());
        });
        if let Some(ref message) = error {
            error!("session ended: {message}");
        } else {
            info!("session ended");
        }
        let _ = self.ui_tx.send(SessionEvent::Ended { error });
    }
}

async fn run_engine(mut core: EngineCore, mut rx: mpsc::Receiver<EngineEvent>) {
    let cancel = core.cancel.clone();
    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        if let ControlFlow::Break(error) = core.handle(event) {
                            failure = error;
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    core.teardown(failure);
}

/// A running live voice session.
///
/// Created by [`VoiceSession::start`] and destroyed with [`VoiceSession::stop`]
/// (or by dropping the handle); the capture graph, link, and renderer live
/// and die with it.
pub struct VoiceSession {
    cancel: CancellationToken,
    guard: Arc<SessionGuard>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    ui_tx: broadcast::Sender<SessionEvent>,
}

impl VoiceSession {
    /// Acquire the microphone, open the link, and start the engine loop.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SessionError::DeviceUnavailable`] when the
    /// microphone cannot be acquired and
    /// [`crate::error::SessionError::ConnectionFailed`] when the remote
    /// session cannot be established. Neither is retried here.
    pub async fn start(config: SessionConfig, options: SessionOptions) -> Result<Self> {
        // The output device has one owner at a time.
        if let Some(ref other) = options.competing_output
            && other.is_active()
        {
            info!("stopping competing audio output before session start");
            other.stop();
        }

        let guard = Arc::new(SessionGuard::new());
        let cancel = CancellationToken::new();

        let capture = CpalCapture::new(&config.audio)?;
        let playback = CpalPlayback::new(&config.audio)?;
        let render = playback.handle();

        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            state: SessionState::Listening,
            feedback: Some("initializing link".into()),
            ..SessionSnapshot::default()
        });
        let (ui_tx, _) = broadcast::channel(UI_CHANNEL_SIZE);

        let (link_tx, mut link_rx) = mpsc::channel::<LinkEvent>(LINK_CHANNEL_SIZE);
        let link_options = LinkOptions {
            system_instruction: options.system_instruction,
            tools: options.tools,
        };
        // On failure the mic handle is released with `capture` going out of
        // scope; nothing else has started yet.
        let link = Arc::new(LiveLink::open(&config.link, link_options, link_tx).await?);

        let (engine_tx, engine_rx) = mpsc::channel::<EngineEvent>(ENGINE_CHANNEL_SIZE);
        let (frame_tx, mut frame_rx) = mpsc::channel::<CapturedFrame>(FRAME_CHANNEL_SIZE);
        let (pb_tx, mut pb_rx) = mpsc::unbounded_channel::<PlaybackEvent>();

        // Forward each producer into the single engine channel.
        {
            let engine_tx = engine_tx.clone();
            tokio::spawn(async move {
                while let Some(frame) = frame_rx.recv().await {
                    if engine_tx.send(EngineEvent::Frame(frame)).await.is_err() {
                        break;
                    }
                }
            });
        }
        {
            let engine_tx = engine_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = link_rx.recv().await {
                    if engine_tx.send(EngineEvent::Link(event)).await.is_err() {
                        break;
                    }
                }
            });
        }
        {
            let engine_tx = engine_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = pb_rx.recv().await {
                    if engine_tx.send(EngineEvent::Playback(event)).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Capture stage.
        {
            let gate_config = config.gate.clone();
            let guard = Arc::clone(&guard);
            let cancel = cancel.clone();
            let engine_tx = engine_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = capture.run(&gate_config, frame_tx, guard, cancel).await {
                    error!("capture stage error: {e}");
                    let _ = engine_tx.send(EngineEvent::Fatal(e.to_string())).await;
                }
            });
        }

        // Playback stage.
        {
            let cancel = cancel.clone();
            let engine_tx = engine_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = playback.run(pb_tx, cancel).await {
                    error!("playback stage error: {e}");
                    let _ = engine_tx.send(EngineEvent::Fatal(e.to_string())).await;
                }
            });
        }

        // Engine loop.
        let core = EngineCore {
            state: SessionState::Listening,
            scheduler: GaplessScheduler::new(),
            silence: SilenceTracker::new(&config.silence),
            transcript: TranscriptWindow::default(),
            link: Arc::clone(&link) as Arc<dyn OutboundLink>,
            playback: Arc::new(render) as Arc<dyn PlaybackSink>,
            tools: options.handler,
            snapshot_tx,
            ui_tx: ui_tx.clone(),
            guard: Arc::clone(&guard),
            cancel: cancel.clone(),
            config,
        };
        tokio::spawn(run_engine(core, engine_rx));

        info!("voice session started");
        Ok(Self {
            cancel,
            guard,
            snapshot_rx,
            ui_tx,
        })
    }

    /// Stop the session and release all resources. Idempotent.
    pub fn stop(&self) {
        self.guard.invalidate();
        self.cancel.cancel();
    }

    /// Current read-only projection for UI rendering.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch the snapshot for changes.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Subscribe to the session event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ui_tx.subscribe()
    }

    /// Completes when the session has fully torn down.
    pub async fn ended(&self) {
        let mut events = self.ui_tx.subscribe();
        if self.cancel.is_cancelled() {
            return;
        }
        loop {
            match events.recv().await {
                Ok(SessionEvent::Ended { .. }) | Err(broadcast::error::RecvError::Closed) => {
                    return;
                }
                _ => {}
            }
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::{GateLevel, SilenceConfig};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records outbound traffic instead of talking to a socket.
    #[derive(Default)]
    struct MockLink {
        audio: Mutex<Vec<Vec<f32>>>,
        tool_results: Mutex<Vec<(String, String, String)>>,
        closed: Mutex<bool>,
    }

    impl OutboundLink for MockLink {
        fn send_audio(&self, samples: &[f32], _src_rate: u32) {
            self.audio.lock().unwrap().push(samples.to_vec());
        }

        fn send_tool_result(&self, id: &str, name: &str, result: &str) {
            self.tool_results
                .lock()
                .unwrap()
                .push((id.to_owned(), name.to_owned(), result.to_owned()));
        }

        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    /// Manually-advanced output clock plus a call log.
    #[derive(Default)]
    struct MockSink {
        clock: Mutex<f64>,
        enqueued: Mutex<Vec<(SourceId, f64, usize)>>,
        cancels: Mutex<usize>,
    }

    impl MockSink {
        fn set_clock(&self, secs: f64) {
            *self.clock.lock().unwrap() = secs;
        }
    }

    impl PlaybackSink for MockSink {
        fn clock_secs(&self) -> f64 {
            *self.clock.lock().unwrap()
        }

        fn enqueue(&self, id: SourceId, start_secs: f64, samples: Vec<f32>) {
            self.enqueued
                .lock()
                .unwrap()
                .push((id, start_secs, samples.len()));
        }

        fn cancel_all(&self) {
            *self.cancels.lock().unwrap() += 1;
        }
    }

    struct OkHandler;

    #[async_trait::async_trait]
    impl ToolHandler for OkHandler {
        async fn handle(&self, _invocation: &ToolInvocation) -> anyhow::Result<String> {
            Ok("Research started.".into())
        }
    }

    struct FailingHandler;

    #[async_trait::async_trait]
    impl ToolHandler for FailingHandler {
        async fn handle(&self, _invocation: &ToolInvocation) -> anyhow::Result<String> {
            anyhow::bail!("collaborator offline")
        }
    }

    struct SlowHandler;

    #[async_trait::async_trait]
    impl ToolHandler for SlowHandler {
        async fn handle(&self, _invocation: &ToolInvocation) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("late".into())
        }
    }

    struct Harness {
        core: EngineCore,
        link: Arc<MockLink>,
        sink: Arc<MockSink>,
    }

    fn harness_with(handler: Arc<dyn ToolHandler>, config: SessionConfig) -> Harness {
        let link = Arc::new(MockLink::default());
        let sink = Arc::new(MockSink::default());
        let (snapshot_tx, _snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (ui_tx, _) = broadcast::channel(UI_CHANNEL_SIZE);

        let core = EngineCore {
            state: SessionState::Listening,
            scheduler: GaplessScheduler::new(),
            silence: SilenceTracker::new(&config.silence),
            transcript: TranscriptWindow::default(),
            link: Arc::clone(&link) as Arc<dyn OutboundLink>,
            playback: Arc::clone(&sink) as Arc<dyn PlaybackSink>,
            tools: handler,
            snapshot_tx,
            ui_tx,
            guard: Arc::new(SessionGuard::new()),
            cancel: CancellationToken::new(),
            config,
        };
        Harness { core, link, sink }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(OkHandler), SessionConfig::default())
    }

    fn frame(rms: f32, gate_open: bool, captured_at: Instant) -> CapturedFrame {
        let level = if gate_open { rms } else { 0.0 };
        CapturedFrame {
            samples: vec![level; 64],
            rms,
            gate_open,
            captured_at,
        }
    }

    fn chunk(duration_secs: f64) -> InboundAudio {
        InboundAudio {
            samples: vec![0.1; (24_000.0 * duration_secs) as usize],
            sample_rate: 24_000,
            channels: 1,
        }
    }

    #[test]
    fn one_second_chunk_schedules_at_zero_and_completes() {
        let mut h = harness();
        assert_eq!(h.core.state, SessionState::Listening);

        // One 1.0s chunk on an output clock reading 0.
        let _ = h.core.on_link(LinkEvent::Audio(chunk(1.0)));

        let enqueued = h.sink.enqueued.lock().unwrap().clone();
        assert_eq!(enqueued.len(), 1);
        let (id, start, len) = enqueued[0];
        assert_eq!(start, 0.0);
        assert_eq!(len, 24_000);
        assert_eq!(h.core.state, SessionState::Speaking);
        assert_eq!(h.core.scheduler.active_count(), 1);

        // Natural completion at t=1.0 with no further input.
        h.sink.set_clock(1.0);
        h.core.on_completed(id);
        assert_eq!(h.core.state, SessionState::Listening);
        assert_eq!(h.core.scheduler.active_count(), 0);
    }

    #[test]
    fn chunks_are_scheduled_gapless() {
        let mut h = harness();
        let _ = h.core.on_link(LinkEvent::Audio(chunk(1.0)));
        h.sink.set_clock(0.2);
        let _ = h.core.on_link(LinkEvent::Audio(chunk(0.5)));

        let enqueued = h.sink.enqueued.lock().unwrap().clone();
        assert_eq!(enqueued[0].1, 0.0);
        assert!((enqueued[1].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn barge_in_cancels_in_the_same_tick() {
        let mut h = harness();
        let _ = h.core.on_link(LinkEvent::Audio(chunk(1.0)));
        assert_eq!(h.core.state, SessionState::Speaking);

        // RMS 0.08 exceeds the 0.05 interruption threshold.
        h.sink.set_clock(0.4);
        h.core.on_frame(frame(0.08, true, Instant::now()));

        assert_eq!(*h.sink.cancels.lock().unwrap(), 1);
        assert_eq!(h.core.scheduler.active_count(), 0);
        assert_eq!(h.core.state, SessionState::Listening);
        // The triggering frame still reaches the link un-zeroed.
        let sent = h.link.audio.lock().unwrap();
        assert!(sent.last().unwrap().iter().any(|&s| s != 0.0));
    }

    #[test]
    fn barge_in_twice_is_idempotent() {
        let mut h = harness();
        let _ = h.core.on_link(LinkEvent::Audio(chunk(1.0)));
        h.sink.set_clock(0.4);
        h.core.on_frame(frame(0.08, true, Instant::now()));
        h.core.on_frame(frame(0.09, true, Instant::now()));

        assert_eq!(h.core.scheduler.active_count(), 0);
        // next_start reset exactly once, to the clock at cancellation.
        assert!((h.core.scheduler.next_start() - 0.4).abs() < 1e-9);
        assert_eq!(h.core.state, SessionState::Listening);
    }

    #[test]
    fn remote_interrupt_takes_the_same_path_as_barge_in() {
        let mut h = harness();
        let _ = h.core.on_link(LinkEvent::Audio(chunk(1.0)));
        h.sink.set_clock(0.3);

        assert!(h.core.on_link(LinkEvent::Interrupted).is_continue());
        assert_eq!(*h.sink.cancels.lock().unwrap(), 1);
        assert_eq!(h.core.scheduler.active_count(), 0);
        assert_eq!(h.core.state, SessionState::Listening);
    }

    #[test]
    fn quiet_frames_while_speaking_are_zeroed_for_transport() {
        let mut h = harness();
        let _ = h.core.on_link(LinkEvent::Audio(chunk(1.0)));

        // Gate-open speech below the interruption threshold: measured but
        // never echoed upstream.
        h.core.on_frame(frame(0.02, true, Instant::now()));
        let sent = h.link.audio.lock().unwrap();
        assert!(sent.last().unwrap().iter().all(|&s| s == 0.0));
        assert_eq!(h.core.state, SessionState::Speaking);
    }

    #[test]
    fn silence_timeout_escalates_to_processing() {
        let mut config = SessionConfig::default();
        config.silence.max_silence_ms = 3000;
        let mut h = harness_with(Arc::new(OkHandler), config);

        let start = Instant::now();
        h.core.silence.reset(start);
        h.core
            .on_frame(frame(0.001, false, start + Duration::from_millis(2999)));
        assert_eq!(h.core.state, SessionState::Listening);

        h.core
            .on_frame(frame(0.001, false, start + Duration::from_millis(3001)));
        assert_eq!(h.core.state, SessionState::Processing);
    }

    #[test]
    fn voice_activity_defers_silence_escalation() {
        let mut config = SessionConfig::default();
        config.silence.max_silence_ms = 1000;
        config.gate.level = GateLevel::Medium;
        let mut h = harness_with(Arc::new(OkHandler), config);

        let start = Instant::now();
        h.core.silence.reset(start);
        // Voice at 900ms restarts the window.
        h.core
            .on_frame(frame(0.02, true, start + Duration::from_millis(900)));
        h.core
            .on_frame(frame(0.001, false, start + Duration::from_millis(1500)));
        assert_eq!(h.core.state, SessionState::Listening);
    }

    #[test]
    fn inbound_messages_reset_the_silence_window() {
        let mut config = SessionConfig::default();
        config.silence.max_silence_ms = 1000;
        let mut h = harness_with(Arc::new(OkHandler), config);

        let start = Instant::now();
        h.core.silence.reset(start);
        // A transcript fragment arrives: activity.
        assert!(
            h.core
                .on_link(LinkEvent::Transcript("hello".into()))
                .is_continue()
        );
        // Well past the original window, but within the reset one.
        h.core
            .on_frame(frame(0.001, false, Instant::now() + Duration::from_millis(500)));
        assert_eq!(h.core.state, SessionState::Listening);
    }

    #[test]
    fn disabled_silence_heuristic_never_escalates() {
        let mut config = SessionConfig::default();
        config.silence = SilenceConfig {
            enabled: false,
            max_silence_ms: 10,
        };
        let mut h = harness_with(Arc::new(OkHandler), config);

        let start = Instant::now();
        h.core.silence.reset(start);
        h.core
            .on_frame(frame(0.001, false, start + Duration::from_secs(60)));
        assert_eq!(h.core.state, SessionState::Listening);
    }

    #[test]
    fn transcript_fragments_are_windowed() {
        let mut h = harness();
        for text in ["one", "two", "three", "four", "five"] {
            let _ = h.core.on_link(LinkEvent::Transcript(text.into()));
        }
        assert_eq!(
            h.core.transcript.fragments(),
            vec!["two", "three", "four", "five"]
        );
    }

    #[test]
    fn error_and_close_break_from_every_state() {
        for make_state in [
            SessionState::Listening,
            SessionState::Processing,
            SessionState::Speaking,
        ] {
            let mut h = harness();
            if make_state == SessionState::Speaking {
                let _ = h.core.on_link(LinkEvent::Audio(chunk(1.0)));
            } else if make_state == SessionState::Processing {
                h.core.set_state(SessionState::Processing);
            }
            assert_eq!(h.core.state, make_state);

            assert!(matches!(
                h.core.on_link(LinkEvent::Error("boom".into())),
                ControlFlow::Break(Some(_))
            ));
            h.core.teardown(Some("boom".into()));
            assert_eq!(h.core.state, SessionState::Idle);
            assert_eq!(h.core.scheduler.active_count(), 0);
            assert!(*h.link.closed.lock().unwrap());
            assert!(h.core.cancel.is_cancelled());
        }

        let mut h = harness();
        assert!(matches!(
            h.core.on_link(LinkEvent::Closed),
            ControlFlow::Break(None)
        ));
    }

    #[test]
    fn teardown_invalidates_the_guard_first() {
        let mut h = harness();
        let token = h.core.guard.token();
        h.core.teardown(None);
        assert!(!h.core.guard.is_current(token));
    }

    async fn wait_for_tool_results(link: &MockLink, expected: usize) {
        for _ in 0..100 {
            if link.tool_results.lock().unwrap().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn tool_call_produces_exactly_one_result() {
        let mut h = harness();
        let call = ToolInvocation {
            id: "1".into(),
            name: "research_topic".into(),
            args: serde_json::json!({"topic": "x"}),
        };
        assert!(h.core.on_link(LinkEvent::ToolCalls(vec![call])).is_continue());
        assert_eq!(h.core.state, SessionState::Processing);

        wait_for_tool_results(&h.link, 1).await;
        // Give any spurious second send a chance to land.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let results = h.link.tool_results.lock().unwrap().clone();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "1");
        assert_eq!(results[0].2, "Research started.");
    }

    #[tokio::test]
    async fn failing_handler_degrades_to_fallback_result() {
        let mut h = harness_with(Arc::new(FailingHandler), SessionConfig::default());
        let call = ToolInvocation {
            id: "7".into(),
            name: "research_topic".into(),
            args: serde_json::json!({"topic": "x"}),
        };
        let _ = h.core.on_link(LinkEvent::ToolCalls(vec![call]));

        wait_for_tool_results(&h.link, 1).await;
        let results = h.link.tool_results.lock().unwrap().clone();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].2, FALLBACK_TOOL_RESULT);
    }

    #[tokio::test]
    async fn stale_tool_results_are_discarded_after_teardown() {
        let mut h = harness_with(Arc::new(SlowHandler), SessionConfig::default());
        let call = ToolInvocation {
            id: "9".into(),
            name: "research_topic".into(),
            args: serde_json::json!({"topic": "x"}),
        };
        let _ = h.core.on_link(LinkEvent::ToolCalls(vec![call]));
        // Teardown lands while the handler is still running; the late
        // result must not touch the link.
        h.core.guard.invalidate();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.link.tool_results.lock().unwrap().is_empty());
    }

    #[test]
    fn stereo_inbound_audio_is_downmixed() {
        let mut h = harness();
        let _ = h.core.on_link(LinkEvent::Audio(InboundAudio {
            samples: vec![0.1; 48_000],
            sample_rate: 24_000,
            channels: 2,
        }));
        let enqueued = h.sink.enqueued.lock().unwrap().clone();
        // 1 second of stereo at 24kHz -> 24000 mono output samples.
        assert_eq!(enqueued[0].2, 24_000);
    }
}
