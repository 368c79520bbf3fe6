//! Selkie: real-time duplex voice session engine for the research concierge.
//!
//! Captures microphone audio, gates and filters it locally, streams it to a
//! remote voice model over a bidirectional link, and schedules the returned
//! audio for gapless playback with immediate barge-in cancellation.
//!
//! # Architecture
//!
//! One engine loop consumes a single merged event channel fed by three
//! producers:
//! - **Capture**: cpal microphone callback → high-pass filter → noise gate →
//!   fixed-size frames
//! - **Link**: WebSocket session with the remote model (audio out, audio /
//!   transcripts / tool calls in)
//! - **Renderer**: cpal output callback mixing gapless-scheduled sources on
//!   the output clock
//!
//! The loop owns the authoritative session state (`idle`, `listening`,
//! `processing`, `speaking`); the UI layer reads snapshots and events but
//! never mutates.

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod link;
pub mod session;
pub mod tools;
pub mod transcript;

pub use config::{GateLevel, SessionConfig};
pub use error::{Result, SessionError};
pub use events::{SessionEvent, SessionSnapshot, SessionState};
pub use link::{LinkEvent, LiveLink};
pub use session::{CompetingOutput, SessionOptions, VoiceSession};
pub use tools::{ToolDeclaration, ToolHandler, ToolInvocation, research_topic_declaration};
