//! Observability events and snapshots published by the session engine.
//!
//! This is intentionally lightweight (no heavy payloads) so the engine can
//! publish without blocking the audio paths. The UI layer reads these
//! projections; it never mutates session state.

/// The single authoritative session state.
///
/// Mutated only by the engine loop. `Speaking` holds iff the active
/// playback-source count is greater than zero; `Processing` is a transient
/// state entered via the silence-timeout heuristic or a tool-call arrival,
/// never by an explicit transport signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No active microphone or session resources.
    #[default]
    Idle,
    /// Session open, gate evaluation active, no output queued.
    Listening,
    /// The system is presumed to be reasoning (silence timeout or tool call).
    Processing,
    /// At least one playback source is active.
    Speaking,
}

/// Read-only projection of the session for UI rendering.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Current state.
    pub state: SessionState,
    /// Last measured capture RMS volume.
    pub last_rms: f32,
    /// Rolling transcript window, oldest first.
    pub transcript: Vec<String>,
    /// Short status message for display, if any.
    pub feedback: Option<String>,
}

/// Events describing what the session is doing "right now".
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// State transition.
    State(SessionState),
    /// A transcript fragment was received (already cleaned for display).
    Transcript(String),
    /// The remote requested a tool invocation.
    ToolCall {
        /// Invocation id (stable across call and result).
        id: String,
        name: String,
    },
    /// A tool result was relayed back to the remote.
    ToolResult {
        /// Invocation id this result corresponds to.
        id: String,
        name: String,
        /// False when the handler failed and the fallback result was sent.
        success: bool,
    },
    /// Playback was cancelled by local barge-in or a remote interrupt.
    Interrupted,
    /// The session ended; `error` carries the failure message if abnormal.
    Ended { error: Option<String> },
}
