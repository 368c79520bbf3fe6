//! Error types for the voice session engine.

/// Top-level error type for the duplex voice session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Microphone permission denied or no input device present.
    ///
    /// Fatal to session start; never retried automatically.
    #[error("input device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The remote session could not be established.
    ///
    /// Fatal to that `open()` attempt; the caller may retry manually.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Mid-session link failure (network drop, protocol violation).
    ///
    /// Forces teardown to idle.
    #[error("transport error: {0}")]
    Transport(String),

    /// A malformed inbound audio chunk. The chunk is dropped and the
    /// session continues.
    #[error("decode error: {0}")]
    Decode(String),

    /// A tool result was sent for an id that is not outstanding.
    /// Dropped with a warning.
    #[error("no outstanding tool call with id {0}")]
    UnknownToolResultTarget(String),

    /// Audio device or stream error outside of session start.
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether this error forces a full teardown to idle.
    ///
    /// Non-fatal kinds are absorbed at their origin and logged; the session
    /// stays alive in a degraded state rather than crashing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable(_) | Self::ConnectionFailed(_) | Self::Transport(_)
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SessionError>;
