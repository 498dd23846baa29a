//! Error types for the visor assistant

use thiserror::Error;

/// Result type alias for visor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the visor assistant
#[derive(Debug, Error)]
pub enum Error {
    /// No candidate sample rate could be opened, or the device is busy
    #[error("audio device unavailable (tried rates: {tried:?})")]
    DeviceUnavailable {
        /// Sample rates tried before giving up
        tried: Vec<u32>,
    },

    /// Duplex connection closed while the session was running
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Malformed or unexpected protocol message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Tool execution failure
    #[error("tool error: {0}")]
    Tool(String),

    /// Error payload reported by the remote model
    #[error("model error {code}: {message}")]
    Model {
        /// Remote error code
        code: String,
        /// Human-readable message
        message: String,
    },

    /// Audio stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// Resampler construction or processing error
    #[error("resample error: {0}")]
    Resample(String),

    /// Microphone handoff invariant violated
    #[error("handoff error: {0}")]
    Handoff(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether this error breaks the device ownership invariant and
    /// requires a full reset of the owning component
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Handoff(_))
    }
}
