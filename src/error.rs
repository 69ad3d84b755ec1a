//! Error types for talkback

use thiserror::Error;

/// Result type alias for talkback operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in talkback
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Speech recognition is not supported on this system
    #[error("speech recognition unavailable: {0}")]
    RecognitionUnavailable(String),

    /// Speech recognition session error
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Remote exchange failed (transport or non-success status)
    #[error("communication failure: {0}")]
    Communication(String),

    /// Audio payload could not be prepared or played
    #[error("playback error: {0}")]
    Playback(String),

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
}
