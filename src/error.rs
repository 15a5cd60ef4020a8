//! Error types for stillwater.
//!
//! One crate-wide `Error` with a nested enum per subsystem, so callers can
//! match on the failure they care about and bubble the rest with `?`.

use thiserror::Error;

/// Result type alias for stillwater operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// No API key in the environment.
    #[error("no API key found in ${var}")]
    MissingCredential { var: String },

    /// An API key is present but unusable.
    #[error("invalid API key: {0}")]
    InvalidCredential(String),

    /// The Messages API answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport failure before a response arrived.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("speech error: {0}")]
    Speech(#[from] SpeechError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("viewport error: {0}")]
    Viewport(#[from] ViewportError),

    #[error("configuration error: {message}")]
    Config { message: String },
}

/// Failures of the speech controller and its platforms.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpeechError {
    /// The host has no usable speech-synthesis facility.
    #[error("speech synthesis is not supported on this platform")]
    Unsupported,

    /// The platform reported an error while playing an utterance.
    #[error("playback failed: {0}")]
    Playback(String),

    /// The utterance was cancelled by `stop` or a newer `speak`.
    #[error("playback interrupted")]
    Interrupted,

    /// The backend could not be initialised.
    #[error("speech backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    /// The write would push the store over its capacity ceiling.
    #[error("quota exceeded: write needs {requested} bytes, limit is {limit}")]
    QuotaExceeded { requested: usize, limit: usize },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewportError {
    #[error("invalid media query '{query}': {reason}")]
    InvalidQuery { query: String, reason: String },
}
