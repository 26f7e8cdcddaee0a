//! Error types for the sync engine.

use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("No subscription registered for key: {0}")]
    NotRegistered(String),

    #[error("No async runtime available")]
    NoRuntime,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },
}

/// Error produced by a single fetch.
///
/// Cloneable so every caller waiting on a shared fetch receives the same
/// outcome.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Network-level failure; retried with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx response other than 401.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// 401 response that could not be recovered.
    #[error("unauthorized")]
    Unauthorized,

    /// The session was terminated; no further requests are issued.
    #[error("session expired")]
    SessionExpired,

    /// Response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The fetch was overtaken by an invalidation and its result discarded.
    #[error("fetch superseded by a newer generation")]
    Superseded,
}

impl FetchError {
    /// Whether the cache retry loop should try again after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            FetchError::Decode(_) => false,
            FetchError::Unauthorized | FetchError::SessionExpired | FetchError::Superseded => {
                false
            }
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
