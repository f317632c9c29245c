//! Error taxonomy for the live session pipeline.
//!
//! Only the fatal categories (`Auth`, `NotFound`) ever close a connection;
//! everything else is recovered locally and reported as a status signal so
//! the session keeps its authoritative slide position.

use thiserror::Error;

use crate::protocol::{CLOSE_AUTH_FAILED, CLOSE_NOT_FOUND};

/// Top-level error for session setup and the live message loop.
#[derive(Debug, Error)]
pub enum LiveError {
    /// Transient transport failure. Retried via backoff on the client side.
    #[error("connection error: {0}")]
    Connection(String),

    /// Bad or expired credentials. Terminal, closes with 4001.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Unknown or inaccessible presentation. Terminal, closes with 4004.
    #[error("presentation not found: {0}")]
    NotFound(String),

    /// Capture device failure. Fatal to the audio pipeline, not the session.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Transcription provider failure. The session stays open.
    #[error(transparent)]
    Stt(#[from] SttError),
}

impl LiveError {
    /// WebSocket close code for fatal categories, `None` for recoverable ones.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            LiveError::Auth(_) => Some(CLOSE_AUTH_FAILED),
            LiveError::NotFound(_) => Some(CLOSE_NOT_FOUND),
            _ => None,
        }
    }
}

/// Microphone acquisition failures, kept distinct so the UI can tell the
/// user what actually went wrong instead of a generic capture error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("no input device found")]
    NotFound,

    #[error("input device is busy or unavailable")]
    Busy,

    #[error("audio backend error: {0}")]
    Backend(String),
}

/// Speech-to-text failures. Transient: the next chunk is processed normally.
#[derive(Debug, Error)]
pub enum SttError {
    #[error("audio chunk too small ({size} bytes, minimum {min})")]
    ChunkTooSmall { size: usize, min: usize },

    #[error("audio chunk too large ({size} bytes, maximum {max})")]
    ChunkTooLarge { size: usize, max: usize },

    #[error("unsupported audio format '{0}'")]
    UnsupportedFormat(String),

    #[error("transcription provider error: {0}")]
    Provider(String),
}
