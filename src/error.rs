use thiserror::Error;

use crate::frame::DecodeError;

/// Failures a client can observe.
///
/// The `Display` text is the message sent back on the wire, so variants are
/// phrased for the remote caller rather than for the log.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A required request field was missing or empty.
    #[error("{0}")]
    Validation(&'static str),

    /// A frame or stats request named a session that is not registered.
    #[error("Session not found")]
    SessionNotFound,

    /// The frame payload could not be turned into an image.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The dispatch queue was full; the frame was skipped.
    #[error("queue full")]
    Overload,

    /// The detector raised while processing a single job.
    #[error("detector error: {0}")]
    Detector(String),
}

impl RelayError {
    /// Short machine-readable tag used by the REST surface.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "validation",
            RelayError::SessionNotFound => "session_not_found",
            RelayError::Decode(_) => "decode",
            RelayError::Overload => "overload",
            RelayError::Detector(_) => "detector",
        }
    }
}
