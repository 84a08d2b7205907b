//! Relay error taxonomy

use thiserror::Error;

use duet_core::IdError;

use crate::messages::ErrorCode;

/// Errors produced by the relay core
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("room not found")]
    RoomNotFound,

    #[error("peer not found")]
    PeerNotFound,

    /// The intended recipient has no live connection right now
    #[error("no connection")]
    NoConnection,

    #[error("room is full")]
    RoomFull,

    /// The socket did not accept the frame before the deadline; nothing was queued
    #[error("write timed out")]
    WriteTimeout,

    /// The socket accepted the frame but did not flush it before the deadline.
    /// The frame stays queued on that socket and may still be delivered.
    #[error("flush timed out")]
    FlushTimeout,

    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("id generation failed: {0}")]
    IdGeneration(#[from] IdError),
}

impl RelayError {
    /// Whether a failed relay should fall back to buffering.
    ///
    /// Only an absent recipient, or one whose socket never took the frame,
    /// qualifies. A frame already queued on the socket is not buffered again,
    /// so it cannot arrive twice.
    pub fn is_recipient_unavailable(&self) -> bool {
        matches!(self, RelayError::NoConnection | RelayError::WriteTimeout)
    }
}

impl From<&RelayError> for ErrorCode {
    fn from(e: &RelayError) -> Self {
        match e {
            RelayError::RoomNotFound => ErrorCode::RoomNotFound,
            RelayError::PeerNotFound => ErrorCode::PeerNotFound,
            RelayError::RoomFull => ErrorCode::RoomFull,
            RelayError::NoConnection
            | RelayError::WriteTimeout
            | RelayError::FlushTimeout
            | RelayError::Transport(_)
            | RelayError::Serialization(_)
            | RelayError::IdGeneration(_) => ErrorCode::InternalError,
        }
    }
}
