//! Error taxonomy for tutoring sessions.
//!
//! Everything except [`TransportError`] is recoverable: the dispatcher turns
//! it into a short categorical error frame via [`FrameError::client_message`]
//! and the connection stays open.

use std::time::Duration;

use thiserror::Error;
use tutor_contracts::protocol::{
    ERROR_ALREADY_PENDING, ERROR_DECODE_FAILED, ERROR_INVALID_REQUEST, ERROR_NO_IMAGE,
    ERROR_PROCESSING_FAILED,
};

use crate::session::PendingTask;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("image payload is empty")]
    Empty,

    #[error("image payload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("image payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("image payload could not be decoded: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("frame is neither an image update nor a question")]
pub struct ProtocolError;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("question received before any image")]
pub struct NoImageError;

/// Returned by `Session::try_set_pending`; hands the rejected task back so
/// the caller can apply its pending policy.
#[derive(Debug, Error)]
#[error("generation {active} is already pending")]
pub struct AlreadyPendingError {
    pub active: u64,
    pub rejected: PendingTask,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation cancelled")]
    Cancelled,

    #[error("generation exceeded {0:?}")]
    TimedOut(Duration),

    #[error("generator panicked")]
    Panicked,

    #[error("generator returned an empty completion")]
    EmptyCompletion,

    #[error("generator unavailable: {0}")]
    Unavailable(String),

    #[error("generation failed: {0}")]
    Failed(String),
}

impl GenerationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Fatal for the session: the connection is torn down.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,
}

/// Any recoverable failure raised while handling one inbound frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    NoImage(#[from] NoImageError),

    #[error("generation already pending")]
    AlreadyPending,

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl FrameError {
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::Decode(_) => ERROR_DECODE_FAILED,
            Self::Protocol(_) => ERROR_INVALID_REQUEST,
            Self::NoImage(_) => ERROR_NO_IMAGE,
            Self::AlreadyPending => ERROR_ALREADY_PENDING,
            Self::Generation(_) => ERROR_PROCESSING_FAILED,
        }
    }
}

impl From<AlreadyPendingError> for FrameError {
    fn from(_: AlreadyPendingError) -> Self {
        Self::AlreadyPending
    }
}
