//! Voice pipeline errors

use std::time::Duration;

use parlor_common::bridge::EntityRef;
use parlor_common::codec::ResponseShapeError;
use parlor_common::voice::FrameSizeError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    /// The platform cannot provide an audio session at all; never retried
    #[error("audio is not supported on this platform: {0}")]
    Unsupported(String),

    /// The device context stayed suspended through every resume retry
    #[error("failed to resume audio after {attempts} attempts ({elapsed:?} of backoff): {last_error}")]
    ResumeExhausted {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },

    /// A collaborator answered with a message the protocol does not allow
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A mirror message referenced an id this side has never seen
    #[error("unknown entity: {0}")]
    UnknownEntity(EntityRef),

    /// Transmission was requested while self-muted
    #[error("tried to send audio while self-muted")]
    Muted,

    #[error("invalid audio frame: {0}")]
    InvalidFrame(#[from] FrameSizeError),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("codec error: {0}")]
    Codec(String),

    /// An operation was issued in a state where it has no meaning
    #[error("invalid device context state: {0}")]
    InvalidState(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The stream, worker or session was already shut down
    #[error("{0} is closed")]
    Closed(&'static str),
}

impl From<ResponseShapeError> for VoiceError {
    fn from(e: ResponseShapeError) -> Self {
        VoiceError::Protocol(e.to_string())
    }
}
