//! Codec worker message protocol
//!
//! Codec workers run in their own execution units and only ever see these
//! messages. Sample and packet buffers are moved into a request and moved back
//! out in the response; neither side keeps a reference to a buffer it has sent.
//!
//! Request shapes:
//! ```text
//! encode<codec>  { target, buffer, channels, bitrate, position }
//! decode<codec>  { buffer | none, target, position }
//! reset          {}
//! ```
//!
//! Response shapes:
//! ```text
//! encoded        { target, buffer, byte_offset, byte_length, position }
//! encoder reset  { reset: true }
//! decoded        { target, buffer, channels, position }
//! decoder reset  { action: "reset" }
//! ```

use std::fmt;

use crate::voice::{Codec, VoiceTarget};

/// Which side of the pipeline a worker serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    /// Compresses outgoing microphone frames
    Encoder,
    /// Decompresses incoming packets for playback
    Decoder,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRole::Encoder => write!(f, "encoder"),
            WorkerRole::Decoder => write!(f, "decoder"),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Message posted to a codec worker
#[derive(Debug, Clone, PartialEq)]
pub enum CodecRequest {
    /// Compress one frame of PCM samples
    Encode {
        codec: Codec,
        target: VoiceTarget,
        buffer: Vec<f32>,
        channels: u16,
        bitrate: i32,
        position: u64,
    },
    /// Decompress one packet; `None` asks for packet loss concealment
    Decode {
        codec: Codec,
        buffer: Option<Vec<u8>>,
        target: VoiceTarget,
        position: u64,
    },
    /// Drop all codec state and acknowledge
    Reset,
}

impl CodecRequest {
    /// Action name as it appears on the wire (`encodeOpus`, `decodeCELT_Alpha`, `reset`)
    pub fn action(&self) -> String {
        match self {
            CodecRequest::Encode { codec, .. } => format!("encode{}", codec.wire_name()),
            CodecRequest::Decode { codec, .. } => format!("decode{}", codec.wire_name()),
            CodecRequest::Reset => "reset".to_string(),
        }
    }

    /// Whether this is the reset request of the recycle protocol
    pub fn is_reset(&self) -> bool {
        matches!(self, CodecRequest::Reset)
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Message posted back by a codec worker
#[derive(Debug, Clone, PartialEq)]
pub enum CodecResponse {
    /// Compressed packet; the payload is `buffer[byte_offset..byte_offset + byte_length]`
    Encoded {
        target: VoiceTarget,
        buffer: Vec<u8>,
        byte_offset: usize,
        byte_length: usize,
        position: u64,
    },
    /// Encoder acknowledged a reset (`{reset: true}`)
    EncoderReset,
    /// Decoded PCM samples, interleaved when `channels > 1`
    Decoded {
        target: VoiceTarget,
        buffer: Vec<f32>,
        channels: u16,
        position: u64,
    },
    /// Decoder acknowledged a reset (`{action: "reset"}`)
    DecoderReset,
}

/// Why a response could not be accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseShapeError {
    /// The encoded payload range lies outside the returned buffer
    PayloadOutOfBounds { offset: usize, length: usize, buffer: usize },
    /// Decoded samples claim zero channels or do not divide into whole frames
    BadChannelLayout { channels: u16, samples: usize },
    /// A response of the wrong role arrived (e.g. `decoded` from an encoder)
    WrongRole { expected: WorkerRole },
}

impl fmt::Display for ResponseShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseShapeError::PayloadOutOfBounds {
                offset,
                length,
                buffer,
            } => write!(
                f,
                "encoded payload of {} bytes at offset {} outside buffer of {} bytes",
                length, offset, buffer
            ),
            ResponseShapeError::BadChannelLayout { channels, samples } => write!(
                f,
                "{} decoded samples cannot be split into {} channels",
                samples, channels
            ),
            ResponseShapeError::WrongRole { expected } => {
                write!(f, "unexpected response for an {} worker", expected)
            }
        }
    }
}

impl std::error::Error for ResponseShapeError {}

impl CodecResponse {
    /// Role of the worker that produced this response
    pub fn role(&self) -> WorkerRole {
        match self {
            CodecResponse::Encoded { .. } | CodecResponse::EncoderReset => WorkerRole::Encoder,
            CodecResponse::Decoded { .. } | CodecResponse::DecoderReset => WorkerRole::Decoder,
        }
    }

    /// Whether this acknowledges a reset request
    pub fn is_reset_ack(&self) -> bool {
        matches!(
            self,
            CodecResponse::EncoderReset | CodecResponse::DecoderReset
        )
    }

    /// The reset acknowledgment a worker of `role` answers with
    pub fn reset_ack(role: WorkerRole) -> Self {
        match role {
            WorkerRole::Encoder => CodecResponse::EncoderReset,
            WorkerRole::Decoder => CodecResponse::DecoderReset,
        }
    }

    /// Check that the response is well formed and comes from a worker of `expected` role
    pub fn validate(&self, expected: WorkerRole) -> Result<(), ResponseShapeError> {
        if self.role() != expected {
            return Err(ResponseShapeError::WrongRole { expected });
        }

        match self {
            CodecResponse::Encoded {
                buffer,
                byte_offset,
                byte_length,
                ..
            } => {
                let in_bounds = byte_offset
                    .checked_add(*byte_length)
                    .is_some_and(|end| end <= buffer.len());
                if !in_bounds {
                    return Err(ResponseShapeError::PayloadOutOfBounds {
                        offset: *byte_offset,
                        length: *byte_length,
                        buffer: buffer.len(),
                    });
                }
            }
            CodecResponse::Decoded {
                buffer, channels, ..
            } => {
                if *channels == 0 || buffer.len() % *channels as usize != 0 {
                    return Err(ResponseShapeError::BadChannelLayout {
                        channels: *channels,
                        samples: buffer.len(),
                    });
                }
            }
            CodecResponse::EncoderReset | CodecResponse::DecoderReset => {}
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
