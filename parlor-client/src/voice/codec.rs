//! Codec transforms run inside codec workers
//!
//! The pipeline treats a codec as an opaque stateful transform: PCM frames in,
//! packets out (or the reverse). Opus is the only codec with a built-in
//! implementation; other codecs plug in through [`CodecFactory`].

use opus::{Application, Bitrate, Channels, Decoder, Encoder};
use parlor_common::codec::WorkerRole;
use parlor_common::voice::{Codec, FRAME_LEN, VOICE_SAMPLE_RATE};

use crate::error::VoiceError;

// =============================================================================
// Constants
// =============================================================================

/// Maximum encoded frame size in bytes
/// At 96kbps with 20ms frames: 96000 * 0.020 / 8 = 240 bytes typical
const MAX_ENCODED_FRAME_SIZE: usize = 512;

/// Longest frame a single Opus packet can carry (120ms at 48kHz)
const MAX_DECODED_FRAME: usize = 5760;

// =============================================================================
// Transform Seam
// =============================================================================

/// Stateful codec instance owned by exactly one worker
pub trait CodecTransform: Send {
    /// Compress one frame of interleaved samples at `bitrate` bits per second
    fn encode(&mut self, samples: &[f32], bitrate: i32) -> Result<Vec<u8>, VoiceError>;

    /// Decompress one packet, or conceal a lost one when `packet` is `None`
    fn decode(&mut self, packet: Option<&[u8]>) -> Result<Vec<f32>, VoiceError>;

    /// Channel count of the PCM side
    fn channels(&self) -> u16;
}

/// Creates codec state for a worker
pub trait CodecFactory: Send + Sync {
    fn create(
        &self,
        role: WorkerRole,
        codec: Codec,
        channels: u16,
    ) -> Result<Box<dyn CodecTransform>, VoiceError>;
}

// =============================================================================
// Opus
// =============================================================================

/// Factory for [`OpusTransform`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct OpusFactory;

impl CodecFactory for OpusFactory {
    fn create(
        &self,
        role: WorkerRole,
        codec: Codec,
        channels: u16,
    ) -> Result<Box<dyn CodecTransform>, VoiceError> {
        if codec != Codec::Opus {
            return Err(VoiceError::Codec(format!(
                "{} is not supported",
                codec.wire_name()
            )));
        }
        let transform = match role {
            WorkerRole::Encoder => OpusTransform::encoder(channels)?,
            WorkerRole::Decoder => OpusTransform::decoder(channels)?,
        };
        Ok(Box::new(transform))
    }
}

fn opus_channels(channels: u16) -> Result<Channels, VoiceError> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        n => Err(VoiceError::Codec(format!("Opus cannot handle {} channels", n))),
    }
}

/// Opus encoder or decoder
pub enum OpusTransform {
    Encoder {
        encoder: Encoder,
        /// Bitrate last applied to the encoder
        bitrate: Option<i32>,
        channels: u16,
    },
    Decoder {
        decoder: Decoder,
        channels: u16,
    },
}

impl OpusTransform {
    /// Create an encoder tuned for voice
    pub fn encoder(channels: u16) -> Result<Self, VoiceError> {
        let encoder = Encoder::new(VOICE_SAMPLE_RATE, opus_channels(channels)?, Application::Voip)
            .map_err(|e| VoiceError::Codec(format!("Failed to create Opus encoder: {}", e)))?;
        Ok(OpusTransform::Encoder {
            encoder,
            bitrate: None,
            channels,
        })
    }

    pub fn decoder(channels: u16) -> Result<Self, VoiceError> {
        let decoder = Decoder::new(VOICE_SAMPLE_RATE, opus_channels(channels)?)
            .map_err(|e| VoiceError::Codec(format!("Failed to create Opus decoder: {}", e)))?;
        Ok(OpusTransform::Decoder { decoder, channels })
    }
}

impl CodecTransform for OpusTransform {
    fn encode(&mut self, samples: &[f32], bitrate: i32) -> Result<Vec<u8>, VoiceError> {
        let OpusTransform::Encoder {
            encoder,
            bitrate: current,
            channels,
        } = self
        else {
            return Err(VoiceError::Codec("a decoder cannot encode".into()));
        };

        let expected = FRAME_LEN * *channels as usize;
        if samples.len() != expected {
            return Err(VoiceError::Codec(format!(
                "Expected {} samples, got {}",
                expected,
                samples.len()
            )));
        }

        // Only touch the encoder when the quality actually changed
        if *current != Some(bitrate) {
            encoder
                .set_bitrate(Bitrate::Bits(bitrate))
                .map_err(|e| VoiceError::Codec(format!("Failed to set bitrate: {}", e)))?;
            *current = Some(bitrate);
        }

        let mut output = vec![0u8; MAX_ENCODED_FRAME_SIZE];
        let len = encoder
            .encode_float(samples, &mut output)
            .map_err(|e| VoiceError::Codec(format!("Opus encode error: {}", e)))?;
        output.truncate(len);
        Ok(output)
    }

    fn decode(&mut self, packet: Option<&[u8]>) -> Result<Vec<f32>, VoiceError> {
        let OpusTransform::Decoder { decoder, channels } = self else {
            return Err(VoiceError::Codec("an encoder cannot decode".into()));
        };
        let channels = *channels as usize;

        let decoded = match packet {
            Some(data) => {
                let mut output = vec![0f32; MAX_DECODED_FRAME * channels];
                decoder
                    .decode_float(data, &mut output, false)
                    .map(|len| {
                        output.truncate(len * channels);
                        output
                    })
                    .map_err(|e| VoiceError::Codec(format!("Opus decode error: {}", e)))?
            }
            None => {
                // Concealment length is taken from the output buffer: one frame
                let mut output = vec![0f32; FRAME_LEN * channels];
                decoder
                    .decode_float(&[], &mut output, true)
                    .map(|len| {
                        output.truncate(len * channels);
                        output
                    })
                    .map_err(|e| VoiceError::Codec(format!("Opus PLC error: {}", e)))?
            }
        };
        Ok(decoded)
    }

    fn channels(&self) -> u16 {
        match self {
            OpusTransform::Encoder { channels, .. } | OpusTransform::Decoder { channels, .. } => {
                *channels
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
