//! Voice audio constants and frame types
//!
//! Everything that crosses a stage boundary in the voice pipeline (capture,
//! activation, codec workers, transport) is expressed in terms of the types in
//! this module. Frames are always exactly one 20ms block of mono audio.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sample rate for voice audio (48kHz, required by Opus)
pub const VOICE_SAMPLE_RATE: u32 = 48000;

/// Frame duration in milliseconds (20ms is standard for voice)
pub const VOICE_FRAME_DURATION_MS: u32 = 20;

/// Number of samples per frame at 48kHz with 20ms frames
pub const VOICE_SAMPLES_PER_FRAME: u32 = VOICE_SAMPLE_RATE * VOICE_FRAME_DURATION_MS / 1000;

/// Number of audio channels (mono)
pub const VOICE_CHANNELS: u16 = 1;

/// Frame length as a `usize` for buffer arithmetic
pub const FRAME_LEN: usize = VOICE_SAMPLES_PER_FRAME as usize;

// =============================================================================
// Voice Quality
// =============================================================================

/// Voice quality presets (Opus bitrate in bits per second)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VoiceQuality {
    /// Low quality: 16 kbps - minimal bandwidth usage
    Low = 16000,
    /// Medium quality: 32 kbps - good balance
    Medium = 32000,
    /// High quality: 64 kbps - recommended default
    #[default]
    High = 64000,
    /// Very high quality: 96 kbps - best quality
    VeryHigh = 96000,
}

impl VoiceQuality {
    /// Get the bitrate in bits per second
    pub fn bitrate(self) -> i32 {
        self as i32
    }

    /// Get all quality levels
    pub fn all() -> &'static [VoiceQuality] {
        &[
            VoiceQuality::Low,
            VoiceQuality::Medium,
            VoiceQuality::High,
            VoiceQuality::VeryHigh,
        ]
    }
}

// =============================================================================
// Voice Target
// =============================================================================

/// Who a frame of outgoing audio is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VoiceTarget {
    /// Regular talking in the current channel
    #[default]
    Normal,
    /// Shout to linked channels
    Shout,
    /// Whisper to a preconfigured set of users or channels
    Whisper,
}

impl fmt::Display for VoiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceTarget::Normal => write!(f, "normal"),
            VoiceTarget::Shout => write!(f, "shout"),
            VoiceTarget::Whisper => write!(f, "whisper"),
        }
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Codec a stream is compressed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Codec {
    /// Opus (the only codec negotiated by current servers)
    #[default]
    Opus,
    /// Legacy CELT 0.7 bitstream
    #[serde(rename = "CELT_Alpha")]
    CeltAlpha,
}

impl Codec {
    /// Name used as the suffix of worker actions (e.g. `encodeOpus`)
    pub fn wire_name(self) -> &'static str {
        match self {
            Codec::Opus => "Opus",
            Codec::CeltAlpha => "CELT_Alpha",
        }
    }
}

// =============================================================================
// Audio Frame
// =============================================================================

/// Returned when a buffer of the wrong length is turned into a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSizeError {
    /// Number of samples the buffer actually held
    pub got: usize,
}

impl fmt::Display for FrameSizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {} samples per frame, got {}", FRAME_LEN, self.got)
    }
}

impl std::error::Error for FrameSizeError {}

/// One 20ms block of mono audio
///
/// The sample buffer is private so a frame can never hold anything other than
/// [`FRAME_LEN`] samples. Frames are never partial on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    /// Who the frame is addressed to
    pub target: VoiceTarget,
    /// Monotonic frame sequence number within the capture stream
    pub position: u64,
}

impl AudioFrame {
    /// Create a frame from exactly [`FRAME_LEN`] samples
    pub fn new(
        samples: Vec<f32>,
        target: VoiceTarget,
        position: u64,
    ) -> Result<Self, FrameSizeError> {
        if samples.len() != FRAME_LEN {
            return Err(FrameSizeError { got: samples.len() });
        }
        Ok(Self {
            samples,
            target,
            position,
        })
    }

    /// A frame of digital silence
    pub fn silence(target: VoiceTarget, position: u64) -> Self {
        Self {
            samples: vec![0.0; FRAME_LEN],
            target,
            position,
        }
    }

    /// Borrow the samples
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Give up the sample buffer (used when transferring it to a codec worker)
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    /// Return the same frame addressed to a different target
    pub fn with_target(mut self, target: VoiceTarget) -> Self {
        self.target = target;
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
