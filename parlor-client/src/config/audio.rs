//! Audio settings for voice chat
//!
//! Configuration for the voice pipeline including device selection, voice
//! quality, activation mode, push-to-talk binding and device session tuning.

use parlor_common::voice::{Codec, VOICE_SAMPLE_RATE, VoiceQuality};
use serde::{Deserialize, Serialize};

use crate::error::VoiceError;
use crate::logging::LoggingSettings;
use crate::voice::ptt::parse_key_code;

// =============================================================================
// Constants
// =============================================================================

/// Default PTT key (backtick)
pub const DEFAULT_PTT_KEY: &str = "`";

/// System default device identifier
pub const SYSTEM_DEFAULT_DEVICE: &str = "";

/// Default number of resume attempts before giving up
pub const DEFAULT_RESUME_ATTEMPTS: u32 = 5;

/// Default backoff after the first failed resume (doubles after each further failure)
pub const DEFAULT_RESUME_BASE_DELAY_MS: u64 = 100;

/// Default ceiling on concurrently live codec workers per pool
pub const DEFAULT_MAX_WORKERS: usize = 8;

// =============================================================================
// Activation Mode
// =============================================================================

/// How outgoing voice is gated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    /// Transmit whenever not muted
    #[default]
    Continuous,
    /// Transmit only while the push-to-talk control is active
    PushToTalk,
}

// =============================================================================
// PTT Mode
// =============================================================================

/// Push-to-talk activation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PttMode {
    /// Hold key to talk, release to stop
    #[default]
    Hold,
    /// Press to start talking, press again to stop
    Toggle,
}

impl PttMode {
    /// All PTT modes for the picker
    pub const ALL: &'static [PttMode] = &[PttMode::Hold, PttMode::Toggle];
}

// =============================================================================
// Device Context
// =============================================================================

/// Latency/power trade-off requested from the platform audio session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyHint {
    /// Lowest latency the device offers
    #[default]
    Interactive,
    /// Platform default buffering
    Balanced,
    /// Large buffers, lowest power
    Playback,
}

/// Parameters the shared audio device session is created with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceContextConfig {
    /// Output device name (empty string = system default)
    #[serde(default)]
    pub output_device: String,

    /// Sample rate of the session in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default)]
    pub latency: LatencyHint,
}

fn default_sample_rate() -> u32 {
    VOICE_SAMPLE_RATE
}

impl Default for DeviceContextConfig {
    fn default() -> Self {
        Self {
            output_device: SYSTEM_DEFAULT_DEVICE.to_string(),
            sample_rate: default_sample_rate(),
            latency: LatencyHint::default(),
        }
    }
}

/// Backoff applied when resuming a suspended device session fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Platform resume calls made before giving up, the first one included
    #[serde(default = "default_resume_attempts")]
    pub max_attempts: u32,

    /// Backoff after the first failure; each further failure doubles it
    #[serde(default = "default_resume_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_resume_attempts() -> u32 {
    DEFAULT_RESUME_ATTEMPTS
}

fn default_resume_base_delay_ms() -> u64 {
    DEFAULT_RESUME_BASE_DELAY_MS
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RESUME_ATTEMPTS,
            base_delay_ms: DEFAULT_RESUME_BASE_DELAY_MS,
        }
    }
}

// =============================================================================
// Audio Settings
// =============================================================================

/// Audio settings for voice chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Input device name (empty string = system default)
    #[serde(default)]
    pub input_device: String,

    /// Output device session parameters
    #[serde(default)]
    pub device: DeviceContextConfig,

    /// Voice quality preset (affects Opus bitrate)
    #[serde(default)]
    pub voice_quality: VoiceQuality,

    /// Codec used for outgoing audio
    #[serde(default)]
    pub codec: Codec,

    /// Continuous transmission or push-to-talk
    #[serde(default)]
    pub activation: ActivationMode,

    /// Push-to-talk key binding
    #[serde(default = "default_ptt_key")]
    pub ptt_key: String,

    /// Push-to-talk mode (hold or toggle)
    #[serde(default)]
    pub ptt_mode: PttMode,

    /// Resume backoff for the device session
    #[serde(default)]
    pub resume_retry: RetrySettings,

    /// Maximum codec workers kept per pool
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_ptt_key() -> String {
    DEFAULT_PTT_KEY.to_string()
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_device: SYSTEM_DEFAULT_DEVICE.to_string(),
            device: DeviceContextConfig::default(),
            voice_quality: VoiceQuality::default(),
            codec: Codec::default(),
            activation: ActivationMode::default(),
            ptt_key: default_ptt_key(),
            ptt_mode: PttMode::default(),
            resume_retry: RetrySettings::default(),
            max_workers: DEFAULT_MAX_WORKERS,
            logging: LoggingSettings::default(),
        }
    }
}

impl AudioSettings {
    /// Parse settings from JSON and validate them
    pub fn from_json(json: &str) -> Result<Self, VoiceError> {
        let settings: AudioSettings = serde_json::from_str(json)
            .map_err(|e| VoiceError::Config(format!("malformed audio settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), VoiceError> {
        if self.device.sample_rate == 0 {
            return Err(VoiceError::Config("sample rate must be positive".into()));
        }
        if self.max_workers == 0 {
            return Err(VoiceError::Config("max_workers must be at least 1".into()));
        }
        if self.resume_retry.max_attempts == 0 {
            return Err(VoiceError::Config("resume needs at least one attempt".into()));
        }
        if self.resume_retry.base_delay_ms == 0 {
            return Err(VoiceError::Config("resume base delay must be positive".into()));
        }
        if self.activation == ActivationMode::PushToTalk {
            parse_key_code(&self.ptt_key).map_err(VoiceError::Config)?;
        }
        Ok(())
    }

    /// Check if using system default output device
    pub fn is_default_output(&self) -> bool {
        self.device.output_device.is_empty()
    }

    /// Check if using system default input device
    pub fn is_default_input(&self) -> bool {
        self.input_device.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
