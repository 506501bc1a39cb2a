//! Voice pipeline configuration
//!
//! Settings are plain serde structs with per-field defaults so partial JSON
//! documents deserialize cleanly. Loading and saving them is left to the host
//! application.

pub mod audio;

pub use audio::{
    ActivationMode, AudioSettings, DeviceContextConfig, LatencyHint, PttMode, RetrySettings,
};
