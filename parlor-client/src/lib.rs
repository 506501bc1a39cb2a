//! Parlor voice core
//!
//! The real-time voice pipeline of the Parlor client: device session
//! management, capture framing, pooled codec workers, voice activation, and
//! the cross-context entity bridge.

pub mod bridge;
pub mod config;
pub mod error;
pub mod logging;
pub mod voice;

pub use error::VoiceError;
