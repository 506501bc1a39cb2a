//! Parlor Common Library
//!
//! Shared types for the Parlor voice pipeline: audio frame constants, the
//! codec worker message protocol, and the entity mirror protocol.

pub mod bridge;
pub mod codec;
pub mod voice;
