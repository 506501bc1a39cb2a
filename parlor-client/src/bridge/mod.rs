//! Cross-context entity bridge
//!
//! Mirrors the channel/user tree between two execution domains (for example
//! the network task and a UI thread) using id-only JSON messages.

pub mod endpoint;
pub mod graph;

pub use endpoint::BridgeEndpoint;
pub use graph::{Arena, ChannelNode, EntityGraph, MirrorEvent, UserNode};
