//! Voice pipeline
//!
//! Client-side audio for voice chat:
//! - Shared audio device session with resume backoff and gesture gating
//! - Microphone capture and framing
//! - Pooled codec workers for encoding and decoding
//! - Continuous and push-to-talk activation
//! - Per-remote decode streams mixed into playback

pub mod activation;
pub mod capture;
pub mod codec;
pub mod context;
pub mod event;
pub mod gesture;
pub mod inbound;
pub mod manager;
pub mod platform;
pub mod ptt;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use activation::{VoiceActivationController, VoiceSessionState};
pub use capture::{FrameCapture, MicrophoneSource};
pub use codec::{CodecFactory, CodecTransform, OpusFactory};
pub use context::{
    AudioBackend, AudioPlatform, ContextEvent, ContextState, DeviceContext, DeviceContextManager,
    RetryPolicy, SubscriptionId,
};
pub use event::VoiceEvent;
pub use gesture::GestureGate;
pub use inbound::{InboundPacket, InboundRouter, PlaybackSink, RemoteVoiceStream};
pub use manager::{VoiceCommand, VoiceSession, VoiceSessionConfig, VoiceSessionHandle};
pub use platform::{CpalPlatform, Mixer};
pub use ptt::{ControlBinding, ControlEvent, ControlInput, HotkeyControlInput, PttLatch};
pub use transport::{
    BitrateHandle, DropSink, EncodingTransport, OutboundPacket, OutboundStream, PacketSink,
    Transport,
};
pub use worker::{BorrowedWorker, CodecWorkerPool};
