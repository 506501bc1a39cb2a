//! Events reported by a voice session

/// Something the host UI may want to react to
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    /// The local user opened an outbound voice stream
    StartedTalking,
    /// The local user's outbound voice stream was closed
    StoppedTalking,
    /// A remote session started sending voice
    RemoteTalkingStarted(u32),
    /// A remote session finished sending voice (or was removed)
    RemoteTalkingStopped(u32),
    /// Audio device failure; the session ends after reporting it
    AudioError(String),
    /// The session loop exited
    SessionEnded,
}

impl VoiceEvent {
    /// Whether this event concerns the local user's own transmission
    pub fn is_local(&self) -> bool {
        matches!(self, VoiceEvent::StartedTalking | VoiceEvent::StoppedTalking)
    }
}
