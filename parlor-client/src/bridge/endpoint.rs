//! One side of the mirror bridge
//!
//! Endpoints only ever exchange serialized [`BridgeMessage`]s. Each side keeps
//! its own [`EntityGraph`], so no object reference crosses the boundary.

use parlor_common::bridge::BridgeMessage;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::error::VoiceError;

use super::graph::{EntityGraph, MirrorEvent};

/// Capacity of the local mirror event channel
const MIRROR_EVENT_CAPACITY: usize = 256;

/// Owns one mirror and the link to the other side
pub struct BridgeEndpoint {
    graph: EntityGraph,
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
    events: broadcast::Sender<MirrorEvent>,
}

impl BridgeEndpoint {
    /// Two endpoints wired to each other
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    /// Endpoint over an existing message link
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(MIRROR_EVENT_CAPACITY);
        Self {
            graph: EntityGraph::new(),
            outbound,
            inbound,
            events,
        }
    }

    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    /// Events for every message received from the other side
    pub fn subscribe(&self) -> broadcast::Receiver<MirrorEvent> {
        self.events.subscribe()
    }

    /// Apply a change locally and send it to the other side
    ///
    /// Nothing is sent if the change doesn't apply here.
    pub fn publish(&mut self, message: BridgeMessage) -> Result<MirrorEvent, VoiceError> {
        let event = self.graph.apply(&message)?;
        let json = message
            .to_json()
            .map_err(|e| VoiceError::Protocol(format!("unserializable bridge message: {}", e)))?;
        self.outbound
            .send(json)
            .map_err(|_| VoiceError::Closed("bridge"))?;
        trace!(entity = %message.entity(), "bridge message published");
        Ok(event)
    }

    /// Apply a message received from the other side
    ///
    /// Malformed messages and unknown ids are logged and skipped; the error is
    /// returned for this message only.
    pub fn receive(&mut self, json: &str) -> Result<MirrorEvent, VoiceError> {
        let message = BridgeMessage::from_json(json).map_err(|e| {
            warn!(error = %e, "malformed bridge message");
            VoiceError::Protocol(format!("malformed bridge message: {}", e))
        })?;

        let event = self.graph.apply(&message).inspect_err(|e| {
            warn!(entity = %message.entity(), error = %e, "bridge message skipped");
        })?;
        // No subscribers is fine
        let _ = self.events.send(event.clone());
        Ok(event)
    }

    /// Wait for and apply the next message; `None` once the other side is gone
    pub async fn recv(&mut self) -> Option<Result<MirrorEvent, VoiceError>> {
        let json = self.inbound.recv().await?;
        Some(self.receive(&json))
    }

    /// Apply messages until the other side goes away
    pub async fn run(&mut self) {
        // Failures were logged by receive
        while self.recv().await.is_some() {}
        debug!("bridge peer disconnected");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_common::bridge::{ChannelDelta, EntityRef, UserDelta};

    fn channel(id: u32, name: &str, parent: Option<u32>) -> BridgeMessage {
        BridgeMessage::ChannelAdded {
            id,
            delta: ChannelDelta {
                name: Some(name.into()),
                parent,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_mirrors_converge() {
        let (mut left, mut right) = BridgeEndpoint::pair();
        let mut events = right.subscribe();

        left.publish(channel(0, "Root", None)).unwrap();
        left.publish(channel(4, "Lobby", Some(0))).unwrap();
        left.publish(BridgeMessage::UserAdded {
            id: 12,
            delta: UserDelta {
                name: Some("alice".into()),
                channel: Some(4),
                ..Default::default()
            },
        })
        .unwrap();
        drop(left);
        right.run().await;

        assert_eq!(right.graph().parent_of(4), Some(0));
        assert_eq!(right.graph().channel_of(12), Some(4));
        assert_eq!(right.graph().user(12).unwrap().name, "alice");

        assert_eq!(events.recv().await.unwrap(), MirrorEvent::ChannelAdded(0));
        assert_eq!(events.recv().await.unwrap(), MirrorEvent::ChannelAdded(4));
        assert_eq!(events.recv().await.unwrap(), MirrorEvent::UserAdded(12));
    }

    #[tokio::test]
    async fn test_unknown_id_is_skipped() {
        let (mut left, mut right) = BridgeEndpoint::pair();
        left.publish(channel(0, "Root", None)).unwrap();
        right.recv().await.unwrap().unwrap();

        let orphan = BridgeMessage::UserUpdated {
            id: 3,
            delta: UserDelta::default(),
        };
        assert_eq!(
            right.receive(&orphan.to_json().unwrap()),
            Err(VoiceError::UnknownEntity(EntityRef::user(3)))
        );

        // Later messages still apply
        left.publish(channel(1, "Music", Some(0))).unwrap();
        assert_eq!(
            right.recv().await.unwrap(),
            Ok(MirrorEvent::ChannelAdded(1))
        );
    }

    #[tokio::test]
    async fn test_malformed_message() {
        let (_left, mut right) = BridgeEndpoint::pair();
        assert!(matches!(
            right.receive("{\"type\":\"nope\"}"),
            Err(VoiceError::Protocol(_))
        ));
        assert_eq!(right.graph().channel_count(), 0);
    }

    #[test]
    fn test_publish_rejected_locally_is_not_sent() {
        let (mut left, mut right) = BridgeEndpoint::pair();
        assert!(left.publish(channel(1, "Orphan", Some(9))).is_err());
        assert!(right.inbound.try_recv().is_err());
    }
}
