//! Entity mirror protocol
//!
//! The channel/user tree is mirrored on both sides of an execution-domain
//! boundary. Messages carry numeric identifiers and flat property deltas only;
//! any reference to another entity (a user's channel, a channel's parent) is
//! sent as that entity's id and resolved by the receiver against its own mirror.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of mirrored entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Channel,
    User,
}

/// Identifier of a mirrored entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: u32,
}

impl EntityRef {
    /// Reference a channel by id
    pub fn channel(id: u32) -> Self {
        Self {
            kind: EntityKind::Channel,
            id,
        }
    }

    /// Reference a user by session id
    pub fn user(id: u32) -> Self {
        Self {
            kind: EntityKind::User,
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntityKind::Channel => write!(f, "channel {}", self.id),
            EntityKind::User => write!(f, "user {}", self.id),
        }
    }
}

/// Talking indicator shown next to a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TalkingState {
    #[default]
    Off,
    On,
    Shout,
    Whisper,
}

// =============================================================================
// Property Deltas
// =============================================================================

/// Changed channel properties; `None` means unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Parent channel id (the root channel has no parent and never sends one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Full replacement of the linked channel ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary: Option<bool>,
}

impl ChannelDelta {
    /// Names of the properties this delta changes
    pub fn changed(&self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.name.is_some() {
            changed.push("name");
        }
        if self.parent.is_some() {
            changed.push("parent");
        }
        if self.position.is_some() {
            changed.push("position");
        }
        if self.description.is_some() {
            changed.push("description");
        }
        if self.links.is_some() {
            changed.push("links");
        }
        if self.temporary.is_some() {
            changed.push("temporary");
        }
        changed
    }
}

/// Changed user properties; `None` means unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Id of the channel the user is in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deaf: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_mute: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_deaf: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talking: Option<TalkingState>,
}

impl UserDelta {
    /// Names of the properties this delta changes
    pub fn changed(&self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.name.is_some() {
            changed.push("name");
        }
        if self.channel.is_some() {
            changed.push("channel");
        }
        if self.mute.is_some() {
            changed.push("mute");
        }
        if self.deaf.is_some() {
            changed.push("deaf");
        }
        if self.self_mute.is_some() {
            changed.push("self_mute");
        }
        if self.self_deaf.is_some() {
            changed.push("self_deaf");
        }
        if self.comment.is_some() {
            changed.push("comment");
        }
        if self.talking.is_some() {
            changed.push("talking");
        }
        changed
    }
}

// =============================================================================
// Messages
// =============================================================================

/// One mirror update sent across the boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    ChannelAdded { id: u32, delta: ChannelDelta },
    ChannelUpdated { id: u32, delta: ChannelDelta },
    ChannelRemoved { id: u32 },
    UserAdded { id: u32, delta: UserDelta },
    UserUpdated { id: u32, delta: UserDelta },
    UserRemoved { id: u32 },
}

impl BridgeMessage {
    /// The entity this message is about
    pub fn entity(&self) -> EntityRef {
        match self {
            BridgeMessage::ChannelAdded { id, .. }
            | BridgeMessage::ChannelUpdated { id, .. }
            | BridgeMessage::ChannelRemoved { id } => EntityRef::channel(*id),
            BridgeMessage::UserAdded { id, .. }
            | BridgeMessage::UserUpdated { id, .. }
            | BridgeMessage::UserRemoved { id } => EntityRef::user(*id),
        }
    }

    /// Serialize for transmission across the boundary
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a message received from the other side
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_json_shape() {
        let msg = BridgeMessage::UserUpdated {
            id: 12,
            delta: UserDelta {
                channel: Some(3),
                ..Default::default()
            },
        };
        let json = msg.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":"user_updated","id":12,"delta":{"channel":3}}"#
        );
        assert_eq!(BridgeMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_missing_delta_fields_default() {
        let msg =
            BridgeMessage::from_json(r#"{"type":"channel_added","id":0,"delta":{"name":"Root"}}"#)
                .unwrap();
        match msg {
            BridgeMessage::ChannelAdded { id, delta } => {
                assert_eq!(id, 0);
                assert_eq!(delta.name.as_deref(), Some("Root"));
                assert!(delta.parent.is_none());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_entity_ref() {
        assert_eq!(
            BridgeMessage::ChannelRemoved { id: 4 }.entity(),
            EntityRef::channel(4)
        );
        assert_eq!(EntityRef::user(9).to_string(), "user 9");
    }

    #[test]
    fn test_changed_fields() {
        let delta = UserDelta {
            self_mute: Some(true),
            talking: Some(TalkingState::On),
            ..Default::default()
        };
        assert_eq!(delta.changed(), vec!["self_mute", "talking"]);
        assert!(ChannelDelta::default().changed().is_empty());
    }
}
