//! Arena-indexed mirror of the channel/user tree
//!
//! Nodes refer to each other by arena index, never by pointer. Slots are
//! reused after removal, so removing a node scrubs every index that pointed at
//! it before the slot can be handed out again.

use std::collections::HashMap;

use parlor_common::bridge::{BridgeMessage, ChannelDelta, EntityRef, TalkingState, UserDelta};

use crate::error::VoiceError;

// =============================================================================
// Arena
// =============================================================================

/// Slot storage keyed by the entity's numeric id
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    index: HashMap<u32, usize>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `id`, replacing any previous value; returns its slot
    pub fn insert(&mut self, id: u32, value: T) -> usize {
        if let Some(&slot) = self.index.get(&id) {
            self.slots[slot] = Some(value);
            return slot;
        }
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(value);
                slot
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        slot
    }

    pub fn slot_of(&self, id: u32) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.slot_of(id).and_then(|slot| self.at(slot))
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        let slot = self.slot_of(id)?;
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// Value at an arena index
    pub fn at(&self, slot: usize) -> Option<&T> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn remove(&mut self, id: u32) -> Option<(usize, T)> {
        let slot = self.index.remove(&id)?;
        let value = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        Some((slot, value))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(Option::as_ref)
    }
}

// =============================================================================
// Nodes
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelNode {
    pub id: u32,
    pub name: String,
    /// Arena index of the parent channel
    pub parent: Option<usize>,
    pub position: i32,
    pub description: String,
    /// Arena indices of linked channels
    pub links: Vec<usize>,
    pub temporary: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserNode {
    pub id: u32,
    pub name: String,
    /// Arena index of the channel the user is in
    pub channel: Option<usize>,
    pub mute: bool,
    pub deaf: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub comment: String,
    pub talking: TalkingState,
}

/// What changed in the local mirror after applying a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    ChannelAdded(u32),
    ChannelUpdated { id: u32, changed: Vec<&'static str> },
    ChannelRemoved(u32),
    UserAdded(u32),
    UserUpdated { id: u32, changed: Vec<&'static str> },
    UserRemoved(u32),
}

// =============================================================================
// Entity Graph
// =============================================================================

/// Channel references of a delta, resolved to arena indices
struct ChannelRefs {
    parent: Option<usize>,
    links: Option<Vec<usize>>,
}

/// One side's mirror of channels and users
#[derive(Debug, Default)]
pub struct EntityGraph {
    channels: Arena<ChannelNode>,
    users: Arena<UserNode>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one message
    ///
    /// Ids the message refers to are resolved against this graph first; if any
    /// of them is unknown the graph is left untouched and
    /// [`VoiceError::UnknownEntity`] names the first one. An `*_added` message
    /// for an id that already exists updates it.
    pub fn apply(&mut self, message: &BridgeMessage) -> Result<MirrorEvent, VoiceError> {
        match message {
            BridgeMessage::ChannelAdded { id, delta } => {
                if self.channels.get(*id).is_some() {
                    return self.update_channel(*id, delta);
                }
                let refs = self.resolve_channel_refs(delta)?;
                self.channels.insert(
                    *id,
                    ChannelNode {
                        id: *id,
                        ..ChannelNode::default()
                    },
                );
                if let Some(node) = self.channels.get_mut(*id) {
                    merge_channel(node, delta, refs);
                }
                Ok(MirrorEvent::ChannelAdded(*id))
            }
            BridgeMessage::ChannelUpdated { id, delta } => self.update_channel(*id, delta),
            BridgeMessage::ChannelRemoved { id } => {
                let (slot, _) = self
                    .channels
                    .remove(*id)
                    .ok_or(VoiceError::UnknownEntity(EntityRef::channel(*id)))?;
                self.scrub_channel(slot);
                Ok(MirrorEvent::ChannelRemoved(*id))
            }
            BridgeMessage::UserAdded { id, delta } => {
                if self.users.get(*id).is_some() {
                    return self.update_user(*id, delta);
                }
                let channel = self.resolve_channel(delta.channel)?;
                self.users.insert(
                    *id,
                    UserNode {
                        id: *id,
                        ..UserNode::default()
                    },
                );
                if let Some(node) = self.users.get_mut(*id) {
                    merge_user(node, delta, channel);
                }
                Ok(MirrorEvent::UserAdded(*id))
            }
            BridgeMessage::UserUpdated { id, delta } => self.update_user(*id, delta),
            BridgeMessage::UserRemoved { id } => {
                self.users
                    .remove(*id)
                    .ok_or(VoiceError::UnknownEntity(EntityRef::user(*id)))?;
                Ok(MirrorEvent::UserRemoved(*id))
            }
        }
    }

    fn update_channel(&mut self, id: u32, delta: &ChannelDelta) -> Result<MirrorEvent, VoiceError> {
        if self.channels.get(id).is_none() {
            return Err(VoiceError::UnknownEntity(EntityRef::channel(id)));
        }
        let refs = self.resolve_channel_refs(delta)?;
        if let Some(node) = self.channels.get_mut(id) {
            merge_channel(node, delta, refs);
        }
        Ok(MirrorEvent::ChannelUpdated {
            id,
            changed: delta.changed(),
        })
    }

    fn update_user(&mut self, id: u32, delta: &UserDelta) -> Result<MirrorEvent, VoiceError> {
        if self.users.get(id).is_none() {
            return Err(VoiceError::UnknownEntity(EntityRef::user(id)));
        }
        let channel = self.resolve_channel(delta.channel)?;
        if let Some(node) = self.users.get_mut(id) {
            merge_user(node, delta, channel);
        }
        Ok(MirrorEvent::UserUpdated {
            id,
            changed: delta.changed(),
        })
    }

    fn resolve_channel(&self, id: Option<u32>) -> Result<Option<usize>, VoiceError> {
        match id {
            Some(id) => self
                .channels
                .slot_of(id)
                .map(Some)
                .ok_or(VoiceError::UnknownEntity(EntityRef::channel(id))),
            None => Ok(None),
        }
    }

    fn resolve_channel_refs(&self, delta: &ChannelDelta) -> Result<ChannelRefs, VoiceError> {
        let parent = self.resolve_channel(delta.parent)?;
        let links = match &delta.links {
            Some(ids) => Some(
                ids.iter()
                    .map(|id| {
                        self.channels
                            .slot_of(*id)
                            .ok_or(VoiceError::UnknownEntity(EntityRef::channel(*id)))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };
        Ok(ChannelRefs { parent, links })
    }

    /// Drop every index pointing at a freed channel slot
    fn scrub_channel(&mut self, slot: usize) {
        for channel in self.channels.values_mut() {
            if channel.parent == Some(slot) {
                channel.parent = None;
            }
            channel.links.retain(|&l| l != slot);
        }
        for user in self.users.values_mut() {
            if user.channel == Some(slot) {
                user.channel = None;
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn channel(&self, id: u32) -> Option<&ChannelNode> {
        self.channels.get(id)
    }

    pub fn user(&self, id: u32) -> Option<&UserNode> {
        self.users.get(id)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Id of a channel's parent
    pub fn parent_of(&self, channel: u32) -> Option<u32> {
        let slot = self.channels.get(channel)?.parent?;
        self.channels.at(slot).map(|c| c.id)
    }

    /// Id of the channel a user is in
    pub fn channel_of(&self, user: u32) -> Option<u32> {
        let slot = self.users.get(user)?.channel?;
        self.channels.at(slot).map(|c| c.id)
    }

    /// Ids of the channels linked to `channel`, in link order
    pub fn links_of(&self, channel: u32) -> Vec<u32> {
        self.channels.get(channel).map_or_else(Vec::new, |c| {
            c.links
                .iter()
                .filter_map(|&slot| self.channels.at(slot).map(|l| l.id))
                .collect()
        })
    }

    /// Ids of the users in `channel`, ascending
    pub fn users_in(&self, channel: u32) -> Vec<u32> {
        let Some(slot) = self.channels.slot_of(channel) else {
            return Vec::new();
        };
        let mut users: Vec<u32> = self
            .users
            .values()
            .filter(|u| u.channel == Some(slot))
            .map(|u| u.id)
            .collect();
        users.sort_unstable();
        users
    }
}

fn merge_channel(node: &mut ChannelNode, delta: &ChannelDelta, refs: ChannelRefs) {
    if let Some(name) = &delta.name {
        node.name = name.clone();
    }
    if refs.parent.is_some() {
        node.parent = refs.parent;
    }
    if let Some(position) = delta.position {
        node.position = position;
    }
    if let Some(description) = &delta.description {
        node.description = description.clone();
    }
    if let Some(links) = refs.links {
        node.links = links;
    }
    if let Some(temporary) = delta.temporary {
        node.temporary = temporary;
    }
}

fn merge_user(node: &mut UserNode, delta: &UserDelta, channel: Option<usize>) {
    if let Some(name) = &delta.name {
        node.name = name.clone();
    }
    if channel.is_some() {
        node.channel = channel;
    }
    if let Some(mute) = delta.mute {
        node.mute = mute;
    }
    if let Some(deaf) = delta.deaf {
        node.deaf = deaf;
    }
    if let Some(self_mute) = delta.self_mute {
        node.self_mute = self_mute;
    }
    if let Some(self_deaf) = delta.self_deaf {
        node.self_deaf = self_deaf;
    }
    if let Some(comment) = &delta.comment {
        node.comment = comment.clone();
    }
    if let Some(talking) = delta.talking {
        node.talking = talking;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn add_channel(graph: &mut EntityGraph, id: u32, name: &str, parent: Option<u32>) {
        graph
            .apply(&BridgeMessage::ChannelAdded {
                id,
                delta: ChannelDelta {
                    name: Some(name.to_string()),
                    parent,
                    ..Default::default()
                },
            })
            .unwrap();
    }

    fn add_user(graph: &mut EntityGraph, id: u32, channel: u32) {
        graph
            .apply(&BridgeMessage::UserAdded {
                id,
                delta: UserDelta {
                    name: Some(format!("user{}", id)),
                    channel: Some(channel),
                    ..Default::default()
                },
            })
            .unwrap();
    }

    #[test]
    fn test_tree_references_resolve() {
        let mut graph = EntityGraph::new();
        add_channel(&mut graph, 0, "Root", None);
        add_channel(&mut graph, 1, "Lobby", Some(0));
        add_user(&mut graph, 10, 1);
        add_user(&mut graph, 11, 1);

        assert_eq!(graph.parent_of(1), Some(0));
        assert_eq!(graph.parent_of(0), None);
        assert_eq!(graph.channel_of(10), Some(1));
        assert_eq!(graph.users_in(1), vec![10, 11]);
        assert_eq!(graph.channel(1).unwrap().name, "Lobby");
    }

    #[test]
    fn test_update_reports_changed_fields() {
        let mut graph = EntityGraph::new();
        add_channel(&mut graph, 0, "Root", None);
        add_channel(&mut graph, 2, "AFK", Some(0));
        add_user(&mut graph, 7, 0);

        let event = graph
            .apply(&BridgeMessage::UserUpdated {
                id: 7,
                delta: UserDelta {
                    channel: Some(2),
                    self_mute: Some(true),
                    ..Default::default()
                },
            })
            .unwrap();
        assert_eq!(
            event,
            MirrorEvent::UserUpdated {
                id: 7,
                changed: vec!["channel", "self_mute"]
            }
        );
        assert_eq!(graph.channel_of(7), Some(2));
        assert!(graph.user(7).unwrap().self_mute);
        assert_eq!(graph.user(7).unwrap().name, "user7");
    }

    #[test]
    fn test_unknown_ids_leave_graph_untouched() {
        let mut graph = EntityGraph::new();
        add_channel(&mut graph, 0, "Root", None);
        add_user(&mut graph, 1, 0);

        let err = graph
            .apply(&BridgeMessage::UserUpdated {
                id: 1,
                delta: UserDelta {
                    channel: Some(99),
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            })
            .unwrap_err();
        assert_eq!(err, VoiceError::UnknownEntity(EntityRef::channel(99)));
        assert_eq!(graph.user(1).unwrap().name, "user1");

        assert_eq!(
            graph.apply(&BridgeMessage::UserRemoved { id: 5 }),
            Err(VoiceError::UnknownEntity(EntityRef::user(5)))
        );
        assert!(
            graph
                .apply(&BridgeMessage::ChannelAdded {
                    id: 3,
                    delta: ChannelDelta {
                        parent: Some(42),
                        ..Default::default()
                    },
                })
                .is_err()
        );
        assert_eq!(graph.channel_count(), 1);
    }

    #[test]
    fn test_removed_slot_reuse_does_not_alias() {
        let mut graph = EntityGraph::new();
        add_channel(&mut graph, 0, "Root", None);
        add_channel(&mut graph, 1, "Games", Some(0));
        add_channel(&mut graph, 2, "Music", Some(0));
        graph
            .apply(&BridgeMessage::ChannelUpdated {
                id: 2,
                delta: ChannelDelta {
                    links: Some(vec![1]),
                    ..Default::default()
                },
            })
            .unwrap();
        add_user(&mut graph, 5, 1);

        graph.apply(&BridgeMessage::ChannelRemoved { id: 1 }).unwrap();
        // Reuses the freed slot
        add_channel(&mut graph, 9, "New", Some(0));

        assert_eq!(graph.channel_of(5), None);
        assert!(graph.links_of(2).is_empty());
        assert!(graph.users_in(9).is_empty());
        assert_eq!(graph.channel_count(), 3);
    }

    #[test]
    fn test_added_twice_updates() {
        let mut graph = EntityGraph::new();
        add_channel(&mut graph, 0, "Root", None);
        let event = graph
            .apply(&BridgeMessage::ChannelAdded {
                id: 0,
                delta: ChannelDelta {
                    name: Some("Server".into()),
                    ..Default::default()
                },
            })
            .unwrap();
        assert_eq!(
            event,
            MirrorEvent::ChannelUpdated {
                id: 0,
                changed: vec!["name"]
            }
        );
        assert_eq!(graph.channel_count(), 1);
        assert_eq!(graph.channel(0).unwrap().name, "Server");
    }

    #[test]
    fn test_arena_reuses_slots() {
        let mut arena = Arena::new();
        let a = arena.insert(1, "a");
        let b = arena.insert(2, "b");
        assert_ne!(a, b);
        assert_eq!(arena.remove(1), Some((a, "a")));
        assert_eq!(arena.insert(3, "c"), a);
        assert_eq!(arena.get(3), Some(&"c"));
        assert_eq!(arena.get(1), None);
        assert_eq!(arena.len(), 2);
    }
}
