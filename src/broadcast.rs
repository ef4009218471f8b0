//! Broadcast Fabric. Fan-out helpers over the registry + room index,
//! implementing the slow-consumer policy.
//!
//! FIFO-per-(channel, connection) ordering falls out of the fact that every
//! fan-out walks subscribers and calls `enqueue` synchronously in order —
//! there is no intermediate queue that could reorder frames for a single
//! recipient.

use std::sync::Arc;

use uuid::Uuid;

use crate::models::ConnectionId;
use crate::protocol::Frame;
use crate::registry::{ConnectionRegistry, EnqueueOutcome};
use crate::rooms::RoomIndex;

pub const CLOSE_SLOW_CONSUMER: u16 = 4003;

/// Connections that should be closed as a result of a fan-out, with the
/// close code to use. The gateway drains this after every dispatch.
pub struct BroadcastFabric {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomIndex>,
}

impl BroadcastFabric {
    pub fn new(registry: Arc<ConnectionRegistry>, rooms: Arc<RoomIndex>) -> Self {
        Self { registry, rooms }
    }

    fn deliver(&self, connection_id: ConnectionId, frame: &Frame, to_close: &mut Vec<ConnectionId>) {
        let Some(handle) = self.registry.get(connection_id) else { return };
        match handle.enqueue(frame.clone()) {
            EnqueueOutcome::SustainedFull => {
                handle.request_close(CLOSE_SLOW_CONSUMER);
                to_close.push(connection_id);
            }
            EnqueueOutcome::Sent
            | EnqueueOutcome::DroppedLowPriority
            | EnqueueOutcome::QueueFull
            | EnqueueOutcome::ConnectionGone => {}
        }
    }

    pub fn to_connection(&self, connection_id: ConnectionId, frame: Frame) -> Vec<ConnectionId> {
        let mut to_close = Vec::new();
        self.deliver(connection_id, &frame, &mut to_close);
        to_close
    }

    /// Fan out to every subscriber of a text channel, optionally excluding
    /// one connection (used so `typing_start`/`typing_stop` never echo back
    /// to the sender).
    pub fn to_channel(&self, channel_id: Uuid, frame: Frame, exclude: Option<ConnectionId>) -> Vec<ConnectionId> {
        let mut to_close = Vec::new();
        for connection_id in self.rooms.channel_subscribers(channel_id) {
            if Some(connection_id) == exclude {
                continue;
            }
            self.deliver(connection_id, &frame, &mut to_close);
        }
        to_close
    }

    pub fn to_voice_channel(&self, channel_id: Uuid, frame: Frame, exclude: Option<ConnectionId>) -> Vec<ConnectionId> {
        let mut to_close = Vec::new();
        for connection_id in self.rooms.voice_members(channel_id) {
            if Some(connection_id) == exclude {
                continue;
            }
            self.deliver(connection_id, &frame, &mut to_close);
        }
        to_close
    }

    pub fn to_users(&self, usernames: &[String], frame: Frame) -> Vec<ConnectionId> {
        let mut to_close = Vec::new();
        for username in usernames {
            if let Some(handle) = self.registry.connection_for_username(username) {
                self.deliver(handle.connection_id, &frame, &mut to_close);
            }
        }
        to_close
    }

    pub fn global(&self, frame: Frame, exclude: Option<ConnectionId>) -> Vec<ConnectionId> {
        let mut to_close = Vec::new();
        for username in self.registry.online_usernames() {
            if let Some(handle) = self.registry.connection_for_username(&username) {
                if Some(handle.connection_id) == exclude {
                    continue;
                }
                self.deliver(handle.connection_id, &frame, &mut to_close);
            }
        }
        to_close
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Identity, Role};

    fn identity(username: &str) -> Identity {
        Identity {
            user_id: uuid::Uuid::now_v7(),
            username: username.to_string(),
            display_name: username.to_string(),
            avatar_url: None,
            role: Role::Member,
        }
    }

    #[tokio::test]
    async fn typing_excludes_sender() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomIndex::new());
        let fabric = BroadcastFabric::new(registry.clone(), rooms.clone());

        let (sender, mut sender_rx) = registry.register();
        let (other, mut other_rx) = registry.register();
        registry.attach_identity(sender.connection_id, identity("alice"));
        registry.attach_identity(other.connection_id, identity("bob"));

        let channel_id = Uuid::now_v7();
        rooms.subscribe_channel(channel_id, sender.connection_id);
        rooms.subscribe_channel(channel_id, other.connection_id);

        fabric.to_channel(channel_id, Frame::TypingStart { channel_id }, Some(sender.connection_id));

        assert!(sender_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn to_connection_delivers_single_frame() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomIndex::new());
        let fabric = BroadcastFabric::new(registry.clone(), rooms);
        let (handle, mut rx) = registry.register();

        fabric.to_connection(handle.connection_id, Frame::LeaveVoice);
        assert!(rx.try_recv().is_ok());
    }
}
