//! Room Index. Forward and reverse membership maps for channel
//! subscriptions, voice membership, and SFU producer ownership, sharded
//! `DashMap`-of-`DashMap` style so mutation on one channel never blocks
//! another.

use std::collections::HashSet;

use dashmap::DashMap;
use uuid::Uuid;

use crate::models::{ConnectionId, VoicePresence};

#[derive(Default)]
pub struct RoomIndex {
    /// channel_id -> connection_ids subscribed to text updates.
    subs: DashMap<Uuid, HashSet<ConnectionId>>,
    /// connection_id -> channel_ids it is subscribed to (reverse index).
    subs_rev: DashMap<ConnectionId, HashSet<Uuid>>,

    /// channel_id -> connection_ids present in that voice channel.
    voice_members: DashMap<Uuid, HashSet<ConnectionId>>,
    /// connection_id -> the single voice channel it occupies, if any.
    voice_rev: DashMap<ConnectionId, Uuid>,
    voice_presence: DashMap<(Uuid, ConnectionId), VoicePresence>,

    /// producer_id -> (channel_id, owner_connection_id), for fast teardown.
    producers: DashMap<Uuid, (Uuid, ConnectionId)>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Text channel subscriptions ──────────────────────────────────────

    pub fn subscribe_channel(&self, channel_id: Uuid, connection_id: ConnectionId) {
        self.subs.entry(channel_id).or_default().insert(connection_id);
        self.subs_rev.entry(connection_id).or_default().insert(channel_id);
    }

    pub fn channel_subscribers(&self, channel_id: Uuid) -> Vec<ConnectionId> {
        self.subs.get(&channel_id).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub fn is_subscribed(&self, channel_id: Uuid, connection_id: ConnectionId) -> bool {
        self.subs.get(&channel_id).map(|s| s.contains(&connection_id)).unwrap_or(false)
    }

    // ── Voice membership ────────────────────────────────────────────────

    pub fn current_voice_channel(&self, connection_id: ConnectionId) -> Option<Uuid> {
        self.voice_rev.get(&connection_id).map(|e| *e)
    }

    /// Join a voice channel. Returns `Err(existing_channel_id)` if the
    /// connection already occupies a different voice channel — callers
    /// reject the join rather than evicting the old one.
    pub fn join_voice(
        &self,
        channel_id: Uuid,
        connection_id: ConnectionId,
        presence: VoicePresence,
    ) -> Result<(), Uuid> {
        if let Some(existing) = self.current_voice_channel(connection_id) {
            return Err(existing);
        }
        self.voice_members.entry(channel_id).or_default().insert(connection_id);
        self.voice_rev.insert(connection_id, channel_id);
        self.voice_presence.insert((channel_id, connection_id), presence);
        Ok(())
    }

    /// Remove a connection from whatever voice channel it occupies. Returns
    /// the channel it left, if any, so the caller can broadcast departure.
    pub fn leave_voice(&self, connection_id: ConnectionId) -> Option<Uuid> {
        let channel_id = self.voice_rev.remove(&connection_id).map(|(_, c)| c)?;
        if let Some(mut members) = self.voice_members.get_mut(&channel_id) {
            members.remove(&connection_id);
        }
        self.voice_presence.remove(&(channel_id, connection_id));
        Some(channel_id)
    }

    pub fn voice_members(&self, channel_id: Uuid) -> Vec<ConnectionId> {
        self.voice_members.get(&channel_id).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub fn voice_presence(&self, channel_id: Uuid) -> Vec<VoicePresence> {
        self.voice_members
            .get(&channel_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|c| self.voice_presence.get(&(channel_id, *c)).map(|p| p.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn update_voice_presence(
        &self,
        channel_id: Uuid,
        connection_id: ConnectionId,
        f: impl FnOnce(&mut VoicePresence),
    ) {
        if let Some(mut entry) = self.voice_presence.get_mut(&(channel_id, connection_id)) {
            f(&mut entry);
        }
    }

    pub fn all_voice_presence(&self) -> std::collections::HashMap<Uuid, Vec<VoicePresence>> {
        self.voice_members
            .iter()
            .map(|entry| (*entry.key(), self.voice_presence(*entry.key())))
            .collect()
    }

    // ── SFU producer ownership ──────────────────────────────────────────

    pub fn register_producer(&self, producer_id: Uuid, channel_id: Uuid, owner: ConnectionId) {
        self.producers.insert(producer_id, (channel_id, owner));
    }

    pub fn producer_owner(&self, producer_id: Uuid) -> Option<(Uuid, ConnectionId)> {
        self.producers.get(&producer_id).map(|e| *e)
    }

    pub fn remove_producer(&self, producer_id: Uuid) -> Option<(Uuid, ConnectionId)> {
        self.producers.remove(&producer_id).map(|(_, v)| v)
    }

    pub fn producers_owned_by(&self, connection_id: ConnectionId) -> Vec<Uuid> {
        self.producers
            .iter()
            .filter(|e| e.value().1 == connection_id)
            .map(|e| *e.key())
            .collect()
    }

    /// Full teardown for a disconnecting connection: drops it from every
    /// channel subscription and its voice channel. Producer/consumer/
    /// transport cleanup is the media router's job (it needs the SFU
    /// engine handle), so this only clears membership bookkeeping.
    pub fn remove_connection(&self, connection_id: ConnectionId) {
        if let Some((_, channels)) = self.subs_rev.remove(&connection_id) {
            for channel_id in channels {
                if let Some(mut subs) = self.subs.get_mut(&channel_id) {
                    subs.remove(&connection_id);
                }
            }
        }
        self.leave_voice(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(username: &str) -> VoicePresence {
        VoicePresence {
            username: username.to_string(),
            mic_muted: false,
            speaker_muted: false,
            speaking: false,
        }
    }

    #[test]
    fn join_voice_twice_rejects_with_existing_channel() {
        let index = RoomIndex::new();
        let connection_id = ConnectionId::now_v7();
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        assert!(index.join_voice(first, connection_id, presence("a")).is_ok());
        assert_eq!(index.join_voice(second, connection_id, presence("a")), Err(first));
    }

    #[test]
    fn leave_voice_clears_membership() {
        let index = RoomIndex::new();
        let connection_id = ConnectionId::now_v7();
        let channel_id = Uuid::now_v7();
        index.join_voice(channel_id, connection_id, presence("a")).unwrap();
        assert_eq!(index.leave_voice(connection_id), Some(channel_id));
        assert!(index.voice_members(channel_id).is_empty());
        assert!(index.current_voice_channel(connection_id).is_none());
    }

    #[test]
    fn remove_connection_clears_channel_subscriptions() {
        let index = RoomIndex::new();
        let connection_id = ConnectionId::now_v7();
        let channel_id = Uuid::now_v7();
        index.subscribe_channel(channel_id, connection_id);
        index.remove_connection(connection_id);
        assert!(index.channel_subscribers(channel_id).is_empty());
    }
}
