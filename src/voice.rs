//! Voice Coordinator. Tracks who occupies which voice channel and
//! fans out join/leave/speaking/mute events — no media passes through this
//! module, that's the Media Signaling Router's (`media.rs`) job over the
//! `SfuEngine` boundary.

use uuid::Uuid;

use crate::broadcast::BroadcastFabric;
use crate::db::Persistence;
use crate::error::{HubError, HubResult};
use crate::models::{ChannelKind, ConnectionId, Identity, VoicePresence};
use crate::protocol::Frame;
use crate::rooms::RoomIndex;
use crate::sfu::SfuEngine;

pub struct VoiceContext<'a> {
    pub persistence: &'a dyn Persistence,
    pub rooms: &'a RoomIndex,
    pub fabric: &'a BroadcastFabric,
    pub sfu: &'a dyn SfuEngine,
}

/// Join a voice channel. Rejects with `not_found`/`validation_failed` if the
/// channel doesn't exist or isn't a voice channel, and with
/// `already_in_voice` if the connection already occupies a different voice
/// channel — callers must leave first rather than being silently moved.
pub async fn join_voice(ctx: &VoiceContext<'_>, user: &Identity, connection_id: ConnectionId, channel_id: Uuid) -> HubResult<()> {
    let channel = ctx.persistence.get_channel(channel_id).await?;
    if channel.kind != ChannelKind::Voice {
        return Err(HubError::ValidationFailed("channel is not a voice channel".into()));
    }

    let presence = VoicePresence {
        username: user.username.clone(),
        mic_muted: false,
        speaker_muted: false,
        speaking: false,
    };

    ctx.rooms.join_voice(channel_id, connection_id, presence).map_err(|_existing| HubError::AlreadyInVoice)?;

    tracing::info!(username = %user.username, %channel_id, "user joined voice channel");
    let joined_event = Frame::VoiceUserJoined {
        channel_id,
        username: user.username.clone(),
        mic_muted: false,
        speaker_muted: false,
    };
    ctx.fabric.to_channel(channel_id, joined_event.clone(), Some(connection_id));
    ctx.fabric.to_voice_channel(channel_id, joined_event, Some(connection_id));
    Ok(())
}

/// Leave whatever voice channel the connection occupies, closing every
/// producer it owns in that channel first — mirrors `hub::disconnect`'s
/// teardown ordering. A no-op (not an error) if it wasn't in a voice channel.
pub async fn leave_voice(ctx: &VoiceContext<'_>, user: &Identity, connection_id: ConnectionId) -> Option<Uuid> {
    let channel_id = ctx.rooms.current_voice_channel(connection_id)?;

    for producer_id in ctx.rooms.producers_owned_by(connection_id) {
        if let Err(e) = ctx.sfu.close_producer(producer_id).await {
            tracing::warn!(%producer_id, error = %e, "failed to close producer on explicit leave_voice");
        }
        ctx.rooms.remove_producer(producer_id);
    }

    ctx.rooms.leave_voice(connection_id)?;
    tracing::info!(username = %user.username, %channel_id, "user left voice channel");
    ctx.fabric
        .to_voice_channel(channel_id, Frame::VoiceUserLeft { channel_id, username: user.username.clone() }, None);
    Some(channel_id)
}

pub fn voice_activity(ctx: &VoiceContext<'_>, user: &Identity, connection_id: ConnectionId, channel_id: Uuid, speaking: bool) -> HubResult<()> {
    if ctx.rooms.current_voice_channel(connection_id) != Some(channel_id) {
        return Err(HubError::NotInVoice);
    }
    ctx.rooms.update_voice_presence(channel_id, connection_id, |p| p.speaking = speaking);
    ctx.fabric.to_voice_channel(
        channel_id,
        Frame::VoiceUserSpeaking { channel_id, username: user.username.clone(), speaking },
        Some(connection_id),
    );
    Ok(())
}

pub fn voice_mute_state(ctx: &VoiceContext<'_>, user: &Identity, connection_id: ConnectionId, mic_muted: bool, speaker_muted: bool) -> HubResult<()> {
    let channel_id = ctx.rooms.current_voice_channel(connection_id).ok_or(HubError::NotInVoice)?;
    ctx.rooms.update_voice_presence(channel_id, connection_id, |p| {
        p.mic_muted = mic_muted;
        p.speaker_muted = speaker_muted;
    });
    ctx.fabric.to_voice_channel(
        channel_id,
        Frame::VoiceUserMuteState { channel_id, username: user.username.clone(), mic_muted, speaker_muted },
        None,
    );
    Ok(())
}

pub fn voice_presence_snapshot(rooms: &RoomIndex) -> std::collections::HashMap<Uuid, Vec<VoicePresence>> {
    rooms.all_voice_presence()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::db::InMemoryPersistence;
    use crate::models::Role;
    use crate::registry::ConnectionRegistry;
    use crate::sfu::InProcessSfu;
    use std::sync::Arc;

    fn identity(username: &str) -> Identity {
        Identity {
            user_id: Uuid::now_v7(),
            username: username.to_string(),
            display_name: username.to_string(),
            avatar_url: None,
            role: Role::Member,
        }
    }

    fn test_auth_config() -> AuthConfig {
        AuthConfig { jwt_secret: "test-secret".into(), server_password: String::new() }
    }

    #[tokio::test]
    async fn second_join_is_rejected_not_evicted() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomIndex::new());
        let fabric = BroadcastFabric::new(registry.clone(), rooms.clone());
        let persistence = InMemoryPersistence::new(1, test_auth_config());
        let sfu = InProcessSfu::new();
        let ctx = VoiceContext { persistence: &persistence, rooms: &rooms, fabric: &fabric, sfu: &sfu };

        let (handle, _rx) = registry.register();
        let user = identity("alice");
        let first_channel = persistence.seed_voice_channel();
        let second_channel = persistence.seed_voice_channel();

        join_voice(&ctx, &user, handle.connection_id, first_channel).await.unwrap();
        let result = join_voice(&ctx, &user, handle.connection_id, second_channel).await;
        assert!(matches!(result, Err(HubError::AlreadyInVoice)));
        assert_eq!(rooms.current_voice_channel(handle.connection_id), Some(first_channel));
    }

    #[test]
    fn activity_outside_voice_is_rejected() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomIndex::new());
        let fabric = BroadcastFabric::new(registry.clone(), rooms.clone());
        let persistence = InMemoryPersistence::new(1, test_auth_config());
        let sfu = InProcessSfu::new();
        let ctx = VoiceContext { persistence: &persistence, rooms: &rooms, fabric: &fabric, sfu: &sfu };

        let (handle, _rx) = registry.register();
        let user = identity("alice");
        let result = voice_activity(&ctx, &user, handle.connection_id, Uuid::now_v7(), true);
        assert!(matches!(result, Err(HubError::NotInVoice)));
    }
}
