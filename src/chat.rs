//! Chat Dispatcher. Validates and sanitizes channel message content, then
//! persists before broadcasting so a client never sees a message the store
//! didn't actually accept.

use chrono::Utc;
use uuid::Uuid;

use crate::broadcast::BroadcastFabric;
use crate::db::Persistence;
use crate::error::{HubError, HubResult};
use crate::models::{Attachment, ConnectionId, Identity, ReadScope, TextMessage};
use crate::protocol::Frame;
use crate::rooms::RoomIndex;

/// Maximum message length (in characters).
pub const MAX_MESSAGE_LENGTH: usize = 4000;

pub const MAX_REACTIONS_PER_MESSAGE: usize = 20;

pub fn validate_message(content: &str) -> HubResult<()> {
    if content.trim().is_empty() {
        return Err(HubError::ValidationFailed("message cannot be empty".to_string()));
    }
    if content.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(HubError::ValidationFailed(format!(
            "message exceeds maximum length of {} characters",
            MAX_MESSAGE_LENGTH
        )));
    }
    Ok(())
}

/// Mention format: `<@user_id>` for users, `<@&role_id>` for roles,
/// `<#channel_id>` for channels.
pub fn parse_mentions(content: &str) -> Vec<MentionType> {
    let mut mentions = Vec::new();
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '<' {
            if let Some(&'@') = chars.peek() {
                chars.next();
                if let Some(&'&') = chars.peek() {
                    chars.next();
                    let id: String = chars.by_ref().take_while(|c| *c != '>').collect();
                    if let Ok(uuid) = Uuid::parse_str(&id) {
                        mentions.push(MentionType::Role(uuid));
                    }
                } else {
                    let id: String = chars.by_ref().take_while(|c| *c != '>').collect();
                    if let Ok(uuid) = Uuid::parse_str(&id) {
                        mentions.push(MentionType::User(uuid));
                    }
                }
            } else if let Some(&'#') = chars.peek() {
                chars.next();
                let id: String = chars.by_ref().take_while(|c| *c != '>').collect();
                if let Ok(uuid) = Uuid::parse_str(&id) {
                    mentions.push(MentionType::Channel(uuid));
                }
            }
        }
    }

    mentions
}

#[derive(Debug, Clone, PartialEq)]
pub enum MentionType {
    User(Uuid),
    Role(Uuid),
    Channel(Uuid),
}

/// Strip control characters, keeping newlines and tabs.
pub fn sanitize_content(content: &str) -> String {
    content
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Shared dependencies every dispatcher operation needs. `Hub` (see
/// `hub.rs`) holds the owning instances and passes references down.
pub struct ChatContext<'a> {
    pub persistence: &'a dyn Persistence,
    pub rooms: &'a RoomIndex,
    pub fabric: &'a BroadcastFabric,
}

pub async fn send_message(
    ctx: &ChatContext<'_>,
    sender: &Identity,
    sender_connection_id: ConnectionId,
    channel_id: Uuid,
    content: String,
    attachments: Vec<Attachment>,
    next_message_id: i64,
) -> HubResult<()> {
    if !ctx.rooms.is_subscribed(channel_id, sender_connection_id) {
        return Err(HubError::Forbidden);
    }
    validate_message(&content)?;
    let content = sanitize_content(&content);

    let message = TextMessage {
        message_id: next_message_id,
        channel_id,
        author_id: sender.user_id,
        content,
        created_at: Utc::now(),
        edited_at: None,
        attachments,
        reactions: vec![],
        is_deleted: false,
    };
    let stored = ctx.persistence.insert_message(message).await?;
    ctx.persistence
        .upsert_read_state(sender.user_id, ReadScope::Channel(channel_id), stored.message_id)
        .await?;

    ctx.fabric.to_channel(
        channel_id,
        Frame::NewMessage {
            message: stored,
            author_username: sender.username.clone(),
            author_display_name: sender.display_name.clone(),
        },
        None,
    );
    Ok(())
}

pub async fn edit_message(ctx: &ChatContext<'_>, editor: &Identity, message_id: i64, content: String) -> HubResult<()> {
    validate_message(&content)?;
    let content = sanitize_content(&content);
    let updated = ctx.persistence.edit_message(message_id, editor.user_id, &content).await?;

    ctx.fabric.to_channel(
        updated.channel_id,
        Frame::MessageEdited {
            message_id: updated.message_id,
            channel_id: updated.channel_id,
            content: updated.content,
            edited_at: updated.edited_at.unwrap_or_else(Utc::now),
        },
        None,
    );
    Ok(())
}

pub async fn delete_message(ctx: &ChatContext<'_>, requester: &Identity, message_id: i64) -> HubResult<()> {
    let channel_id = ctx
        .persistence
        .delete_message(message_id, requester.user_id, requester.role.is_moderator())
        .await?;

    ctx.fabric.to_channel(channel_id, Frame::MessageDeleted { message_id, channel_id }, None);
    Ok(())
}

pub fn typing_start(ctx: &ChatContext<'_>, sender_connection_id: ConnectionId, channel_id: Uuid) {
    ctx.fabric.to_channel(channel_id, Frame::TypingStart { channel_id }, Some(sender_connection_id));
}

pub fn typing_stop(ctx: &ChatContext<'_>, sender_connection_id: ConnectionId, channel_id: Uuid) {
    ctx.fabric.to_channel(channel_id, Frame::TypingStop { channel_id }, Some(sender_connection_id));
}

pub async fn channel_read(
    ctx: &ChatContext<'_>,
    reader: &Identity,
    channel_id: Uuid,
    last_read_message_id: i64,
) -> HubResult<()> {
    ctx.persistence
        .upsert_read_state(reader.user_id, ReadScope::Channel(channel_id), last_read_message_id)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_empty_message() {
        assert!(validate_message("").is_err());
    }

    #[test]
    fn test_validate_normal_message() {
        assert!(validate_message("Hello, world!").is_ok());
    }

    #[test]
    fn test_validate_too_long() {
        let long = "a".repeat(MAX_MESSAGE_LENGTH + 1);
        assert!(validate_message(&long).is_err());
    }

    #[test]
    fn test_sanitize_strips_control() {
        let input = "Hello\x00World\x01!";
        assert_eq!(sanitize_content(input), "HelloWorld!");
    }

    #[test]
    fn test_sanitize_preserves_newlines() {
        let input = "Hello\nWorld";
        assert_eq!(sanitize_content(input), "Hello\nWorld");
    }

    #[test]
    fn parses_user_and_channel_mentions() {
        let user = Uuid::now_v7();
        let channel = Uuid::now_v7();
        let content = format!("hey <@{}> check <#{}>", user, channel);
        let mentions = parse_mentions(&content);
        assert_eq!(mentions, vec![MentionType::User(user), MentionType::Channel(channel)]);
    }
}
