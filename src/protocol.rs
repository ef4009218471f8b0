//! Protocol Codec. Tagged JSON frames, flat `snake_case` fields, and the
//! wire size caps clients and the gateway both enforce.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::*;

pub const MAX_FRAME_BYTES: usize = 64 * 1024;
pub const MAX_MEDIA_PAYLOAD_BYTES: usize = 32 * 1024;
pub const MAX_TEXT_CONTENT_CHARS: usize = 4 * 1024;
pub const MAX_USERNAME_CHARS: usize = 32;
pub const MAX_NAME_CHARS: usize = 64;
pub const MAX_PROFILE_DESCRIPTION_CHARS: usize = 280;
pub const MAX_PROFILE_STATUS_CHARS: usize = 80;

/// Every inbound/outbound frame, discriminated by the `type` field.
/// Struct-variant fields flatten to top-level JSON keys under
/// `#[serde(tag = "type")]` — a flat wire shape, no nested `data` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    // ── Client → Server ─────────────────────────────────────────────────
    Authenticate {
        token: String,
    },
    SubscribeChannel {
        channel_id: Uuid,
    },
    SendMessage {
        channel_id: Uuid,
        content: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    EditMessage {
        message_id: i64,
        content: String,
    },
    DeleteMessage {
        message_id: i64,
    },
    TypingStart {
        channel_id: Uuid,
    },
    TypingStop {
        channel_id: Uuid,
    },
    ChannelRead {
        channel_id: Uuid,
        last_read_message_id: i64,
    },
    SubscribeDm {
        thread_id: Uuid,
    },
    SendDmMessage {
        thread_id: Uuid,
        content: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    EditDmMessage {
        message_id: i64,
        content: String,
    },
    DeleteDmMessage {
        message_id: i64,
    },
    TypingStartDm {
        thread_id: Uuid,
    },
    TypingStopDm {
        thread_id: Uuid,
    },
    DmRead {
        thread_id: Uuid,
        last_read_message_id: i64,
    },
    JoinVoice {
        channel_id: Uuid,
    },
    LeaveVoice,
    VoiceActivity {
        channel_id: Uuid,
        speaking: bool,
    },
    VoiceMuteState {
        mic_muted: bool,
        speaker_muted: bool,
    },
    MediaSignal {
        channel_id: Uuid,
        request_id: Option<RequestId>,
        payload: serde_json::Value,
    },

    // ── Server → Client ──────────────────────────────────────────────────
    PresenceSnapshot {
        users: Vec<String>,
    },
    VoicePresenceSnapshot {
        channels: std::collections::HashMap<Uuid, Vec<VoicePresence>>,
    },
    UserConnected {
        username: String,
        display_name: String,
        avatar_url: Option<String>,
    },
    UserDisconnected {
        username: String,
    },
    NewMessage {
        #[serde(flatten)]
        message: TextMessage,
        author_username: String,
        author_display_name: String,
    },
    MessageEdited {
        message_id: i64,
        channel_id: Uuid,
        content: String,
        edited_at: chrono::DateTime<chrono::Utc>,
    },
    MessageDeleted {
        message_id: i64,
        channel_id: Uuid,
    },
    ChannelCreated {
        channel: Channel,
    },
    ChannelDeleted {
        channel_id: Uuid,
    },
    ChannelActivity {
        channel_id: Uuid,
    },
    VoiceUserJoined {
        channel_id: Uuid,
        username: String,
        mic_muted: bool,
        speaker_muted: bool,
    },
    VoiceUserLeft {
        channel_id: Uuid,
        username: String,
    },
    VoiceUserSpeaking {
        channel_id: Uuid,
        username: String,
        speaking: bool,
    },
    VoiceUserMuteState {
        channel_id: Uuid,
        username: String,
        mic_muted: bool,
        speaker_muted: bool,
    },
    NewDmMessage {
        #[serde(flatten)]
        message: DmMessage,
        author_username: String,
    },
    DmMessageEdited {
        message_id: i64,
        thread_id: Uuid,
        content: String,
        edited_at: chrono::DateTime<chrono::Utc>,
    },
    DmMessageDeleted {
        message_id: i64,
        thread_id: Uuid,
    },
    DmTypingStart {
        thread_id: Uuid,
        username: String,
    },
    DmTypingStop {
        thread_id: Uuid,
        username: String,
    },
    DmThreadCreated {
        thread_id: Uuid,
    },
    DmThreadUpdated {
        thread_id: Uuid,
        last_message_id: i64,
    },
    DmUnreadUpdated {
        thread_id: Uuid,
        unread_count: u64,
    },
    SignalError {
        request_id: Option<RequestId>,
        kind: ErrorKind,
        message: String,
    },
}

impl Frame {
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Authenticate { .. } => "authenticate",
            Frame::SubscribeChannel { .. } => "subscribe_channel",
            Frame::SendMessage { .. } => "send_message",
            Frame::EditMessage { .. } => "edit_message",
            Frame::DeleteMessage { .. } => "delete_message",
            Frame::TypingStart { .. } => "typing_start",
            Frame::TypingStop { .. } => "typing_stop",
            Frame::ChannelRead { .. } => "channel_read",
            Frame::SubscribeDm { .. } => "subscribe_dm",
            Frame::SendDmMessage { .. } => "send_dm_message",
            Frame::EditDmMessage { .. } => "edit_dm_message",
            Frame::DeleteDmMessage { .. } => "delete_dm_message",
            Frame::TypingStartDm { .. } => "typing_start_dm",
            Frame::TypingStopDm { .. } => "typing_stop_dm",
            Frame::DmRead { .. } => "dm_read",
            Frame::JoinVoice { .. } => "join_voice",
            Frame::LeaveVoice => "leave_voice",
            Frame::VoiceActivity { .. } => "voice_activity",
            Frame::VoiceMuteState { .. } => "voice_mute_state",
            Frame::MediaSignal { .. } => "media_signal",
            Frame::PresenceSnapshot { .. } => "presence_snapshot",
            Frame::VoicePresenceSnapshot { .. } => "voice_presence_snapshot",
            Frame::UserConnected { .. } => "user_connected",
            Frame::UserDisconnected { .. } => "user_disconnected",
            Frame::NewMessage { .. } => "new_message",
            Frame::MessageEdited { .. } => "message_edited",
            Frame::MessageDeleted { .. } => "message_deleted",
            Frame::ChannelCreated { .. } => "channel_created",
            Frame::ChannelDeleted { .. } => "channel_deleted",
            Frame::ChannelActivity { .. } => "channel_activity",
            Frame::VoiceUserJoined { .. } => "voice_user_joined",
            Frame::VoiceUserLeft { .. } => "voice_user_left",
            Frame::VoiceUserSpeaking { .. } => "voice_user_speaking",
            Frame::VoiceUserMuteState { .. } => "voice_user_mute_state",
            Frame::NewDmMessage { .. } => "new_dm_message",
            Frame::DmMessageEdited { .. } => "dm_message_edited",
            Frame::DmMessageDeleted { .. } => "dm_message_deleted",
            Frame::DmTypingStart { .. } => "dm_typing_start",
            Frame::DmTypingStop { .. } => "dm_typing_stop",
            Frame::DmThreadCreated { .. } => "dm_thread_created",
            Frame::DmThreadUpdated { .. } => "dm_thread_updated",
            Frame::DmUnreadUpdated { .. } => "dm_unread_updated",
            Frame::SignalError { .. } => "signal_error",
        }
    }

    /// Low-priority frames may be dropped under backpressure.
    pub fn is_low_priority(&self) -> bool {
        matches!(
            self,
            Frame::TypingStart { .. }
                | Frame::TypingStop { .. }
                | Frame::DmTypingStart { .. }
                | Frame::DmTypingStop { .. }
                | Frame::VoiceUserSpeaking { .. }
        )
    }

    pub fn signal_error(request_id: Option<RequestId>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Frame::SignalError { request_id, kind, message: message.into() }
    }
}

/// Validate an inbound frame's field sizes. Returns the kind to report if
/// invalid; callers decide whether to bind it to a `request_id` or close
/// the connection.
pub fn validate_frame(raw_len: usize, frame: &Frame) -> Result<(), ErrorKind> {
    if raw_len > MAX_FRAME_BYTES {
        return Err(ErrorKind::PayloadTooLarge);
    }
    match frame {
        Frame::SendMessage { content, .. } | Frame::EditMessage { content, .. } => {
            if content.is_empty() {
                return Err(ErrorKind::ValidationFailed);
            }
            if content.chars().count() > MAX_TEXT_CONTENT_CHARS {
                return Err(ErrorKind::PayloadTooLarge);
            }
        }
        Frame::SendDmMessage { content, .. } | Frame::EditDmMessage { content, .. } => {
            if content.is_empty() {
                return Err(ErrorKind::ValidationFailed);
            }
            if content.chars().count() > MAX_TEXT_CONTENT_CHARS {
                return Err(ErrorKind::PayloadTooLarge);
            }
        }
        Frame::MediaSignal { payload, .. } => {
            let encoded = serde_json::to_vec(payload).unwrap_or_default();
            if encoded.len() > MAX_MEDIA_PAYLOAD_BYTES {
                return Err(ErrorKind::PayloadTooLarge);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Decode a raw text frame. Unknown `type` values produce a distinguishable
/// error so the caller can respond `signal_error{kind: unknown_action}` or
/// close with 4002.
pub fn decode(raw: &str) -> Result<Frame, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn encode(frame: &Frame) -> String {
    serde_json::to_string(frame).expect("Frame serialization is infallible")
}
