use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU16, Ordering};
use uuid::Uuid;

pub type ConnectionId = Uuid;
pub type RequestId = Uuid;

// ─── Users ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
    Operator,
}

impl Role {
    /// Admins and operators may delete others' messages / moderate channels.
    pub fn is_moderator(&self) -> bool {
        matches!(self, Role::Admin | Role::Operator)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: Role,
}

// ─── Channels ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Voice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpusConfig {
    pub opus_bitrate: Option<u32>,
    pub opus_dtx: Option<bool>,
    pub opus_fec: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: Uuid,
    pub kind: ChannelKind,
    pub name: String,
    pub position: i32,
    #[serde(flatten)]
    pub codec: OpusConfig,
}

// ─── Messages ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextMessage {
    pub message_id: i64,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    pub is_deleted: bool,
}

/// Canonically-ordered pair key for a direct-message thread
/// (`user_a_id < user_b_id`) so a thread between two users is unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DmPair {
    pub user_a_id: Uuid,
    pub user_b_id: Uuid,
}

impl DmPair {
    pub fn new(a: Uuid, b: Uuid) -> Self {
        if a < b {
            DmPair { user_a_id: a, user_b_id: b }
        } else {
            DmPair { user_a_id: b, user_b_id: a }
        }
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.user_a_id == user_id || self.user_b_id == user_id
    }

    pub fn other(&self, user_id: Uuid) -> Option<Uuid> {
        if self.user_a_id == user_id {
            Some(self.user_b_id)
        } else if self.user_b_id == user_id {
            Some(self.user_a_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmThread {
    pub thread_id: Uuid,
    pub pair: DmPair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmMessage {
    pub message_id: i64,
    pub thread_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub is_deleted: bool,
}

/// Scope a read-state or subscription applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadScope {
    Channel(Uuid),
    Thread(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadState {
    pub last_read_message_id: i64,
    pub updated_at: DateTime<Utc>,
}

// ─── Voice ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicePresence {
    pub username: String,
    pub mic_muted: bool,
    pub speaker_muted: bool,
    pub speaking: bool,
}

// ─── SFU primitives ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSource {
    Microphone,
    Camera,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportDirection {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Webrtc,
    Plain,
}

#[derive(Debug, Clone)]
pub struct Producer {
    pub producer_id: Uuid,
    pub owner_connection_id: ConnectionId,
    pub channel_id: Uuid,
    pub kind: MediaKind,
    pub source: MediaSource,
}

#[derive(Debug, Clone)]
pub struct Transport {
    pub transport_id: Uuid,
    pub direction: TransportDirection,
    pub kind: TransportKind,
    pub owner_connection_id: ConnectionId,
    pub channel_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct Consumer {
    pub consumer_id: Uuid,
    pub producer_id: Uuid,
    pub owner_connection_id: ConnectionId,
}

// ─── Snowflake ID generator ─────────────────────────────────────────────────

/// Discord-style snowflake: [42 bits timestamp][10 bits worker][12 bits seq].
/// Shared by channel messages and DM messages alike — message ids only need
/// to be monotonic per scope, and a single generator gives that for free.
pub struct SnowflakeGenerator {
    worker_id: u16,
    sequence: AtomicU16,
    epoch_ms: u64,
}

impl SnowflakeGenerator {
    /// Yankcord epoch: 2025-01-01T00:00:00Z.
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: worker_id & 0x3FF,
            sequence: AtomicU16::new(0),
            epoch_ms: 1_735_689_600_000,
        }
    }

    pub fn next_id(&self) -> i64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let timestamp = now.saturating_sub(self.epoch_ms);
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) & 0xFFF;
        ((timestamp as i64) << 22) | ((self.worker_id as i64) << 12) | (seq as i64)
    }
}
