//! Persistence boundary. The hub only needs a narrow slice
//! of durable storage — everything else (schema, migrations, REST CRUD) is
//! explicitly out of scope. `InMemoryPersistence` is the reference
//! implementation used by tests and by default when no database is wired
//! up; a Postgres-backed implementation would live alongside it and
//! implement the same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::auth;
use crate::config::AuthConfig;
use crate::error::{HubError, HubResult};
use crate::models::{
    Channel, DmMessage, DmPair, DmThread, Identity, OpusConfig, ReadScope, ReadState, Role, TextMessage,
};

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Verify a bearer token and return the identity it authenticates, or
    /// `Err(HubError::Unauthenticated)` if it's invalid or expired.
    async fn verify_token(&self, token: &str) -> HubResult<Identity>;

    async fn insert_message(&self, msg: TextMessage) -> HubResult<TextMessage>;
    async fn edit_message(&self, message_id: i64, editor: Uuid, content: &str) -> HubResult<TextMessage>;
    async fn delete_message(&self, message_id: i64, requester: Uuid, is_moderator: bool) -> HubResult<Uuid>;

    async fn insert_dm_message(&self, msg: DmMessage) -> HubResult<DmMessage>;
    async fn edit_dm_message(&self, message_id: i64, editor: Uuid, content: &str) -> HubResult<DmMessage>;
    async fn delete_dm_message(&self, message_id: i64, requester: Uuid) -> HubResult<Uuid>;

    async fn open_dm_thread(&self, a: Uuid, b: Uuid) -> HubResult<DmThread>;

    async fn upsert_read_state(&self, user_id: Uuid, scope: ReadScope, last_read_message_id: i64) -> HubResult<()>;
    async fn unread_count(&self, user_id: Uuid, scope: ReadScope, latest_message_id: i64) -> HubResult<u64>;

    async fn list_channels(&self) -> HubResult<Vec<Channel>>;
    async fn get_channel(&self, channel_id: Uuid) -> HubResult<Channel>;
}

#[derive(Default)]
struct MemoryState {
    identities_by_token: HashMap<String, Identity>,
    messages: HashMap<i64, TextMessage>,
    dm_messages: HashMap<i64, DmMessage>,
    dm_threads: HashMap<DmPair, DmThread>,
    read_states: HashMap<(Uuid, ReadScope), ReadState>,
    channels: Vec<Channel>,
}

/// In-memory reference implementation. Tokens are looked up verbatim — the
/// test/dev harness seeds `identities_by_token` with `"T_<username>"` style
/// tokens via [`InMemoryPersistence::seed_identity`].
pub struct InMemoryPersistence {
    state: Mutex<MemoryState>,
    snowflake: crate::models::SnowflakeGenerator,
    auth_config: AuthConfig,
}

impl InMemoryPersistence {
    pub fn new(worker_id: u16, auth_config: AuthConfig) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            snowflake: crate::models::SnowflakeGenerator::new(worker_id),
            auth_config,
        }
    }

    pub fn seed_identity(&self, token: &str, identity: Identity) {
        self.state.lock().unwrap().identities_by_token.insert(token.to_string(), identity);
    }

    pub fn seed_channel(&self, channel: Channel) {
        self.state.lock().unwrap().channels.push(channel);
    }

    /// Test helper: seed and return a fresh voice channel's id.
    #[cfg(test)]
    pub fn seed_voice_channel(&self) -> Uuid {
        use crate::models::{ChannelKind, OpusConfig};
        let channel_id = Uuid::now_v7();
        self.seed_channel(Channel {
            channel_id,
            kind: ChannelKind::Voice,
            name: "test-voice".into(),
            position: 0,
            codec: OpusConfig { opus_bitrate: None, opus_dtx: None, opus_fec: None },
        });
        channel_id
    }

    pub fn next_message_id(&self) -> i64 {
        self.snowflake.next_id()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn verify_token(&self, token: &str) -> HubResult<Identity> {
        if let Some(identity) = self.state.lock().unwrap().identities_by_token.get(token).cloned() {
            return Ok(identity);
        }

        let claims = auth::validate_token(&self.auth_config, token)?;
        if auth::is_expired(&claims) {
            return Err(HubError::Unauthenticated);
        }
        let user_id = auth::user_id_from_claims(&claims)?;
        Ok(Identity {
            user_id,
            username: claims.username.clone(),
            display_name: claims.username,
            avatar_url: None,
            role: Role::Member,
        })
    }

    async fn insert_message(&self, msg: TextMessage) -> HubResult<TextMessage> {
        let mut state = self.state.lock().unwrap();
        state.messages.insert(msg.message_id, msg.clone());
        Ok(msg)
    }

    async fn edit_message(&self, message_id: i64, editor: Uuid, content: &str) -> HubResult<TextMessage> {
        let mut state = self.state.lock().unwrap();
        let msg = state.messages.get_mut(&message_id).ok_or_else(|| HubError::NotFound("message".into()))?;
        if msg.author_id != editor {
            return Err(HubError::Forbidden);
        }
        msg.content = content.to_string();
        msg.edited_at = Some(Utc::now());
        Ok(msg.clone())
    }

    async fn delete_message(&self, message_id: i64, requester: Uuid, is_moderator: bool) -> HubResult<Uuid> {
        let mut state = self.state.lock().unwrap();
        let msg = state.messages.get_mut(&message_id).ok_or_else(|| HubError::NotFound("message".into()))?;
        if msg.author_id != requester && !is_moderator {
            return Err(HubError::Forbidden);
        }
        msg.is_deleted = true;
        Ok(msg.channel_id)
    }

    async fn insert_dm_message(&self, msg: DmMessage) -> HubResult<DmMessage> {
        let mut state = self.state.lock().unwrap();
        state.dm_messages.insert(msg.message_id, msg.clone());
        Ok(msg)
    }

    async fn edit_dm_message(&self, message_id: i64, editor: Uuid, content: &str) -> HubResult<DmMessage> {
        let mut state = self.state.lock().unwrap();
        let msg = state.dm_messages.get_mut(&message_id).ok_or_else(|| HubError::NotFound("dm message".into()))?;
        if msg.author_id != editor {
            return Err(HubError::Forbidden);
        }
        msg.content = content.to_string();
        msg.edited_at = Some(Utc::now());
        Ok(msg.clone())
    }

    async fn delete_dm_message(&self, message_id: i64, requester: Uuid) -> HubResult<Uuid> {
        let mut state = self.state.lock().unwrap();
        let msg = state.dm_messages.get_mut(&message_id).ok_or_else(|| HubError::NotFound("dm message".into()))?;
        if msg.author_id != requester {
            return Err(HubError::Forbidden);
        }
        msg.is_deleted = true;
        Ok(msg.thread_id)
    }

    async fn open_dm_thread(&self, a: Uuid, b: Uuid) -> HubResult<DmThread> {
        let pair = DmPair::new(a, b);
        let mut state = self.state.lock().unwrap();
        if let Some(thread) = state.dm_threads.get(&pair) {
            return Ok(thread.clone());
        }
        let thread = DmThread { thread_id: Uuid::now_v7(), pair };
        state.dm_threads.insert(pair, thread.clone());
        Ok(thread)
    }

    async fn upsert_read_state(&self, user_id: Uuid, scope: ReadScope, last_read_message_id: i64) -> HubResult<()> {
        let mut state = self.state.lock().unwrap();
        state.read_states.insert(
            (user_id, scope),
            ReadState { last_read_message_id, updated_at: Utc::now() },
        );
        Ok(())
    }

    async fn unread_count(&self, user_id: Uuid, scope: ReadScope, latest_message_id: i64) -> HubResult<u64> {
        let state = self.state.lock().unwrap();
        let last_read = state
            .read_states
            .get(&(user_id, scope))
            .map(|r| r.last_read_message_id)
            .unwrap_or(0);
        Ok(latest_message_id.saturating_sub(last_read).max(0) as u64)
    }

    async fn list_channels(&self) -> HubResult<Vec<Channel>> {
        Ok(self.state.lock().unwrap().channels.clone())
    }

    async fn get_channel(&self, channel_id: Uuid) -> HubResult<Channel> {
        self.state
            .lock()
            .unwrap()
            .channels
            .iter()
            .find(|c| c.channel_id == channel_id)
            .cloned()
            .ok_or_else(|| HubError::NotFound("channel".into()))
    }
}

/// Default codec configuration applied to voice channels with no explicit
/// override.
pub fn default_opus_config() -> OpusConfig {
    OpusConfig { opus_bitrate: Some(64_000), opus_dtx: Some(true), opus_fec: Some(true) }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[tokio::test]
    async fn unknown_token_is_unauthenticated() {
        let persistence = InMemoryPersistence::new(1, test_auth_config());
        let result = persistence.verify_token("garbage").await;
        assert!(matches!(result, Err(HubError::Unauthenticated)));
    }

    #[tokio::test]
    async fn dm_thread_is_stable_regardless_of_argument_order() {
        let persistence = InMemoryPersistence::new(1, test_auth_config());
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let t1 = persistence.open_dm_thread(a, b).await.unwrap();
        let t2 = persistence.open_dm_thread(b, a).await.unwrap();
        assert_eq!(t1.thread_id, t2.thread_id);
    }

    #[tokio::test]
    async fn editing_someone_elses_message_is_forbidden() {
        let persistence = InMemoryPersistence::new(1, test_auth_config());
        let author = identity("alice").user_id;
        let message_id = persistence.next_message_id();
        persistence
            .insert_message(TextMessage {
                message_id,
                channel_id: Uuid::now_v7(),
                author_id: author,
                content: "hi".into(),
                created_at: Utc::now(),
                edited_at: None,
                attachments: vec![],
                reactions: vec![],
                is_deleted: false,
            })
            .await
            .unwrap();

        let result = persistence.edit_message(message_id, Uuid::now_v7(), "edited").await;
        assert!(matches!(result, Err(HubError::Forbidden)));
    }
}
