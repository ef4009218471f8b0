//! Media Signaling Router. Dispatches `media_signal` requests to the
//! `SfuEngine` boundary and correlates responses by `request_id`.
//! Unsolicited `new_producer` events are pushed to the rest of a voice
//! channel whenever a member starts producing.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::broadcast::BroadcastFabric;
use crate::error::{HubError, HubResult};
use crate::models::{ConnectionId, Identity, MediaKind, MediaSource, TransportDirection};
use crate::protocol::Frame;
use crate::rooms::RoomIndex;
use crate::sfu::SfuEngine;

/// At most one active camera and one active screen-share producer per
/// connection at a time; microphone has no per-connection cap beyond "one
/// active producer" since a user only has one mic.
const MAX_CAMERA_PRODUCERS_PER_CONNECTION: usize = 1;
const MAX_SCREEN_PRODUCERS_PER_CONNECTION: usize = 1;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum MediaAction {
    GetRouterRtpCapabilities,
    CreateWebrtcTransport {
        direction: TransportDirection,
    },
    ConnectWebrtcTransport {
        transport_id: Uuid,
        dtls_parameters: Value,
    },
    MediaProduce {
        transport_id: Uuid,
        kind: MediaKind,
        source: MediaSource,
        rtp_parameters: Value,
    },
    MediaConsume {
        transport_id: Uuid,
        producer_id: Uuid,
        rtp_capabilities: Value,
    },
    MediaResumeConsumer {
        consumer_id: Uuid,
    },
    MediaCloseProducer {
        producer_id: Uuid,
    },
    CreateNativeSenderSession {
        #[serde(default)]
        preferred_codecs: Vec<String>,
    },
    ClientDiagnostic {
        #[serde(default)]
        detail: Value,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MediaResponse {
    Value(Value),
    Empty {},
}

pub struct MediaContext<'a> {
    pub rooms: &'a RoomIndex,
    pub fabric: &'a BroadcastFabric,
    pub sfu: &'a dyn SfuEngine,
}

/// Handle one `media_signal` request. The caller is responsible for binding
/// the returned frame back to the connection that sent it, and for timing
/// the whole call out after `T_req` if it never resolves —
/// every branch here is non-blocking beyond the `SfuEngine` call itself.
pub async fn handle_media_signal(
    ctx: &MediaContext<'_>,
    sender: &Identity,
    sender_connection_id: ConnectionId,
    channel_id: Uuid,
    payload: Value,
) -> HubResult<Value> {
    if ctx.rooms.current_voice_channel(sender_connection_id) != Some(channel_id) {
        return Err(HubError::NotInVoice);
    }

    let action: MediaAction = serde_json::from_value(payload)
        .map_err(|e| HubError::UnknownAction(e.to_string()))?;

    let response = match action {
        MediaAction::GetRouterRtpCapabilities => {
            MediaResponse::Value(ctx.sfu.get_router_rtp_capabilities(channel_id).await?)
        }
        MediaAction::CreateWebrtcTransport { direction } => {
            let (transport_id, params) =
                ctx.sfu.create_webrtc_transport(channel_id, sender_connection_id, direction).await?;
            MediaResponse::Value(serde_json::json!({ "transport_id": transport_id, "params": params }))
        }
        MediaAction::ConnectWebrtcTransport { transport_id, dtls_parameters } => {
            ctx.sfu.connect_webrtc_transport(transport_id, dtls_parameters).await?;
            MediaResponse::Empty {}
        }
        MediaAction::MediaProduce { transport_id, kind, source, rtp_parameters } => {
            enforce_source_limit(ctx, sender_connection_id, source)?;
            let producer_id = ctx
                .sfu
                .produce(transport_id, sender_connection_id, channel_id, kind, source, rtp_parameters)
                .await?;
            ctx.rooms.register_producer(producer_id, channel_id, sender_connection_id);

            ctx.fabric.to_voice_channel(
                channel_id,
                Frame::MediaSignal {
                    channel_id,
                    request_id: None,
                    payload: serde_json::json!({
                        "event": "new_producer",
                        "producer_id": producer_id,
                        "username": sender.username,
                        "kind": kind,
                        "source": source,
                    }),
                },
                Some(sender_connection_id),
            );
            MediaResponse::Value(serde_json::json!({ "producer_id": producer_id }))
        }
        MediaAction::MediaConsume { transport_id, producer_id, rtp_capabilities } => {
            let (consumer_id, params) =
                ctx.sfu.consume(transport_id, sender_connection_id, producer_id, rtp_capabilities).await?;
            MediaResponse::Value(serde_json::json!({ "consumer_id": consumer_id, "params": params }))
        }
        MediaAction::MediaResumeConsumer { consumer_id } => {
            ctx.sfu.resume_consumer(consumer_id).await?;
            MediaResponse::Empty {}
        }
        MediaAction::MediaCloseProducer { producer_id } => {
            let (owner_channel, owner_connection) =
                ctx.rooms.producer_owner(producer_id).ok_or_else(|| HubError::NotFound("producer".into()))?;
            if owner_connection != sender_connection_id {
                return Err(HubError::Forbidden);
            }
            ctx.sfu.close_producer(producer_id).await?;
            ctx.rooms.remove_producer(producer_id);
            ctx.fabric.to_voice_channel(
                owner_channel,
                Frame::MediaSignal {
                    channel_id: owner_channel,
                    request_id: None,
                    payload: serde_json::json!({ "event": "producer_closed", "producer_id": producer_id }),
                },
                None,
            );
            MediaResponse::Empty {}
        }
        MediaAction::CreateNativeSenderSession { preferred_codecs } => {
            let (producer_id, params) = ctx
                .sfu
                .create_native_sender_session(channel_id, sender_connection_id, "0.0.0.0", &preferred_codecs)
                .await?;
            ctx.rooms.register_producer(producer_id, channel_id, sender_connection_id);
            MediaResponse::Value(params)
        }
        MediaAction::ClientDiagnostic { detail } => {
            tracing::info!(username = %sender.username, %channel_id, diagnostic = ?detail, "client diagnostic");
            MediaResponse::Empty {}
        }
    };

    Ok(serde_json::to_value(response).expect("MediaResponse serialization is infallible"))
}

fn enforce_source_limit(ctx: &MediaContext<'_>, connection_id: ConnectionId, source: MediaSource) -> HubResult<()> {
    if matches!(source, MediaSource::Microphone) {
        return Ok(());
    }
    let cap = match source {
        MediaSource::Camera => MAX_CAMERA_PRODUCERS_PER_CONNECTION,
        MediaSource::Screen => MAX_SCREEN_PRODUCERS_PER_CONNECTION,
        MediaSource::Microphone => unreachable!(),
    };
    let active = ctx.rooms.producers_owned_by(connection_id).len();
    if active >= cap {
        let message = match source {
            MediaSource::Camera => "camera already active",
            MediaSource::Screen => "screen share already active",
            MediaSource::Microphone => unreachable!(),
        };
        return Err(HubError::Conflict(message.to_string()));
    }
    Ok(())
}

/// Monotonically increasing sequence used to derive the SSRC/port pair for
/// each native RTP sender session.
static NATIVE_SESSION_SEQUENCE: AtomicU32 = AtomicU32::new(1);

pub fn next_native_session_sequence() -> u32 {
    NATIVE_SESSION_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[tokio::test]
    async fn signal_outside_voice_is_rejected() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomIndex::new());
        let fabric = BroadcastFabric::new(registry.clone(), rooms.clone());
        let sfu = InProcessSfu::new();
        let ctx = MediaContext { rooms: &rooms, fabric: &fabric, sfu: &sfu };

        let (handle, _rx) = registry.register();
        let user = identity("alice");
        let result = handle_media_signal(
            &ctx,
            &user,
            handle.connection_id,
            Uuid::now_v7(),
            serde_json::json!({ "action": "get_router_rtp_capabilities" }),
        )
        .await;
        assert!(matches!(result, Err(HubError::NotInVoice)));
    }

    #[tokio::test]
    async fn second_camera_producer_is_rejected() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomIndex::new());
        let fabric = BroadcastFabric::new(registry.clone(), rooms.clone());
        let sfu = InProcessSfu::new();
        let ctx = MediaContext { rooms: &rooms, fabric: &fabric, sfu: &sfu };

        let (handle, _rx) = registry.register();
        let user = identity("alice");
        let channel_id = Uuid::now_v7();
        rooms
            .join_voice(
                channel_id,
                handle.connection_id,
                crate::models::VoicePresence { username: user.username.clone(), mic_muted: false, speaker_muted: false, speaking: false },
            )
            .unwrap();

        let (transport_id, _) = sfu.create_webrtc_transport(channel_id, handle.connection_id, TransportDirection::Send).await.unwrap();

        let produce = |tid: Uuid| {
            serde_json::json!({
                "action": "media_produce",
                "transport_id": tid,
                "kind": "video",
                "source": "camera",
                "rtp_parameters": {},
            })
        };

        handle_media_signal(&ctx, &user, handle.connection_id, channel_id, produce(transport_id)).await.unwrap();
        let second = handle_media_signal(&ctx, &user, handle.connection_id, channel_id, produce(transport_id)).await;
        assert!(matches!(second, Err(HubError::Conflict(_))));
    }
}
