//! Lifecycle Supervisor, gateway half. The axum `/ws` route, the
//! auth handshake, heartbeat enforcement, and frame dispatch to the other
//! components. Connection teardown itself lives in `hub::Hub::disconnect`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::chat::{self, ChatContext};
use crate::dm::{self, DmContext};
use crate::hub::Hub;
use crate::media::{self, MediaContext};
use crate::models::ConnectionId;
use crate::protocol::{self, Frame};
use crate::ratelimit::{RateCategory, T_AUTH_SECS, T_PING_SECS, T_PONG_SECS};
use crate::voice::{self, VoiceContext};

pub const CLOSE_UNAUTHENTICATED: u16 = 4001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 4002;
pub const CLOSE_RATE_ABUSE: u16 = 4004;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4005;
pub const CLOSE_EVICTED: u16 = 4006;

pub fn build_router(hub: Arc<Hub>) -> Router {
    let cors = if hub.config.cors.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<axum::http::HeaderValue> = hub
            .config
            .cors
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_methods([axum::http::Method::GET])
    };

    Router::new()
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.to_string().into() }))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sink, mut stream) = socket.split();
    let (handle, mut outbound_rx) = hub.registry.register();
    let connection_id = handle.connection_id;

    // ── Auth handshake: must complete within T_auth or the socket closes ─
    let authenticated = tokio::time::timeout(Duration::from_secs(T_AUTH_SECS), async {
        while let Some(Ok(msg)) = stream.next().await {
            let Message::Text(raw) = msg else { continue };
            let Ok(frame) = protocol::decode(&raw) else { return false };
            if let Frame::Authenticate { token } = frame {
                return authenticate(&hub, connection_id, &token).await;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if !authenticated {
        let _ = sink.send(close_message(CLOSE_UNAUTHENTICATED, "authentication required")).await;
        hub.disconnect(connection_id).await;
        return;
    }

    // ── Writer task: drains the outbound mailbox onto the socket ────────
    let mut ping_interval = tokio::time::interval(Duration::from_secs(T_PING_SECS));
    ping_interval.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if sink.send(Message::Text(protocol::encode(&frame).into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping_interval.tick() => {
                if hub.registry.get(connection_id).map(|h| h.seconds_since_pong()).unwrap_or(u64::MAX) >= T_PONG_SECS {
                    let _ = sink.send(close_message(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout")).await;
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => {
                        if let Some(h) = hub.registry.get(connection_id) {
                            h.touch_pong();
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Text(raw))) => {
                        if let Some(close_code) = dispatch_text(&hub, connection_id, &raw).await {
                            let _ = sink.send(close_message(close_code, "closing")).await;
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = handle.close_notify.notified() => {
                if let Some(code) = handle.take_pending_close() {
                    let _ = sink.send(close_message(code, "closing")).await;
                    break;
                }
            }
        }
    }

    hub.disconnect(connection_id).await;
}

async fn authenticate(hub: &Hub, connection_id: ConnectionId, token: &str) -> bool {
    let limiter = hub.rate_limiters.get_or_create(connection_id);
    if limiter.check(RateCategory::Auth).is_err() {
        return false;
    }

    let identity = match hub.persistence.verify_token(token).await {
        Ok(identity) => identity,
        Err(_) => return false,
    };

    let already_online = hub.registry.connection_for_username(&identity.username).is_some();
    let username = identity.username.clone();
    let display_name = identity.display_name.clone();
    let avatar_url = identity.avatar_url.clone();

    if let Some(previous) = hub.registry.attach_identity(connection_id, identity) {
        if let Some(previous_handle) = hub.registry.get(previous) {
            previous_handle.request_close(CLOSE_EVICTED);
        }
        tracing::info!(%connection_id, %previous, "evicted previous session for user");
    }

    hub.fabric.to_connection(connection_id, Frame::PresenceSnapshot { users: hub.registry.online_usernames() });
    hub.fabric
        .to_connection(connection_id, Frame::VoicePresenceSnapshot { channels: hub.voice_presence_snapshot() });

    if !already_online {
        hub.fabric.global(Frame::UserConnected { username, display_name, avatar_url }, Some(connection_id));
    }

    true
}

/// Decode and dispatch one text frame. Returns `Some(close_code)` if the
/// connection should be closed as a result.
async fn dispatch_text(hub: &Hub, connection_id: ConnectionId, raw: &str) -> Option<u16> {
    let frame = match protocol::decode(raw) {
        Ok(frame) => frame,
        Err(_) => {
            hub.fabric.to_connection(
                connection_id,
                Frame::signal_error(None, crate::error::ErrorKind::UnknownAction, "could not parse frame"),
            );
            return None;
        }
    };

    if let Err(kind) = protocol::validate_frame(raw.len(), &frame) {
        hub.fabric.to_connection(connection_id, Frame::signal_error(request_id_of(&frame), kind, "payload too large"));
        return None;
    }

    let Some(handle) = hub.registry.get(connection_id) else { return Some(CLOSE_PROTOCOL_ERROR) };
    let Some(identity) = handle.identity() else { return Some(CLOSE_UNAUTHENTICATED) };

    let limiter = hub.rate_limiters.get_or_create(connection_id);
    if let Some(category) = rate_category_of(&frame) {
        if let Err(should_close) = limiter.check(category) {
            if should_close {
                return Some(CLOSE_RATE_ABUSE);
            }
            hub.fabric.to_connection(
                connection_id,
                Frame::signal_error(request_id_of(&frame), crate::error::ErrorKind::RateLimited, "rate limit exceeded"),
            );
            return None;
        }
    }

    let chat_ctx = ChatContext { persistence: hub.persistence.as_ref(), rooms: &hub.rooms, fabric: &hub.fabric };
    let dm_ctx = DmContext { persistence: hub.persistence.as_ref(), rooms: &hub.rooms, fabric: &hub.fabric, registry: &hub.registry };
    let voice_ctx = VoiceContext { persistence: hub.persistence.as_ref(), rooms: &hub.rooms, fabric: &hub.fabric, sfu: hub.sfu.as_ref() };
    let media_ctx = MediaContext { rooms: &hub.rooms, fabric: &hub.fabric, sfu: hub.sfu.as_ref() };

    let request_id = request_id_of(&frame);

    let result: Result<(), crate::error::HubError> = match frame {
        Frame::SubscribeChannel { channel_id } => match hub.persistence.get_channel(channel_id).await {
            Ok(channel) if channel.kind == crate::models::ChannelKind::Text => {
                hub.rooms.subscribe_channel(channel_id, connection_id);
                Ok(())
            }
            Ok(_) => Err(crate::error::HubError::ValidationFailed("channel is not a text channel".into())),
            Err(e) => Err(e),
        },
        Frame::SendMessage { channel_id, content, attachments } => {
            chat::send_message(&chat_ctx, &identity, connection_id, channel_id, content, attachments, hub.next_message_id()).await
        }
        Frame::EditMessage { message_id, content } => chat::edit_message(&chat_ctx, &identity, message_id, content).await,
        Frame::DeleteMessage { message_id } => chat::delete_message(&chat_ctx, &identity, message_id).await,
        Frame::TypingStart { channel_id } => {
            chat::typing_start(&chat_ctx, connection_id, channel_id);
            Ok(())
        }
        Frame::TypingStop { channel_id } => {
            chat::typing_stop(&chat_ctx, connection_id, channel_id);
            Ok(())
        }
        Frame::ChannelRead { channel_id, last_read_message_id } => {
            chat::channel_read(&chat_ctx, &identity, channel_id, last_read_message_id).await
        }
        Frame::SubscribeDm { thread_id } => dm::subscribe_dm(&dm_ctx, &identity, thread_id, connection_id).await,
        Frame::SendDmMessage { thread_id, content, attachments } => {
            dm::send_dm_message(&dm_ctx, &identity, connection_id, thread_id, content, attachments, hub.next_message_id()).await
        }
        Frame::EditDmMessage { message_id, content } => dm::edit_dm_message(&dm_ctx, &identity, message_id, content).await,
        Frame::DeleteDmMessage { message_id } => dm::delete_dm_message(&dm_ctx, &identity, message_id).await,
        Frame::TypingStartDm { thread_id } => {
            dm::typing_start_dm(&dm_ctx, &identity, connection_id, thread_id);
            Ok(())
        }
        Frame::TypingStopDm { thread_id } => {
            dm::typing_stop_dm(&dm_ctx, &identity, connection_id, thread_id);
            Ok(())
        }
        Frame::DmRead { thread_id, last_read_message_id } => dm::dm_read(&dm_ctx, &identity, thread_id, last_read_message_id).await,
        Frame::JoinVoice { channel_id } => voice::join_voice(&voice_ctx, &identity, connection_id, channel_id).await,
        Frame::LeaveVoice => {
            voice::leave_voice(&voice_ctx, &identity, connection_id).await;
            Ok(())
        }
        Frame::VoiceActivity { channel_id, speaking } => voice::voice_activity(&voice_ctx, &identity, connection_id, channel_id, speaking),
        Frame::VoiceMuteState { mic_muted, speaker_muted } => voice::voice_mute_state(&voice_ctx, &identity, connection_id, mic_muted, speaker_muted),
        Frame::MediaSignal { channel_id, request_id, payload } => {
            match media::handle_media_signal(&media_ctx, &identity, connection_id, channel_id, payload).await {
                Ok(response) => {
                    hub.fabric.to_connection(connection_id, Frame::MediaSignal { channel_id, request_id, payload: response });
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        Frame::Authenticate { .. } => Err(crate::error::HubError::ValidationFailed("already authenticated".into())),
        other => Err(crate::error::HubError::UnknownAction(other.type_name().to_string())),
    };

    if let Err(err) = result {
        let (kind, message) = err.as_wire();
        hub.fabric.to_connection(connection_id, Frame::signal_error(request_id, kind, message));
        if err.is_protocol_fatal() {
            return Some(CLOSE_PROTOCOL_ERROR);
        }
    }

    None
}

fn request_id_of(frame: &Frame) -> Option<crate::models::RequestId> {
    match frame {
        Frame::MediaSignal { request_id, .. } => *request_id,
        _ => None,
    }
}

fn rate_category_of(frame: &Frame) -> Option<RateCategory> {
    match frame {
        Frame::SendMessage { .. } | Frame::SendDmMessage { .. } | Frame::EditMessage { .. } | Frame::EditDmMessage { .. } => {
            Some(RateCategory::ChatSend)
        }
        Frame::TypingStart { .. } | Frame::TypingStop { .. } | Frame::TypingStartDm { .. } | Frame::TypingStopDm { .. } => {
            Some(RateCategory::Typing)
        }
        Frame::MediaSignal { .. } => Some(RateCategory::MediaSignal),
        Frame::VoiceActivity { .. } => Some(RateCategory::VoiceActivity),
        _ => None,
    }
}
