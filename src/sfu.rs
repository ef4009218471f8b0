//! SFU Engine boundary. The actual media plane (ICE/DTLS/RTP
//! forwarding) is out of scope; `InProcessSfu` tracks the bookkeeping a real
//! engine would expose — transport/producer/consumer ids and ownership —
//! without moving any media. A production deployment would swap this for an
//! adapter over a real SFU (mediasoup-style worker process, a WebRTC stack,
//! or similar), implementing the same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{HubError, HubResult};
use crate::models::{ConnectionId, MediaKind, MediaSource, TransportDirection, TransportKind};

#[async_trait]
pub trait SfuEngine: Send + Sync {
    async fn get_router_rtp_capabilities(&self, channel_id: Uuid) -> HubResult<Value>;

    async fn create_webrtc_transport(
        &self,
        channel_id: Uuid,
        owner: ConnectionId,
        direction: TransportDirection,
    ) -> HubResult<(Uuid, Value)>;

    async fn connect_webrtc_transport(&self, transport_id: Uuid, dtls_parameters: Value) -> HubResult<()>;

    async fn produce(
        &self,
        transport_id: Uuid,
        owner: ConnectionId,
        channel_id: Uuid,
        kind: MediaKind,
        source: MediaSource,
        rtp_parameters: Value,
    ) -> HubResult<Uuid>;

    async fn consume(
        &self,
        transport_id: Uuid,
        owner: ConnectionId,
        producer_id: Uuid,
        rtp_capabilities: Value,
    ) -> HubResult<(Uuid, Value)>;

    async fn resume_consumer(&self, consumer_id: Uuid) -> HubResult<()>;

    async fn close_producer(&self, producer_id: Uuid) -> HubResult<()>;

    /// Native RTP ingest path — used by bridges that forward
    /// pre-existing RTP streams into a channel rather than negotiating a
    /// WebRTC transport, e.g. a recording or broadcast relay. Defaults to
    /// H264 when `preferred_codecs` is empty. Returns the new producer's id
    /// alongside the session parameters the caller sends to the client.
    async fn create_native_sender_session(
        &self,
        channel_id: Uuid,
        owner: ConnectionId,
        listen_ip: &str,
        preferred_codecs: &[String],
    ) -> HubResult<(Uuid, Value)>;
}

struct TransportRecord {
    direction: TransportDirection,
    kind: TransportKind,
    owner: ConnectionId,
    channel_id: Uuid,
}

struct ProducerRecord {
    owner: ConnectionId,
    channel_id: Uuid,
    kind: MediaKind,
}

#[derive(Default)]
struct SfuState {
    transports: HashMap<Uuid, TransportRecord>,
    producers: HashMap<Uuid, ProducerRecord>,
    consumers: HashMap<Uuid, Uuid>,
}

pub struct InProcessSfu {
    state: Mutex<SfuState>,
}

impl InProcessSfu {
    pub fn new() -> Self {
        Self { state: Mutex::new(SfuState::default()) }
    }
}

impl Default for InProcessSfu {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SfuEngine for InProcessSfu {
    async fn get_router_rtp_capabilities(&self, _channel_id: Uuid) -> HubResult<Value> {
        Ok(serde_json::json!({ "codecs": ["opus"] }))
    }

    async fn create_webrtc_transport(
        &self,
        channel_id: Uuid,
        owner: ConnectionId,
        direction: TransportDirection,
    ) -> HubResult<(Uuid, Value)> {
        let transport_id = Uuid::now_v7();
        self.state.lock().unwrap().transports.insert(
            transport_id,
            TransportRecord { direction, kind: TransportKind::Webrtc, owner, channel_id },
        );
        let params = serde_json::json!({
            "id": transport_id,
            "ice_parameters": {},
            "ice_candidates": [],
            "dtls_parameters": {},
        });
        Ok((transport_id, params))
    }

    async fn connect_webrtc_transport(&self, transport_id: Uuid, _dtls_parameters: Value) -> HubResult<()> {
        if !self.state.lock().unwrap().transports.contains_key(&transport_id) {
            return Err(HubError::NotFound("transport".into()));
        }
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: Uuid,
        owner: ConnectionId,
        channel_id: Uuid,
        kind: MediaKind,
        _source: MediaSource,
        _rtp_parameters: Value,
    ) -> HubResult<Uuid> {
        let mut state = self.state.lock().unwrap();
        let transport = state.transports.get(&transport_id).ok_or_else(|| HubError::NotFound("transport".into()))?;
        if transport.direction != TransportDirection::Send {
            return Err(HubError::ValidationFailed("transport is not a send transport".into()));
        }
        let producer_id = Uuid::now_v7();
        state.producers.insert(producer_id, ProducerRecord { owner, channel_id, kind });
        Ok(producer_id)
    }

    async fn consume(
        &self,
        transport_id: Uuid,
        _owner: ConnectionId,
        producer_id: Uuid,
        _rtp_capabilities: Value,
    ) -> HubResult<(Uuid, Value)> {
        let mut state = self.state.lock().unwrap();
        let transport = state.transports.get(&transport_id).ok_or_else(|| HubError::NotFound("transport".into()))?;
        if transport.direction != TransportDirection::Recv {
            return Err(HubError::ValidationFailed("transport is not a recv transport".into()));
        }
        let producer = state.producers.get(&producer_id).ok_or_else(|| HubError::NotFound("producer".into()))?;
        let kind = producer.kind;
        let consumer_id = Uuid::now_v7();
        state.consumers.insert(consumer_id, producer_id);
        let params = serde_json::json!({
            "id": consumer_id,
            "producer_id": producer_id,
            "kind": kind,
            "rtp_parameters": {},
        });
        Ok((consumer_id, params))
    }

    async fn resume_consumer(&self, consumer_id: Uuid) -> HubResult<()> {
        if !self.state.lock().unwrap().consumers.contains_key(&consumer_id) {
            return Err(HubError::NotFound("consumer".into()));
        }
        Ok(())
    }

    async fn close_producer(&self, producer_id: Uuid) -> HubResult<()> {
        let mut state = self.state.lock().unwrap();
        state.producers.remove(&producer_id).ok_or_else(|| HubError::NotFound("producer".into()))?;
        state.consumers.retain(|_, p| *p != producer_id);
        Ok(())
    }

    async fn create_native_sender_session(
        &self,
        channel_id: Uuid,
        owner: ConnectionId,
        listen_ip: &str,
        preferred_codecs: &[String],
    ) -> HubResult<(Uuid, Value)> {
        const AVAILABLE_CODECS: &[&str] = &["H264", "VP8", "VP9"];
        let codec = preferred_codecs.first().cloned().unwrap_or_else(|| "H264".to_string());
        let sequence = crate::media::next_native_session_sequence();

        let transport_id = Uuid::now_v7();
        let producer_id = Uuid::now_v7();
        let mut state = self.state.lock().unwrap();
        state.transports.insert(
            transport_id,
            TransportRecord { direction: TransportDirection::Send, kind: TransportKind::Plain, owner, channel_id },
        );
        state.producers.insert(producer_id, ProducerRecord { owner, channel_id, kind: MediaKind::Video });
        drop(state);

        let params = serde_json::json!({
            "producer_id": producer_id,
            "rtp_target": { "ip": listen_ip, "port": 5004u16.wrapping_add(sequence as u16) },
            "payload_type": 96,
            "ssrc": 1_000_000u32.wrapping_add(sequence),
            "codec": codec,
            "available_codecs": AVAILABLE_CODECS,
        });
        Ok((producer_id, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produce_requires_send_transport() {
        let sfu = InProcessSfu::new();
        let owner = ConnectionId::now_v7();
        let channel_id = Uuid::now_v7();
        let (transport_id, _) = sfu.create_webrtc_transport(channel_id, owner, TransportDirection::Recv).await.unwrap();
        let result = sfu
            .produce(transport_id, owner, channel_id, MediaKind::Audio, MediaSource::Microphone, serde_json::json!({}))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn consume_requires_existing_producer() {
        let sfu = InProcessSfu::new();
        let owner = ConnectionId::now_v7();
        let channel_id = Uuid::now_v7();
        let (transport_id, _) = sfu.create_webrtc_transport(channel_id, owner, TransportDirection::Recv).await.unwrap();
        let result = sfu.consume(transport_id, owner, Uuid::now_v7(), serde_json::json!({})).await;
        assert!(matches!(result, Err(HubError::NotFound(_))));
    }

    #[tokio::test]
    async fn closing_producer_removes_its_consumers() {
        let sfu = InProcessSfu::new();
        let owner = ConnectionId::now_v7();
        let channel_id = Uuid::now_v7();
        let (send_t, _) = sfu.create_webrtc_transport(channel_id, owner, TransportDirection::Send).await.unwrap();
        let producer_id = sfu
            .produce(send_t, owner, channel_id, MediaKind::Audio, MediaSource::Microphone, serde_json::json!({}))
            .await
            .unwrap();
        let (recv_t, _) = sfu.create_webrtc_transport(channel_id, owner, TransportDirection::Recv).await.unwrap();
        let (consumer_id, _) = sfu.consume(recv_t, owner, producer_id, serde_json::json!({})).await.unwrap();

        sfu.close_producer(producer_id).await.unwrap();
        assert!(sfu.resume_consumer(consumer_id).await.is_err());
    }
}
