//! Transport and media operations on behalf of peers.
//!
//! All operations are idempotent where the wire allows retries: a second
//! transport request for a direction that already has a live transport
//! returns the existing parameters, and a connect on a settled DTLS state is
//! a no-op success.

use std::collections::HashMap;
use std::sync::Arc;

use confab_core::models::{MediaKind, StreamKind};
use confab_core::{Error, Result};

use crate::peer::{DownstreamTransport, Peer, TransportRole};
use crate::room::Room;
use crate::sfu::{
    DtlsParameters, ProducerHandle, RtpCapabilities, RtpParameters, TransportParams,
    WebRtcTransportOptions,
};
use crate::workers::WorkerPool;

/// Connection-level options applied to every WebRTC transport.
#[derive(Debug, Clone)]
pub struct MediaServiceConfig {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub initial_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
}

/// A transport request from the wire.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub role: TransportRole,
    pub stream_kind: Option<StreamKind>,
    pub producer_id: Option<String>,
    pub audio_pid: Option<String>,
}

/// Everything a client needs to create its consumer.
#[derive(Debug, Clone)]
pub struct ConsumeResult {
    pub id: String,
    pub producer_id: String,
    pub kind: StreamKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Clone)]
pub struct MediaService {
    workers: WorkerPool,
    config: MediaServiceConfig,
}

impl MediaService {
    #[must_use]
    pub fn new(workers: WorkerPool, config: MediaServiceConfig) -> Self {
        Self { workers, config }
    }

    fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.config.listen_ip.clone(),
            announced_ip: self.config.announced_ip.clone(),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_outgoing_bitrate: self.config.initial_outgoing_bitrate,
        }
    }

    /// Create (or return) the transport for the requested direction.
    pub async fn handle_transport_request(
        &self,
        room: &Room,
        peer: &Arc<Peer>,
        request: TransportRequest,
    ) -> Result<TransportParams> {
        match request.role {
            TransportRole::Producer => {
                if let Some(existing) = peer.live_upstream() {
                    return Ok(existing.params());
                }

                let transport = room
                    .router()?
                    .create_webrtc_transport(self.transport_options())
                    .await?;
                transport
                    .set_max_incoming_bitrate(self.config.max_incoming_bitrate)
                    .await?;
                let params = transport.params();
                peer.set_upstream(transport);
                self.workers.inc_transports(room.worker_pid(), 1);
                Ok(params)
            }
            TransportRole::Consumer => {
                let audio_pid = request
                    .audio_pid
                    .as_deref()
                    .ok_or_else(|| Error::InvalidInput("audioPid is required".into()))?;

                if let Some(existing) = peer.downstream_for_audio_pid(audio_pid) {
                    return Ok(existing.params());
                }

                let video_pid = Self::resolve_video_pid(room, audio_pid);
                let transport = room
                    .router()?
                    .create_webrtc_transport(self.transport_options())
                    .await?;
                let params = transport.params();

                let mut stream_producers = HashMap::new();
                if let (Some(kind), Some(producer_id)) =
                    (request.stream_kind, request.producer_id.clone())
                {
                    stream_producers.insert(kind, producer_id);
                }

                peer.push_downstream(DownstreamTransport {
                    transport,
                    associated_audio_pid: Some(audio_pid.to_string()),
                    associated_video_pid: video_pid,
                    stream_producers,
                    consumers: HashMap::new(),
                });
                self.workers.inc_transports(room.worker_pid(), 1);
                Ok(params)
            }
        }
    }

    /// The video producer paired with an audio producer: the owning peer's
    /// screen video for screen audio, plain video otherwise.
    fn resolve_video_pid(room: &Room, audio_pid: &str) -> Option<String> {
        let (owner, kind) = room.find_producer_owner(audio_pid)?;
        let video_kind = if kind == StreamKind::ScreenAudio {
            StreamKind::ScreenVideo
        } else {
            StreamKind::Video
        };
        owner.producer(video_kind).map(|p| p.id())
    }

    /// Connect a transport with client DTLS parameters. A transport whose
    /// DTLS is already connecting or connected acks success without
    /// re-issuing the handshake.
    pub async fn connect_transport(
        &self,
        peer: &Arc<Peer>,
        transport_id: Option<&str>,
        role: TransportRole,
        audio_pid: Option<&str>,
        dtls: DtlsParameters,
    ) -> Result<()> {
        let transport = if let Some(id) = transport_id {
            peer.transport_by_id(id)
        } else {
            match role {
                TransportRole::Producer => peer.upstream(),
                TransportRole::Consumer => {
                    audio_pid.and_then(|pid| peer.downstream_for_audio_pid(pid))
                }
            }
        }
        .ok_or_else(|| Error::NotFound("Transport not found".into()))?;

        if transport.dtls_state().is_settled() {
            tracing::debug!(
                transport_id = %transport.id(),
                state = ?transport.dtls_state(),
                "Transport connect skipped, DTLS already settled"
            );
            return Ok(());
        }

        transport.connect(dtls).await
    }

    /// Produce a stream on the peer's upstream transport. Audio-ranked kinds
    /// are appended to the room's active-speaker list and registered with
    /// the observer; the dominant-speaker handler re-ranks them later.
    pub async fn start_producing(
        &self,
        room: &Room,
        peer: &Arc<Peer>,
        stream_kind: StreamKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn ProducerHandle>> {
        let upstream = peer.live_upstream().ok_or(Error::NoUpstream)?;

        let producer = upstream
            .produce(stream_kind.media_kind(), rtp_parameters)
            .await?;
        peer.add_producer(stream_kind, Arc::clone(&producer));

        if stream_kind.is_speaker_audio() {
            room.push_speaker(&producer.id());
            if let Some(observer) = room.observer() {
                observer.add_producer(&producer.id()).await?;
            }
        }

        tracing::info!(
            room_id = %room.id(),
            participant_id = %peer.user_id,
            kind = %stream_kind,
            producer_id = %producer.id(),
            "Producer created"
        );
        Ok(producer)
    }

    /// Consume a remote producer on the matching downstream transport. The
    /// consumer is created unpaused for lowest latency.
    pub async fn consume_media(
        &self,
        room: &Room,
        peer: &Arc<Peer>,
        rtp_capabilities: RtpCapabilities,
        pid: &str,
    ) -> Result<ConsumeResult> {
        // The requested kind on the wire is advisory; trust the producer
        // registry for the actual kind.
        let actual_kind = room
            .find_producer_owner(pid)
            .map(|(_, kind)| kind)
            .ok_or_else(|| Error::CannotConsume(pid.to_string()))?;

        let router = room.router()?;
        if !router.can_consume(pid, &rtp_capabilities) {
            return Err(Error::CannotConsume(pid.to_string()));
        }

        let transport = match actual_kind.media_kind() {
            MediaKind::Audio => peer.downstream_for_audio_pid(pid),
            MediaKind::Video => peer.downstream_for_video_pid(pid),
        }
        .ok_or_else(|| Error::DownstreamNotFound(pid.to_string()))?;

        let consumer = transport.consume(pid, rtp_capabilities, false).await?;
        let attached = match actual_kind.media_kind() {
            MediaKind::Audio => peer.attach_consumer(pid, actual_kind, Arc::clone(&consumer)),
            MediaKind::Video => {
                peer.attach_video_consumer(pid, actual_kind, Arc::clone(&consumer))
            }
        };
        if !attached {
            consumer.close().await;
            return Err(Error::DownstreamNotFound(pid.to_string()));
        }

        Ok(ConsumeResult {
            id: consumer.id(),
            producer_id: pid.to_string(),
            kind: actual_kind,
            rtp_parameters: consumer.rtp_parameters(),
        })
    }

    /// Resume the consumer bound to `pid`.
    pub async fn unpause_consumer(&self, room: &Room, peer: &Arc<Peer>, pid: &str) -> Result<()> {
        let media_kind = room
            .find_producer_owner(pid)
            .map(|(_, kind)| kind.media_kind());

        let consumer = match media_kind {
            Some(kind) => peer.consumer_for(pid, kind),
            // Producer already gone: fall back to searching both kinds.
            None => peer
                .consumer_for(pid, MediaKind::Audio)
                .or_else(|| peer.consumer_for(pid, MediaKind::Video)),
        }
        .ok_or_else(|| Error::ConsumerNotFound(pid.to_string()))?;

        consumer.resume().await
    }

    /// Mute or unmute the peer's audio producer.
    pub async fn handle_audio_change(&self, peer: &Arc<Peer>, mute: bool) -> Result<()> {
        let producer = peer
            .producer(StreamKind::Audio)
            .filter(|p| !p.is_closed())
            .ok_or_else(|| Error::NotFound("No audio producer".into()))?;

        if mute {
            producer.pause().await
        } else {
            producer.resume().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RoomSignal;
    use crate::sfu::sim::SimBackend;
    use crate::sfu::DtlsState;
    use confab_core::config::{RouterConfig, WorkerPoolConfig};
    use confab_core::models::{RoomId, SocketId, UserId};
    use tokio::sync::mpsc;

    async fn setup() -> (MediaService, Room, mpsc::UnboundedReceiver<RoomSignal>) {
        let workers = WorkerPool::start(
            Arc::new(SimBackend::new()),
            WorkerPoolConfig {
                count: 1,
                ..WorkerPoolConfig::default()
            },
        )
        .await
        .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let room = Room::create(
            RoomId::from("r1"),
            UserId::from("owner"),
            None,
            workers.pick_for_room(&RoomId::from("r1")).unwrap(),
            &RouterConfig::default(),
            tx,
        )
        .await
        .unwrap();

        let service = MediaService::new(
            workers,
            MediaServiceConfig {
                listen_ip: "127.0.0.1".into(),
                announced_ip: None,
                initial_outgoing_bitrate: 600_000,
                max_incoming_bitrate: 1_500_000,
            },
        );
        (service, room, rx)
    }

    fn peer(room: &Room, user: &str, socket: &str) -> Arc<Peer> {
        let peer = Arc::new(Peer::new(
            UserId::from(user),
            user.to_string(),
            SocketId::from(socket),
            room.id().clone(),
        ));
        room.add_peer(Arc::clone(&peer));
        peer
    }

    fn producer_request() -> TransportRequest {
        TransportRequest {
            role: TransportRole::Producer,
            stream_kind: None,
            producer_id: None,
            audio_pid: None,
        }
    }

    async fn produce_audio(
        service: &MediaService,
        room: &Room,
        peer: &Arc<Peer>,
    ) -> Arc<dyn ProducerHandle> {
        service
            .handle_transport_request(room, peer, producer_request())
            .await
            .unwrap();
        service
            .connect_transport(
                peer,
                None,
                TransportRole::Producer,
                None,
                DtlsParameters(serde_json::json!({})),
            )
            .await
            .unwrap();
        service
            .start_producing(
                room,
                peer,
                StreamKind::Audio,
                RtpParameters(serde_json::json!({})),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_producer_transport_request_idempotent() {
        let (service, room, _rx) = setup().await;
        let peer = peer(&room, "u1", "s1");

        let first = service
            .handle_transport_request(&room, &peer, producer_request())
            .await
            .unwrap();
        let second = service
            .handle_transport_request(&room, &peer, producer_request())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(peer.transport_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_transport_idempotent() {
        let (service, room, _rx) = setup().await;
        let peer = peer(&room, "u1", "s1");

        service
            .handle_transport_request(&room, &peer, producer_request())
            .await
            .unwrap();

        for _ in 0..3 {
            service
                .connect_transport(
                    &peer,
                    None,
                    TransportRole::Producer,
                    None,
                    DtlsParameters(serde_json::json!({})),
                )
                .await
                .unwrap();
        }
        assert_eq!(peer.upstream().unwrap().dtls_state(), DtlsState::Connected);
    }

    #[tokio::test]
    async fn test_start_producing_requires_upstream() {
        let (service, room, _rx) = setup().await;
        let peer = peer(&room, "u1", "s1");

        let err = service
            .start_producing(
                &room,
                &peer,
                StreamKind::Audio,
                RtpParameters(serde_json::json!({})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoUpstream));
    }

    #[tokio::test]
    async fn test_audio_producer_joins_speaker_list() {
        let (service, room, _rx) = setup().await;
        let peer = peer(&room, "u1", "s1");

        let producer = produce_audio(&service, &room, &peer).await;
        assert_eq!(room.active_speakers(), vec![producer.id()]);
    }

    #[tokio::test]
    async fn test_consume_full_flow() {
        let (service, room, _rx) = setup().await;
        let alice = peer(&room, "u1", "s1");
        let bob = peer(&room, "u2", "s2");

        let audio = produce_audio(&service, &room, &alice).await;

        // Bob requests a downstream transport keyed by Alice's audio pid.
        let request = TransportRequest {
            role: TransportRole::Consumer,
            stream_kind: Some(StreamKind::Audio),
            producer_id: Some(audio.id()),
            audio_pid: Some(audio.id()),
        };
        let params = service
            .handle_transport_request(&room, &bob, request.clone())
            .await
            .unwrap();

        // Second request for the same pid returns the same transport.
        let again = service
            .handle_transport_request(&room, &bob, request)
            .await
            .unwrap();
        assert_eq!(params.id, again.id);

        let caps = room.router().unwrap().rtp_capabilities();
        let consumed = service
            .consume_media(&room, &bob, caps, &audio.id())
            .await
            .unwrap();
        assert_eq!(consumed.kind, StreamKind::Audio);
        assert_eq!(consumed.producer_id, audio.id());

        // The consumer was created unpaused; unpause is still a no-op success.
        service
            .unpause_consumer(&room, &bob, &audio.id())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_consume_unknown_producer_fails() {
        let (service, room, _rx) = setup().await;
        let bob = peer(&room, "u2", "s2");

        let caps = room.router().unwrap().rtp_capabilities();
        let err = service
            .consume_media(&room, &bob, caps, "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CannotConsume(_)));
    }

    #[tokio::test]
    async fn test_consume_without_downstream_fails() {
        let (service, room, _rx) = setup().await;
        let alice = peer(&room, "u1", "s1");
        let bob = peer(&room, "u2", "s2");

        let audio = produce_audio(&service, &room, &alice).await;
        let caps = room.router().unwrap().rtp_capabilities();

        let err = service
            .consume_media(&room, &bob, caps, &audio.id())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DownstreamNotFound(_)));
    }

    #[tokio::test]
    async fn test_unpause_unknown_consumer_fails() {
        let (service, room, _rx) = setup().await;
        let bob = peer(&room, "u2", "s2");

        let err = service
            .unpause_consumer(&room, &bob, "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConsumerNotFound(_)));
    }

    #[tokio::test]
    async fn test_audio_change_mute_unmute() {
        let (service, room, _rx) = setup().await;
        let peer = peer(&room, "u1", "s1");
        let producer = produce_audio(&service, &room, &peer).await;

        service.handle_audio_change(&peer, true).await.unwrap();
        assert!(producer.paused());
        service.handle_audio_change(&peer, false).await.unwrap();
        assert!(!producer.paused());
    }

    #[tokio::test]
    async fn test_screen_audio_resolves_screen_video() {
        let (service, room, _rx) = setup().await;
        let alice = peer(&room, "u1", "s1");
        let bob = peer(&room, "u2", "s2");

        service
            .handle_transport_request(&room, &alice, producer_request())
            .await
            .unwrap();
        let screen_audio = service
            .start_producing(
                &room,
                &alice,
                StreamKind::ScreenAudio,
                RtpParameters(serde_json::json!({})),
            )
            .await
            .unwrap();
        let screen_video = service
            .start_producing(
                &room,
                &alice,
                StreamKind::ScreenVideo,
                RtpParameters(serde_json::json!({})),
            )
            .await
            .unwrap();

        service
            .handle_transport_request(
                &room,
                &bob,
                TransportRequest {
                    role: TransportRole::Consumer,
                    stream_kind: None,
                    producer_id: None,
                    audio_pid: Some(screen_audio.id()),
                },
            )
            .await
            .unwrap();

        assert!(bob.downstream_for_video_pid(&screen_video.id()).is_some());
    }
}
