//! Per-peer media state.
//!
//! A peer binds to exactly one socket and at most one room. It owns one
//! upstream transport (peer → SFU) and one downstream transport per remote
//! audio stream it consumes, each holding consumers keyed by stream kind.
//! Producers exist only after the upstream transport is DTLS-connected.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use confab_core::models::{MediaKind, RoomId, SocketId, StreamKind, UserId};

use crate::sfu::{ConsumerHandle, ProducerHandle, TransportHandle};

/// Direction of a requested transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Producer,
    Consumer,
}

/// One SFU→peer transport carrying a remote audio stream and its associated
/// video. Audio and video consumers pause and resume independently.
pub struct DownstreamTransport {
    pub transport: Arc<dyn TransportHandle>,
    pub associated_audio_pid: Option<String>,
    pub associated_video_pid: Option<String>,
    /// Optional explicit `(stream kind → producer id)` bindings supplied by
    /// newer clients alongside the legacy pid pair.
    pub stream_producers: HashMap<StreamKind, String>,
    pub consumers: HashMap<StreamKind, Arc<dyn ConsumerHandle>>,
}

#[derive(Default)]
struct PeerState {
    upstream: Option<Arc<dyn TransportHandle>>,
    downstreams: Vec<DownstreamTransport>,
    producers: HashMap<StreamKind, Arc<dyn ProducerHandle>>,
}

pub struct Peer {
    pub user_id: UserId,
    pub display_name: String,
    pub socket_id: SocketId,
    pub room_id: RoomId,
    state: Mutex<PeerState>,
}

impl Peer {
    #[must_use]
    pub fn new(
        user_id: UserId,
        display_name: String,
        socket_id: SocketId,
        room_id: RoomId,
    ) -> Self {
        Self {
            user_id,
            display_name,
            socket_id,
            room_id,
            state: Mutex::new(PeerState::default()),
        }
    }

    pub fn upstream(&self) -> Option<Arc<dyn TransportHandle>> {
        self.state.lock().upstream.clone()
    }

    /// A live (not closed) upstream transport, if one exists.
    pub fn live_upstream(&self) -> Option<Arc<dyn TransportHandle>> {
        self.state
            .lock()
            .upstream
            .clone()
            .filter(|t| !t.is_closed())
    }

    pub fn set_upstream(&self, transport: Arc<dyn TransportHandle>) {
        self.state.lock().upstream = Some(transport);
    }

    pub fn push_downstream(&self, downstream: DownstreamTransport) {
        self.state.lock().downstreams.push(downstream);
    }

    /// The live downstream transport bound to a remote audio producer.
    pub fn downstream_for_audio_pid(&self, audio_pid: &str) -> Option<Arc<dyn TransportHandle>> {
        self.state
            .lock()
            .downstreams
            .iter()
            .find(|d| {
                d.associated_audio_pid.as_deref() == Some(audio_pid) && !d.transport.is_closed()
            })
            .map(|d| Arc::clone(&d.transport))
    }

    /// The live downstream transport whose associated video producer is `video_pid`.
    pub fn downstream_for_video_pid(&self, video_pid: &str) -> Option<Arc<dyn TransportHandle>> {
        self.state
            .lock()
            .downstreams
            .iter()
            .find(|d| {
                d.associated_video_pid.as_deref() == Some(video_pid) && !d.transport.is_closed()
            })
            .map(|d| Arc::clone(&d.transport))
    }

    /// Find any transport (upstream or downstream) by id.
    pub fn transport_by_id(&self, transport_id: &str) -> Option<Arc<dyn TransportHandle>> {
        let state = self.state.lock();
        if let Some(upstream) = state.upstream.as_ref() {
            if upstream.id() == transport_id {
                return Some(Arc::clone(upstream));
            }
        }
        state
            .downstreams
            .iter()
            .find(|d| d.transport.id() == transport_id)
            .map(|d| Arc::clone(&d.transport))
    }

    /// Attach a consumer to the downstream transport carrying `audio_pid`.
    pub fn attach_consumer(
        &self,
        audio_pid: &str,
        kind: StreamKind,
        consumer: Arc<dyn ConsumerHandle>,
    ) -> bool {
        let mut state = self.state.lock();
        if let Some(downstream) = state
            .downstreams
            .iter_mut()
            .find(|d| d.associated_audio_pid.as_deref() == Some(audio_pid))
        {
            downstream.consumers.insert(kind, consumer);
            true
        } else {
            false
        }
    }

    /// Attach a consumer to the downstream transport whose associated video
    /// producer is `video_pid`.
    pub fn attach_video_consumer(
        &self,
        video_pid: &str,
        kind: StreamKind,
        consumer: Arc<dyn ConsumerHandle>,
    ) -> bool {
        let mut state = self.state.lock();
        if let Some(downstream) = state
            .downstreams
            .iter_mut()
            .find(|d| d.associated_video_pid.as_deref() == Some(video_pid))
        {
            downstream.consumers.insert(kind, consumer);
            true
        } else {
            false
        }
    }

    pub fn add_producer(&self, kind: StreamKind, producer: Arc<dyn ProducerHandle>) {
        self.state.lock().producers.insert(kind, producer);
    }

    pub fn producer(&self, kind: StreamKind) -> Option<Arc<dyn ProducerHandle>> {
        self.state.lock().producers.get(&kind).cloned()
    }

    /// Snapshot of all producers by stream kind.
    pub fn producers(&self) -> Vec<(StreamKind, Arc<dyn ProducerHandle>)> {
        self.state
            .lock()
            .producers
            .iter()
            .map(|(k, p)| (*k, Arc::clone(p)))
            .collect()
    }

    /// The stream kind under which this peer produces `producer_id`, if any.
    pub fn owns_producer(&self, producer_id: &str) -> Option<(StreamKind, Arc<dyn ProducerHandle>)> {
        self.state
            .lock()
            .producers
            .iter()
            .find(|(_, p)| p.id() == producer_id)
            .map(|(k, p)| (*k, Arc::clone(p)))
    }

    pub fn remove_producer(&self, producer_id: &str) -> Option<(StreamKind, Arc<dyn ProducerHandle>)> {
        let mut state = self.state.lock();
        let kind = state
            .producers
            .iter()
            .find(|(_, p)| p.id() == producer_id)
            .map(|(k, _)| *k)?;
        state.producers.remove(&kind).map(|p| (kind, p))
    }

    /// An open consumer of the given media kind fed by `producer_id`.
    pub fn consumer_for(
        &self,
        producer_id: &str,
        media_kind: MediaKind,
    ) -> Option<Arc<dyn ConsumerHandle>> {
        self.state
            .lock()
            .downstreams
            .iter()
            .flat_map(|d| d.consumers.values())
            .find(|c| {
                c.producer_id() == producer_id && c.kind() == media_kind && !c.is_closed()
            })
            .map(Arc::clone)
    }

    /// Open video consumers on the downstream transport associated with the
    /// given audio pid. Used by the engine's keep-video-flowing policy.
    pub fn video_consumers_for_audio_pid(&self, audio_pid: &str) -> Vec<Arc<dyn ConsumerHandle>> {
        self.state
            .lock()
            .downstreams
            .iter()
            .filter(|d| d.associated_audio_pid.as_deref() == Some(audio_pid))
            .flat_map(|d| d.consumers.values())
            .filter(|c| c.kind() == MediaKind::Video && !c.is_closed())
            .map(Arc::clone)
            .collect()
    }

    /// Total transports currently held (for worker accounting).
    pub fn transport_count(&self) -> usize {
        let state = self.state.lock();
        usize::from(state.upstream.is_some()) + state.downstreams.len()
    }

    /// Null out downstream associations pointing at a departed peer's
    /// producers, leaving the transports reusable.
    pub fn clear_downstream_refs(&self, producer_ids: &[String]) {
        let mut state = self.state.lock();
        for downstream in &mut state.downstreams {
            if let Some(pid) = downstream.associated_audio_pid.as_deref() {
                if producer_ids.iter().any(|p| p.as_str() == pid) {
                    downstream.associated_audio_pid = None;
                }
            }
            if let Some(pid) = downstream.associated_video_pid.as_deref() {
                if producer_ids.iter().any(|p| p.as_str() == pid) {
                    downstream.associated_video_pid = None;
                }
            }
            downstream
                .stream_producers
                .retain(|_, pid| !producer_ids.iter().any(|p| p.as_str() == pid.as_str()));
        }
    }

    /// Close everything the peer holds. Idempotent: a second call finds the
    /// maps already empty.
    pub async fn cleanup(&self) {
        let (upstream, downstreams, producers) = {
            let mut state = self.state.lock();
            (
                state.upstream.take(),
                std::mem::take(&mut state.downstreams),
                std::mem::take(&mut state.producers),
            )
        };

        for (_, producer) in producers {
            producer.close().await;
        }
        if let Some(upstream) = upstream {
            upstream.close().await;
        }
        for downstream in downstreams {
            for consumer in downstream.consumers.values() {
                consumer.close().await;
            }
            downstream.transport.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::sim::SimBackend;
    use crate::sfu::{
        RouterHandle, RtpParameters, SfuBackend, WebRtcTransportOptions, WorkerSettings,
    };

    async fn router() -> Arc<dyn RouterHandle> {
        let backend = SimBackend::new();
        let worker = backend
            .spawn_worker(&WorkerSettings {
                rtc_min_port: 40000,
                rtc_max_port: 49999,
                log_level: "warn".into(),
            })
            .await
            .unwrap();
        worker.create_router().await.unwrap()
    }

    fn options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: "127.0.0.1".into(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_outgoing_bitrate: 600_000,
        }
    }

    fn peer() -> Peer {
        Peer::new(
            UserId::from("u1"),
            "Alice".into(),
            SocketId::from("s1"),
            RoomId::from("r1"),
        )
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let router = router().await;
        let peer = peer();

        let upstream = router.create_webrtc_transport(options()).await.unwrap();
        peer.set_upstream(Arc::clone(&upstream));
        let producer = upstream
            .produce(MediaKind::Audio, RtpParameters(serde_json::json!({})))
            .await
            .unwrap();
        peer.add_producer(StreamKind::Audio, Arc::clone(&producer));

        assert_eq!(peer.transport_count(), 1);

        peer.cleanup().await;
        assert!(upstream.is_closed());
        assert!(producer.is_closed());
        assert_eq!(peer.transport_count(), 0);

        // Second pass finds nothing and does not panic.
        peer.cleanup().await;
    }

    #[tokio::test]
    async fn test_downstream_lookup_and_refs() {
        let router = router().await;
        let peer = peer();

        let transport = router.create_webrtc_transport(options()).await.unwrap();
        peer.push_downstream(DownstreamTransport {
            transport: Arc::clone(&transport),
            associated_audio_pid: Some("PA".into()),
            associated_video_pid: Some("PV".into()),
            stream_producers: HashMap::new(),
            consumers: HashMap::new(),
        });

        assert!(peer.downstream_for_audio_pid("PA").is_some());
        assert!(peer.downstream_for_audio_pid("PX").is_none());
        assert!(peer.downstream_for_video_pid("PV").is_some());

        peer.clear_downstream_refs(&["PA".to_string(), "PV".to_string()]);
        assert!(peer.downstream_for_audio_pid("PA").is_none());
        assert!(peer.downstream_for_video_pid("PV").is_none());
        // The transport itself survives for reuse.
        assert!(!transport.is_closed());
        assert_eq!(peer.transport_count(), 1);
    }

    #[tokio::test]
    async fn test_owns_and_removes_producer() {
        let router = router().await;
        let peer = peer();

        let upstream = router.create_webrtc_transport(options()).await.unwrap();
        let producer = upstream
            .produce(MediaKind::Audio, RtpParameters(serde_json::json!({})))
            .await
            .unwrap();
        peer.add_producer(StreamKind::ScreenAudio, Arc::clone(&producer));

        let (kind, _) = peer.owns_producer(&producer.id()).unwrap();
        assert_eq!(kind, StreamKind::ScreenAudio);

        let (kind, removed) = peer.remove_producer(&producer.id()).unwrap();
        assert_eq!(kind, StreamKind::ScreenAudio);
        assert_eq!(removed.id(), producer.id());
        assert!(peer.owns_producer(&producer.id()).is_none());
    }

    #[tokio::test]
    async fn test_consumer_for_matches_kind() {
        let router = router().await;
        let peer = peer();

        let upstream = router.create_webrtc_transport(options()).await.unwrap();
        let audio = upstream
            .produce(MediaKind::Audio, RtpParameters(serde_json::json!({})))
            .await
            .unwrap();
        let video = upstream
            .produce(MediaKind::Video, RtpParameters(serde_json::json!({})))
            .await
            .unwrap();

        let downstream = router.create_webrtc_transport(options()).await.unwrap();
        let caps = router.rtp_capabilities();
        let audio_consumer = downstream
            .consume(&audio.id(), caps.clone(), false)
            .await
            .unwrap();
        let video_consumer = downstream
            .consume(&video.id(), caps, false)
            .await
            .unwrap();

        peer.push_downstream(DownstreamTransport {
            transport: downstream,
            associated_audio_pid: Some(audio.id()),
            associated_video_pid: Some(video.id()),
            stream_producers: HashMap::new(),
            consumers: HashMap::from([
                (StreamKind::Audio, audio_consumer),
                (StreamKind::Video, video_consumer),
            ]),
        });

        assert!(peer.consumer_for(&audio.id(), MediaKind::Audio).is_some());
        assert!(peer.consumer_for(&audio.id(), MediaKind::Video).is_none());
        assert_eq!(peer.video_consumers_for_audio_pid(&audio.id()).len(), 1);
    }
}
