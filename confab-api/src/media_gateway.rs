//! Streaming gateway.
//!
//! Stateless routing of media socket events into the engine: join/leave
//! lifecycle, transport plumbing, producer/consumer operations, and the
//! post-produce reconciliation fan-out. All per-room mutation and emission
//! happens under the room-id lock; room signals (dominant speaker, periodic
//! refresh) re-enter the engine through the same lock.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use confab_core::config::RouterConfig;
use confab_core::models::{generate_id, RoomId, SocketId, StreamKind, UserId};
use confab_core::service::Locks;
use confab_core::{validation, Error, Result};
use confab_media::capture::AudioCapture;
use confab_media::peer::{Peer, TransportRole};
use confab_media::room::{Room, RoomRegistry, RoomSignal};
use confab_media::service::{MediaService, TransportRequest};
use confab_media::speaker::{build_new_producers_payload, DominantSpeakerHandler};
use confab_media::sfu::{DtlsParameters, RtpCapabilities, RtpParameters};
use confab_media::workers::WorkerPool;

use crate::hub::ClusterHub;
use crate::protocol::{
    ack_error, ack_ok, events, AudioChangePayload, CloseProducersPayload, ConnectTransportPayload,
    ConsumeMediaPayload, JoinRoomPayload, RequestTransportPayload, StartProducingPayload,
    UnpauseConsumerPayload,
};

pub struct StreamingGateway {
    registry: RoomRegistry,
    workers: WorkerPool,
    service: MediaService,
    handler: Arc<DominantSpeakerHandler>,
    capture: AudioCapture,
    locks: Locks,
    hub: ClusterHub,
    router_config: RouterConfig,
    signals: mpsc::UnboundedSender<RoomSignal>,
    socket_rooms: DashMap<SocketId, RoomId>,
    cancel: CancellationToken,
}

impl StreamingGateway {
    /// Build the gateway and start the room-signal loop.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        registry: RoomRegistry,
        workers: WorkerPool,
        service: MediaService,
        handler: Arc<DominantSpeakerHandler>,
        capture: AudioCapture,
        locks: Locks,
        hub: ClusterHub,
        router_config: RouterConfig,
    ) -> Arc<Self> {
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(Self {
            registry,
            workers,
            service,
            handler,
            capture,
            locks,
            hub,
            router_config,
            signals,
            socket_rooms: DashMap::new(),
            cancel: CancellationToken::new(),
        });
        gateway.clone().spawn_signal_loop(signals_rx);
        gateway
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Dominant-speaker events and periodic refreshes re-enter the engine
    /// here, serialized per room by the room-id lock.
    fn spawn_signal_loop(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<RoomSignal>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    () = cancel.cancelled() => return,
                    signal = signals.recv() => match signal {
                        Some(signal) => signal,
                        None => return,
                    },
                };

                let (room_id, producer_id) = match signal {
                    RoomSignal::Refresh(room_id) => (room_id, None),
                    RoomSignal::DominantSpeaker {
                        room_id,
                        producer_id,
                    } => (room_id, Some(producer_id)),
                };

                let Some(room) = self.registry.get(&room_id) else {
                    continue;
                };
                let handler = Arc::clone(&self.handler);
                let outcome = self
                    .locks
                    .with_lock(room_id.as_str(), || async {
                        match &producer_id {
                            Some(producer_id) => {
                                handler.on_dominant_speaker(&room, producer_id).await
                            }
                            None => handler.run(&room).await,
                        }
                    })
                    .await;
                if let Err(e) = outcome {
                    tracing::warn!(room_id = %room_id, error = %e, "Room signal handling failed");
                }
            }
        });
    }

    fn room_and_peer(&self, socket: &SocketId) -> Result<(Room, Arc<Peer>)> {
        let room_id = self
            .socket_rooms
            .get(socket)
            .map(|r| r.clone())
            .ok_or(Error::NotInRoom)?;
        let room = self.registry.get(&room_id).ok_or(Error::NotInRoom)?;
        let peer = room.peer_by_socket(socket).ok_or(Error::NotInRoom)?;
        Ok((room, peer))
    }

    /// Per-request failures become acks; store and lock-lease faults
    /// propagate to the socket loop, which logs, acks a generic failure,
    /// and for store faults drops the socket.
    fn settle<T>(outcome: Result<T>, ack: impl FnOnce(T) -> Value) -> Result<Value> {
        match outcome {
            Ok(value) => Ok(ack(value)),
            Err(e) if e.is_connection_fault() => Err(e),
            Err(e) => Ok(Self::ack_failure(&e)),
        }
    }

    fn ack_failure(error: &Error) -> Value {
        match error {
            Error::CannotConsume(_) => Value::String("cannotConsume".into()),
            Error::DownstreamNotFound(_) => Value::String("consumeFailed".into()),
            Error::ConsumerNotFound(_) => Value::String("consumerNotFound".into()),
            Error::InvalidRoomPassword => {
                serde_json::json!({ "error": "Invalid room password" })
            }
            Error::Banned { .. } => serde_json::json!({ "error": "Banned from room" }),
            other => serde_json::json!({ "error": other.to_string() }),
        }
    }

    // ---- joinRoom --------------------------------------------------------

    /// `joinRoom {roomId, userName, password?}`
    pub async fn join_room(&self, socket: &SocketId, data: Value) -> Result<Value> {
        let payload: JoinRoomPayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => return Ok(ack_error(&format!("Invalid payload: {e}"))),
        };
        if let Err(e) = validation::validate_id("roomId", &payload.room_id)
            .and_then(|()| validation::validate_display_name(&payload.user_name))
            .and_then(|()| {
                payload
                    .password
                    .as_deref()
                    .map_or(Ok(()), validation::validate_password)
            })
        {
            return Ok(ack_error(&e.to_string()));
        }

        Self::settle(self.join_room_inner(socket, payload).await, |view| view)
    }

    async fn join_room_inner(&self, socket: &SocketId, payload: JoinRoomPayload) -> Result<Value> {
        let room_id = RoomId::from_string(payload.room_id.clone());
        let user_id = UserId::from_string(
            payload
                .user_id
                .clone()
                .unwrap_or_else(generate_id),
        );
        let now_ms = chrono::Utc::now().timestamp_millis();

        self.locks
            .with_lock(room_id.as_str(), || async {
                let (room, is_new) = match self.registry.get(&room_id) {
                    Some(room) => {
                        if room.is_blocked(&user_id, now_ms) {
                            return Err(Error::Banned { until: now_ms });
                        }
                        if !room.password_matches(payload.password.as_deref()) {
                            return Err(Error::InvalidRoomPassword);
                        }
                        (room, false)
                    }
                    None => {
                        let worker = self.workers.pick_for_room(&room_id)?;
                        let pid = worker.pid;
                        let room = Room::create(
                            room_id.clone(),
                            user_id.clone(),
                            payload.password.clone(),
                            worker,
                            &self.router_config,
                            self.signals.clone(),
                        )
                        .await?;
                        self.registry.insert(room.clone());
                        self.workers.inc_routers(pid, 1);
                        (room, true)
                    }
                };

                // One live peer per user: a reconnect evicts the old socket.
                if let Some(stale) = room
                    .peer_by_user(&user_id)
                    .filter(|p| &p.socket_id != socket)
                {
                    tracing::info!(
                        room_id = %room_id,
                        participant_id = %user_id,
                        old_socket = %stale.socket_id,
                        "Evicting stale peer on rejoin"
                    );
                    self.hub.disconnect_sockets(&[stale.socket_id.clone()]);
                    room.remove_peer_by_socket(&stale.socket_id);
                    self.socket_rooms.remove(&stale.socket_id);
                    self.workers
                        .inc_transports(room.worker_pid(), -(stale.transport_count() as i32));
                    stale.cleanup().await;
                }

                let peer = Arc::new(Peer::new(
                    user_id.clone(),
                    payload.user_name.clone(),
                    socket.clone(),
                    room_id.clone(),
                ));
                room.add_peer(Arc::clone(&peer));
                self.socket_rooms.insert(socket.clone(), room_id.clone());
                self.hub.hub().join(socket, room_id.as_str());

                if !is_new {
                    self.hub.broadcast(
                        room_id.as_str(),
                        events::NEW_PARTICIPANT,
                        serde_json::json!({
                            "participantId": user_id,
                            "displayName": payload.user_name,
                        }),
                        Some(socket),
                    );
                }

                let view = build_new_producers_payload(
                    &room,
                    &room.active_speakers_truncated(self.router_config.max_active_speakers),
                    self.router_config.max_active_speakers,
                )?;
                Ok(ack_ok(serde_json::to_value(&view)?))
            })
            .await
    }

    // ---- transport plumbing ---------------------------------------------

    /// `requestTransport`
    pub async fn request_transport(&self, socket: &SocketId, data: Value) -> Result<Value> {
        let payload: RequestTransportPayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => return Ok(ack_error(&format!("Invalid payload: {e}"))),
        };
        let role = match payload.role.as_str() {
            "producer" => TransportRole::Producer,
            "consumer" => TransportRole::Consumer,
            other => return Ok(ack_error(&format!("Unknown transport role: {other}"))),
        };

        let outcome = async {
            let (room, peer) = self.room_and_peer(socket)?;
            let params = self
                .service
                .handle_transport_request(
                    &room,
                    &peer,
                    TransportRequest {
                        role,
                        stream_kind: payload.stream_kind,
                        producer_id: payload.producer_id,
                        audio_pid: payload.audio_pid,
                    },
                )
                .await?;
            Ok(serde_json::to_value(&params)?)
        }
        .await;

        Self::settle(outcome, |params| params)
    }

    /// `connectTransport`
    pub async fn connect_transport(&self, socket: &SocketId, data: Value) -> Result<Value> {
        let payload: ConnectTransportPayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => return Ok(ack_error(&format!("Invalid payload: {e}"))),
        };
        let role = match payload.role.as_deref() {
            Some("consumer") => TransportRole::Consumer,
            _ => TransportRole::Producer,
        };

        let outcome = async {
            let (_, peer) = self.room_and_peer(socket)?;
            self.service
                .connect_transport(
                    &peer,
                    payload.transport_id.as_deref(),
                    role,
                    payload.audio_pid.as_deref(),
                    DtlsParameters(payload.dtls_parameters),
                )
                .await
        }
        .await;

        Self::settle(outcome, |()| serde_json::json!({ "success": true }))
    }

    // ---- producing -------------------------------------------------------

    /// `startProducing`: create the producer, provision the audio side-tap
    /// for plain audio, then reconcile and fan out under the room lock.
    pub async fn start_producing(&self, socket: &SocketId, data: Value) -> Result<Value> {
        let payload: StartProducingPayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => return Ok(ack_error(&format!("Invalid payload: {e}"))),
        };

        let outcome = async {
            let (room, peer) = self.room_and_peer(socket)?;
            let producer = self
                .service
                .start_producing(
                    &room,
                    &peer,
                    payload.stream_kind,
                    RtpParameters(payload.rtp_parameters),
                )
                .await?;

            // Screen audio is never tapped; a tap failure never affects media.
            if payload.stream_kind == StreamKind::Audio {
                if let Err(e) = self.capture.start_tap(&room, &peer, &producer.id()).await {
                    tracing::warn!(
                        room_id = %room.id(),
                        producer_id = %producer.id(),
                        error = %e,
                        "Audio side-tap unavailable, continuing without capture"
                    );
                }
            }

            self.locks
                .with_lock(room.id().as_str(), || async {
                    self.handler.run(&room).await?;
                    self.hub.broadcast(
                        room.id().as_str(),
                        events::NEW_PRODUCER,
                        serde_json::json!({
                            "participantId": peer.user_id,
                            "displayName": peer.display_name,
                            "kind": payload.stream_kind,
                            "producerId": producer.id(),
                        }),
                        Some(socket),
                    );
                    Ok(())
                })
                .await?;

            Ok(producer.id())
        }
        .await;

        Self::settle(outcome, |producer_id| {
            ack_ok(serde_json::json!({ "producerId": producer_id }))
        })
    }

    // ---- consuming -------------------------------------------------------

    /// `consumeMedia`
    pub async fn consume_media(&self, socket: &SocketId, data: Value) -> Result<Value> {
        let payload: ConsumeMediaPayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => return Ok(ack_error(&format!("Invalid payload: {e}"))),
        };

        let outcome = async {
            let (room, peer) = self.room_and_peer(socket)?;
            self.service
                .consume_media(
                    &room,
                    &peer,
                    RtpCapabilities(payload.rtp_capabilities),
                    &payload.pid,
                )
                .await
        }
        .await;

        Self::settle(outcome, |consumed| {
            serde_json::json!({
                "id": consumed.id,
                "producerId": consumed.producer_id,
                "kind": consumed.kind,
                "rtpParameters": consumed.rtp_parameters,
            })
        })
    }

    /// `unpauseConsumer`
    pub async fn unpause_consumer(&self, socket: &SocketId, data: Value) -> Result<Value> {
        let payload: UnpauseConsumerPayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => return Ok(ack_error(&format!("Invalid payload: {e}"))),
        };

        let outcome = async {
            let (room, peer) = self.room_and_peer(socket)?;
            self.service
                .unpause_consumer(&room, &peer, &payload.pid)
                .await
        }
        .await;

        Self::settle(outcome, |()| serde_json::json!({ "success": true }))
    }

    /// `audioChange`: pause/resume the peer's audio producer and tell the
    /// rest of the room about the new mute state.
    pub async fn audio_change(&self, socket: &SocketId, data: Value) -> Result<Value> {
        let payload: AudioChangePayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => return Ok(ack_error(&format!("Invalid payload: {e}"))),
        };
        let mute = match payload.op.as_str() {
            "mute" => true,
            "unmute" => false,
            other => return Ok(ack_error(&format!("Unknown audio op: {other}"))),
        };

        let outcome = async {
            let (room, peer) = self.room_and_peer(socket)?;
            self.service.handle_audio_change(&peer, mute).await?;
            self.hub.broadcast(
                room.id().as_str(),
                events::AUDIO_CHANGE,
                serde_json::json!({
                    "participantId": peer.user_id,
                    "op": payload.op,
                }),
                Some(socket),
            );
            Ok(())
        }
        .await;

        Self::settle(outcome, |()| ack_ok(serde_json::json!({})))
    }

    // ---- teardown --------------------------------------------------------

    /// `closeProducers {producerIds}`
    pub async fn close_producers(&self, socket: &SocketId, data: Value) -> Result<Value> {
        let payload: CloseProducersPayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => return Ok(ack_error(&format!("Invalid payload: {e}"))),
        };

        let outcome = async {
            let (room, peer) = self.room_and_peer(socket)?;
            self.locks
                .with_lock(room.id().as_str(), || async {
                    for producer_id in &payload.producer_ids {
                        let Some((kind, producer)) = peer.remove_producer(producer_id) else {
                            continue;
                        };
                        producer.close().await;
                        room.remove_speakers(std::slice::from_ref(producer_id));
                        if let Some(observer) = room.observer() {
                            let _ = observer.remove_producer(producer_id).await;
                        }
                        if kind == StreamKind::Audio {
                            self.capture.stop_tap(room.id(), producer_id).await;
                        }
                        self.hub.broadcast(
                            room.id().as_str(),
                            events::PRODUCER_CLOSED,
                            serde_json::json!({
                                "producerId": producer_id,
                                "kind": kind,
                                "participantId": peer.user_id,
                            }),
                            None,
                        );
                    }
                    Ok(())
                })
                .await
        }
        .await;

        Self::settle(outcome, |()| ack_ok(serde_json::json!({})))
    }

    /// `leaveRoom` and socket disconnect share the same cleanup.
    pub async fn leave_room(&self, socket: &SocketId) -> Result<Value> {
        Self::settle(self.remove_socket(socket).await, |()| {
            ack_ok(serde_json::json!({ "left": true }))
        })
    }

    pub async fn on_disconnect(&self, socket: &SocketId) {
        if let Err(e) = self.remove_socket(socket).await {
            tracing::warn!(socket_id = %socket, error = %e, "Disconnect cleanup failed");
        }
    }

    async fn remove_socket(&self, socket: &SocketId) -> Result<()> {
        let Some((_, room_id)) = self.socket_rooms.remove(socket) else {
            return Ok(());
        };
        let Some(room) = self.registry.get(&room_id) else {
            self.hub.hub().leave(socket, room_id.as_str());
            return Ok(());
        };

        self.locks
            .with_lock(room_id.as_str(), || async {
                let Some(peer) = room.peer_by_socket(socket) else {
                    return Ok(());
                };

                self.capture
                    .stop_taps_for_participant(&room_id, &peer.user_id)
                    .await;

                let producers = peer.producers();
                let producer_ids: Vec<String> =
                    producers.iter().map(|(_, p)| p.id()).collect();

                room.remove_speakers(&producer_ids);
                if let Some(observer) = room.observer() {
                    for producer_id in &producer_ids {
                        let _ = observer.remove_producer(producer_id).await;
                    }
                }

                // Other peers keep their transports but drop the dangling
                // producer associations.
                for other in room.peers() {
                    if other.socket_id != peer.socket_id {
                        other.clear_downstream_refs(&producer_ids);
                    }
                }

                self.hub.broadcast(
                    room_id.as_str(),
                    events::PARTICIPANT_LEFT,
                    serde_json::json!({ "participantId": peer.user_id }),
                    Some(socket),
                );
                for (kind, producer) in &producers {
                    self.hub.broadcast(
                        room_id.as_str(),
                        events::PRODUCER_CLOSED,
                        serde_json::json!({
                            "producerId": producer.id(),
                            "kind": kind,
                            "participantId": peer.user_id,
                        }),
                        Some(socket),
                    );
                }

                self.workers
                    .inc_transports(room.worker_pid(), -(peer.transport_count() as i32));
                room.remove_peer_by_socket(socket);
                peer.cleanup().await;

                if room.is_empty() {
                    self.capture.stop_room(&room_id).await;
                    self.workers.inc_routers(room.worker_pid(), -1);
                    room.destroy().await;
                    self.registry.remove(&room_id);
                }

                Ok(())
            })
            .await?;

        self.hub.hub().leave(socket, room_id.as_str());
        Ok(())
    }
}
