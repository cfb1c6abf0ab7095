//! Socket hub and clustered fan-out adapter.
//!
//! The hub routes events to sockets on this node: each socket registers an
//! outbound channel and joins named rooms. The cluster adapter mirrors
//! broadcasts and forced disconnects over a Redis pub/sub channel so they
//! reach sockets held by other nodes; messages from the local node are
//! skipped by node id.

use dashmap::DashMap;
use redis::aio::ConnectionManager as RedisConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use confab_core::models::{generate_id, RoomId, SocketId};
use confab_core::{Error, Result};
use confab_media::Broadcaster;

use crate::protocol::ServerEnvelope;

const CLUSTER_CHANNEL: &str = "confab:cluster:events";

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

struct SocketEntry {
    sender: mpsc::UnboundedSender<ServerEnvelope>,
    close: CancellationToken,
}

/// Node-local socket registry and room fan-out.
#[derive(Clone, Default)]
pub struct SocketHub {
    sockets: Arc<DashMap<SocketId, SocketEntry>>,
    rooms: Arc<DashMap<String, HashSet<SocketId>>>,
    socket_rooms: Arc<DashMap<SocketId, HashSet<String>>>,
}

impl SocketHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket. Returns the receiver for its outbound frames and
    /// a token cancelled when the socket must close.
    pub fn register(
        &self,
        socket: &SocketId,
    ) -> (
        mpsc::UnboundedReceiver<ServerEnvelope>,
        CancellationToken,
    ) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let close = CancellationToken::new();
        self.sockets.insert(
            socket.clone(),
            SocketEntry {
                sender,
                close: close.clone(),
            },
        );
        (receiver, close)
    }

    /// Remove a socket and leave every room it joined.
    pub fn unregister(&self, socket: &SocketId) {
        self.sockets.remove(socket);
        if let Some((_, rooms)) = self.socket_rooms.remove(socket) {
            for room in rooms {
                if let Some(mut members) = self.rooms.get_mut(&room) {
                    members.remove(socket);
                    if members.is_empty() {
                        drop(members);
                        self.rooms.remove(&room);
                    }
                }
            }
        }
    }

    pub fn join(&self, socket: &SocketId, room: &str) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(socket.clone());
        self.socket_rooms
            .entry(socket.clone())
            .or_default()
            .insert(room.to_string());
    }

    pub fn leave(&self, socket: &SocketId, room: &str) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(socket);
            if members.is_empty() {
                drop(members);
                self.rooms.remove(room);
            }
        }
        if let Some(mut rooms) = self.socket_rooms.get_mut(socket) {
            rooms.remove(room);
        }
    }

    #[must_use]
    pub fn is_registered(&self, socket: &SocketId) -> bool {
        self.sockets.contains_key(socket)
    }

    #[must_use]
    pub fn room_members(&self, room: &str) -> Vec<SocketId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Send an envelope to one socket on this node.
    pub fn send(&self, socket: &SocketId, envelope: ServerEnvelope) -> bool {
        if let Some(entry) = self.sockets.get(socket) {
            if entry.sender.send(envelope).is_ok() {
                return true;
            }
            // Writer gone; force the reader side down too.
            entry.close.cancel();
        }
        false
    }

    /// Broadcast to every member of a room on this node.
    pub fn broadcast_local(
        &self,
        room: &str,
        event: &str,
        data: &serde_json::Value,
        except: Option<&SocketId>,
    ) -> usize {
        let members = self.room_members(room);
        let mut sent = 0;
        for member in members {
            if except.is_some_and(|e| e == &member) {
                continue;
            }
            if self.send(&member, ServerEnvelope::event(event, data.clone())) {
                sent += 1;
            }
        }
        sent
    }

    /// Force-close sockets on this node. Unknown ids are ignored.
    pub fn disconnect_local(&self, socket_ids: &[SocketId]) {
        for socket in socket_ids {
            if let Some(entry) = self.sockets.get(socket) {
                entry.close.cancel();
            }
        }
    }
}

/// Messages mirrored across the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum ClusterMessage {
    #[serde(rename_all = "camelCase")]
    RoomBroadcast {
        room: String,
        event: String,
        data: serde_json::Value,
        except: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    EmitToSocket {
        socket_id: String,
        event: String,
        data: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    DisconnectSockets { socket_ids: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClusterFrame {
    origin: String,
    message: ClusterMessage,
}

/// Cross-node mirror over Redis pub/sub.
#[derive(Clone)]
pub struct ClusterAdapter {
    publisher: RedisConnectionManager,
    node_id: String,
    cancel: CancellationToken,
}

impl ClusterAdapter {
    /// Connect the adapter and start the subscriber task applying remote
    /// frames to the local hub.
    pub async fn start(redis_url: &str, hub: SocketHub) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(Error::Redis)?;
        let publisher = RedisConnectionManager::new(client.clone()).await?;

        let adapter = Self {
            publisher,
            node_id: generate_id(),
            cancel: CancellationToken::new(),
        };

        adapter.spawn_subscriber(client, hub);
        Ok(adapter)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_subscriber(&self, client: redis::Client, hub: SocketHub) {
        let node_id = self.node_id.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                let pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => {
                        backoff_secs = INITIAL_BACKOFF_SECS;
                        pubsub
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, backoff_secs, "Cluster subscriber connect failed, retrying");
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                        continue;
                    }
                };

                let mut pubsub = pubsub;
                if let Err(e) = pubsub.subscribe(CLUSTER_CHANNEL).await {
                    tracing::warn!(error = %e, "Cluster channel subscribe failed, retrying");
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }

                tracing::info!("Cluster subscriber connected");
                let mut stream = pubsub.on_message();
                loop {
                    let message = tokio::select! {
                        () = cancel.cancelled() => return,
                        message = futures::StreamExt::next(&mut stream) => message,
                    };
                    let Some(message) = message else {
                        tracing::warn!("Cluster subscription dropped, reconnecting");
                        break;
                    };

                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(error = %e, "Unreadable cluster frame");
                            continue;
                        }
                    };
                    let frame: ClusterFrame = match serde_json::from_str(&payload) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(error = %e, "Malformed cluster frame");
                            continue;
                        }
                    };
                    if frame.origin == node_id {
                        continue; // already applied locally
                    }
                    Self::apply(&hub, frame.message);
                }
            }
        });
    }

    fn apply(hub: &SocketHub, message: ClusterMessage) {
        match message {
            ClusterMessage::RoomBroadcast {
                room,
                event,
                data,
                except,
            } => {
                let except = except.map(SocketId::from_string);
                hub.broadcast_local(&room, &event, &data, except.as_ref());
            }
            ClusterMessage::EmitToSocket {
                socket_id,
                event,
                data,
            } => {
                hub.send(
                    &SocketId::from_string(socket_id),
                    ServerEnvelope::event(&event, data),
                );
            }
            ClusterMessage::DisconnectSockets { socket_ids } => {
                let ids: Vec<SocketId> =
                    socket_ids.into_iter().map(SocketId::from_string).collect();
                hub.disconnect_local(&ids);
            }
        }
    }

    fn publish(&self, message: ClusterMessage) {
        let frame = ClusterFrame {
            origin: self.node_id.clone(),
            message,
        };
        let payload = match serde_json::to_string(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode cluster frame");
                return;
            }
        };
        let mut conn = self.publisher.clone();
        tokio::spawn(async move {
            if let Err(e) = redis::cmd("PUBLISH")
                .arg(CLUSTER_CHANNEL)
                .arg(payload)
                .query_async::<()>(&mut conn)
                .await
            {
                tracing::warn!(error = %e, "Cluster publish failed");
            }
        });
    }
}

/// The hub with optional cluster mirroring; this is the `Broadcaster` the
/// media engine and gateways see.
#[derive(Clone)]
pub struct ClusterHub {
    hub: SocketHub,
    adapter: Option<ClusterAdapter>,
}

impl ClusterHub {
    #[must_use]
    pub fn new(hub: SocketHub, adapter: Option<ClusterAdapter>) -> Self {
        Self { hub, adapter }
    }

    #[must_use]
    pub fn hub(&self) -> &SocketHub {
        &self.hub
    }

    pub fn emit(&self, socket: &SocketId, event: &str, data: serde_json::Value) {
        let delivered = self
            .hub
            .send(socket, ServerEnvelope::event(event, data.clone()));
        if !delivered {
            if let Some(adapter) = &self.adapter {
                adapter.publish(ClusterMessage::EmitToSocket {
                    socket_id: socket.to_string(),
                    event: event.to_string(),
                    data,
                });
            }
        }
    }

    pub fn ack(&self, socket: &SocketId, ack_id: u64, data: serde_json::Value) {
        self.hub.send(socket, ServerEnvelope::ack(ack_id, data));
    }

    pub fn broadcast(
        &self,
        room: &str,
        event: &str,
        data: serde_json::Value,
        except: Option<&SocketId>,
    ) {
        self.hub.broadcast_local(room, event, &data, except);
        if let Some(adapter) = &self.adapter {
            adapter.publish(ClusterMessage::RoomBroadcast {
                room: room.to_string(),
                event: event.to_string(),
                data,
                except: except.map(ToString::to_string),
            });
        }
    }

    /// Disconnect sockets wherever in the cluster they live.
    pub fn disconnect_sockets(&self, socket_ids: &[SocketId]) {
        self.hub.disconnect_local(socket_ids);
        if let Some(adapter) = &self.adapter {
            adapter.publish(ClusterMessage::DisconnectSockets {
                socket_ids: socket_ids.iter().map(ToString::to_string).collect(),
            });
        }
    }
}

impl Broadcaster for ClusterHub {
    fn emit_to_socket(&self, socket: &SocketId, event: &str, data: serde_json::Value) {
        self.emit(socket, event, data);
    }

    fn broadcast_to_room(
        &self,
        room: &RoomId,
        event: &str,
        data: serde_json::Value,
        except: Option<&SocketId>,
    ) {
        self.broadcast(room.as_str(), event, data, except);
    }
}
