//! Active-speaker pipeline.
//!
//! The engine reconciles every peer's subscriptions against the room's
//! ranked producer list: audio beyond the top `max_active_speakers` is
//! paused, audio inside it is resumed or flagged as "needs a new transport",
//! and video is never paused, only nudged back to life when its speaker is
//! active. The dominant-speaker handler feeds router observer events into
//! the engine and fans the results out.
//!
//! Engine runs for one room are serialized by the caller under the room-id
//! lock; peers within a run are reconciled in parallel.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use confab_core::models::{MediaKind, SocketId, StreamKind};
use confab_core::Result;

use crate::peer::Peer;
use crate::room::Room;
use crate::sfu::RtpCapabilities;
use crate::Broadcaster;

/// Outbound event carrying per-socket subscription deltas.
pub const EVENT_NEW_PRODUCERS: &str = "newProducersToConsume";
/// Outbound event carrying the truncated speaker ranking.
pub const EVENT_UPDATE_ACTIVE_SPEAKERS: &str = "updateActiveSpeakers";

/// Identity attached to each audio pid in a subscription delta. Screen
/// shares appear as a synthetic `-screen` participant.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssociatedUser {
    pub id: String,
    pub display_name: String,
}

/// Wire payload telling one socket which producers to start consuming.
/// `video_pids_to_create` and `associated_users` are parallel to
/// `audio_pids_to_create`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducersPayload {
    pub router_rtp_capabilities: RtpCapabilities,
    pub audio_pids_to_create: Vec<String>,
    pub video_pids_to_create: Vec<Option<String>>,
    pub associated_users: Vec<AssociatedUser>,
    pub active_speaker_list: Vec<String>,
}

/// Build the subscription payload for a set of audio pids. Pids whose
/// producing peer has left the room are dropped, keeping the arrays
/// parallel.
pub fn build_new_producers_payload(
    room: &Room,
    audio_pids: &[String],
    max_active_speakers: usize,
) -> Result<NewProducersPayload> {
    let router = room.router()?;

    let mut audio_pids_to_create = Vec::with_capacity(audio_pids.len());
    let mut video_pids_to_create = Vec::with_capacity(audio_pids.len());
    let mut associated_users = Vec::with_capacity(audio_pids.len());

    for pid in audio_pids {
        let Some((owner, kind)) = room.find_producer_owner(pid) else {
            tracing::debug!(producer_id = %pid, "Producer owner left, dropping from payload");
            continue;
        };

        let (video_kind, user) = if kind == StreamKind::ScreenAudio {
            (
                StreamKind::ScreenVideo,
                AssociatedUser {
                    id: format!("{}-screen", owner.user_id),
                    display_name: format!("{} (Sharing)", owner.display_name),
                },
            )
        } else {
            (
                StreamKind::Video,
                AssociatedUser {
                    id: owner.user_id.to_string(),
                    display_name: owner.display_name.clone(),
                },
            )
        };

        audio_pids_to_create.push(pid.clone());
        video_pids_to_create.push(owner.producer(video_kind).map(|p| p.id()));
        associated_users.push(user);
    }

    Ok(NewProducersPayload {
        router_rtp_capabilities: router.rtp_capabilities(),
        audio_pids_to_create,
        video_pids_to_create,
        associated_users,
        active_speaker_list: room.active_speakers_truncated(max_active_speakers),
    })
}

#[derive(Clone)]
pub struct ActiveSpeakerEngine {
    max_active_speakers: usize,
}

impl ActiveSpeakerEngine {
    #[must_use]
    pub const fn new(max_active_speakers: usize) -> Self {
        Self { max_active_speakers }
    }

    #[must_use]
    pub const fn max_active_speakers(&self) -> usize {
        self.max_active_speakers
    }

    /// Reconcile every peer against the current ranking. Returns, per
    /// socket, the audio pids that need a brand-new downstream transport.
    pub async fn reconcile(&self, room: &Room) -> HashMap<SocketId, Vec<String>> {
        let list = room.active_speakers();
        let (active, muted) = if list.len() > self.max_active_speakers {
            let (active, muted) = list.split_at(self.max_active_speakers);
            (active.to_vec(), muted.to_vec())
        } else {
            (list, Vec::new())
        };

        let peers = room.peers();
        let tasks = peers.iter().map(|peer| {
            let active = active.clone();
            let muted = muted.clone();
            async move {
                let needs = Self::reconcile_peer(peer, &active, &muted).await;
                (peer.socket_id.clone(), needs)
            }
        });

        join_all(tasks).await.into_iter().collect()
    }

    /// Audio plan and video policy for a single peer.
    async fn reconcile_peer(peer: &Arc<Peer>, active: &[String], muted: &[String]) -> Vec<String> {
        for pid in muted {
            if let Some((_, producer)) = peer.owns_producer(pid) {
                if !producer.is_closed() && !producer.paused() {
                    if let Err(e) = producer.pause().await {
                        tracing::warn!(producer_id = %pid, error = %e, "Failed to pause producer");
                    }
                }
            } else if let Some(consumer) = peer.consumer_for(pid, MediaKind::Audio) {
                if !consumer.paused() {
                    if let Err(e) = consumer.pause().await {
                        tracing::warn!(producer_id = %pid, error = %e, "Failed to pause consumer");
                    }
                }
            }
        }

        let mut needs_transport = Vec::new();
        for pid in active {
            if let Some((_, producer)) = peer.owns_producer(pid) {
                if !producer.is_closed() && producer.paused() {
                    if let Err(e) = producer.resume().await {
                        tracing::warn!(producer_id = %pid, error = %e, "Failed to resume producer");
                    }
                }
                Self::nudge_own_video(peer, pid);
            } else if let Some(consumer) = peer.consumer_for(pid, MediaKind::Audio) {
                if consumer.paused() {
                    if let Err(e) = consumer.resume().await {
                        tracing::warn!(producer_id = %pid, error = %e, "Failed to resume consumer");
                    }
                }
                Self::nudge_consumed_video(peer, pid);
            } else {
                needs_transport.push(pid.clone());
            }
        }

        needs_transport
    }

    /// Video is never paused by the engine; a paused-but-open video stream
    /// for an active speaker is resumed fire-and-forget.
    fn nudge_own_video(peer: &Arc<Peer>, audio_pid: &str) {
        let video_kind = match peer.owns_producer(audio_pid) {
            Some((StreamKind::ScreenAudio, _)) => StreamKind::ScreenVideo,
            Some(_) => StreamKind::Video,
            None => return,
        };
        if let Some(video) = peer.producer(video_kind) {
            if !video.is_closed() && video.paused() {
                let pid = audio_pid.to_string();
                tokio::spawn(async move {
                    if let Err(e) = video.resume().await {
                        tracing::warn!(audio_pid = %pid, error = %e, "Video producer resume failed");
                    }
                });
            }
        }
    }

    fn nudge_consumed_video(peer: &Arc<Peer>, audio_pid: &str) {
        for video in peer.video_consumers_for_audio_pid(audio_pid) {
            if video.paused() {
                let pid = audio_pid.to_string();
                tokio::spawn(async move {
                    if let Err(e) = video.resume().await {
                        tracing::warn!(audio_pid = %pid, error = %e, "Video consumer resume failed");
                    }
                });
            }
        }
    }
}

/// Reacts to dominant-speaker elections and periodic refreshes: re-ranks,
/// reconciles, and fans out. Callers hold the room-id lock around every
/// entry point.
pub struct DominantSpeakerHandler {
    engine: ActiveSpeakerEngine,
    broadcaster: Arc<dyn Broadcaster>,
}

impl DominantSpeakerHandler {
    #[must_use]
    pub fn new(engine: ActiveSpeakerEngine, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { engine, broadcaster }
    }

    /// Handle a router dominant-speaker event.
    pub async fn on_dominant_speaker(&self, room: &Room, producer_id: &str) -> Result<()> {
        if !room.promote_speaker(producer_id) {
            // Already at the head; nothing to re-plan.
            return Ok(());
        }
        self.run(room).await
    }

    /// Run the engine and emit the results: per-socket subscription deltas
    /// when any peer needs new transports, plus the truncated ranking to the
    /// whole room.
    pub async fn run(&self, room: &Room) -> Result<()> {
        let needs = self.engine.reconcile(room).await;
        let max = self.engine.max_active_speakers();

        let any_new = needs.values().any(|pids| !pids.is_empty());
        if any_new {
            for (socket, pids) in &needs {
                if pids.is_empty() {
                    continue;
                }
                let payload = build_new_producers_payload(room, pids, max)?;
                self.broadcaster.emit_to_socket(
                    socket,
                    EVENT_NEW_PRODUCERS,
                    serde_json::to_value(&payload)?,
                );
            }
        }

        self.broadcaster.broadcast_to_room(
            room.id(),
            EVENT_UPDATE_ACTIVE_SPEAKERS,
            serde_json::to_value(room.active_speakers_truncated(max))?,
            None,
        );
        Ok(())
    }
}
