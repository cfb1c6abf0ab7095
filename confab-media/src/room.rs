//! Per-room media state and lifecycle.
//!
//! A room owns a router on its assigned worker, an active-speaker observer,
//! the ranked active-speaker list, and the peers currently joined. Observer
//! events and the periodic refresh never call back into the gateway
//! directly; they emit [`RoomSignal`]s on a channel the gateway drains,
//! keeping the dependency one-way.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use confab_core::config::RouterConfig;
use confab_core::models::{RoomId, SocketId, StreamKind, UserId};
use confab_core::{Error, Result};

use crate::peer::Peer;
use crate::sfu::{ActiveSpeakerObserverHandle, RouterHandle, WorkerHandle};
use crate::workers::PickedWorker;

/// Out-of-band events a room raises for the gateway to act on.
#[derive(Debug, Clone)]
pub enum RoomSignal {
    /// Periodic re-run of the active-speaker engine.
    Refresh(RoomId),
    /// The router's observer elected a new dominant speaker.
    DominantSpeaker {
        room_id: RoomId,
        producer_id: String,
    },
}

/// Time-bounded ban entry.
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub user_id: UserId,
    /// Epoch milliseconds.
    pub expires_at: i64,
}

/// Owner-approval join request; expires after the configured window.
#[derive(Debug, Clone)]
pub struct PendingJoin {
    pub user_id: UserId,
    pub display_name: String,
    /// Epoch milliseconds.
    pub requested_at: i64,
}

struct RoomInner {
    room_id: RoomId,
    owner_id: UserId,
    worker_pid: u32,
    worker: Arc<dyn WorkerHandle>,
    password: Option<String>,
    router: RwLock<Option<Arc<dyn RouterHandle>>>,
    observer: RwLock<Option<Arc<dyn ActiveSpeakerObserverHandle>>>,
    peers: RwLock<Vec<Arc<Peer>>>,
    /// Producer ids, most-recently-dominant first.
    active_speakers: Mutex<Vec<String>>,
    blocklist: Mutex<Vec<BlockEntry>>,
    pending_joins: Mutex<HashMap<UserId, PendingJoin>>,
    pending_join_expiry: Duration,
    refresh_cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

impl Room {
    /// Create the room: router on the picked worker, active-speaker observer,
    /// and the periodic refresh task.
    pub async fn create(
        room_id: RoomId,
        owner_id: UserId,
        password: Option<String>,
        worker: PickedWorker,
        config: &RouterConfig,
        signals: mpsc::UnboundedSender<RoomSignal>,
    ) -> Result<Self> {
        let router = worker.handle.create_router().await?;
        let observer = router
            .create_active_speaker_observer(Duration::from_millis(
                config.speaker_observer_interval_ms,
            ))
            .await?;

        {
            let signals = signals.clone();
            let room_id = room_id.clone();
            observer.on_dominant_speaker(Box::new(move |producer_id| {
                let _ = signals.send(RoomSignal::DominantSpeaker {
                    room_id: room_id.clone(),
                    producer_id,
                });
            }));
        }

        let room = Self {
            inner: Arc::new(RoomInner {
                room_id: room_id.clone(),
                owner_id,
                worker_pid: worker.pid,
                worker: worker.handle,
                password: password.filter(|p| !p.is_empty()),
                router: RwLock::new(Some(router)),
                observer: RwLock::new(Some(observer)),
                peers: RwLock::new(Vec::new()),
                active_speakers: Mutex::new(Vec::new()),
                blocklist: Mutex::new(Vec::new()),
                pending_joins: Mutex::new(HashMap::new()),
                pending_join_expiry: Duration::from_secs(config.pending_join_expiry_secs),
                refresh_cancel: CancellationToken::new(),
            }),
        };

        room.spawn_refresh_task(
            Duration::from_secs(config.refresh_interval_secs),
            signals,
        );

        tracing::info!(room_id = %room_id, pid = room.inner.worker_pid, "Room created");
        Ok(room)
    }

    fn spawn_refresh_task(&self, interval: Duration, signals: mpsc::UnboundedSender<RoomSignal>) {
        let inner = Arc::downgrade(&self.inner);
        let cancel = self.inner.refresh_cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = inner.upgrade() else { return };
                let has_peers = !inner.peers.read().is_empty();
                let has_speakers = !inner.active_speakers.lock().is_empty();
                if has_peers && has_speakers {
                    let _ = signals.send(RoomSignal::Refresh(inner.room_id.clone()));
                }
            }
        });
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.inner.room_id
    }

    #[must_use]
    pub fn owner_id(&self) -> &UserId {
        &self.inner.owner_id
    }

    #[must_use]
    pub fn worker_pid(&self) -> u32 {
        self.inner.worker_pid
    }

    #[must_use]
    pub fn worker(&self) -> Arc<dyn WorkerHandle> {
        Arc::clone(&self.inner.worker)
    }

    /// The room's router. A room without a router is being torn down.
    pub fn router(&self) -> Result<Arc<dyn RouterHandle>> {
        self.inner
            .router
            .read()
            .clone()
            .ok_or_else(|| Error::NotFound(format!("Room {} has no router", self.inner.room_id)))
    }

    pub fn observer(&self) -> Option<Arc<dyn ActiveSpeakerObserverHandle>> {
        self.inner.observer.read().clone()
    }

    // ---- peers ----------------------------------------------------------

    pub fn add_peer(&self, peer: Arc<Peer>) {
        self.inner.peers.write().push(peer);
    }

    pub fn remove_peer_by_socket(&self, socket: &SocketId) -> Option<Arc<Peer>> {
        let mut peers = self.inner.peers.write();
        let index = peers.iter().position(|p| &p.socket_id == socket)?;
        Some(peers.remove(index))
    }

    #[must_use]
    pub fn peer_by_socket(&self, socket: &SocketId) -> Option<Arc<Peer>> {
        self.inner
            .peers
            .read()
            .iter()
            .find(|p| &p.socket_id == socket)
            .cloned()
    }

    #[must_use]
    pub fn peer_by_user(&self, user: &UserId) -> Option<Arc<Peer>> {
        self.inner
            .peers
            .read()
            .iter()
            .find(|p| &p.user_id == user)
            .cloned()
    }

    #[must_use]
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.peers.read().clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.peers.read().is_empty()
    }

    /// The peer producing `producer_id` and the stream kind it is bound to.
    #[must_use]
    pub fn find_producer_owner(
        &self,
        producer_id: &str,
    ) -> Option<(Arc<Peer>, StreamKind)> {
        self.inner.peers.read().iter().find_map(|peer| {
            peer.owns_producer(producer_id)
                .map(|(kind, _)| (Arc::clone(peer), kind))
        })
    }

    // ---- active-speaker list --------------------------------------------

    #[must_use]
    pub fn active_speakers(&self) -> Vec<String> {
        self.inner.active_speakers.lock().clone()
    }

    #[must_use]
    pub fn active_speakers_truncated(&self, max: usize) -> Vec<String> {
        let list = self.inner.active_speakers.lock();
        list.iter().take(max).cloned().collect()
    }

    /// Append a producer id to the tail of the ranking if not present.
    pub fn push_speaker(&self, producer_id: &str) {
        let mut list = self.inner.active_speakers.lock();
        if !list.iter().any(|p| p.as_str() == producer_id) {
            list.push(producer_id.to_string());
        }
    }

    /// Move (or insert) a producer id to the head of the ranking.
    /// Returns `false` when it was already dominant (no churn).
    pub fn promote_speaker(&self, producer_id: &str) -> bool {
        let mut list = self.inner.active_speakers.lock();
        if list.first().is_some_and(|p| p.as_str() == producer_id) {
            return false;
        }
        list.retain(|p| p.as_str() != producer_id);
        list.insert(0, producer_id.to_string());
        true
    }

    pub fn remove_speakers(&self, producer_ids: &[String]) {
        let mut list = self.inner.active_speakers.lock();
        list.retain(|p| !producer_ids.iter().any(|r| r == p));
    }

    // ---- access control --------------------------------------------------

    #[must_use]
    pub fn password_matches(&self, supplied: Option<&str>) -> bool {
        match &self.inner.password {
            None => true,
            Some(expected) => supplied == Some(expected.as_str()),
        }
    }

    #[must_use]
    pub fn is_blocked(&self, user: &UserId, now_ms: i64) -> bool {
        self.inner
            .blocklist
            .lock()
            .iter()
            .any(|entry| &entry.user_id == user && entry.expires_at > now_ms)
    }

    pub fn block(&self, user: UserId, expires_at: i64) {
        let mut blocklist = self.inner.blocklist.lock();
        blocklist.retain(|entry| entry.user_id != user);
        blocklist.push(BlockEntry {
            user_id: user,
            expires_at,
        });
    }

    /// Record an owner-approval join request.
    pub fn request_join(&self, user: UserId, display_name: String, now_ms: i64) {
        self.sweep_pending(now_ms);
        self.inner.pending_joins.lock().insert(
            user.clone(),
            PendingJoin {
                user_id: user,
                display_name,
                requested_at: now_ms,
            },
        );
    }

    #[must_use]
    pub fn pending_join(&self, user: &UserId, now_ms: i64) -> Option<PendingJoin> {
        self.sweep_pending(now_ms);
        self.inner.pending_joins.lock().get(user).cloned()
    }

    pub fn resolve_pending_join(&self, user: &UserId) -> Option<PendingJoin> {
        self.inner.pending_joins.lock().remove(user)
    }

    fn sweep_pending(&self, now_ms: i64) {
        let expiry_ms = self.inner.pending_join_expiry.as_millis() as i64;
        self.inner
            .pending_joins
            .lock()
            .retain(|_, join| now_ms - join.requested_at < expiry_ms);
    }

    // ---- teardown --------------------------------------------------------

    /// Tear the room down: observer first, then the router (which cascades
    /// to transports, producers and consumers), then local state.
    pub async fn destroy(&self) {
        self.inner.refresh_cancel.cancel();

        let observer = self.inner.observer.write().take();
        if let Some(observer) = observer {
            observer.close().await;
        }
        let router = self.inner.router.write().take();
        if let Some(router) = router {
            router.close().await;
        }

        self.inner.peers.write().clear();
        self.inner.active_speakers.lock().clear();
        self.inner.pending_joins.lock().clear();

        tracing::info!(room_id = %self.inner.room_id, "Room destroyed");
    }
}

/// Registry of live rooms.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<RoomId, Room>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<Room> {
        self.rooms.get(room_id).map(|r| r.clone())
    }

    pub fn insert(&self, room: Room) {
        self.rooms.insert(room.id().clone(), room);
    }

    pub fn remove(&self, room_id: &RoomId) -> Option<Room> {
        self.rooms.remove(room_id).map(|(_, room)| room)
    }

    #[must_use]
    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::sim::SimBackend;
    use crate::sfu::SfuBackend;
    use crate::sfu::WorkerSettings;

    async fn picked() -> PickedWorker {
        let backend = SimBackend::new();
        let handle = backend
            .spawn_worker(&WorkerSettings {
                rtc_min_port: 40000,
                rtc_max_port: 49999,
                log_level: "warn".into(),
            })
            .await
            .unwrap();
        PickedWorker {
            pid: handle.pid(),
            handle,
        }
    }

    async fn room(password: Option<&str>) -> (Room, mpsc::UnboundedReceiver<RoomSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let room = Room::create(
            RoomId::from("r1"),
            UserId::from("owner"),
            password.map(str::to_string),
            picked().await,
            &RouterConfig::default(),
            tx,
        )
        .await
        .unwrap();
        (room, rx)
    }

    #[tokio::test]
    async fn test_speaker_promotion() {
        let (room, _rx) = room(None).await;

        room.push_speaker("PA");
        room.push_speaker("PB");
        room.push_speaker("PA"); // duplicate push ignored
        assert_eq!(room.active_speakers(), vec!["PA", "PB"]);

        assert!(room.promote_speaker("PB"));
        assert_eq!(room.active_speakers(), vec!["PB", "PA"]);

        // Already dominant: no churn.
        assert!(!room.promote_speaker("PB"));

        // Insert-at-head for an unseen id.
        assert!(room.promote_speaker("PC"));
        assert_eq!(room.active_speakers(), vec!["PC", "PB", "PA"]);

        room.remove_speakers(&["PB".to_string()]);
        assert_eq!(room.active_speakers(), vec!["PC", "PA"]);
    }

    #[tokio::test]
    async fn test_truncated_list() {
        let (room, _rx) = room(None).await;
        for i in 0..15 {
            room.push_speaker(&format!("P{i}"));
        }
        assert_eq!(room.active_speakers_truncated(10).len(), 10);
        assert_eq!(room.active_speakers().len(), 15);
    }

    #[tokio::test]
    async fn test_password_guard() {
        let (pw_room, _rx) = room(Some("s3cret")).await;
        assert!(pw_room.password_matches(Some("s3cret")));
        assert!(!pw_room.password_matches(Some("wrong")));
        assert!(!pw_room.password_matches(None));

        let (open, _rx) = room(None).await;
        assert!(open.password_matches(None));
        assert!(open.password_matches(Some("anything")));
    }

    #[tokio::test]
    async fn test_blocklist_expiry() {
        let (room, _rx) = room(None).await;
        let user = UserId::from("banned");

        room.block(user.clone(), 1_000);
        assert!(room.is_blocked(&user, 500));
        assert!(!room.is_blocked(&user, 1_500));
    }

    #[tokio::test]
    async fn test_pending_join_expires() {
        let (room, _rx) = room(None).await;
        let user = UserId::from("guest");

        room.request_join(user.clone(), "Guest".into(), 0);
        assert!(room.pending_join(&user, 30_000).is_some());
        // 60 s window elapsed.
        assert!(room.pending_join(&user, 61_000).is_none());
    }

    #[tokio::test]
    async fn test_destroy_closes_observer_and_router() {
        let (room, _rx) = room(None).await;
        let router = room.router().unwrap();
        let observer = room.observer().unwrap();

        room.destroy().await;

        assert!(router.is_closed());
        assert!(observer.is_closed());
        assert!(room.router().is_err());
        assert!(room.active_speakers().is_empty());
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        let registry = RoomRegistry::new();
        let (room, _rx) = room(None).await;

        registry.insert(room.clone());
        assert!(registry.contains(room.id()));
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(room.id()).unwrap();
        assert_eq!(removed.id(), room.id());
        assert!(registry.is_empty());
    }
}
