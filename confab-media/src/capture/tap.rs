//! Tap session lifecycle and the segment watcher.
//!
//! One session per tapped audio producer: a consecutive UDP port pair, a
//! plain transport + consumer pointed at it, an SDP file, and a segmenter
//! subprocess. A single watcher task polls every session's segment-list
//! file; new indexes go to the transcription worker, results are stored and
//! broadcast. A segment index is handled at most once; failures drop the
//! segment.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use confab_core::config::CaptureConfig;
use confab_core::models::{RoomId, UserId};
use confab_core::{Error, Result};

use super::ports::PortPool;
use super::sdp;
use super::segmenter::{parse_segment_list, SegmenterCommand};
use super::store::{StoredSegment, TranscriptStore};
use super::transcribe::TranscriptionWorker;
use crate::peer::Peer;
use crate::room::Room;
use crate::sfu::{ConsumerHandle, PlainTransportHandle, PlainTransportOptions};
use crate::Broadcaster;

/// Outbound event carrying one transcribed segment.
pub const EVENT_TRANSCRIPTION: &str = "transcription";

struct AudioSession {
    room_id: RoomId,
    producer_id: String,
    participant_id: UserId,
    plain_transport: Arc<dyn PlainTransportHandle>,
    consumer: Arc<dyn ConsumerHandle>,
    rtp_port: u16,
    rtcp_port: u16,
    segmenter: Mutex<Option<Child>>,
    audio_dir: PathBuf,
    sdp_path: PathBuf,
    segment_list_path: PathBuf,
    /// Highest segment index fully processed; monotonic.
    last_processed: AtomicI64,
    in_flight: Mutex<HashSet<i64>>,
    /// Failed indexes, never retried.
    dropped: Mutex<HashSet<i64>>,
    /// Last observed byte length of the segment list, to skip unchanged files.
    list_len: AtomicU64,
}

struct CaptureInner {
    config: CaptureConfig,
    ports: PortPool,
    transcriber: TranscriptionWorker,
    store: TranscriptStore,
    broadcaster: Arc<dyn Broadcaster>,
    sessions: DashMap<(RoomId, String), Arc<AudioSession>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct AudioCapture {
    inner: Arc<CaptureInner>,
}

impl AudioCapture {
    /// Build the capture manager and start its segment watcher.
    #[must_use]
    pub fn new(config: CaptureConfig, broadcaster: Arc<dyn Broadcaster>) -> Self {
        let capture = Self {
            inner: Arc::new(CaptureInner {
                ports: PortPool::new(config.port_min, config.port_max),
                transcriber: TranscriptionWorker::new(&config),
                store: TranscriptStore::new(),
                broadcaster,
                sessions: DashMap::new(),
                cancel: CancellationToken::new(),
                config,
            }),
        };
        capture.spawn_watcher();
        capture
    }

    #[must_use]
    pub fn store(&self) -> &TranscriptStore {
        &self.inner.store
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    fn sanitize(name: &str) -> String {
        name.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }

    /// Provision the side-tap for an audio producer. Idempotent per
    /// (room, producer). Port or subprocess failures leave media untouched;
    /// the caller logs and skips the tap.
    pub async fn start_tap(&self, room: &Room, peer: &Arc<Peer>, producer_id: &str) -> Result<()> {
        let key = (room.id().clone(), producer_id.to_string());
        if self.inner.sessions.contains_key(&key) {
            return Ok(());
        }

        let audio_dir = PathBuf::from(&self.inner.config.audio_dir).join(room.id().as_str());
        tokio::fs::create_dir_all(&audio_dir)
            .await
            .map_err(|e| Error::Internal(format!("Failed to create audio dir: {e}")))?;
        let transcript_dir =
            PathBuf::from(&self.inner.config.transcript_dir).join(room.id().as_str());
        tokio::fs::create_dir_all(&transcript_dir)
            .await
            .map_err(|e| Error::Internal(format!("Failed to create transcript dir: {e}")))?;

        let (rtp_port, rtcp_port) = self.inner.ports.allocate_pair()?;

        let provisioned = self
            .provision(room, peer, producer_id, &audio_dir, rtp_port, rtcp_port)
            .await;
        let session = match provisioned {
            Ok(session) => session,
            Err(e) => {
                self.inner.ports.release_pair(rtp_port, rtcp_port);
                return Err(e);
            }
        };

        self.inner.store.open_session(
            room.id().clone(),
            producer_id.to_string(),
            peer.user_id.clone(),
            Utc::now(),
        );
        self.inner.sessions.insert(key, Arc::new(session));

        tracing::info!(
            room_id = %room.id(),
            participant_id = %peer.user_id,
            producer_id = %producer_id,
            rtp = rtp_port,
            rtcp = rtcp_port,
            "Audio side-tap started"
        );
        Ok(())
    }

    async fn provision(
        &self,
        room: &Room,
        peer: &Arc<Peer>,
        producer_id: &str,
        audio_dir: &std::path::Path,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<AudioSession> {
        let router = room.router()?;
        let plain_transport = router
            .create_plain_transport(PlainTransportOptions {
                listen_ip: "127.0.0.1".into(),
                rtcp_mux: false,
                comedia: false,
            })
            .await?;
        plain_transport
            .tuple_connect("127.0.0.1", rtp_port, rtcp_port)
            .await?;

        let consumer = plain_transport
            .consume(producer_id, router.rtp_capabilities())
            .await?;

        let prefix = format!("{}_{}", Self::sanitize(&peer.display_name), producer_id);
        let sdp_path = audio_dir.join(format!("{prefix}.sdp"));
        let segment_list_path = audio_dir.join(format!("{prefix}_segments.txt"));
        let segment_pattern = audio_dir.join(format!("{prefix}_segment_%03d.wav"));

        sdp::write(&sdp_path, rtp_port, rtcp_port).await?;

        let segmenter = SegmenterCommand {
            ffmpeg_bin: self.inner.config.ffmpeg_bin.clone(),
            sdp_path: sdp_path.clone(),
            segment_pattern,
            segment_list: segment_list_path.clone(),
            segment_secs: self.inner.config.segment_secs,
        }
        .spawn()?;

        Ok(AudioSession {
            room_id: room.id().clone(),
            producer_id: producer_id.to_string(),
            participant_id: peer.user_id.clone(),
            plain_transport,
            consumer,
            rtp_port,
            rtcp_port,
            segmenter: Mutex::new(Some(segmenter)),
            audio_dir: audio_dir.to_path_buf(),
            sdp_path,
            segment_list_path,
            last_processed: AtomicI64::new(-1),
            in_flight: Mutex::new(HashSet::new()),
            dropped: Mutex::new(HashSet::new()),
            list_len: AtomicU64::new(0),
        })
    }

    /// Stop the tap for one producer: kill the segmenter, close the plain
    /// transport, delete the SDP and list files, return the ports, and
    /// spool the transcript.
    pub async fn stop_tap(&self, room_id: &RoomId, producer_id: &str) {
        let key = (room_id.clone(), producer_id.to_string());
        let Some((_, session)) = self.inner.sessions.remove(&key) else {
            return;
        };

        let segmenter = session.segmenter.lock().take();
        if let Some(mut child) = segmenter {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "Segmenter already exited");
            }
        }

        session.consumer.close().await;
        session.plain_transport.close().await;

        let _ = tokio::fs::remove_file(&session.sdp_path).await;
        let _ = tokio::fs::remove_file(&session.segment_list_path).await;

        self.inner
            .ports
            .release_pair(session.rtp_port, session.rtcp_port);

        let transcript_dir = PathBuf::from(&self.inner.config.transcript_dir);
        if let Err(e) = self
            .inner
            .store
            .close_session(room_id, producer_id, &transcript_dir)
            .await
        {
            tracing::warn!(error = %e, "Failed to spool transcript on tap stop");
        }

        tracing::info!(
            room_id = %room_id,
            producer_id = %producer_id,
            "Audio side-tap stopped"
        );
    }

    /// Stop every tap owned by one participant in a room.
    pub async fn stop_taps_for_participant(&self, room_id: &RoomId, participant: &UserId) {
        let producer_ids: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| {
                entry.key().0 == *room_id && entry.value().participant_id == *participant
            })
            .map(|entry| entry.key().1.clone())
            .collect();

        for producer_id in producer_ids {
            self.stop_tap(room_id, &producer_id).await;
        }
    }

    /// Stop every tap in a room and drop its in-memory transcripts.
    pub async fn stop_room(&self, room_id: &RoomId) {
        let producer_ids: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.key().0 == *room_id)
            .map(|entry| entry.key().1.clone())
            .collect();

        for producer_id in producer_ids {
            self.stop_tap(room_id, &producer_id).await;
        }
        self.inner.store.clear_room(room_id);
    }

    /// Stop the watcher and all sessions.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let keys: Vec<(RoomId, String)> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for (room_id, producer_id) in keys {
            self.stop_tap(&room_id, &producer_id).await;
        }
    }

    // ---- watcher ---------------------------------------------------------

    fn spawn_watcher(&self) {
        let inner = Arc::downgrade(&self.inner);
        let interval = Duration::from_millis(self.inner.config.watch_interval_ms);
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = inner.upgrade() else { return };
                let sessions: Vec<Arc<AudioSession>> = inner
                    .sessions
                    .iter()
                    .map(|entry| Arc::clone(entry.value()))
                    .collect();
                for session in sessions {
                    Self::poll_session(&inner, &session).await;
                }
            }
        });
    }

    async fn poll_session(inner: &Arc<CaptureInner>, session: &Arc<AudioSession>) {
        // Skip untouched lists cheaply by length.
        let Ok(meta) = tokio::fs::metadata(&session.segment_list_path).await else {
            return;
        };
        if meta.len() == session.list_len.swap(meta.len(), Ordering::SeqCst) {
            return;
        }

        let Ok(contents) = tokio::fs::read_to_string(&session.segment_list_path).await else {
            return;
        };

        for (index, filename) in parse_segment_list(&contents) {
            if index <= session.last_processed.load(Ordering::SeqCst) {
                continue;
            }
            {
                let mut in_flight = session.in_flight.lock();
                if in_flight.contains(&index) || session.dropped.lock().contains(&index) {
                    continue;
                }
                in_flight.insert(index);
            }

            let inner = Arc::clone(inner);
            let session = Arc::clone(session);
            tokio::spawn(async move {
                Self::process_segment(&inner, &session, index, &filename).await;
                session.in_flight.lock().remove(&index);
            });
        }
    }

    async fn process_segment(
        inner: &Arc<CaptureInner>,
        session: &Arc<AudioSession>,
        index: i64,
        filename: &str,
    ) {
        let wav_path = session.audio_dir.join(filename);

        match inner.transcriber.transcribe(&wav_path).await {
            Ok(result) => {
                inner.store.add_segment(
                    &session.room_id,
                    &session.producer_id,
                    StoredSegment {
                        index,
                        text: result.text.clone(),
                        language: result.language.clone(),
                        confidence: result.confidence,
                        duration: result.duration,
                        wav_file: filename.to_string(),
                        transcribed_at: Utc::now(),
                    },
                );

                inner.broadcaster.broadcast_to_room(
                    &session.room_id,
                    EVENT_TRANSCRIPTION,
                    serde_json::json!({
                        "participantId": session.participant_id,
                        "producerId": session.producer_id,
                        "segmentIndex": index,
                        "text": result.text,
                        "language": result.language,
                        "confidence": result.confidence,
                        "duration": result.duration,
                        "timestamp": Utc::now().timestamp_millis(),
                    }),
                    None,
                );

                session.last_processed.fetch_max(index, Ordering::SeqCst);
            }
            Err(e) => {
                tracing::warn!(
                    room_id = %session.room_id,
                    producer_id = %session.producer_id,
                    segment = index,
                    error = %e,
                    "Transcription failed, dropping segment"
                );
                session.dropped.lock().insert(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RoomSignal;
    use crate::sfu::sim::SimBackend;
    use crate::sfu::SfuBackend;
    use crate::sfu::WorkerSettings;
    use crate::workers::PickedWorker;
    use confab_core::config::RouterConfig;
    use confab_core::models::SocketId;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingBroadcaster {
        broadcast: Mutex<Vec<(RoomId, String, serde_json::Value)>>,
    }

    impl Broadcaster for RecordingBroadcaster {
        fn emit_to_socket(&self, _socket: &SocketId, _event: &str, _data: serde_json::Value) {}

        fn broadcast_to_room(
            &self,
            room: &RoomId,
            event: &str,
            data: serde_json::Value,
            _except: Option<&SocketId>,
        ) {
            self.broadcast
                .lock()
                .push((room.clone(), event.to_string(), data));
        }
    }

    struct Fixture {
        capture: AudioCapture,
        broadcaster: Arc<RecordingBroadcaster>,
        room: Room,
        peer: Arc<Peer>,
        producer_id: String,
        _dir: tempfile::TempDir,
        _signals: mpsc::UnboundedReceiver<RoomSignal>,
    }

    /// Shell script standing in for the transcription worker: prints the
    /// contract JSON and exits 0.
    fn fake_worker_script(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("fake_worker.sh");
        std::fs::write(
            &path,
            "#!/bin/sh\necho '{\"success\":true,\"text\":\"hello\",\"language\":\"en\",\"language_probability\":1.0,\"duration\":30.0,\"confidence\":0.9,\"segments\":[]}'\n",
        )
        .unwrap();
        path
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_worker_script(dir.path());

        let config = CaptureConfig {
            port_min: 62000,
            port_max: 62100,
            audio_dir: dir.path().join("audio").display().to_string(),
            transcript_dir: dir.path().join("transcripts").display().to_string(),
            // `true` exits immediately; the watcher only reads list files.
            ffmpeg_bin: "true".into(),
            python_bin: "sh".into(),
            script_path: script.display().to_string(),
            watch_interval_ms: 25,
            transcribe_timeout_secs: 5,
            ..CaptureConfig::default()
        };

        let backend = SimBackend::new();
        let handle = backend
            .spawn_worker(&WorkerSettings {
                rtc_min_port: 40000,
                rtc_max_port: 49999,
                log_level: "warn".into(),
            })
            .await
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let room = Room::create(
            RoomId::from("r1"),
            UserId::from("owner"),
            None,
            PickedWorker {
                pid: handle.pid(),
                handle,
            },
            &RouterConfig::default(),
            tx,
        )
        .await
        .unwrap();

        let peer = Arc::new(Peer::new(
            UserId::from("u1"),
            "Alice".into(),
            SocketId::from("s1"),
            room.id().clone(),
        ));
        room.add_peer(Arc::clone(&peer));

        // Produce audio through the room router so the sim registry knows
        // the producer id the tap will consume.
        let upstream = room
            .router()
            .unwrap()
            .create_webrtc_transport(crate::sfu::WebRtcTransportOptions {
                listen_ip: "127.0.0.1".into(),
                announced_ip: None,
                enable_udp: true,
                enable_tcp: true,
                prefer_udp: true,
                initial_outgoing_bitrate: 600_000,
            })
            .await
            .unwrap();
        let producer = upstream
            .produce(
                confab_core::models::MediaKind::Audio,
                crate::sfu::RtpParameters(serde_json::json!({})),
            )
            .await
            .unwrap();

        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let capture = AudioCapture::new(config, Arc::clone(&broadcaster) as Arc<dyn Broadcaster>);

        Fixture {
            capture,
            broadcaster,
            room,
            peer,
            producer_id: producer.id(),
            _dir: dir,
            _signals: rx,
        }
    }

    #[tokio::test]
    async fn test_tap_lifecycle_ports_and_files() {
        let fixture = fixture().await;
        let free_before = fixture.capture.inner.ports.free_count();

        fixture
            .capture
            .start_tap(&fixture.room, &fixture.peer, &fixture.producer_id)
            .await
            .unwrap();
        assert_eq!(fixture.capture.session_count(), 1);
        assert_eq!(fixture.capture.inner.ports.free_count(), free_before - 2);

        let session = {
            let entry = fixture
                .capture
                .inner
                .sessions
                .iter()
                .next()
                .expect("session");
            Arc::clone(entry.value())
        };
        assert_eq!(session.rtcp_port, session.rtp_port + 1);
        assert!(session.sdp_path.exists());

        fixture
            .capture
            .stop_tap(fixture.room.id(), &fixture.producer_id)
            .await;
        assert_eq!(fixture.capture.session_count(), 0);
        assert_eq!(fixture.capture.inner.ports.free_count(), free_before);
        assert!(!session.sdp_path.exists());
        assert!(session.plain_transport.is_closed());
    }

    #[tokio::test]
    async fn test_start_tap_idempotent() {
        let fixture = fixture().await;
        fixture
            .capture
            .start_tap(&fixture.room, &fixture.peer, &fixture.producer_id)
            .await
            .unwrap();
        fixture
            .capture
            .start_tap(&fixture.room, &fixture.peer, &fixture.producer_id)
            .await
            .unwrap();
        assert_eq!(fixture.capture.session_count(), 1);
    }

    #[tokio::test]
    async fn test_watcher_transcribes_new_segments() {
        let fixture = fixture().await;
        fixture
            .capture
            .start_tap(&fixture.room, &fixture.peer, &fixture.producer_id)
            .await
            .unwrap();

        let session = {
            let entry = fixture
                .capture
                .inner
                .sessions
                .iter()
                .next()
                .expect("session");
            Arc::clone(entry.value())
        };

        // Simulate the segmenter finishing one segment.
        let wav_name = format!("Alice_{}_segment_000.wav", fixture.producer_id);
        std::fs::write(session.audio_dir.join(&wav_name), b"RIFF").unwrap();
        std::fs::write(&session.segment_list_path, format!("{wav_name}\n")).unwrap();

        // Give the watcher a few ticks.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            if session.last_processed.load(Ordering::SeqCst) == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "watcher never processed segment");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let stored = fixture
            .capture
            .store()
            .session(fixture.room.id(), &fixture.producer_id)
            .unwrap();
        assert_eq!(stored.total_segments, 1);
        assert_eq!(stored.segments[0].text, "hello");

        let broadcasts = fixture.broadcaster.broadcast.lock();
        let event = broadcasts
            .iter()
            .find(|(_, event, _)| event == EVENT_TRANSCRIPTION)
            .expect("transcription broadcast");
        assert_eq!(event.2["text"], "hello");
        assert_eq!(event.2["segmentIndex"], 0);
    }

    #[tokio::test]
    async fn test_failed_segment_dropped_not_retried() {
        let mut fixture = fixture().await;
        // Point the worker at a missing script so transcription fails.
        fixture = {
            let Fixture { _dir, room, peer, producer_id, broadcaster, _signals, .. } = fixture;
            let config = CaptureConfig {
                port_min: 62200,
                port_max: 62300,
                audio_dir: _dir.path().join("audio").display().to_string(),
                transcript_dir: _dir.path().join("transcripts").display().to_string(),
                ffmpeg_bin: "true".into(),
                python_bin: "/nonexistent/python3".into(),
                watch_interval_ms: 25,
                ..CaptureConfig::default()
            };
            let capture =
                AudioCapture::new(config, Arc::clone(&broadcaster) as Arc<dyn Broadcaster>);
            Fixture {
                capture,
                broadcaster,
                room,
                peer,
                producer_id,
                _dir,
                _signals,
            }
        };

        fixture
            .capture
            .start_tap(&fixture.room, &fixture.peer, &fixture.producer_id)
            .await
            .unwrap();
        let session = {
            let entry = fixture
                .capture
                .inner
                .sessions
                .iter()
                .next()
                .expect("session");
            Arc::clone(entry.value())
        };

        let wav_name = format!("Alice_{}_segment_000.wav", fixture.producer_id);
        std::fs::write(session.audio_dir.join(&wav_name), b"RIFF").unwrap();
        std::fs::write(&session.segment_list_path, format!("{wav_name}\n")).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            if session.dropped.lock().contains(&0) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "segment never dropped");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        // Dropped segments never advance the high-water mark or broadcast.
        assert_eq!(session.last_processed.load(Ordering::SeqCst), -1);
        assert!(session.in_flight.lock().is_empty());
        assert!(fixture
            .broadcaster
            .broadcast
            .lock()
            .iter()
            .all(|(_, event, _)| event != EVENT_TRANSCRIPTION));
    }

    #[tokio::test]
    async fn test_sanitize_display_names() {
        assert_eq!(AudioCapture::sanitize("Alice B!"), "Alice_B_");
        assert_eq!(AudioCapture::sanitize("bob-2"), "bob-2");
    }
}
