//! Room transcription store with an on-disk JSON spool.
//!
//! Transcribed segments accumulate in memory per (room, producer). When a
//! tap session ends, its transcript is spooled to
//! `{transcript_dir}/{roomId}/{pid}_{ISO-ts}.json`; clearing a room drops
//! the in-memory state.

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use confab_core::models::{RoomId, UserId};
use confab_core::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSegment {
    pub index: i64,
    pub text: String,
    pub language: String,
    pub confidence: f64,
    pub duration: f64,
    pub wav_file: String,
    pub transcribed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTranscript {
    pub room_id: RoomId,
    pub participant_id: UserId,
    pub session_start_time: DateTime<Utc>,
    pub session_end_time: Option<DateTime<Utc>>,
    pub total_segments: usize,
    pub segments: Vec<StoredSegment>,
}

#[derive(Clone, Default)]
pub struct TranscriptStore {
    // Keyed by (room, producer id).
    sessions: Arc<DashMap<(RoomId, String), SessionTranscript>>,
}

impl TranscriptStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session record for a producer's tap.
    pub fn open_session(
        &self,
        room_id: RoomId,
        producer_id: String,
        participant_id: UserId,
        started_at: DateTime<Utc>,
    ) {
        self.sessions.insert(
            (room_id.clone(), producer_id),
            SessionTranscript {
                room_id,
                participant_id,
                session_start_time: started_at,
                session_end_time: None,
                total_segments: 0,
                segments: Vec::new(),
            },
        );
    }

    /// Append a transcribed segment, keeping segments sorted by index.
    pub fn add_segment(&self, room_id: &RoomId, producer_id: &str, segment: StoredSegment) {
        if let Some(mut session) = self
            .sessions
            .get_mut(&(room_id.clone(), producer_id.to_string()))
        {
            let pos = session
                .segments
                .iter()
                .position(|s| s.index > segment.index)
                .unwrap_or(session.segments.len());
            session.segments.insert(pos, segment);
            session.total_segments = session.segments.len();
        }
    }

    #[must_use]
    pub fn session(&self, room_id: &RoomId, producer_id: &str) -> Option<SessionTranscript> {
        self.sessions
            .get(&(room_id.clone(), producer_id.to_string()))
            .map(|s| s.clone())
    }

    /// Close a session and spool it to disk. Empty sessions are dropped
    /// without writing a file.
    pub async fn close_session(
        &self,
        room_id: &RoomId,
        producer_id: &str,
        transcript_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        let Some((_, mut session)) = self
            .sessions
            .remove(&(room_id.clone(), producer_id.to_string()))
        else {
            return Ok(None);
        };

        if session.segments.is_empty() {
            return Ok(None);
        }
        session.session_end_time = Some(Utc::now());

        let room_dir = transcript_dir.join(room_id.as_str());
        tokio::fs::create_dir_all(&room_dir)
            .await
            .map_err(|e| Error::Internal(format!("Failed to create transcript dir: {e}")))?;

        let stamp = session
            .session_start_time
            .to_rfc3339_opts(SecondsFormat::Secs, true)
            .replace(':', "-");
        let path = room_dir.join(format!("{producer_id}_{stamp}.json"));

        let json = serde_json::to_vec_pretty(&session)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| Error::Internal(format!("Failed to spool transcript: {e}")))?;

        tracing::info!(
            room_id = %room_id,
            producer_id = %producer_id,
            segments = session.total_segments,
            path = %path.display(),
            "Transcript spooled"
        );
        Ok(Some(path))
    }

    /// Drop all in-memory transcripts for a room (called when the room dies).
    pub fn clear_room(&self, room_id: &RoomId) {
        self.sessions.retain(|(rid, _), _| rid != room_id);
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
