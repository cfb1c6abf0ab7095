//! Job status notification emitter.
//!
//! Backend services (the durable ingestion workers, the jobs service)
//! publish status transitions on a store pub/sub channel; the ingest task
//! drains that channel and fans each update out to the conversation room as
//! `notification:job.status.updated`. Constructed once at startup, injected,
//! and shut down with the server; there is no ambient global.

use redis::Client as RedisClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use confab_core::models::JobId;
use confab_core::Result;

use crate::hub::ClusterHub;
use crate::protocol::events;

/// Channel the backend publishes job status transitions on.
pub const JOB_STATUS_CHANNEL: &str = "confab:notifications:job-status";

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusUpdate {
    pub event_id: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub source: String,
    pub job_id: JobId,
    pub previous_status: String,
    pub new_status: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub transactions: Value,
}

#[derive(Clone)]
pub struct NotificationEmitter {
    hub: ClusterHub,
    cancel: CancellationToken,
}

impl NotificationEmitter {
    #[must_use]
    pub fn new(hub: ClusterHub) -> Self {
        Self {
            hub,
            cancel: CancellationToken::new(),
        }
    }

    /// Broadcast a job status transition to its conversation room.
    pub fn emit_job_status(&self, update: &JobStatusUpdate) -> Result<()> {
        self.hub.broadcast(
            update.job_id.as_str(),
            events::JOB_STATUS_UPDATED,
            serde_json::to_value(update)?,
            None,
        );
        tracing::debug!(
            job_id = %update.job_id,
            previous = %update.previous_status,
            new = %update.new_status,
            "Job status update fanned out"
        );
        Ok(())
    }

    /// Start draining the store channel, reconnecting with backoff.
    /// Malformed frames are logged and skipped.
    pub fn start_ingest(&self, client: RedisClient) {
        let emitter = self.clone();
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
                        tracing::warn!(error = %e, backoff_secs, "Notification ingest connect failed, retrying");
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                        continue;
                    }
                };

                let mut pubsub = pubsub;
                if let Err(e) = pubsub.subscribe(JOB_STATUS_CHANNEL).await {
                    tracing::warn!(error = %e, "Notification channel subscribe failed, retrying");
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }

                tracing::info!(channel = JOB_STATUS_CHANNEL, "Notification ingest connected");
                let mut stream = pubsub.on_message();
                loop {
                    let message = tokio::select! {
                        () = cancel.cancelled() => return,
                        message = futures::StreamExt::next(&mut stream) => message,
                    };
                    let Some(message) = message else {
                        tracing::warn!("Notification subscription dropped, reconnecting");
                        break;
                    };

                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(error = %e, "Unreadable notification frame");
                            continue;
                        }
                    };
                    let update: JobStatusUpdate = match serde_json::from_str(&payload) {
                        Ok(update) => update,
                        Err(e) => {
                            tracing::warn!(error = %e, "Malformed job status update");
                            continue;
                        }
                    };
                    if let Err(e) = emitter.emit_job_status(&update) {
                        tracing::warn!(job_id = %update.job_id, error = %e, "Job status fan-out failed");
                    }
                }
            }
        });
    }

    /// Stop the ingest task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::SocketHub;
    use confab_core::models::SocketId;

    fn sample(job_id: &str) -> JobStatusUpdate {
        JobStatusUpdate {
            event_id: "e1".into(),
            timestamp: 1,
            source: "jobs-service".into(),
            job_id: JobId::from(job_id),
            previous_status: "active".into(),
            new_status: "completed".into(),
            transactions: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_update_reaches_job_room() {
        let hub = SocketHub::new();
        let (mut receiver, _close) = hub.register(&SocketId::from("s1"));
        hub.join(&SocketId::from("s1"), "j1");

        let emitter = NotificationEmitter::new(ClusterHub::new(hub, None));
        emitter.emit_job_status(&sample("j1")).unwrap();

        let envelope = receiver.recv().await.unwrap();
        assert_eq!(envelope.event, events::JOB_STATUS_UPDATED);
        assert_eq!(envelope.data["jobId"], "j1");
        assert_eq!(envelope.data["newStatus"], "completed");
        assert!(envelope.data.get("transactions").is_none());
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_ingest_round_trip() {
        let hub = SocketHub::new();
        let (mut receiver, _close) = hub.register(&SocketId::from("s1"));
        hub.join(&SocketId::from("s1"), "j-ingest");

        let emitter = NotificationEmitter::new(ClusterHub::new(hub, None));
        let client = RedisClient::open("redis://localhost:6379").unwrap();
        emitter.start_ingest(client.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let payload = serde_json::to_string(&sample("j-ingest")).unwrap();
        redis::cmd("PUBLISH")
            .arg(JOB_STATUS_CHANNEL)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.event, events::JOB_STATUS_UPDATED);
        assert_eq!(envelope.data["jobId"], "j-ingest");

        emitter.shutdown();
    }
}
