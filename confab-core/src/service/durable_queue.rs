//! Durable message ingestion with idempotent enqueue.
//!
//! Every accepted chat message becomes a `message.created` entry on a capped
//! Redis stream, from which the ingestion workers drain. Enqueue is guarded
//! by an idempotency key `msg:idem:{id}` (TTL 1 h): if the key already
//! exists the message was accepted before and the enqueue short-circuits as
//! a duplicate, which is what gives `contract:message.new` its at-most-once
//! delivery.

use redis::aio::ConnectionManager as RedisConnectionManager;

use crate::models::Message;
use crate::Result;

const STREAM_KEY: &str = "confab:messages:stream";
const MAX_STREAM_LENGTH: usize = 10_000;

const IDEMPOTENCY_TTL_SECS: u64 = 3600;
const JOB_ATTEMPTS: u32 = 5;
const BACKOFF_DELAY_MS: u64 = 2000;
const REMOVE_ON_COMPLETE_SECS: u64 = 3600;
const REMOVE_ON_FAIL_SECS: u64 = 86400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub is_duplicate: bool,
}

#[derive(Clone)]
pub struct DurableMessageQueue {
    redis: RedisConnectionManager,
}

impl DurableMessageQueue {
    #[must_use]
    pub const fn new(redis: RedisConnectionManager) -> Self {
        Self { redis }
    }

    fn idempotency_key(message_id: &str) -> String {
        format!("msg:idem:{message_id}")
    }

    /// Enqueue a `message.created` job keyed by the message id.
    ///
    /// Returns `is_duplicate = true` without touching the stream when the
    /// idempotency key is already present.
    pub async fn enqueue_created(&self, message: &Message) -> Result<EnqueueOutcome> {
        let mut conn = self.redis.clone();

        let claimed: Option<String> = redis::cmd("SET")
            .arg(Self::idempotency_key(&message.id))
            .arg(serde_json::json!({ "jobId": message.job_id }).to_string())
            .arg("NX")
            .arg("EX")
            .arg(IDEMPOTENCY_TTL_SECS)
            .query_async(&mut conn)
            .await?;

        if claimed.is_none() {
            tracing::debug!(
                message_id = %message.id,
                job_id = %message.job_id,
                "Duplicate message enqueue short-circuited by idempotency key"
            );
            return Ok(EnqueueOutcome { is_duplicate: true });
        }

        let payload = serde_json::to_string(message)?;
        redis::cmd("XADD")
            .arg(STREAM_KEY)
            .arg("MAXLEN")
            .arg("~")
            .arg(MAX_STREAM_LENGTH)
            .arg("*")
            .arg("name")
            .arg("message.created")
            .arg("job_id")
            .arg(&message.id)
            .arg("payload")
            .arg(payload)
            .arg("attempts")
            .arg(JOB_ATTEMPTS)
            .arg("backoff_ms")
            .arg(BACKOFF_DELAY_MS)
            .arg("keep_completed_s")
            .arg(REMOVE_ON_COMPLETE_SECS)
            .arg("keep_failed_s")
            .arg(REMOVE_ON_FAIL_SECS)
            .query_async::<String>(&mut conn)
            .await?;

        tracing::debug!(
            message_id = %message.id,
            job_id = %message.job_id,
            "Message enqueued for durable ingestion"
        );
        Ok(EnqueueOutcome { is_duplicate: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EncryptedContent, JobId, UserId};

    fn sample(id: &str) -> Message {
        Message {
            id: id.to_string(),
            job_id: JobId::from("j1"),
            sender_id: UserId::from("u1"),
            timestamp: 10,
            kind: Some("text".to_string()),
            mime_type: None,
            encrypted_content: EncryptedContent {
                body: serde_json::json!("x"),
                extra: serde_json::Map::new(),
            },
            merkle_leaf: None,
            previous_counter: None,
            metadata: None,
        }
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_enqueue_is_idempotent_by_message_id() {
        let client = redis::Client::open("redis://localhost:6379").unwrap();
        let redis = RedisConnectionManager::new(client).await.unwrap();
        let queue = DurableMessageQueue::new(redis.clone());

        let id = crate::models::Message::generate_id();
        let message = sample(&id);

        let first = queue.enqueue_created(&message).await.unwrap();
        assert!(!first.is_duplicate);

        let second = queue.enqueue_created(&message).await.unwrap();
        assert!(second.is_duplicate);

        // Cleanup the idempotency key so reruns behave the same.
        let mut conn = redis.clone();
        redis::cmd("DEL")
            .arg(DurableMessageQueue::idempotency_key(&id))
            .query_async::<()>(&mut conn)
            .await
            .unwrap();
    }
}
