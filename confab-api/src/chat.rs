//! Messaging gateway.
//!
//! Chat work is partitioned by conversation: each `message.send` runs under
//! the conversation's distributed lock, is ordered by sender timestamp in
//! the local job queue, and is enqueued durably exactly once; duplicates
//! (by message id) short-circuit without a second `contract:message.new`.

use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;

use confab_core::config::LockMode;
use confab_core::models::{JobId, Message, SocketId, UserId};
use confab_core::service::{DurableMessageQueue, Locks, MessageQueueManager};
use confab_core::{validation, Error, Result};

use crate::protocol::{ack_error, ack_ok, events, MessageRefPayload, TypingPayload};
use crate::hub::ClusterHub;

/// Outcome of one ordered send task.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Sent { message_id: String, timestamp: i64 },
    Duplicate { message_id: String },
}

pub struct MessagingGateway {
    locks: Locks,
    queues: Arc<MessageQueueManager<SendOutcome>>,
    durable: DurableMessageQueue,
    hub: ClusterHub,
    lock_mode: LockMode,
}

impl MessagingGateway {
    #[must_use]
    pub fn new(
        locks: Locks,
        queues: Arc<MessageQueueManager<SendOutcome>>,
        durable: DurableMessageQueue,
        hub: ClusterHub,
        lock_mode: LockMode,
    ) -> Self {
        Self {
            locks,
            queues,
            durable,
            hub,
            lock_mode,
        }
    }

    /// Parse and validate a `message.send` payload. Missing ids and
    /// timestamps are filled in; a missing `jobId` or `encryptedContent.body`
    /// rejects the event.
    fn parse_message(sender: &UserId, mut data: Value) -> Result<Message> {
        let object = data
            .as_object_mut()
            .ok_or_else(|| Error::InvalidInput("Message payload must be an object".into()))?;

        let job_id = object
            .get("jobId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidInput("jobId is required".into()))?
            .to_string();
        validation::validate_id("jobId", &job_id)?;

        let body_present = object
            .get("encryptedContent")
            .and_then(|content| content.get("body"))
            .is_some_and(|body| !body.is_null());
        if !body_present {
            return Err(Error::InvalidInput(
                "encryptedContent.body is required".into(),
            ));
        }

        if !object.contains_key("id") {
            object.insert("id".into(), Value::String(Message::generate_id()));
        }
        if !object.contains_key("timestamp") {
            object.insert(
                "timestamp".into(),
                Value::from(chrono::Utc::now().timestamp_millis()),
            );
        }
        object.insert("senderId".into(), Value::String(sender.to_string()));

        let message: Message = serde_json::from_value(data)?;
        validation::validate_id("id", &message.id)?;
        Ok(message)
    }

    /// `contract:message.send`
    ///
    /// Store and lock-lease faults propagate to the socket loop; everything
    /// else is answered as an ack.
    pub async fn handle_send(
        &self,
        _socket: &SocketId,
        sender: &UserId,
        data: Value,
    ) -> Result<Value> {
        let message = match Self::parse_message(sender, data) {
            Ok(message) => message,
            Err(e) => {
                return Ok(serde_json::json!({ "success": false, "error": e.to_string() }))
            }
        };

        let job_id = message.job_id.clone();
        let outcome = match self.lock_mode {
            LockMode::Blocking => {
                self.locks
                    .with_lock(job_id.as_str(), || self.dispatch_send(&job_id, message))
                    .await
            }
            LockMode::Try => {
                match self
                    .locks
                    .try_with_lock(job_id.as_str(), || self.dispatch_send(&job_id, message))
                    .await
                {
                    Ok(Some(outcome)) => Ok(outcome),
                    Ok(None) => return Ok(ack_error("RESOURCE_BUSY")),
                    Err(e) => Err(e),
                }
            }
        };

        match outcome {
            Ok(SendOutcome::Sent {
                message_id,
                timestamp,
            }) => Ok(serde_json::json!({
                "success": true,
                "messageId": message_id,
                "timestamp": timestamp,
            })),
            Ok(SendOutcome::Duplicate { message_id }) => Ok(serde_json::json!({
                "delivered": true,
                "duplicate": true,
                "messageId": message_id,
            })),
            Err(Error::LockBusy(_)) => Ok(ack_error("RESOURCE_BUSY")),
            Err(e) if e.is_connection_fault() => Err(e),
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "message.send failed");
                Ok(serde_json::json!({ "success": false, "error": e.to_string() }))
            }
        }
    }

    async fn dispatch_send(&self, job_id: &JobId, message: Message) -> Result<SendOutcome> {
        let durable = self.durable.clone();
        let hub = self.hub.clone();
        let timestamp = message.timestamp;

        self.queues
            .dispatch(job_id, timestamp, move || {
                async move {
                    let enqueued = durable.enqueue_created(&message).await?;
                    if enqueued.is_duplicate {
                        return Ok(SendOutcome::Duplicate {
                            message_id: message.id.clone(),
                        });
                    }

                    hub.broadcast(
                        message.job_id.as_str(),
                        events::MESSAGE_NEW,
                        serde_json::to_value(&message)?,
                        None,
                    );

                    Ok(SendOutcome::Sent {
                        message_id: message.id.clone(),
                        timestamp: message.timestamp,
                    })
                }
                .boxed()
            })
            .await
    }

    /// `contract:message.{pin,unpin,read}`: structurally identical fan-outs
    /// under the conversation lock.
    pub async fn handle_message_ref(
        &self,
        event: &str,
        sender: &UserId,
        data: Value,
    ) -> Result<Value> {
        let payload: MessageRefPayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => return Ok(ack_error(&format!("Invalid payload: {e}"))),
        };
        if let Err(e) = validation::validate_id("jobId", &payload.job_id) {
            return Ok(ack_error(&e.to_string()));
        }

        let out_event = match event {
            events::MESSAGE_PIN => events::MESSAGE_PINNED,
            events::MESSAGE_UNPIN => events::MESSAGE_UNPINNED,
            events::MESSAGE_READ => events::MESSAGE_READ_OUT,
            _ => return Ok(ack_error("Unknown message event")),
        };

        let mut payload = payload;
        payload.user_id = Some(sender.to_string());

        let result = self
            .locks
            .with_lock(payload.job_id.as_str(), || {
                let hub = self.hub.clone();
                let payload = payload.clone();
                async move {
                    hub.broadcast(
                        payload.job_id.as_str(),
                        out_event,
                        serde_json::to_value(&payload)?,
                        None,
                    );
                    Ok(())
                }
            })
            .await;

        match result {
            Ok(()) => Ok(ack_ok(serde_json::json!({ "messageId": payload.message_id }))),
            Err(e) if e.is_connection_fault() => Err(e),
            Err(e) => Ok(ack_error(&e.to_string())),
        }
    }

    /// `contract:message.typing`: unlocked broadcast, sender excluded.
    pub fn handle_typing(&self, socket: &SocketId, sender: &UserId, data: Value) -> Value {
        let payload: TypingPayload = match serde_json::from_value(data) {
            Ok(payload) => payload,
            Err(e) => return ack_error(&format!("Invalid payload: {e}")),
        };

        let mut payload = payload;
        payload.user_id = Some(sender.to_string());

        match serde_json::to_value(&payload) {
            Ok(value) => {
                self.hub.broadcast(
                    &payload.job_id,
                    events::MESSAGE_TYPING_OUT,
                    value,
                    Some(socket),
                );
                ack_ok(serde_json::json!({}))
            }
            Err(e) => ack_error(&e.to_string()),
        }
    }

    /// `contract:room.join` / `chat.room.join`
    pub fn handle_room_join(&self, socket: &SocketId, room_id: &str) -> Value {
        if let Err(e) = validation::validate_id("roomId", room_id) {
            return ack_error(&e.to_string());
        }
        self.hub.hub().join(socket, room_id);
        ack_ok(serde_json::json!({ "roomId": room_id }))
    }

    /// `chat.room.leave`
    pub fn handle_room_leave(&self, socket: &SocketId, room_id: &str) -> Value {
        self.hub.hub().leave(socket, room_id);
        ack_ok(serde_json::json!({ "left": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fills_id_and_timestamp() {
        let sender = UserId::from("u1");
        let message = MessagingGateway::parse_message(
            &sender,
            serde_json::json!({
                "jobId": "j1",
                "encryptedContent": {"body": "x"},
            }),
        )
        .unwrap();

        assert_eq!(message.job_id.as_str(), "j1");
        assert_eq!(message.sender_id, sender);
        assert!(!message.id.is_empty());
        assert!(message.timestamp > 0);
    }

    #[test]
    fn test_parse_preserves_supplied_fields() {
        let message = MessagingGateway::parse_message(
            &UserId::from("u1"),
            serde_json::json!({
                "id": "m1",
                "jobId": "j1",
                "timestamp": 10,
                "encryptedContent": {"body": "x"},
                "merkleLeaf": {"h": "00"},
                "previousCounter": 4,
            }),
        )
        .unwrap();

        assert_eq!(message.id, "m1");
        assert_eq!(message.timestamp, 10);
        assert!(message.merkle_leaf.is_some());
        assert_eq!(message.previous_counter, Some(serde_json::json!(4)));
    }

    #[test]
    fn test_parse_rejects_missing_job_id() {
        let err = MessagingGateway::parse_message(
            &UserId::from("u1"),
            serde_json::json!({"encryptedContent": {"body": "x"}}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_parse_rejects_missing_body() {
        let err = MessagingGateway::parse_message(
            &UserId::from("u1"),
            serde_json::json!({"jobId": "j1", "encryptedContent": {}}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = MessagingGateway::parse_message(
            &UserId::from("u1"),
            serde_json::json!({"jobId": "j1"}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
