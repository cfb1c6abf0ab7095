//! Wire protocol: envelopes, event names, and typed payloads.
//!
//! Every frame is a JSON envelope `{event, data, ackId?}`. Acked requests
//! are answered with `{event: "ack", ackId, data}`; broadcasts omit the ack
//! id. Payload field names are camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use confab_core::models::StreamKind;

/// Inbound and outbound event names.
pub mod events {
    // Chat surface (authenticated).
    pub const AUTH: &str = "auth";
    pub const MESSAGE_SEND: &str = "contract:message.send";
    pub const MESSAGE_PIN: &str = "contract:message.pin";
    pub const MESSAGE_UNPIN: &str = "contract:message.unpin";
    pub const MESSAGE_READ: &str = "contract:message.read";
    pub const MESSAGE_TYPING: &str = "contract:message.typing";
    pub const ROOM_JOIN: &str = "contract:room.join";
    pub const CHAT_ROOM_JOIN: &str = "chat.room.join";
    pub const CHAT_ROOM_LEAVE: &str = "chat.room.leave";

    pub const MESSAGE_NEW: &str = "contract:message.new";
    pub const MESSAGE_PINNED: &str = "contract:message.pinned";
    pub const MESSAGE_UNPINNED: &str = "contract:message.unpinned";
    pub const MESSAGE_READ_OUT: &str = "contract:message.read";
    pub const MESSAGE_TYPING_OUT: &str = "contract:message.typing";
    pub const ERROR_AUTH: &str = "error:auth";
    pub const JOB_STATUS_UPDATED: &str = "notification:job.status.updated";

    // Media surface (anonymous).
    pub const JOIN_ROOM: &str = "joinRoom";
    pub const LEAVE_ROOM: &str = "leaveRoom";
    pub const REQUEST_TRANSPORT: &str = "requestTransport";
    pub const CONNECT_TRANSPORT: &str = "connectTransport";
    pub const START_PRODUCING: &str = "startProducing";
    pub const CONSUME_MEDIA: &str = "consumeMedia";
    pub const UNPAUSE_CONSUMER: &str = "unpauseConsumer";
    pub const AUDIO_CHANGE: &str = "audioChange";
    pub const CLOSE_PRODUCERS: &str = "closeProducers";

    pub const NEW_PARTICIPANT: &str = "newParticipant";
    pub const PARTICIPANT_LEFT: &str = "participantLeft";
    pub const NEW_PRODUCER: &str = "newProducer";
    pub const PRODUCER_CLOSED: &str = "producerClosed";
}

/// Auth failure codes carried by `error:auth`.
pub mod auth_codes {
    pub const AUTH_TIMEOUT: &str = "AUTH_TIMEOUT";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub ack_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEnvelope {
    pub event: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
}

impl ServerEnvelope {
    #[must_use]
    pub fn event(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
            ack_id: None,
        }
    }

    #[must_use]
    pub fn ack(ack_id: u64, data: Value) -> Self {
        Self {
            event: "ack".to_string(),
            data,
            ack_id: Some(ack_id),
        }
    }
}

// ---- chat payloads -------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub token: String,
}

/// `contract:message.{pin,unpin,read}` all carry the same shape.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRefPayload {
    pub job_id: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub job_id: String,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoomPayload {
    #[serde(alias = "jobId")]
    pub room_id: String,
}

// ---- media payloads ------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub room_id: String,
    pub user_name: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTransportPayload {
    /// "producer" or "consumer".
    pub role: String,
    #[serde(default)]
    pub stream_kind: Option<StreamKind>,
    #[serde(default)]
    pub producer_id: Option<String>,
    #[serde(default)]
    pub audio_pid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportPayload {
    #[serde(default)]
    pub transport_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub audio_pid: Option<String>,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProducingPayload {
    pub stream_kind: StreamKind,
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeMediaPayload {
    pub rtp_capabilities: Value,
    pub pid: String,
    /// Advisory; the server trusts its own producer registry.
    #[serde(default)]
    pub kind: Option<StreamKind>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpauseConsumerPayload {
    pub pid: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChangePayload {
    /// "mute" or "unmute".
    pub op: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducersPayload {
    pub producer_ids: Vec<String>,
}

// ---- ack helpers ---------------------------------------------------------

#[must_use]
pub fn ack_ok(data: Value) -> Value {
    match data {
        Value::Object(mut map) => {
            map.insert("ok".into(), Value::Bool(true));
            Value::Object(map)
        }
        other => serde_json::json!({ "ok": true, "data": other }),
    }
}

#[must_use]
pub fn ack_error(error: &str) -> Value {
    serde_json::json!({ "ok": false, "error": error })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let raw = serde_json::json!({
            "event": "contract:message.send",
            "data": {"jobId": "j1"},
            "ackId": 7
        });
        let envelope: ClientEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.event, events::MESSAGE_SEND);
        assert_eq!(envelope.ack_id, Some(7));

        let ack = ServerEnvelope::ack(7, serde_json::json!({"success": true}));
        let out = serde_json::to_value(&ack).unwrap();
        assert_eq!(out["event"], "ack");
        assert_eq!(out["ackId"], 7);
    }

    #[test]
    fn test_broadcast_envelope_omits_ack_id() {
        let envelope = ServerEnvelope::event("newProducer", serde_json::json!({}));
        let out = serde_json::to_string(&envelope).unwrap();
        assert!(!out.contains("ackId"));
    }

    #[test]
    fn test_chat_room_payload_accepts_job_id_alias() {
        let payload: ChatRoomPayload =
            serde_json::from_value(serde_json::json!({"jobId": "j1"})).unwrap();
        assert_eq!(payload.room_id, "j1");

        let payload: ChatRoomPayload =
            serde_json::from_value(serde_json::json!({"roomId": "r1"})).unwrap();
        assert_eq!(payload.room_id, "r1");
    }

    #[test]
    fn test_ack_helpers() {
        let ok = ack_ok(serde_json::json!({"roomId": "r1"}));
        assert_eq!(ok["ok"], true);
        assert_eq!(ok["roomId"], "r1");

        let err = ack_error("RESOURCE_BUSY");
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"], "RESOURCE_BUSY");
    }

    #[test]
    fn test_stream_kind_in_payload() {
        let payload: StartProducingPayload = serde_json::from_value(serde_json::json!({
            "streamKind": "screenAudio",
            "rtpParameters": {}
        }))
        .unwrap();
        assert_eq!(payload.stream_kind, StreamKind::ScreenAudio);
    }
}
