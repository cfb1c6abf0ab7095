use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::{JobId, UserId};

/// Opaque end-to-end encrypted payload. The backend never decrypts it;
/// only the presence of `body` is checked at the gateway boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedContent {
    pub body: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Chat message envelope.
///
/// `id` is globally unique; `(job_id, timestamp)` establishes conversation
/// order, ties broken by arrival. `merkle_leaf` and `previous_counter` are
/// client-side integrity fields carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub job_id: JobId,
    pub sender_id: UserId,
    /// Monotonic sender clock, milliseconds.
    pub timestamp: i64,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub encrypted_content: EncryptedContent,
    #[serde(default)]
    pub merkle_leaf: Option<Value>,
    #[serde(default)]
    pub previous_counter: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl Message {
    /// Generate a fresh message id (uuid v4, the wire contract).
    #[must_use]
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
