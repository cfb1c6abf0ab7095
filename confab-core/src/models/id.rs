use nanoid::nanoid;
use serde::{Deserialize, Serialize};

/// Generate a 12-character nanoid for entity IDs
pub fn generate_id() -> String {
    nanoid!(12)
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(generate_id())
            }

            #[must_use]
            pub const fn from_string(id: String) -> Self {
                Self(id)
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Stable principal identifier (`sub` claim).
    UserId
);

string_id!(
    /// Media room identifier. Maps 1:1 to a `JobId` for chat.
    RoomId
);

string_id!(
    /// Conversation / workspace identifier; partition key for chat ordering.
    JobId
);

string_id!(
    /// Identifier of one live socket connection.
    SocketId
);

impl RoomId {
    /// The chat conversation that shares this room's identity.
    #[must_use]
    pub fn as_job(&self) -> JobId {
        JobId(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_length() {
        assert_eq!(generate_id().len(), 12);
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn test_id_serde_transparent() {
        let id = UserId::from("u1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"u1\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
