pub mod id;
pub mod message;
pub mod stream;

pub use id::{generate_id, JobId, RoomId, SocketId, UserId};
pub use message::{EncryptedContent, Message};
pub use stream::{MediaKind, StreamKind};
