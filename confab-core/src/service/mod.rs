pub mod auth;
pub mod durable_queue;
pub mod jobs_client;
pub mod locks;
pub mod message_queue;
pub mod sessions;

pub use auth::{Claims, TokenValidator};
pub use durable_queue::{DurableMessageQueue, EnqueueOutcome};
pub use jobs_client::JobsClient;
pub use locks::{LockConfig, Locks};
pub use message_queue::MessageQueueManager;
pub use sessions::SessionRegistry;
