use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authentication timed out")]
    AuthTimeout,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Invalid room password")]
    InvalidRoomPassword,

    #[error("Banned from room until {until}")]
    Banned { until: i64 },

    #[error("Peer is not in a room")]
    NotInRoom,

    #[error("Peer has no upstream transport")]
    NoUpstream,

    #[error("No live media workers available")]
    NoWorkersAvailable,

    #[error("Router cannot consume producer {0}")]
    CannotConsume(String),

    #[error("No downstream transport for producer {0}")]
    DownstreamNotFound(String),

    #[error("No consumer for producer {0}")]
    ConsumerNotFound(String),

    #[error("Lock busy: {0}")]
    LockBusy(String),

    #[error("Lock aborted: lease lost for {0}")]
    LockAborted(String),

    #[error("Duplicate message: {0}")]
    DuplicateMessage(String),

    #[error("No consecutive UDP port pair available")]
    NoPortPairs,

    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("Media worker died (pid {0})")]
    WorkerDied(u32),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("External service error: {0}")]
    External(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Faults a handler cannot answer with a typed ack: the socket dispatch
    /// loop logs them and acks a generic failure instead. Everything else is
    /// recovered handler-locally as an event ack.
    #[must_use]
    pub const fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            Self::Redis(_) | Self::Serialization(_) | Self::LockAborted(_) | Self::Internal(_)
        )
    }

    /// Faults that invalidate the socket itself: with the shared store
    /// unreachable, session bindings and lock guarantees no longer hold, so
    /// the dispatch loop disconnects the affected socket.
    #[must_use]
    pub const fn requires_disconnect(&self) -> bool {
        matches!(self, Self::Redis(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
