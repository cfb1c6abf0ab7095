//! Socket surface for the confab backend.
//!
//! Two WebSocket namespaces share one hub: the authenticated chat surface
//! (token-validated handshake, single socket per user, conversation rooms
//! auto-joined from the jobs service) and the anonymous media surface
//! (join/leave lifecycle, transport and producer plumbing, active-speaker
//! fan-out).

pub mod chat;
pub mod connection;
pub mod hub;
pub mod media_gateway;
pub mod notifications;
pub mod protocol;
pub mod ws;

pub use chat::MessagingGateway;
pub use connection::ConnectionSupervisor;
pub use hub::{ClusterAdapter, SocketHub};
pub use media_gateway::StreamingGateway;
pub use notifications::NotificationEmitter;
