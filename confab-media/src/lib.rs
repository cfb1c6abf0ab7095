//! Media conference engine for confab.
//!
//! Coordinates per-room media routers over a pool of CPU-bound workers:
//! transport/producer/consumer bookkeeping, the active-speaker pipeline that
//! drives adaptive subscriptions, and the audio side-tap that feeds offline
//! transcription. All SFU interaction goes through the handle contract in
//! [`sfu`]; the engine never depends on a concrete media library.

pub mod capture;
pub mod peer;
pub mod room;
pub mod service;
pub mod sfu;
pub mod speaker;
pub mod workers;

use confab_core::models::{RoomId, SocketId};

/// Narrow emission capability the media engine needs from the socket layer.
///
/// Implemented by the API crate's socket hub; keeping it here breaks the
/// gateway ↔ engine cycle into a one-way dependency.
pub trait Broadcaster: Send + Sync {
    /// Send an event to one socket.
    fn emit_to_socket(&self, socket: &SocketId, event: &str, data: serde_json::Value);

    /// Broadcast an event to every socket in a room, optionally excluding one.
    fn broadcast_to_room(
        &self,
        room: &RoomId,
        event: &str,
        data: serde_json::Value,
        except: Option<&SocketId>,
    );
}
