//! Named contract for the underlying SFU library.
//!
//! The media library is an external collaborator: the engine only sees
//! opaque worker/router/transport/producer/consumer handles with the
//! operations below. Everything RTP-level (codecs, packet forwarding,
//! ICE/DTLS internals) lives behind these traits; the engine owns the
//! coordination semantics on top of them.

pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use confab_core::models::MediaKind;
use confab_core::Result;

/// Router RTP capabilities, opaque to the engine, forwarded to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub Value);

/// Producer/consumer RTP parameters, opaque pass-through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

/// Client DTLS parameters handed to `connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub Value);

/// DTLS connection state of a WebRTC transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl DtlsState {
    /// Connect is idempotent once the handshake is underway or done.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// Parameters a client needs to complete a WebRTC transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_outgoing_bitrate: u32,
}

#[derive(Debug, Clone)]
pub struct PlainTransportOptions {
    pub listen_ip: String,
    pub rtcp_mux: bool,
    pub comedia: bool,
}

/// Factory for media worker processes.
#[async_trait]
pub trait SfuBackend: Send + Sync {
    async fn spawn_worker(&self, settings: &WorkerSettings) -> Result<Arc<dyn WorkerHandle>>;
}

/// One CPU-bound media worker process.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// OS pid of the worker process. The only identity the engine keys on.
    fn pid(&self) -> u32;

    /// Cumulative CPU time consumed by the worker, for load sampling.
    async fn cpu_time(&self) -> Result<Duration>;

    async fn create_router(&self) -> Result<Arc<dyn RouterHandle>>;

    /// Register a callback fired once if the worker process dies.
    fn on_died(&self, callback: Box<dyn Fn() + Send + Sync>);

    async fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Per-room media router hosted on a worker.
#[async_trait]
pub trait RouterHandle: Send + Sync {
    fn id(&self) -> String;
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a consumer with `caps` can be bound to `producer_id`.
    fn can_consume(&self, producer_id: &str, caps: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn TransportHandle>>;

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<Arc<dyn PlainTransportHandle>>;

    async fn create_active_speaker_observer(
        &self,
        interval: Duration,
    ) -> Result<Arc<dyn ActiveSpeakerObserverHandle>>;

    /// Closing the router cascades to every transport, producer and consumer
    /// created on it.
    async fn close(&self);
    fn is_closed(&self) -> bool;
}

/// A WebRTC transport (upstream or downstream direction).
#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn id(&self) -> String;
    fn params(&self) -> TransportParams;
    fn dtls_state(&self) -> DtlsState;

    async fn connect(&self, dtls: DtlsParameters) -> Result<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn ProducerHandle>>;

    async fn consume(
        &self,
        producer_id: &str,
        caps: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn ConsumerHandle>>;

    async fn set_max_incoming_bitrate(&self, bps: u32) -> Result<()>;

    async fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Plain RTP transport used by the audio side-tap.
#[async_trait]
pub trait PlainTransportHandle: Send + Sync {
    fn id(&self) -> String;

    /// Point the transport at a local RTP/RTCP destination pair.
    async fn tuple_connect(&self, ip: &str, rtp_port: u16, rtcp_port: u16) -> Result<()>;

    async fn consume(
        &self,
        producer_id: &str,
        caps: RtpCapabilities,
    ) -> Result<Arc<dyn ConsumerHandle>>;

    async fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Server-side handle for a media stream uploaded by a peer.
#[async_trait]
pub trait ProducerHandle: Send + Sync + std::fmt::Debug {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn paused(&self) -> bool;
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Server-side handle for a stream delivered to a peer.
#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> String;
    fn producer_id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn paused(&self) -> bool;
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Energy-based dominant speaker detection on a router.
#[async_trait]
pub trait ActiveSpeakerObserverHandle: Send + Sync {
    async fn add_producer(&self, producer_id: &str) -> Result<()>;
    async fn remove_producer(&self, producer_id: &str) -> Result<()>;

    /// Register the callback fired with the dominant producer id.
    fn on_dominant_speaker(&self, callback: Box<dyn Fn(String) + Send + Sync>);

    async fn close(&self);
    fn is_closed(&self) -> bool;
}
