//! In-process SFU backend.
//!
//! Implements the full handle contract with real state machines (DTLS
//! progression, pause/resume flags, close cascades) but no packet I/O.
//! Dominant-speaker events are injected via [`SimActiveSpeakerObserver::emit_dominant`],
//! worker death via [`SimWorker::simulate_death`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use confab_core::models::MediaKind;
use confab_core::{Error, Result};

use super::{
    ActiveSpeakerObserverHandle, ConsumerHandle, DtlsParameters, DtlsState, PlainTransportHandle,
    PlainTransportOptions, ProducerHandle, RouterHandle, RtpCapabilities, RtpParameters,
    SfuBackend, TransportHandle, TransportParams, WebRtcTransportOptions, WorkerHandle,
    WorkerSettings,
};

fn new_id() -> String {
    confab_core::models::generate_id()
}

/// Backend factory. Pids are synthetic and monotonically assigned.
pub struct SimBackend {
    next_pid: AtomicU32,
}

impl SimBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
        }
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SfuBackend for SimBackend {
    async fn spawn_worker(&self, _settings: &WorkerSettings) -> Result<Arc<dyn WorkerHandle>> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimWorker::new(pid)))
    }
}

struct WorkerState {
    routers: Vec<Weak<RouterInner>>,
    died_callbacks: Vec<Box<dyn Fn() + Send + Sync>>,
}

pub struct SimWorker {
    pid: u32,
    started: Instant,
    /// Divisor applied to wall time when reporting CPU time; tests vary it
    /// to make workers look differently loaded.
    cpu_divisor: AtomicU32,
    closed: AtomicBool,
    state: Mutex<WorkerState>,
}

impl SimWorker {
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            started: Instant::now(),
            cpu_divisor: AtomicU32::new(64),
            closed: AtomicBool::new(false),
            state: Mutex::new(WorkerState {
                routers: Vec::new(),
                died_callbacks: Vec::new(),
            }),
        }
    }

    /// Make the worker report heavier or lighter CPU usage.
    pub fn set_cpu_divisor(&self, divisor: u32) {
        self.cpu_divisor.store(divisor.max(1), Ordering::SeqCst);
    }

    /// Kill the simulated process: closes the worker and fires death hooks.
    pub fn simulate_death(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let callbacks = std::mem::take(&mut self.state.lock().died_callbacks);
        for callback in callbacks {
            callback();
        }
    }
}

#[async_trait]
impl WorkerHandle for SimWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn cpu_time(&self) -> Result<Duration> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::WorkerDied(self.pid));
        }
        let divisor = self.cpu_divisor.load(Ordering::SeqCst);
        Ok(self.started.elapsed() / divisor)
    }

    async fn create_router(&self) -> Result<Arc<dyn RouterHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::WorkerDied(self.pid));
        }
        let inner = Arc::new(RouterInner::new());
        self.state.lock().routers.push(Arc::downgrade(&inner));
        Ok(Arc::new(SimRouter { inner }))
    }

    fn on_died(&self, callback: Box<dyn Fn() + Send + Sync>) {
        self.state.lock().died_callbacks.push(callback);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let routers: Vec<_> = self.state.lock().routers.drain(..).collect();
        for router in routers.iter().filter_map(Weak::upgrade) {
            router.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct RouterState {
    /// Every producer created on this router, for capability checks and
    /// consumer kind resolution.
    producers: HashMap<String, SimProducer>,
    transports: Vec<Weak<TransportInner>>,
    plain_transports: Vec<Weak<PlainTransportInner>>,
    observers: Vec<Weak<ObserverInner>>,
}

struct RouterInner {
    id: String,
    closed: AtomicBool,
    state: Mutex<RouterState>,
}

impl RouterInner {
    fn new() -> Self {
        Self {
            id: new_id(),
            closed: AtomicBool::new(false),
            state: Mutex::new(RouterState {
                producers: HashMap::new(),
                transports: Vec::new(),
                plain_transports: Vec::new(),
                observers: Vec::new(),
            }),
        }
    }

    fn register_producer(&self, producer: &SimProducer) {
        self.state
            .lock()
            .producers
            .insert(producer.inner.id.clone(), producer.clone());
    }

    fn producer_kind(&self, producer_id: &str) -> Option<MediaKind> {
        self.state
            .lock()
            .producers
            .get(producer_id)
            .filter(|p| !p.is_closed())
            .map(|p| p.inner.kind)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (transports, plains, observers) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.transports),
                std::mem::take(&mut state.plain_transports),
                std::mem::take(&mut state.observers),
            )
        };
        for transport in transports.iter().filter_map(Weak::upgrade) {
            transport.close();
        }
        for plain in plains.iter().filter_map(Weak::upgrade) {
            plain.close();
        }
        for observer in observers.iter().filter_map(Weak::upgrade) {
            observer.close();
        }
    }
}

pub struct SimRouter {
    inner: Arc<RouterInner>,
}

#[async_trait]
impl RouterHandle for SimRouter {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities(serde_json::json!({
            "codecs": [
                {
                    "mimeType": "audio/opus",
                    "kind": "audio",
                    "clockRate": 48000,
                    "channels": 2,
                },
                {
                    "mimeType": "video/VP8",
                    "kind": "video",
                    "clockRate": 90000,
                },
            ],
            "headerExtensions": [],
        }))
    }

    fn can_consume(&self, producer_id: &str, _caps: &RtpCapabilities) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
            && self.inner.producer_kind(producer_id).is_some()
    }

    async fn create_webrtc_transport(
        &self,
        _options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn TransportHandle>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Media("router is closed".into()));
        }
        let transport = Arc::new(TransportInner::new(Arc::downgrade(&self.inner)));
        self.inner
            .state
            .lock()
            .transports
            .push(Arc::downgrade(&transport));
        Ok(Arc::new(SimTransport { inner: transport }))
    }

    async fn create_plain_transport(
        &self,
        _options: PlainTransportOptions,
    ) -> Result<Arc<dyn PlainTransportHandle>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Media("router is closed".into()));
        }
        let plain = Arc::new(PlainTransportInner::new(Arc::downgrade(&self.inner)));
        self.inner
            .state
            .lock()
            .plain_transports
            .push(Arc::downgrade(&plain));
        Ok(Arc::new(SimPlainTransport { inner: plain }))
    }

    async fn create_active_speaker_observer(
        &self,
        _interval: Duration,
    ) -> Result<Arc<dyn ActiveSpeakerObserverHandle>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Media("router is closed".into()));
        }
        let observer = Arc::new(ObserverInner::new());
        self.inner
            .state
            .lock()
            .observers
            .push(Arc::downgrade(&observer));
        Ok(Arc::new(SimActiveSpeakerObserver { inner: observer }))
    }

    async fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

struct TransportState {
    dtls: DtlsState,
    producers: Vec<SimProducer>,
    consumers: Vec<SimConsumer>,
    max_incoming_bitrate: Option<u32>,
}

struct TransportInner {
    id: String,
    router: Weak<RouterInner>,
    closed: AtomicBool,
    state: Mutex<TransportState>,
}

impl TransportInner {
    fn new(router: Weak<RouterInner>) -> Self {
        Self {
            id: new_id(),
            router,
            closed: AtomicBool::new(false),
            state: Mutex::new(TransportState {
                dtls: DtlsState::New,
                producers: Vec::new(),
                consumers: Vec::new(),
                max_incoming_bitrate: None,
            }),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (producers, consumers) = {
            let mut state = self.state.lock();
            state.dtls = DtlsState::Closed;
            (
                std::mem::take(&mut state.producers),
                std::mem::take(&mut state.consumers),
            )
        };
        for producer in &producers {
            producer.force_close();
        }
        for consumer in &consumers {
            consumer.force_close();
        }
    }
}

pub struct SimTransport {
    inner: Arc<TransportInner>,
}

#[async_trait]
impl TransportHandle for SimTransport {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn params(&self) -> TransportParams {
        TransportParams {
            id: self.inner.id.clone(),
            ice_parameters: serde_json::json!({
                "usernameFragment": new_id(),
                "password": new_id(),
                "iceLite": true,
            }),
            ice_candidates: serde_json::json!([]),
            dtls_parameters: serde_json::json!({
                "role": "auto",
                "fingerprints": [],
            }),
        }
    }

    fn dtls_state(&self) -> DtlsState {
        self.inner.state.lock().dtls
    }

    async fn connect(&self, _dtls: DtlsParameters) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Media("transport is closed".into()));
        }
        let mut state = self.inner.state.lock();
        state.dtls = DtlsState::Connecting;
        state.dtls = DtlsState::Connected;
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        _rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn ProducerHandle>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Media("transport is closed".into()));
        }
        let producer = SimProducer::new(kind);
        if let Some(router) = self.inner.router.upgrade() {
            router.register_producer(&producer);
        }
        self.inner.state.lock().producers.push(producer.clone());
        Ok(Arc::new(producer))
    }

    async fn consume(
        &self,
        producer_id: &str,
        _caps: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn ConsumerHandle>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Media("transport is closed".into()));
        }
        let router = self
            .inner
            .router
            .upgrade()
            .ok_or_else(|| Error::Media("router is gone".into()))?;
        let kind = router
            .producer_kind(producer_id)
            .ok_or_else(|| Error::CannotConsume(producer_id.to_string()))?;

        let consumer = SimConsumer::new(producer_id.to_string(), kind, paused);
        self.inner.state.lock().consumers.push(consumer.clone());
        Ok(Arc::new(consumer))
    }

    async fn set_max_incoming_bitrate(&self, bps: u32) -> Result<()> {
        self.inner.state.lock().max_incoming_bitrate = Some(bps);
        Ok(())
    }

    async fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

struct PlainTransportInner {
    id: String,
    router: Weak<RouterInner>,
    closed: AtomicBool,
    tuple: Mutex<Option<(String, u16, u16)>>,
    consumers: Mutex<Vec<SimConsumer>>,
}

impl PlainTransportInner {
    fn new(router: Weak<RouterInner>) -> Self {
        Self {
            id: new_id(),
            router,
            closed: AtomicBool::new(false),
            tuple: Mutex::new(None),
            consumers: Mutex::new(Vec::new()),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for consumer in self.consumers.lock().drain(..) {
            consumer.force_close();
        }
    }
}

pub struct SimPlainTransport {
    inner: Arc<PlainTransportInner>,
}

impl SimPlainTransport {
    /// The destination the transport was pointed at, for assertions.
    #[must_use]
    pub fn connected_tuple(&self) -> Option<(String, u16, u16)> {
        self.inner.tuple.lock().clone()
    }
}

#[async_trait]
impl PlainTransportHandle for SimPlainTransport {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    async fn tuple_connect(&self, ip: &str, rtp_port: u16, rtcp_port: u16) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Media("plain transport is closed".into()));
        }
        *self.inner.tuple.lock() = Some((ip.to_string(), rtp_port, rtcp_port));
        Ok(())
    }

    async fn consume(
        &self,
        producer_id: &str,
        _caps: RtpCapabilities,
    ) -> Result<Arc<dyn ConsumerHandle>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Media("plain transport is closed".into()));
        }
        let router = self
            .inner
            .router
            .upgrade()
            .ok_or_else(|| Error::Media("router is gone".into()))?;
        let kind = router
            .producer_kind(producer_id)
            .ok_or_else(|| Error::CannotConsume(producer_id.to_string()))?;

        let consumer = SimConsumer::new(producer_id.to_string(), kind, false);
        self.inner.consumers.lock().push(consumer.clone());
        Ok(Arc::new(consumer))
    }

    async fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct ProducerInner {
    id: String,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[derive(Clone, Debug)]
pub struct SimProducer {
    inner: Arc<ProducerInner>,
}

impl SimProducer {
    fn new(kind: MediaKind) -> Self {
        Self {
            inner: Arc::new(ProducerInner {
                id: new_id(),
                kind,
                paused: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn force_close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProducerHandle for SimProducer {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Media("producer is closed".into()));
        }
        self.inner.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Media("producer is closed".into()));
        }
        self.inner.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.force_close();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

struct ConsumerInner {
    id: String,
    producer_id: String,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct SimConsumer {
    inner: Arc<ConsumerInner>,
}

impl SimConsumer {
    fn new(producer_id: String, kind: MediaKind, paused: bool) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                id: new_id(),
                producer_id,
                kind,
                paused: AtomicBool::new(paused),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn force_close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConsumerHandle for SimConsumer {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn producer_id(&self) -> String {
        self.inner.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        RtpParameters(serde_json::json!({
            "codecs": [],
            "encodings": [],
            "mid": self.inner.id,
        }))
    }

    fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Media("consumer is closed".into()));
        }
        self.inner.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Media("consumer is closed".into()));
        }
        self.inner.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.force_close();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

struct ObserverState {
    producers: std::collections::HashSet<String>,
    callback: Option<Box<dyn Fn(String) + Send + Sync>>,
}

struct ObserverInner {
    closed: AtomicBool,
    state: Mutex<ObserverState>,
}

impl ObserverInner {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            state: Mutex::new(ObserverState {
                producers: std::collections::HashSet::new(),
                callback: None,
            }),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.lock().callback = None;
    }
}

pub struct SimActiveSpeakerObserver {
    inner: Arc<ObserverInner>,
}

impl SimActiveSpeakerObserver {
    /// Inject a dominant-speaker event, as the router's energy detection
    /// would. Ignored for unregistered producers or after close.
    pub fn emit_dominant(&self, producer_id: &str) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let state = self.inner.state.lock();
        if !state.producers.contains(producer_id) {
            return;
        }
        if let Some(callback) = state.callback.as_ref() {
            callback(producer_id.to_string());
        }
    }
}

#[async_trait]
impl ActiveSpeakerObserverHandle for SimActiveSpeakerObserver {
    async fn add_producer(&self, producer_id: &str) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Media("observer is closed".into()));
        }
        self.inner
            .state
            .lock()
            .producers
            .insert(producer_id.to_string());
        Ok(())
    }

    async fn remove_producer(&self, producer_id: &str) -> Result<()> {
        self.inner.state.lock().producers.remove(producer_id);
        Ok(())
    }

    fn on_dominant_speaker(&self, callback: Box<dyn Fn(String) + Send + Sync>) {
        self.inner.state.lock().callback = Some(callback);
    }

    async fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn router() -> Arc<dyn RouterHandle> {
        let backend = SimBackend::new();
        let worker = backend
            .spawn_worker(&WorkerSettings {
                rtc_min_port: 40000,
                rtc_max_port: 49999,
                log_level: "warn".into(),
            })
            .await
            .unwrap();
        worker.create_router().await.unwrap()
    }

    fn transport_options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: "127.0.0.1".into(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_outgoing_bitrate: 600_000,
        }
    }

    #[tokio::test]
    async fn test_dtls_progression() {
        let router = router().await;
        let transport = router
            .create_webrtc_transport(transport_options())
            .await
            .unwrap();

        assert_eq!(transport.dtls_state(), DtlsState::New);
        transport
            .connect(DtlsParameters(serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(transport.dtls_state(), DtlsState::Connected);
    }

    #[tokio::test]
    async fn test_consume_requires_known_producer() {
        let router = router().await;
        let transport = router
            .create_webrtc_transport(transport_options())
            .await
            .unwrap();

        let caps = router.rtp_capabilities();
        assert!(!router.can_consume("nope", &caps));
        assert!(transport.consume("nope", caps.clone(), false).await.is_err());

        let producer = transport
            .produce(MediaKind::Audio, RtpParameters(serde_json::json!({})))
            .await
            .unwrap();
        assert!(router.can_consume(&producer.id(), &caps));

        let consumer = transport
            .consume(&producer.id(), caps, false)
            .await
            .unwrap();
        assert_eq!(consumer.kind(), MediaKind::Audio);
        assert_eq!(consumer.producer_id(), producer.id());
        assert!(!consumer.paused());
    }

    #[tokio::test]
    async fn test_router_close_cascades() {
        let router = router().await;
        let transport = router
            .create_webrtc_transport(transport_options())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Video, RtpParameters(serde_json::json!({})))
            .await
            .unwrap();
        let observer = router
            .create_active_speaker_observer(Duration::from_millis(100))
            .await
            .unwrap();

        router.close().await;

        assert!(router.is_closed());
        assert!(transport.is_closed());
        assert!(producer.is_closed());
        assert!(observer.is_closed());
        assert_eq!(transport.dtls_state(), DtlsState::Closed);
    }

    #[tokio::test]
    async fn test_closed_producer_rejects_resume() {
        let router = router().await;
        let transport = router
            .create_webrtc_transport(transport_options())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Audio, RtpParameters(serde_json::json!({})))
            .await
            .unwrap();

        producer.close().await;
        assert!(producer.resume().await.is_err());
        assert!(producer.pause().await.is_err());
    }

    #[tokio::test]
    async fn test_observer_emits_only_registered_producers() {
        let observer = SimActiveSpeakerObserver {
            inner: Arc::new(ObserverInner::new()),
        };

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        observer.on_dominant_speaker(Box::new(move |id| seen_cb.lock().push(id)));

        observer.emit_dominant("p1");
        assert!(seen.lock().is_empty());

        observer.add_producer("p1").await.unwrap();
        observer.emit_dominant("p1");
        assert_eq!(*seen.lock(), vec!["p1".to_string()]);

        observer.remove_producer("p1").await.unwrap();
        observer.emit_dominant("p1");
        assert_eq!(seen.lock().len(), 1);

        observer.close().await;
        assert!(observer.is_closed());
        assert!(observer.add_producer("p2").await.is_err());
    }

    #[tokio::test]
    async fn test_worker_death_hook() {
        let worker = SimWorker::new(42);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_cb = Arc::clone(&fired);
        worker.on_died(Box::new(move || fired_cb.store(true, Ordering::SeqCst)));

        worker.simulate_death();
        assert!(fired.load(Ordering::SeqCst));
        assert!(worker.is_closed());
        assert!(worker.cpu_time().await.is_err());
    }
}
