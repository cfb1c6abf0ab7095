//! Service construction and the axum serve loop.
//!
//! Everything is built once here and injected; no ambient globals. Shutdown
//! tears the stack down in dependency order: gateways stop accepting, taps
//! and workers close, queue managers drop their sweepers.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager as RedisConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use confab_api::{
    hub::ClusterHub, ws, ClusterAdapter, ConnectionSupervisor, MessagingGateway,
    NotificationEmitter, SocketHub, StreamingGateway,
};
use confab_core::service::{
    DurableMessageQueue, JobsClient, LockConfig, Locks, MessageQueueManager, SessionRegistry,
    TokenValidator,
};
use confab_core::Config;
use confab_media::capture::AudioCapture;
use confab_media::room::RoomRegistry;
use confab_media::service::{MediaService, MediaServiceConfig};
use confab_media::sfu::sim::SimBackend;
use confab_media::sfu::SfuBackend;
use confab_media::speaker::{ActiveSpeakerEngine, DominantSpeakerHandler};
use confab_media::workers::WorkerPool;
use confab_media::Broadcaster;

pub async fn run(config: Config) -> Result<()> {
    // Shared store
    let redis_url = config.redis.url();
    let redis_client =
        redis::Client::open(redis_url.as_str()).context("Invalid redis configuration")?;
    let redis = RedisConnectionManager::new(redis_client.clone())
        .await
        .context("Failed to connect to redis")?;
    info!(host = %config.redis.host, port = config.redis.port, "Connected to shared store");

    // Socket hub + cluster adapter
    let hub = SocketHub::new();
    let adapter = ClusterAdapter::start(&redis_url, hub.clone())
        .await
        .context("Failed to start cluster adapter")?;
    let cluster = ClusterHub::new(hub, Some(adapter.clone()));

    // Job status notifications: fan backend-published transitions out to
    // conversation rooms.
    let notifications = NotificationEmitter::new(cluster.clone());
    notifications.start_ingest(redis_client);
    info!("Notification ingest started");

    // Core services
    let locks = Locks::new(redis.clone(), LockConfig::default());
    let sessions = SessionRegistry::new(redis.clone());
    let durable = DurableMessageQueue::new(redis.clone());
    let queues = Arc::new(MessageQueueManager::new(Duration::from_secs(
        config.messaging.queue_idle_secs,
    )));
    let jobs = JobsClient::new(&config.jobs)?;
    let validator = TokenValidator::new(&config.auth.jwt_secret)?;

    // Media engine
    let backend: Arc<dyn SfuBackend> = Arc::new(SimBackend::new());
    let workers = WorkerPool::start(backend, config.media.workers.clone())
        .await
        .context("Failed to start media worker pool")?;
    info!(workers = workers.worker_count(), "Media workers online");

    let media_service = MediaService::new(
        workers.clone(),
        MediaServiceConfig {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: config.server.public_ip.clone(),
            initial_outgoing_bitrate: config.media.router.initial_outgoing_bitrate,
            max_incoming_bitrate: config.media.router.max_incoming_bitrate,
        },
    );

    let broadcaster: Arc<dyn Broadcaster> = Arc::new(cluster.clone());
    let handler = Arc::new(DominantSpeakerHandler::new(
        ActiveSpeakerEngine::new(config.media.router.max_active_speakers),
        Arc::clone(&broadcaster),
    ));
    let capture = AudioCapture::new(config.capture.clone(), Arc::clone(&broadcaster));
    let registry = RoomRegistry::new();

    // Gateways
    let supervisor = Arc::new(ConnectionSupervisor::new(
        validator,
        sessions,
        jobs,
        cluster.clone(),
        Duration::from_secs(config.auth.handshake_timeout_secs),
    ));
    let chat = Arc::new(MessagingGateway::new(
        locks.clone(),
        Arc::clone(&queues),
        durable,
        cluster.clone(),
        config.messaging.lock_mode,
    ));
    let media = StreamingGateway::new(
        registry,
        workers.clone(),
        media_service,
        handler,
        capture.clone(),
        locks,
        cluster.clone(),
        config.media.router.clone(),
    );

    let state = ws::ApiState {
        cluster,
        supervisor,
        chat,
        media: Arc::clone(&media),
    };
    let app = ws::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "confab server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Teardown in dependency order.
    info!("Shutting down");
    media.shutdown();
    capture.shutdown().await;
    workers.shutdown().await;
    queues.destroy();
    notifications.shutdown();
    adapter.shutdown();
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
