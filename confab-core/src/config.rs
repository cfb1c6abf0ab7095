use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub jobs: JobsServiceConfig,
    pub logging: LoggingConfig,
    pub messaging: MessagingConfig,
    pub media: MediaConfig,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Announced IP for ICE candidates; falls back to host when unset.
    pub public_ip: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_ip: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            key_prefix: "confab:".to_string(),
        }
    }
}

impl RedisConfig {
    /// Build a redis connection URL from the host/port/password triple.
    #[must_use]
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{password}@{}:{}", self.host, self.port)
            }
            _ => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for token validation. Must be set in production.
    pub jwt_secret: String,
    /// Hard cap on the unauthenticated handshake window.
    pub handshake_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            handshake_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsServiceConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for JobsServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001".to_string(),
            request_timeout_secs: 5,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Which lock flavour the messaging gateway uses for `message.send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Retry acquisition until the lease is granted.
    Blocking,
    /// Single attempt; busy conversations answer `RESOURCE_BUSY`.
    Try,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub lock_mode: LockMode,
    /// Idle conversation queues are swept after this many seconds.
    pub queue_idle_secs: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            lock_mode: LockMode::Blocking,
            queue_idle_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub workers: WorkerPoolConfig,
    pub router: RouterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Worker process count; 0 means one per logical CPU.
    pub count: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: String,
    pub sample_interval_ms: u64,
    pub weight_cpu: f64,
    pub weight_routers: f64,
    pub weight_transports: f64,
    pub overload_threshold: f64,
    pub died_policy: WorkerDiedPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            count: 0,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            log_level: "warn".to_string(),
            sample_interval_ms: 1000,
            weight_cpu: 1.0,
            weight_routers: 0.05,
            weight_transports: 0.01,
            overload_threshold: 1.5,
            died_policy: WorkerDiedPolicy::Respawn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerDiedPolicy {
    /// Replace the dead worker in the same slot after a short delay.
    Respawn,
    /// Treat a dead worker as fatal for the whole process.
    Exit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub max_active_speakers: usize,
    pub refresh_interval_secs: u64,
    pub speaker_observer_interval_ms: u64,
    pub initial_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
    pub pending_join_expiry_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_active_speakers: 10,
            refresh_interval_secs: 25,
            speaker_observer_interval_ms: 100,
            initial_outgoing_bitrate: 600_000,
            max_incoming_bitrate: 1_500_000,
            pending_join_expiry_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub port_min: u16,
    pub port_max: u16,
    pub segment_secs: u32,
    pub audio_dir: String,
    pub transcript_dir: String,
    pub ffmpeg_bin: String,
    pub python_bin: String,
    pub script_path: String,
    pub model: String,
    pub device: String,
    pub compute_type: String,
    pub language: Option<String>,
    pub transcribe_timeout_secs: u64,
    pub watch_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            port_min: 60000,
            port_max: 65000,
            segment_secs: 30,
            audio_dir: "temp/audio-segments".to_string(),
            transcript_dir: "temp/transcripts".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
            python_bin: "python3".to_string(),
            script_path: "scripts/whisper_transcriber.py".to_string(),
            model: "base".to_string(),
            device: "cpu".to_string(),
            compute_type: "float32".to_string(),
            language: None,
            transcribe_timeout_secs: 60,
            watch_interval_ms: 2000,
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// `CONFAB__`-prefixed variables override any key (`CONFAB__REDIS__HOST`);
    /// the handful of legacy flat variables the deployment scripts export
    /// (`REDIS_HOST`, `JWT_SECRET`, ...) are applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("CONFAB")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: Self = builder.build()?.try_deserialize()?;
        cfg.apply_flat_env();
        Ok(cfg)
    }

    fn apply_flat_env(&mut self) {
        if let Ok(host) = std::env::var("REDIS_HOST") {
            self.redis.host = host;
        }
        if let Ok(port) = std::env::var("REDIS_PORT") {
            if let Ok(port) = port.parse() {
                self.redis.port = port;
            }
        }
        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            self.redis.password = Some(password);
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(url) = std::env::var("JOBS_SERVICE_URL") {
            self.jobs.base_url = url;
        }
        if let Ok(ip) = std::env::var("PUBLIC_IP") {
            self.server.public_ip = Some(ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.auth.handshake_timeout_secs, 30);
        assert_eq!(cfg.jobs.request_timeout_secs, 5);
        assert_eq!(cfg.media.router.max_active_speakers, 10);
        assert_eq!(cfg.capture.port_min, 60000);
        assert_eq!(cfg.capture.port_max, 65000);
        assert_eq!(cfg.messaging.lock_mode, LockMode::Blocking);
    }

    #[test]
    fn test_redis_url() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://localhost:6379");

        redis.password = Some("s3cret".to_string());
        assert_eq!(redis.url(), "redis://:s3cret@localhost:6379");
    }
}
