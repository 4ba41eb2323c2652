//! Server Configuration
//!
//! Environment-driven settings for the bridge. Every knob has a default
//! suitable for a local deployment; production overrides them via
//! `BRIDGE_*` environment variables.

use std::path::PathBuf;

use tracing::warn;

/// Default WebSocket listener port.
pub const DEFAULT_PORT: u16 = 7007;

/// Default PCM sample rate for user speech, in Hz.
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Runtime configuration loaded from the environment.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Port the WebSocket listener binds to (`BRIDGE_PORT`).
    pub port: u16,
    /// Endpoint of the streaming RPC pipeline backend (`BRIDGE_STREAMING_URL`).
    pub streaming_url: String,
    /// Endpoint of the durable event-log backend (`BRIDGE_LOG_URL`).
    pub log_url: String,
    /// Base URL of the HTTP chat backend (`BRIDGE_HTTP_URL`).
    pub http_url: String,
    /// Stream name for pipeline lifecycle events; also the prefix for
    /// per-session channels (`BRIDGE_EVENT_STREAM`).
    pub event_stream: String,
    /// Source identity written on every log entry this server produces,
    /// used for self-echo suppression (`BRIDGE_SOURCE_NAME`).
    pub source_name: String,
    /// Sample rate announced on outbound audio streams (`BRIDGE_SAMPLE_RATE`).
    pub sample_rate: u32,
    /// TLS certificate chain in PEM format (`BRIDGE_TLS_CERT`).
    pub tls_cert: Option<PathBuf>,
    /// TLS private key in PEM format (`BRIDGE_TLS_KEY`).
    pub tls_key: Option<PathBuf>,
    /// Optional JSON gesture table for the emoji lookup (`BRIDGE_GESTURES`).
    pub gestures_path: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            streaming_url: "http://localhost:50055".to_string(),
            log_url: "redis://localhost:6379".to_string(),
            http_url: "http://localhost:9000".to_string(),
            event_stream: "bridge_system_events".to_string(),
            source_name: "chat-bridge".to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            tls_cert: None,
            tls_key: None,
            gestures_path: None,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `BRIDGE_*` environment variables, falling
    /// back to defaults for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("BRIDGE_PORT", defaults.port),
            streaming_url: env_or("BRIDGE_STREAMING_URL", &defaults.streaming_url),
            log_url: env_or("BRIDGE_LOG_URL", &defaults.log_url),
            http_url: env_or("BRIDGE_HTTP_URL", &defaults.http_url),
            event_stream: env_or("BRIDGE_EVENT_STREAM", &defaults.event_stream),
            source_name: env_or("BRIDGE_SOURCE_NAME", &defaults.source_name),
            sample_rate: env_parse("BRIDGE_SAMPLE_RATE", defaults.sample_rate),
            tls_cert: std::env::var("BRIDGE_TLS_CERT").ok().map(PathBuf::from),
            tls_key: std::env::var("BRIDGE_TLS_KEY").ok().map(PathBuf::from),
            gestures_path: std::env::var("BRIDGE_GESTURES").ok().map(PathBuf::from),
        }
    }

    /// The TLS cert/key pair, if both are configured.
    ///
    /// Configuring only one of the pair logs a warning and falls back to
    /// an insecure listener rather than refusing to start.
    #[must_use]
    pub fn tls_pair(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (None, None) => None,
            _ => {
                warn!(
                    "only one of BRIDGE_TLS_CERT / BRIDGE_TLS_KEY is set; \
                     starting without TLS"
                );
                None
            }
        }
    }

    /// Channel name for a single session's event-log traffic.
    #[must_use]
    pub fn session_channel(&self, session_id: &str) -> String {
        format!("{}_{}", self.event_stream, session_id)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
