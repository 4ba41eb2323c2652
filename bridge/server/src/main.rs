//! Chat-Bridge Server
//!
//! WebSocket server for conversational UI sessions. Each connection gets
//! its own session, wired to the backend selected on the command line.
//!
//! # Usage
//!
//! ```bash
//! # Text over the streaming RPC pipeline
//! bridge-server --chat-interface streaming
//!
//! # Text over the event log
//! bridge-server --chat-interface event
//!
//! # Text over HTTP, with speech enabled
//! bridge-server --chat-interface http --speech
//!
//! # With verbose logging
//! RUST_LOG=debug bridge-server --chat-interface http
//! ```
//!
//! # Environment Variables
//!
//! - `BRIDGE_PORT`: WebSocket listener port (default: 7007)
//! - `BRIDGE_STREAMING_URL`: streaming pipeline endpoint
//! - `BRIDGE_LOG_URL`: event-log endpoint
//! - `BRIDGE_HTTP_URL`: HTTP chat endpoint
//! - `BRIDGE_TLS_CERT` / `BRIDGE_TLS_KEY`: PEM pair enabling TLS
//! - `BRIDGE_GESTURES`: JSON gesture table extending the built-ins
//! - `RUST_LOG`: log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: graceful shutdown (open sessions get a notice and
//!   are drained before exit)

mod gestures;
mod listener;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bridge_core::{
    BackendClients, BridgeConfig, GrpcStreamingBackend, HttpChatClient, RedisEventLog,
    StreamingBackend, TextStrategy,
};
use clap::{Parser, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::gestures::StaticGestureLookup;
use crate::listener::ServerState;

#[derive(Parser)]
#[command(name = "bridge-server", about = "WebSocket server for chat sessions")]
struct Args {
    /// Backend carrying the text side of every session.
    #[arg(long, value_enum)]
    chat_interface: ChatInterface,

    /// Enable the speech pipeline (audio upload, synthesis, transcription).
    #[arg(long)]
    speech: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ChatInterface {
    /// Streaming RPC pipeline.
    Streaming,
    /// Durable event log.
    Event,
    /// Plain HTTP chat endpoint.
    Http,
}

impl From<ChatInterface> for TextStrategy {
    fn from(value: ChatInterface) -> Self {
        match value {
            ChatInterface::Streaming => TextStrategy::Streaming,
            ChatInterface::Event => TextStrategy::Event,
            ChatInterface::Http => TextStrategy::Http,
        }
    }
}

/// Connect the clients the selected strategy and speech flag need.
/// Failing here, before the listener binds, keeps misconfiguration a
/// startup error instead of a per-connection one.
async fn connect_clients(
    config: &BridgeConfig,
    strategy: TextStrategy,
    speech: bool,
) -> anyhow::Result<BackendClients> {
    let mut clients = BackendClients::default();

    // User audio always needs the streaming pipeline, whichever backend
    // carries text.
    let needs_streaming = strategy == TextStrategy::Streaming || speech;
    if needs_streaming {
        let backend = GrpcStreamingBackend::connect(config.streaming_url.clone())
            .await
            .with_context(|| format!("connecting to {}", config.streaming_url))?;
        info!(url = %config.streaming_url, "streaming backend connected");
        clients.streaming = Some(Arc::new(backend) as Arc<dyn StreamingBackend>);
    }

    if strategy == TextStrategy::Event {
        let log = RedisEventLog::connect(&config.log_url)
            .await
            .with_context(|| format!("connecting to {}", config.log_url))?;
        info!(url = %config.log_url, "event log connected");
        clients.event_log = Some(Arc::new(log));
    }

    if strategy == TextStrategy::Http {
        info!(url = %config.http_url, "using HTTP chat backend");
        clients.http = Some(Arc::new(HttpChatClient::new(config.http_url.clone())));
    }

    Ok(clients)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bridge_server=info".parse()?)
                .add_directive("bridge_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    let strategy = TextStrategy::from(args.chat_interface);
    let config = BridgeConfig::from_env();
    info!(?strategy, speech = args.speech, port = config.port, "starting bridge server");

    let clients = connect_clients(&config, strategy, args.speech).await?;
    let gestures = Arc::new(StaticGestureLookup::load(config.gestures_path.as_deref())?);

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C, shutting down"),
            _ = terminate => info!("received SIGTERM, shutting down"),
        }
        signal_shutdown.cancel();
    });

    let state = Arc::new(ServerState {
        config,
        clients,
        strategy,
        speech: args.speech,
        gestures,
    });
    listener::serve(state, shutdown).await?;

    // Give in-flight log appends and socket closes a moment to land.
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("bridge server stopped cleanly");
    Ok(())
}
