//! WebSocket Listener
//!
//! Accept loop for user connections: plain TCP or TLS depending on
//! configuration, one [`bridge_core::ChatSession`] per accepted
//! WebSocket. Connections are tracked so shutdown can wait for every
//! session to deliver its closing notice before the process exits.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bridge_core::{
    BackendClients, BridgeConfig, ChatSession, GestureLookup, TextStrategy, TransportError,
    TransportFrame, UserTransport,
};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Everything a new connection needs, shared across the accept loop.
pub struct ServerState {
    /// Runtime configuration.
    pub config: BridgeConfig,
    /// Backend clients constructed at startup.
    pub clients: BackendClients,
    /// Text strategy selected on the command line.
    pub strategy: TextStrategy,
    /// Whether speech was enabled on the command line.
    pub speech: bool,
    /// Gesture table for outbound emoji messages.
    pub gestures: Arc<dyn GestureLookup>,
}

/// Run the listener until `shutdown` fires, then wait for every live
/// session to finish unwinding.
pub async fn serve(state: Arc<ServerState>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let tls = match state.config.tls_pair() {
        Some((cert, key)) => Some(tls_acceptor(cert, key)?),
        None => None,
    };
    info!(addr, tls = tls.is_some(), "listening for connections");

    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                info!(%peer, "connection accepted");
                let state = Arc::clone(&state);
                let session_shutdown = shutdown.child_token();
                let tls = tls.clone();
                tracker.spawn(async move {
                    match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => {
                                handle_connection(stream, state, session_shutdown).await;
                            }
                            Err(err) => warn!(%peer, error = %err, "TLS handshake failed"),
                        },
                        None => handle_connection(stream, state, session_shutdown).await,
                    }
                });
            }
        }
    }

    info!("listener stopped; draining sessions");
    tracker.close();
    tracker.wait().await;
    Ok(())
}

fn tls_acceptor(cert: &Path, key: &Path) -> anyhow::Result<TlsAcceptor> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
            .collect::<Result<_, _>>()
            .with_context(|| format!("reading certificates from {}", cert.display()))?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))
            .with_context(|| format!("reading private key from {}", key.display()))?
            .with_context(|| format!("no private key in {}", key.display()))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("assembling TLS configuration")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Upgrade one accepted stream to a WebSocket and run its session to
/// completion.
async fn handle_connection<S>(stream: S, state: Arc<ServerState>, shutdown: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(error = %err, "WebSocket handshake failed");
            return;
        }
    };
    let transport = Arc::new(WsTransport::new(ws));

    let session = match ChatSession::new(
        &state.config,
        &state.clients,
        state.strategy,
        state.speech,
        transport,
        Some(Arc::clone(&state.gestures)),
    ) {
        Ok(session) => session,
        Err(err) => {
            error!(error = %err, "refusing connection");
            return;
        }
    };
    session.run(shutdown).await;
}

/// [`UserTransport`] over a WebSocket: JSON messages as text frames, raw
/// audio as binary frames.
struct WsTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl<S> UserTransport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, frame: TransportFrame) -> Result<(), TransportError> {
        let message = match frame {
            TransportFrame::Text(text) => Message::Text(text),
            TransportFrame::Binary(audio) => Message::Binary(audio.to_vec()),
        };
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&self) -> Result<Option<TransportFrame>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(TransportFrame::Text(text))),
                Some(Ok(Message::Binary(audio))) => {
                    return Ok(Some(TransportFrame::Binary(Bytes::from(audio))));
                }
                // Control frames are handled by the protocol layer.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(err)) => return Err(TransportError::Io(err.to_string())),
            }
        }
    }
}
