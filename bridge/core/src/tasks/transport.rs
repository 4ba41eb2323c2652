//! Transport Bridge Task
//!
//! Translates the user-facing message transport to and from bus events.
//! Inbound frames are demultiplexed by content tag; outbound bus events
//! are serialized into wire messages. This task is the only component
//! that touches the transport, and it runs in both interaction modes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, SessionBus};
use crate::gesture::GestureLookup;
use crate::messages::{ChatContent, ChatMessage, InteractionMode};
use crate::tasks::{spawn_run, RunState, SessionTask, TaskError};

/// Errors on the user transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer went away.
    #[error("transport closed")]
    Closed,
    /// Anything else the underlying socket reported.
    #[error("transport error: {0}")]
    Io(String),
}

/// One frame on the user transport.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportFrame {
    /// A UTF-8 JSON text frame.
    Text(String),
    /// A raw audio frame.
    Binary(Bytes),
}

/// The bidirectional user transport as the bridge sees it. The server
/// binary implements this over a WebSocket; tests use channel pairs.
#[async_trait]
pub trait UserTransport: Send + Sync {
    /// Write one frame to the peer.
    async fn send(&self, frame: TransportFrame) -> Result<(), TransportError>;

    /// Read the next frame, or `None` once the peer has closed.
    async fn recv(&self) -> Result<Option<TransportFrame>, TransportError>;
}

/// Bridges the user transport onto the session bus.
pub struct TransportBridgeTask {
    bus: SessionBus,
    transport: Arc<dyn UserTransport>,
    gestures: Option<Arc<dyn GestureLookup>>,
    run: RunState,
}

impl TransportBridgeTask {
    /// Create the bridge for one session.
    #[must_use]
    pub fn new(
        bus: SessionBus,
        transport: Arc<dyn UserTransport>,
        gestures: Option<Arc<dyn GestureLookup>>,
    ) -> Self {
        Self {
            bus,
            transport,
            gestures,
            run: RunState::default(),
        }
    }

    /// Read frames from the peer and republish them as bus events until
    /// the transport closes.
    async fn pump_inbound(&self) -> Result<(), TaskError> {
        loop {
            match self.transport.recv().await {
                Ok(Some(TransportFrame::Binary(audio))) => {
                    self.bus.publish(BusEvent::UserAudioChunk(audio));
                }
                Ok(Some(TransportFrame::Text(raw))) => self.dispatch_text(&raw),
                Ok(None) => {
                    debug!("user transport closed");
                    self.bus.publish(BusEvent::UserClosedSocket);
                    return Ok(());
                }
                Err(err) => {
                    // The transport reports closure separately; errors are
                    // logged and the read loop carries on.
                    warn!(error = %err, "user transport error");
                }
            }
        }
    }

    /// Parse one text frame and publish the matching bus event.
    /// Malformed frames are logged and dropped.
    fn dispatch_text(&self, raw: &str) {
        let message: ChatMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping malformed frame");
                return;
            }
        };
        match message.content {
            ChatContent::Typing {
                message_id,
                text,
                is_new_message,
            } => {
                if is_new_message {
                    self.bus
                        .publish(BusEvent::UserStartedMessage { message_id, text });
                } else {
                    self.bus
                        .publish(BusEvent::UserUpdatedMessage { message_id, text });
                }
            }
            ChatContent::Text {
                message_id,
                text,
                bot_name,
            } => {
                self.bus.publish(BusEvent::UserFinishedMessage {
                    message_id,
                    text,
                    bot_name,
                });
            }
            ChatContent::ToggleSpeech { interaction_mode } => {
                self.bus.publish(BusEvent::UserToggledSpeech {
                    mode: interaction_mode,
                });
            }
            other => debug!(?other, "ignoring unexpected inbound content"),
        }
    }

    /// Serialize bus events into wire messages and write them out.
    async fn pump_outbound(
        &self,
        mut rx: broadcast::Receiver<BusEvent>,
    ) -> Result<(), TaskError> {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "outbound subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            };
            match event {
                BusEvent::BotRosterUpdated { bots } => {
                    self.send_message(ChatMessage::system(ChatContent::BotList {
                        bot_list: bots,
                    }))
                    .await;
                }
                BusEvent::BotUtterance {
                    message_id,
                    text,
                    bot_name,
                } => {
                    self.send_message(ChatMessage::bot(ChatContent::Text {
                        message_id,
                        text,
                        bot_name,
                    }))
                    .await;
                }
                BusEvent::BotThinking { message_id } => {
                    self.send_message(ChatMessage::bot(ChatContent::Typing {
                        message_id,
                        text: String::new(),
                        is_new_message: true,
                    }))
                    .await;
                }
                BusEvent::BotGesture { gesture } => self.relay_gesture(&gesture).await,
                BusEvent::BotAudioChunk(audio) => {
                    if let Err(err) = self
                        .transport
                        .send(TransportFrame::Binary(audio))
                        .await
                    {
                        warn!(error = %err, "failed to write audio frame");
                    }
                }
                BusEvent::AsrAvailable {
                    transcript,
                    message_id,
                } => {
                    self.send_message(ChatMessage::user(ChatContent::Asr {
                        transcript,
                        message_id,
                    }))
                    .await;
                }
                BusEvent::UserBargeIn => {
                    self.send_message(ChatMessage::system(ChatContent::UserBargeIn {}))
                        .await;
                }
                BusEvent::ConfigChanged { speech_supported } => {
                    self.send_message(ChatMessage::system(ChatContent::ConfigChange {
                        speech_supported,
                    }))
                    .await;
                }
                BusEvent::Shutdown { reason } => {
                    self.send_message(ChatMessage::system(ChatContent::Shutdown { reason }))
                        .await;
                }
                _ => {}
            }
        }
    }

    /// Resolve a gesture through the injected lookup and relay it as an
    /// emoji message. Unresolved gestures are logged and dropped.
    async fn relay_gesture(&self, gesture: &str) {
        let Some(lookup) = &self.gestures else {
            warn!(gesture, "no gesture lookup configured; dropping gesture");
            return;
        };
        match lookup.find(gesture).await {
            Some(symbol) => {
                self.send_message(ChatMessage::bot(ChatContent::Emoji {
                    message_id: Uuid::new_v4().to_string(),
                    emoji: symbol.emoji,
                    title: symbol.title,
                    bot_name: None,
                }))
                .await;
            }
            None => warn!(gesture, "gesture did not resolve to a symbol"),
        }
    }

    async fn send_message(&self, message: ChatMessage) {
        match serde_json::to_string(&message) {
            Ok(json) => {
                if let Err(err) = self.transport.send(TransportFrame::Text(json)).await {
                    warn!(error = %err, "failed to write frame");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize message"),
        }
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        rx: broadcast::Receiver<BusEvent>,
    ) -> Result<(), TaskError> {
        tokio::select! {
            () = cancel.cancelled() => Err(TaskError::Cancelled),
            result = self.pump_inbound() => result,
            result = self.pump_outbound(rx) => result,
        }
    }
}

#[async_trait]
impl SessionTask for TransportBridgeTask {
    fn name(&self) -> &'static str {
        "transport-bridge"
    }

    fn modes(&self) -> &'static [InteractionMode] {
        &[InteractionMode::Text, InteractionMode::Speech]
    }

    fn run_state(&self) -> &RunState {
        &self.run
    }

    fn start(self: Arc<Self>) {
        let cancel = self.run.begin();
        // Subscribe before spawning so no event published right after
        // start() can be missed.
        let rx = self.bus.subscribe();
        let bus = self.bus.clone();
        let task = Arc::clone(&self);
        spawn_run(bus, self.name(), async move { task.run(cancel, rx).await });
    }
}
