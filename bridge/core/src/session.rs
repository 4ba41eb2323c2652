//! Chat Session Supervisor
//!
//! One [`ChatSession`] per connected user. The supervisor assembles the
//! fixed task set for the chosen text strategy, announces the session's
//! capabilities over the bus, and then arbitrates the task lifecycle:
//! mode toggles start and stop tasks according to the modes each task
//! declares, a fatal task error tears the whole session down with a
//! user-visible notice, and a closed transport unwinds it silently.
//!
//! # Design Philosophy
//!
//! The task set is decided once, at construction, from the text strategy
//! and the speech flag; missing backend clients are a constructor error
//! naming the configuration knob to set, not a runtime surprise. After
//! construction the supervisor treats tasks uniformly through the
//! [`SessionTask`] contract; it never needs to know which task is which.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, SessionBus};
use crate::clients::http::HttpChat;
use crate::clients::log::EventLog;
use crate::clients::streaming::StreamingBackend;
use crate::config::BridgeConfig;
use crate::gesture::GestureLookup;
use crate::messages::InteractionMode;
use crate::tasks::event_log::EventLogTask;
use crate::tasks::speech::SpeechStreamTask;
use crate::tasks::text_http::HttpChatTask;
use crate::tasks::text_streaming::StreamingTextTask;
use crate::tasks::transcription::TranscriptionTask;
use crate::tasks::transport::{TransportBridgeTask, UserTransport};
use crate::tasks::SessionTask;

/// How long published shutdown notices get to reach the transport before
/// the tasks delivering them are stopped.
const NOTICE_FLUSH: Duration = Duration::from_millis(100);

/// Unique identifier of one connection's session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which backend carries the session's text turns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextStrategy {
    /// Streaming RPC pipeline.
    Streaming,
    /// Durable event log.
    Event,
    /// Plain HTTP chat endpoint.
    Http,
}

/// Backend clients available to sessions. Only the clients the chosen
/// strategy and speech flag need have to be present.
#[derive(Clone, Default)]
pub struct BackendClients {
    /// Streaming RPC pipeline client.
    pub streaming: Option<Arc<dyn StreamingBackend>>,
    /// Durable event-log client.
    pub event_log: Option<Arc<dyn EventLog>>,
    /// HTTP chat client.
    pub http: Option<Arc<dyn HttpChat>>,
}

/// Why a session could not be assembled.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The selected strategy needs the streaming backend.
    #[error("streaming backend is not available; check BRIDGE_STREAMING_URL")]
    StreamingUnavailable,
    /// The selected strategy needs the event-log backend.
    #[error("event-log backend is not available; check BRIDGE_LOG_URL")]
    EventLogUnavailable,
    /// The selected strategy needs the HTTP chat backend.
    #[error("HTTP chat backend is not available; check BRIDGE_HTTP_URL")]
    HttpUnavailable,
    /// Speech was requested but the backend carrying audio is missing.
    #[error("speech requires the streaming backend; check BRIDGE_STREAMING_URL")]
    SpeechWithoutStreaming,
}

/// Supervisor for one user's connection.
pub struct ChatSession {
    session_id: SessionId,
    bus: SessionBus,
    tasks: Vec<Arc<dyn SessionTask>>,
    speech_supported: bool,
    mode: Mutex<InteractionMode>,
}

impl ChatSession {
    /// Assemble the task set for one connection.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] naming the missing backend when the
    /// chosen strategy or the speech flag needs a client that was not
    /// provided.
    pub fn new(
        config: &BridgeConfig,
        clients: &BackendClients,
        strategy: TextStrategy,
        speech: bool,
        transport: Arc<dyn UserTransport>,
        gestures: Option<Arc<dyn GestureLookup>>,
    ) -> Result<Self, SessionError> {
        let session_id = SessionId::generate();
        let bus = SessionBus::new();

        let mut tasks: Vec<Arc<dyn SessionTask>> = vec![Arc::new(TransportBridgeTask::new(
            bus.clone(),
            transport,
            gestures,
        ))];

        match strategy {
            TextStrategy::Streaming => {
                let backend = clients
                    .streaming
                    .clone()
                    .ok_or(SessionError::StreamingUnavailable)?;
                tasks.push(Arc::new(StreamingTextTask::new(
                    bus.clone(),
                    backend,
                    session_id.to_string(),
                )));
            }
            TextStrategy::Event => {
                let log = clients
                    .event_log
                    .clone()
                    .ok_or(SessionError::EventLogUnavailable)?;
                tasks.push(Arc::new(EventLogTask::new(
                    bus.clone(),
                    log,
                    config.session_channel(session_id.as_str()),
                    config.event_stream.clone(),
                    config.source_name.clone(),
                )));
            }
            TextStrategy::Http => {
                let client = clients.http.clone().ok_or(SessionError::HttpUnavailable)?;
                tasks.push(Arc::new(HttpChatTask::new(
                    bus.clone(),
                    client,
                    session_id.to_string(),
                )));
            }
        }

        // User audio always rides the streaming pipeline. Bot-speech
        // transcripts do too, except with the event-log strategy, where
        // the log itself delivers them.
        if speech {
            let backend = clients
                .streaming
                .clone()
                .ok_or(SessionError::SpeechWithoutStreaming)?;
            tasks.push(Arc::new(SpeechStreamTask::new(
                bus.clone(),
                Arc::clone(&backend),
                session_id.to_string(),
                config.sample_rate,
            )));
            if strategy != TextStrategy::Event {
                tasks.push(Arc::new(TranscriptionTask::new(
                    bus.clone(),
                    backend,
                    session_id.to_string(),
                )));
            }
        }

        Ok(Self {
            session_id,
            bus,
            tasks,
            speech_supported: speech,
            mode: Mutex::new(InteractionMode::Text),
        })
    }

    /// This session's identifier.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.session_id
    }

    /// Drive the session until the transport closes, a task fails, or
    /// the server-wide shutdown token fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        // Subscribe before starting anything so the supervisor observes
        // every event the tasks publish from their first instant.
        let mut rx = self.bus.subscribe();
        self.refresh_tasks();
        self.bus.publish(BusEvent::ConfigChanged {
            speech_supported: self.speech_supported,
        });
        info!(session = %self.session_id, "session started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    self.shutdown_with_notice("server is shutting down").await;
                    break;
                }
                event = rx.recv() => match event {
                    Ok(BusEvent::FatalError { task, message }) => {
                        warn!(session = %self.session_id, task, error = %message,
                              "task failed; closing session");
                        self.shutdown_with_notice(&message).await;
                        break;
                    }
                    Ok(BusEvent::UserClosedSocket) => {
                        debug!(session = %self.session_id, "transport closed");
                        self.stop_all();
                        self.cleanup_all().await;
                        break;
                    }
                    Ok(BusEvent::UserToggledSpeech { mode }) => {
                        *self.mode.lock().unwrap() = mode;
                        self.refresh_tasks();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(session = %self.session_id, missed, "supervisor lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!(session = %self.session_id, "session ended");
    }

    /// Start every task that runs in the current mode and stop every
    /// task that does not.
    fn refresh_tasks(&self) {
        let mode = *self.mode.lock().unwrap();
        for task in &self.tasks {
            match (task.is_running(), task.supports(mode)) {
                (false, true) => {
                    debug!(session = %self.session_id, task = task.name(), "starting");
                    Arc::clone(task).start();
                }
                (true, false) => {
                    debug!(session = %self.session_id, task = task.name(), "stopping");
                    task.stop();
                }
                _ => {}
            }
        }
    }

    /// Tell the user why the session is ending, give the transport a
    /// moment to deliver the notice, then unwind everything.
    async fn shutdown_with_notice(&self, reason: &str) {
        self.bus.publish(BusEvent::Shutdown {
            reason: reason.to_string(),
        });
        tokio::time::sleep(NOTICE_FLUSH).await;
        self.stop_all();
        self.cleanup_all().await;
    }

    fn stop_all(&self) {
        for task in &self.tasks {
            task.stop();
        }
    }

    /// Run every task's cleanup. Failures are logged per task and never
    /// block the remaining cleanups.
    async fn cleanup_all(&self) {
        for task in &self.tasks {
            if let Err(err) = task.cleanup().await {
                warn!(session = %self.session_id, task = task.name(), error = %err,
                      "cleanup failed");
            }
        }
    }

    #[cfg(test)]
    fn running_task_names(&self) -> Vec<&'static str> {
        self.tasks
            .iter()
            .filter(|t| t.is_running())
            .map(|t| t.name())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::transport::TransportFrame;
    use crate::testing::{
        recv_matching, MemoryEventLog, MockHttpChat, MockStreamingBackend, MockTransport,
    };
    use tokio::sync::mpsc;

    struct TransportHalves {
        _inbound: mpsc::UnboundedSender<TransportFrame>,
        _outbound: mpsc::UnboundedReceiver<TransportFrame>,
    }

    // The returned halves keep the mock transport open; dropping them
    // closes it and the session unwinds.
    fn speech_session() -> (Arc<ChatSession>, SessionBus, TransportHalves) {
        let (transport, inbound, outbound) = MockTransport::pair();
        let clients = BackendClients {
            streaming: Some(Arc::new(MockStreamingBackend::new())),
            event_log: None,
            http: Some(Arc::new(MockHttpChat::new())),
        };
        let session = ChatSession::new(
            &BridgeConfig::default(),
            &clients,
            TextStrategy::Http,
            true,
            transport,
            None,
        )
        .unwrap();
        let bus = session.bus.clone();
        let halves = TransportHalves {
            _inbound: inbound,
            _outbound: outbound,
        };
        (Arc::new(session), bus, halves)
    }

    #[test]
    fn missing_backends_are_constructor_errors() {
        let (transport, _in, _out) = MockTransport::pair();
        let clients = BackendClients::default();

        let err = ChatSession::new(
            &BridgeConfig::default(),
            &clients,
            TextStrategy::Streaming,
            false,
            Arc::clone(&transport) as Arc<dyn UserTransport>,
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, SessionError::StreamingUnavailable));

        let clients = BackendClients {
            http: Some(Arc::new(MockHttpChat::new())),
            ..BackendClients::default()
        };
        let err = ChatSession::new(
            &BridgeConfig::default(),
            &clients,
            TextStrategy::Http,
            true,
            transport,
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, SessionError::SpeechWithoutStreaming));
    }

    #[test]
    fn event_strategy_with_speech_still_streams_user_audio() {
        let (transport, _in, _out) = MockTransport::pair();
        let clients = BackendClients {
            streaming: Some(Arc::new(MockStreamingBackend::new())),
            event_log: Some(Arc::new(MemoryEventLog::new())),
            http: None,
        };
        let session = ChatSession::new(
            &BridgeConfig::default(),
            &clients,
            TextStrategy::Event,
            true,
            Arc::clone(&transport) as Arc<dyn UserTransport>,
            None,
        )
        .unwrap();
        let names: Vec<_> = session.tasks.iter().map(|t| t.name()).collect();
        assert!(names.contains(&"speech-stream"));
        // The log already carries bot-speech transcripts.
        assert!(!names.contains(&"transcription"));

        let clients = BackendClients {
            event_log: Some(Arc::new(MemoryEventLog::new())),
            ..BackendClients::default()
        };
        let err = ChatSession::new(
            &BridgeConfig::default(),
            &clients,
            TextStrategy::Event,
            true,
            transport,
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, SessionError::SpeechWithoutStreaming));
    }

    #[tokio::test(start_paused = true)]
    async fn capability_notice_precedes_everything_else() {
        let (session, bus, _halves) = speech_session();
        let mut rx = bus.subscribe();
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn({
            let session = Arc::clone(&session);
            let shutdown = shutdown.clone();
            async move { session.run(shutdown).await }
        });

        let event = recv_matching(&mut rx, |e| {
            matches!(e, BusEvent::ConfigChanged { .. })
        })
        .await;
        assert!(matches!(
            event,
            BusEvent::ConfigChanged { speech_supported: true }
        ));

        shutdown.cancel();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn mode_toggle_starts_and_stops_tasks_by_declared_modes() {
        let (session, bus, _halves) = speech_session();
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn({
            let session = Arc::clone(&session);
            let shutdown = shutdown.clone();
            async move { session.run(shutdown).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let running = session.running_task_names();
        assert!(running.contains(&"transport-bridge"));
        assert!(running.contains(&"http-chat"));
        assert!(!running.contains(&"speech-stream"));
        assert!(!running.contains(&"transcription"));

        bus.publish(BusEvent::UserToggledSpeech {
            mode: InteractionMode::Speech,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let running = session.running_task_names();
        assert!(running.contains(&"transport-bridge"));
        assert!(!running.contains(&"http-chat"));
        assert!(running.contains(&"speech-stream"));
        assert!(running.contains(&"transcription"));

        bus.publish(BusEvent::UserToggledSpeech {
            mode: InteractionMode::Text,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let running = session.running_task_names();
        assert!(running.contains(&"http-chat"));
        assert!(!running.contains(&"speech-stream"));

        shutdown.cancel();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_closes_with_a_notice() {
        let (session, bus, _halves) = speech_session();
        let mut rx = bus.subscribe();
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn({
            let session = Arc::clone(&session);
            let shutdown = shutdown.clone();
            async move { session.run(shutdown).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.publish(BusEvent::FatalError {
            task: "http-chat",
            message: "backend gone".to_string(),
        });
        let event = recv_matching(&mut rx, |e| matches!(e, BusEvent::Shutdown { .. })).await;
        assert!(matches!(
            event,
            BusEvent::Shutdown { reason } if reason == "backend gone"
        ));

        runner.await.unwrap();
        assert!(session.running_task_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_transport_unwinds_silently() {
        let (session, bus, _halves) = speech_session();
        let shutdown = CancellationToken::new();
        let runner = tokio::spawn({
            let session = Arc::clone(&session);
            let shutdown = shutdown.clone();
            async move { session.run(shutdown).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.publish(BusEvent::UserClosedSocket);
        runner.await.unwrap();
        assert!(session.running_task_names().is_empty());
    }
}
