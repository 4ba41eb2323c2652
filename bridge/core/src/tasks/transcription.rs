//! Speech Transcription Task
//!
//! Consumes the streaming backend's transcription feed. Finalized display
//! text becomes a complete bot utterance with a fresh identifier;
//! recognition updates for the user's speech share a running counter
//! identifier so the UI updates one utterance in place, and the counter
//! advances only when the backend marks a result final.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{BusEvent, SessionBus};
use crate::clients::streaming::{SpeechResult, StreamingBackend};
use crate::messages::InteractionMode;
use crate::tasks::{spawn_run, RunState, SessionTask, TaskError};

/// Relays the transcription feed onto the session bus.
pub struct TranscriptionTask {
    bus: SessionBus,
    backend: Arc<dyn StreamingBackend>,
    session_id: String,
    message_counter: AtomicU64,
    run: RunState,
}

impl TranscriptionTask {
    /// Create the consumer for one session.
    #[must_use]
    pub fn new(bus: SessionBus, backend: Arc<dyn StreamingBackend>, session_id: String) -> Self {
        Self {
            bus,
            backend,
            session_id,
            message_counter: AtomicU64::new(0),
            run: RunState::default(),
        }
    }

    async fn consume_feed(&self) -> Result<(), TaskError> {
        loop {
            let mut feed = self.backend.transcribe(&self.session_id).await?;
            while let Some(result) = feed.next().await {
                match result? {
                    SpeechResult::Display(text) => {
                        self.bus.publish(BusEvent::BotUtterance {
                            message_id: Uuid::new_v4().to_string(),
                            text,
                            bot_name: None,
                        });
                    }
                    SpeechResult::Interim {
                        transcript,
                        is_final,
                    } => {
                        let message_id =
                            self.message_counter.load(Ordering::SeqCst).to_string();
                        self.bus.publish(BusEvent::AsrAvailable {
                            transcript,
                            message_id,
                        });
                        if is_final {
                            self.message_counter.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            }
            debug!("transcription feed ended; reopening");
        }
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), TaskError> {
        tokio::select! {
            () = cancel.cancelled() => Err(TaskError::Cancelled),
            result = self.consume_feed() => result,
        }
    }
}

#[async_trait]
impl SessionTask for TranscriptionTask {
    fn name(&self) -> &'static str {
        "transcription"
    }

    fn modes(&self) -> &'static [InteractionMode] {
        &[InteractionMode::Speech]
    }

    fn run_state(&self) -> &RunState {
        &self.run
    }

    fn start(self: Arc<Self>) {
        let cancel = self.run.begin();
        let bus = self.bus.clone();
        let task = Arc::clone(&self);
        spawn_run(bus, self.name(), async move { task.run(cancel).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStreamingBackend;

    #[tokio::test]
    async fn partials_share_an_identifier_until_final() {
        let backend = Arc::new(MockStreamingBackend::new());
        backend.push_transcripts(vec![
            SpeechResult::Interim {
                transcript: "hel".to_string(),
                is_final: false,
            },
            SpeechResult::Interim {
                transcript: "hello".to_string(),
                is_final: true,
            },
            SpeechResult::Interim {
                transcript: "wor".to_string(),
                is_final: false,
            },
        ]);

        let bus = SessionBus::new();
        let mut rx = bus.subscribe();
        let task = Arc::new(TranscriptionTask::new(
            bus.clone(),
            backend,
            "sess-1".to_string(),
        ));
        Arc::clone(&task).start();

        let mut ids = Vec::new();
        while ids.len() < 3 {
            if let BusEvent::AsrAvailable { message_id, .. } = rx.recv().await.unwrap() {
                ids.push(message_id);
            }
        }
        assert_eq!(ids, vec!["0", "0", "1"]);
    }

    #[tokio::test]
    async fn display_text_becomes_a_bot_utterance() {
        let backend = Arc::new(MockStreamingBackend::new());
        backend.push_transcripts(vec![SpeechResult::Display("All done.".to_string())]);

        let bus = SessionBus::new();
        let mut rx = bus.subscribe();
        let task = Arc::new(TranscriptionTask::new(
            bus.clone(),
            backend,
            "sess-1".to_string(),
        ));
        Arc::clone(&task).start();

        loop {
            if let BusEvent::BotUtterance { text, bot_name, .. } = rx.recv().await.unwrap() {
                assert_eq!(text, "All done.");
                assert_eq!(bot_name, None);
                break;
            }
        }
    }
}
