//! Streaming-RPC Text Task
//!
//! One-shot text turns over the streaming backend: each submitted user
//! message becomes one chat call, the streamed fragments are accumulated,
//! and a single bot utterance is published when the turn completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, SessionBus};
use crate::clients::streaming::StreamingBackend;
use crate::messages::InteractionMode;
use crate::tasks::{spawn_run, RunState, SessionTask, TaskError};

/// Relays text turns over the streaming RPC backend.
pub struct StreamingTextTask {
    bus: SessionBus,
    backend: Arc<dyn StreamingBackend>,
    session_id: String,
    pipeline_acquired: AtomicBool,
    run: RunState,
}

impl StreamingTextTask {
    /// Create the relay for one session.
    #[must_use]
    pub fn new(bus: SessionBus, backend: Arc<dyn StreamingBackend>, session_id: String) -> Self {
        Self {
            bus,
            backend,
            session_id,
            pipeline_acquired: AtomicBool::new(false),
            run: RunState::default(),
        }
    }

    async fn relay_turns(
        &self,
        mut rx: broadcast::Receiver<BusEvent>,
    ) -> Result<(), TaskError> {
        loop {
            let (text, _bot_name) = match rx.recv().await {
                Ok(BusEvent::UserFinishedMessage { text, bot_name, .. }) => (text, bot_name),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "text relay lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            };

            let query_id = Uuid::new_v4().to_string();
            let mut fragments = self
                .backend
                .chat(&self.session_id, &query_id, &text)
                .await?;
            let mut answer = String::new();
            while let Some(fragment) = fragments.next().await {
                answer.push_str(&fragment?);
            }
            debug!(query_id = %query_id, "turn complete");
            self.bus.publish(BusEvent::BotUtterance {
                message_id: query_id,
                text: answer,
                bot_name: None,
            });
        }
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        rx: broadcast::Receiver<BusEvent>,
    ) -> Result<(), TaskError> {
        if !self.pipeline_acquired.swap(true, Ordering::SeqCst) {
            self.backend.create_pipeline(&self.session_id).await?;
        }
        tokio::select! {
            () = cancel.cancelled() => Err(TaskError::Cancelled),
            result = self.relay_turns(rx) => result,
        }
    }
}

#[async_trait]
impl SessionTask for StreamingTextTask {
    fn name(&self) -> &'static str {
        "streaming-text"
    }

    fn modes(&self) -> &'static [InteractionMode] {
        &[InteractionMode::Text]
    }

    fn run_state(&self) -> &RunState {
        &self.run
    }

    fn start(self: Arc<Self>) {
        let cancel = self.run.begin();
        let rx = self.bus.subscribe();
        let bus = self.bus.clone();
        let task = Arc::clone(&self);
        spawn_run(bus, self.name(), async move { task.run(cancel, rx).await });
    }

    async fn cleanup(&self) -> Result<(), TaskError> {
        if self.pipeline_acquired.load(Ordering::SeqCst) {
            self.backend.free_pipeline(&self.session_id).await?;
        }
        Ok(())
    }
}
