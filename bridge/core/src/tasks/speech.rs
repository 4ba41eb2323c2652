//! Speech Streaming Task
//!
//! Bidirectional audio relay between the session bus and the streaming
//! backend. Three loops share one run-cycle cancellation token:
//! a receive loop republishing synthesized audio, an enqueue loop
//! buffering user microphone chunks, and a drain loop feeding the
//! buffered chunks into the backend's upload stream.
//!
//! The remote pipeline is acquired at most once, before the first run
//! cycle; mode toggles stop and restart the loops without touching the
//! pipeline, which is released only in `cleanup()`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{BusEvent, SessionBus};
use crate::clients::streaming::{AudioFrame, StreamingBackend};
use crate::messages::InteractionMode;
use crate::tasks::{spawn_run, RunState, SessionTask, TaskError};

/// How long the drain loop idles when the queue is empty.
const DRAIN_IDLE: Duration = Duration::from_millis(5);

/// Relays audio between the session and the streaming backend.
pub struct SpeechStreamTask {
    bus: SessionBus,
    backend: Arc<dyn StreamingBackend>,
    session_id: String,
    sample_rate: u32,
    queue: Mutex<VecDeque<Bytes>>,
    pipeline_acquired: AtomicBool,
    run: RunState,
}

impl SpeechStreamTask {
    /// Create the relay for one session.
    #[must_use]
    pub fn new(
        bus: SessionBus,
        backend: Arc<dyn StreamingBackend>,
        session_id: String,
        sample_rate: u32,
    ) -> Self {
        Self {
            bus,
            backend,
            session_id,
            sample_rate,
            queue: Mutex::new(VecDeque::new()),
            pipeline_acquired: AtomicBool::new(false),
            run: RunState::default(),
        }
    }

    /// Open the synthesized-audio feed and republish every chunk. If the
    /// feed completes while the task is still running, it is reopened.
    async fn pump_inbound(&self) -> Result<(), TaskError> {
        loop {
            let mut feed = self.backend.receive_audio(&self.session_id).await?;
            while let Some(chunk) = feed.next().await {
                self.bus.publish(BusEvent::BotAudioChunk(chunk?));
            }
            debug!("audio feed ended; reopening");
        }
    }

    /// Append user audio from the bus to the upload queue.
    async fn enqueue_user_audio(
        &self,
        mut rx: broadcast::Receiver<BusEvent>,
    ) -> Result<(), TaskError> {
        loop {
            match rx.recv().await {
                Ok(BusEvent::UserAudioChunk(chunk)) => {
                    self.queue.lock().unwrap().push_back(chunk);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "audio enqueue lagged; chunks lost");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Drive the upload stream: one configuration record first, then
    /// queued chunks as they appear. Reopens the call if the backend
    /// completes it while the task is still running.
    async fn drain_outbound(&self) -> Result<(), TaskError> {
        loop {
            let (tx, rx) = mpsc::channel::<AudioFrame>(64);
            let upload = self.backend.send_audio(ReceiverStream::new(rx).boxed());
            let feed = async {
                let config = AudioFrame::Config {
                    channels: 1,
                    sample_rate: self.sample_rate,
                };
                if tx.send(config).await.is_err() {
                    return;
                }
                loop {
                    let chunk = self.queue.lock().unwrap().pop_front();
                    match chunk {
                        Some(chunk) => {
                            if tx.send(AudioFrame::Chunk(chunk)).await.is_err() {
                                return;
                            }
                        }
                        None => tokio::time::sleep(DRAIN_IDLE).await,
                    }
                }
            };
            tokio::select! {
                result = upload => {
                    result?;
                    debug!("audio upload ended; reopening");
                }
                () = feed => {}
            }
        }
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        rx: broadcast::Receiver<BusEvent>,
    ) -> Result<(), TaskError> {
        // Acquired once for the task's whole lifetime, not per run cycle.
        if !self.pipeline_acquired.swap(true, Ordering::SeqCst) {
            self.backend.create_pipeline(&self.session_id).await?;
        }
        tokio::select! {
            () = cancel.cancelled() => Err(TaskError::Cancelled),
            result = self.pump_inbound() => result,
            result = self.enqueue_user_audio(rx) => result,
            result = self.drain_outbound() => result,
        }
    }
}

#[async_trait]
impl SessionTask for SpeechStreamTask {
    fn name(&self) -> &'static str {
        "speech-stream"
    }

    fn modes(&self) -> &'static [InteractionMode] {
        &[InteractionMode::Speech]
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
