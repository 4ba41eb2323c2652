//! HTTP Polling Text Task
//!
//! Text turns over the plain request/response backend. Two loops share
//! the run-cycle token: a roster poll that publishes the ready-bot list
//! whenever it changes, and a submission loop that turns each finished
//! user message into one `POST /chat`.
//!
//! Connection-level roster faults are retried against a fixed budget
//! that refills after every success; anything past the budget, and any
//! non-200 chat response, is fatal for the session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, SessionBus};
use crate::clients::http::{ChatReply, HttpChat};
use crate::clients::BackendError;
use crate::messages::InteractionMode;
use crate::tasks::{spawn_run, RunState, SessionTask, TaskError};

/// Transient roster faults tolerated before escalating.
const MAX_RETRIES: u32 = 3;

/// Delay between roster polls.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Relays text turns over the HTTP backend.
pub struct HttpChatTask {
    bus: SessionBus,
    client: Arc<dyn HttpChat>,
    session_id: String,
    run: RunState,
}

impl HttpChatTask {
    /// Create the relay for one session.
    #[must_use]
    pub fn new(bus: SessionBus, client: Arc<dyn HttpChat>, session_id: String) -> Self {
        Self {
            bus,
            client,
            session_id,
            run: RunState::default(),
        }
    }

    /// Poll bot availability, publishing the roster only when it changes.
    async fn poll_roster(&self) -> Result<(), TaskError> {
        let mut retries = MAX_RETRIES;
        let mut last_roster: Option<Vec<String>> = None;
        loop {
            match self.client.ready_bots().await {
                Ok(bots) => {
                    retries = MAX_RETRIES;
                    let roster: Vec<String> = bots
                        .into_iter()
                        .filter(|bot| bot.ready)
                        .map(|bot| bot.bot_name)
                        .collect();
                    if last_roster.as_ref() != Some(&roster) {
                        self.bus.publish(BusEvent::BotRosterUpdated {
                            bots: roster.clone(),
                        });
                        last_roster = Some(roster);
                    }
                }
                Err(BackendError::Transient(reason)) if retries > 0 => {
                    retries -= 1;
                    warn!(reason, retries_left = retries, "roster poll failed; retrying");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Turn finished user messages into chat requests.
    async fn relay_turns(
        &self,
        mut rx: broadcast::Receiver<BusEvent>,
    ) -> Result<(), TaskError> {
        loop {
            let (text, bot_name) = match rx.recv().await {
                Ok(BusEvent::UserFinishedMessage { text, bot_name, .. }) => (text, bot_name),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "chat relay lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            };

            self.bus.publish(BusEvent::BotThinking {
                message_id: Uuid::new_v4().to_string(),
            });

            let reply = self
                .client
                .chat(&self.session_id, &text, bot_name.as_deref())
                .await?;
            match reply {
                ChatReply::Rejected { status } => {
                    return Err(TaskError::Fatal(format!(
                        "chat endpoint answered with status {status}"
                    )));
                }
                ChatReply::Single(fragment) => {
                    self.bus.publish(BusEvent::BotUtterance {
                        message_id: fragment.metadata.query_id,
                        text: fragment.response.cleaned_text,
                        bot_name,
                    });
                }
                ChatReply::Chunked(mut fragments) => {
                    let mut answer = String::new();
                    let mut query_id = String::new();
                    while let Some(fragment) = fragments.next().await {
                        let fragment = fragment?;
                        answer.push_str(&fragment.response.cleaned_text);
                        if !fragment.metadata.query_id.is_empty() {
                            query_id = fragment.metadata.query_id;
                        }
                    }
                    debug!(query_id = %query_id, "chunked turn complete");
                    self.bus.publish(BusEvent::BotUtterance {
                        message_id: query_id,
                        text: answer,
                        bot_name,
                    });
                }
            }
        }
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        rx: broadcast::Receiver<BusEvent>,
    ) -> Result<(), TaskError> {
        tokio::select! {
            () = cancel.cancelled() => Err(TaskError::Cancelled),
            result = self.poll_roster() => result,
            result = self.relay_turns(rx) => result,
        }
    }
}

#[async_trait]
impl SessionTask for HttpChatTask {
    fn name(&self) -> &'static str {
        "http-chat"
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
}
