//! Log-Based Text/Action Task
//!
//! Bidirectional bridge between the session bus and the durable event
//! log. One direction tails the session's log channel in bounded
//! blocking batches and dispatches each entry by type: action requests
//! (timers, postures, gestures, bot utterances) are acknowledged with
//! started/finished reply entries and, where relevant, raised as local
//! bus events. The other direction subscribes to the user's
//! typing/submit lifecycle on the bus and appends the matching
//! user-utterance entries to the same channel.
//!
//! Entries this task wrote itself come back on the next read; they are
//! recognized by their source identity and skipped. The task spans both
//! interaction modes, so mode toggles never stop it; they only flip an
//! internal flag that gates the utterance-start acknowledgements (in
//! speech mode those are the streaming backend's responsibility).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::actions::{kind, ActionEvent};
use crate::bus::{BusEvent, SessionBus};
use crate::clients::log::EventLog;
use crate::messages::InteractionMode;
use crate::tasks::{spawn_run, RunState, SessionTask, TaskError};

/// Entries fetched per read call.
const READ_BATCH: usize = 20;

/// Upper bound on one blocking read; keeps stop requests observable even
/// on a quiet channel.
const READ_BLOCK: Duration = Duration::from_secs(1);

/// Cursor value meaning "start of the log".
const LOG_START: &str = "0";

/// Bridges the durable event log onto the session bus and back.
pub struct EventLogTask {
    bus: SessionBus,
    log: Arc<dyn EventLog>,
    session_channel: String,
    system_stream: String,
    source_name: String,
    cursor: Mutex<String>,
    speech_mode: AtomicBool,
    pipeline_acquired: AtomicBool,
    run: RunState,
}

impl EventLogTask {
    /// Create the bridge for one session.
    #[must_use]
    pub fn new(
        bus: SessionBus,
        log: Arc<dyn EventLog>,
        session_channel: String,
        system_stream: String,
        source_name: String,
    ) -> Self {
        Self {
            bus,
            log,
            session_channel,
            system_stream,
            source_name,
            cursor: Mutex::new(LOG_START.to_string()),
            speech_mode: AtomicBool::new(false),
            pipeline_acquired: AtomicBool::new(false),
            run: RunState::default(),
        }
    }

    /// Tail the session channel and dispatch foreign entries.
    async fn consume_log(&self, cancel: &CancellationToken) -> Result<(), TaskError> {
        loop {
            let cursor = self.cursor.lock().unwrap().clone();
            let batch = self
                .log
                .read(&self.session_channel, &cursor, READ_BATCH, READ_BLOCK)
                .await?;
            for record in batch {
                *self.cursor.lock().unwrap() = record.id.clone();
                let event: ActionEvent = match serde_json::from_str(&record.payload) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(error = %err, id = %record.id, "skipping malformed log entry");
                        continue;
                    }
                };
                if event.source_uid == self.source_name {
                    continue;
                }
                self.dispatch(event, cancel).await;
            }
        }
    }

    /// Handle one foreign entry: raise bus events and append replies.
    async fn dispatch(&self, event: ActionEvent, cancel: &CancellationToken) {
        let action_uid = event
            .action_uid
            .clone()
            .unwrap_or_else(|| event.uid.clone());
        match event.event_type.as_str() {
            kind::START_TIMER => {
                self.append_reply(ActionEvent::timer_started(&self.source_name, &action_uid))
                    .await;
                self.schedule_timer_finish(event, action_uid, cancel);
            }
            kind::STOP_TIMER => {
                self.append_reply(ActionEvent::timer_finished(&self.source_name, &action_uid))
                    .await;
            }
            kind::START_POSTURE => {
                // Only the idle thinking posture surfaces as a typing
                // indicator; other postures stay animation-only.
                if event.posture.as_deref() == Some("Thinking, idle") {
                    self.bus.publish(BusEvent::BotThinking {
                        message_id: Uuid::new_v4().to_string(),
                    });
                }
                self.append_reply(ActionEvent::posture_started(&self.source_name, &action_uid))
                    .await;
            }
            kind::STOP_POSTURE => {
                self.append_reply(ActionEvent::posture_finished(
                    &self.source_name,
                    &action_uid,
                ))
                .await;
            }
            kind::START_GESTURE => {
                if let Some(gesture) = event.gesture.clone() {
                    self.bus.publish(BusEvent::BotGesture { gesture });
                }
                self.append_reply(ActionEvent::gesture_started(&self.source_name, &action_uid))
                    .await;
                self.append_reply(ActionEvent::gesture_finished(
                    &self.source_name,
                    &action_uid,
                ))
                .await;
            }
            kind::START_UTTERANCE => {
                self.bus.publish(BusEvent::BotUtterance {
                    message_id: action_uid.clone(),
                    text: event.script.clone().unwrap_or_default(),
                    bot_name: None,
                });
                // In speech mode the streaming backend acknowledges the
                // utterance lifecycle; acknowledging here too would
                // double-report it.
                if !self.speech_mode.load(Ordering::SeqCst) {
                    self.append_reply(ActionEvent::utterance_started(
                        &self.source_name,
                        &action_uid,
                    ))
                    .await;
                    self.append_reply(ActionEvent::utterance_finished(
                        &self.source_name,
                        &action_uid,
                    ))
                    .await;
                }
            }
            kind::STOP_UTTERANCE => {
                self.bus.publish(BusEvent::UserBargeIn);
            }
            kind::USER_TRANSCRIPT_UPDATED => {
                self.bus.publish(BusEvent::AsrAvailable {
                    transcript: event.interim_transcript.clone().unwrap_or_default(),
                    message_id: action_uid,
                });
            }
            kind::USER_UTTERANCE_FINISHED => {
                let transcript = event.final_transcript.clone().unwrap_or_default();
                if !transcript.is_empty() {
                    self.bus.publish(BusEvent::AsrAvailable {
                        transcript,
                        message_id: action_uid,
                    });
                }
            }
            other => debug!(kind = other, "ignoring log entry"),
        }
    }

    /// Emit the timer's finished reply once its remaining duration has
    /// elapsed, measured from the event's declared creation time. Runs on
    /// a child token so a pending timer neither blocks the poll loop nor
    /// outlives the run cycle.
    fn schedule_timer_finish(
        &self,
        event: ActionEvent,
        action_uid: String,
        cancel: &CancellationToken,
    ) {
        let remaining = event.timer_remaining(Utc::now());
        let child = cancel.child_token();
        let log = Arc::clone(&self.log);
        let channel = self.session_channel.clone();
        let source = self.source_name.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = child.cancelled() => {}
                () = tokio::time::sleep(remaining) => {
                    let reply = ActionEvent::timer_finished(&source, &action_uid);
                    if let Err(err) = append_json(log.as_ref(), &channel, &reply).await {
                        warn!(error = %err, "failed to append timer reply");
                    }
                }
            }
        });
    }

    /// Forward the user's typing/submit lifecycle into the log, and track
    /// mode toggles.
    async fn forward_user_events(
        &self,
        mut rx: broadcast::Receiver<BusEvent>,
    ) -> Result<(), TaskError> {
        loop {
            match rx.recv().await {
                Ok(BusEvent::UserStartedMessage { message_id, .. }) => {
                    self.append_reply(ActionEvent::user_utterance_started(
                        &self.source_name,
                        &message_id,
                    ))
                    .await;
                }
                Ok(BusEvent::UserUpdatedMessage { message_id, text }) => {
                    self.append_reply(ActionEvent::user_transcript_updated(
                        &self.source_name,
                        &message_id,
                        &text,
                    ))
                    .await;
                }
                Ok(BusEvent::UserFinishedMessage {
                    message_id, text, ..
                }) => {
                    self.append_reply(ActionEvent::user_utterance_finished(
                        &self.source_name,
                        &message_id,
                        &text,
                    ))
                    .await;
                }
                Ok(BusEvent::UserToggledSpeech { mode }) => {
                    self.speech_mode
                        .store(mode == InteractionMode::Speech, Ordering::SeqCst);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "log forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Append one reply entry to the session channel. A failed append is
    /// logged and dropped; a missing acknowledgement must not take the
    /// whole session down.
    async fn append_reply(&self, reply: ActionEvent) {
        if let Err(err) = append_json(self.log.as_ref(), &self.session_channel, &reply).await {
            warn!(error = %err, kind = %reply.event_type, "failed to append reply");
        }
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        rx: broadcast::Receiver<BusEvent>,
    ) -> Result<(), TaskError> {
        // Announced once for the task's whole lifetime, not per run cycle.
        if !self.pipeline_acquired.swap(true, Ordering::SeqCst) {
            let announce =
                ActionEvent::pipeline_acquired(&self.source_name, &self.session_channel);
            append_json(self.log.as_ref(), &self.system_stream, &announce).await?;
        }
        tokio::select! {
            () = cancel.cancelled() => Err(TaskError::Cancelled),
            result = self.consume_log(&cancel) => result,
            result = self.forward_user_events(rx) => result,
        }
    }
}

async fn append_json(
    log: &dyn EventLog,
    stream: &str,
    event: &ActionEvent,
) -> Result<(), TaskError> {
    let payload = serde_json::to_string(event)
        .map_err(|e| TaskError::Fatal(format!("unserializable action event: {e}")))?;
    log.append(stream, &payload).await?;
    Ok(())
}

#[async_trait]
impl SessionTask for EventLogTask {
    fn name(&self) -> &'static str {
        "event-log"
    }

    fn modes(&self) -> &'static [InteractionMode] {
        &[InteractionMode::Text, InteractionMode::Speech]
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
            let farewell =
                ActionEvent::pipeline_released(&self.source_name, &self.session_channel);
            append_json(self.log.as_ref(), &self.system_stream, &farewell).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{recv_matching, MemoryEventLog};

    const CHANNEL: &str = "events_sess-1";
    const SYSTEM: &str = "system_events";
    const SOURCE: &str = "bridge-ui";

    fn started_task(log: Arc<MemoryEventLog>) -> (SessionBus, Arc<EventLogTask>) {
        let bus = SessionBus::new();
        let task = Arc::new(EventLogTask::new(
            bus.clone(),
            log,
            CHANNEL.to_string(),
            SYSTEM.to_string(),
            SOURCE.to_string(),
        ));
        Arc::clone(&task).start();
        (bus, task)
    }

    async fn push(log: &MemoryEventLog, stream: &str, event: &ActionEvent) {
        log.append(stream, &serde_json::to_string(event).unwrap())
            .await
            .unwrap();
    }

    fn foreign(kind: &str) -> ActionEvent {
        let mut event = ActionEvent::pipeline_acquired("planner", "ignored");
        event.event_type = kind.to_string();
        event.stream_uid = None;
        event
    }

    async fn wait_for_kinds(log: &MemoryEventLog, stream: &str, wanted: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let found = log
                    .entries(stream)
                    .iter()
                    .filter(|r| r.payload.contains(wanted))
                    .count();
                if found >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {count} {wanted}"));
    }

    #[tokio::test(start_paused = true)]
    async fn self_produced_entries_are_never_dispatched() {
        let log = Arc::new(MemoryEventLog::new());
        let (bus, _task) = started_task(Arc::clone(&log));
        let mut rx = bus.subscribe();

        // An entry carrying our own source identity must be skipped even
        // though its type has a handler.
        let mut echo = foreign(kind::START_UTTERANCE);
        echo.source_uid = SOURCE.to_string();
        echo.script = Some("echo".to_string());
        push(&log, CHANNEL, &echo).await;

        let mut real = foreign(kind::START_UTTERANCE);
        real.script = Some("real".to_string());
        push(&log, CHANNEL, &real).await;

        let event =
            recv_matching(&mut rx, |e| matches!(e, BusEvent::BotUtterance { .. })).await;
        let BusEvent::BotUtterance { text, .. } = event else {
            unreachable!()
        };
        assert_eq!(text, "real");
    }

    #[tokio::test(start_paused = true)]
    async fn timer_finishes_after_remaining_not_full_duration() {
        let log = Arc::new(MemoryEventLog::new());
        let (_bus, _task) = started_task(Arc::clone(&log));

        // Created one second ago with a two-second duration: the finished
        // reply is due roughly one second from receipt.
        let mut timer = foreign(kind::START_TIMER);
        timer.duration = Some(2.0);
        timer.event_created_at = Utc::now() - chrono::Duration::seconds(1);
        let begin = tokio::time::Instant::now();
        push(&log, CHANNEL, &timer).await;

        wait_for_kinds(&log, CHANNEL, kind::TIMER_FINISHED, 1).await;
        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_millis(900), "fired too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1900), "fired too late: {elapsed:?}");

        // The immediate started acknowledgement is there too.
        wait_for_kinds(&log, CHANNEL, kind::TIMER_STARTED, 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn utterance_replies_depend_on_interaction_mode() {
        let log = Arc::new(MemoryEventLog::new());
        let (bus, _task) = started_task(Arc::clone(&log));
        let mut rx = bus.subscribe();

        // TEXT mode: utterance raises a bus event and both replies.
        let mut first = foreign(kind::START_UTTERANCE);
        first.script = Some("in text mode".to_string());
        push(&log, CHANNEL, &first).await;
        recv_matching(&mut rx, |e| matches!(e, BusEvent::BotUtterance { .. })).await;
        wait_for_kinds(&log, CHANNEL, kind::UTTERANCE_STARTED, 1).await;
        wait_for_kinds(&log, CHANNEL, kind::UTTERANCE_FINISHED, 1).await;

        // SPEECH mode: the bus event still fires but no replies appear.
        bus.publish(BusEvent::UserToggledSpeech {
            mode: InteractionMode::Speech,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = foreign(kind::START_UTTERANCE);
        second.script = Some("in speech mode".to_string());
        push(&log, CHANNEL, &second).await;
        recv_matching(&mut rx, |e| matches!(e, BusEvent::BotUtterance { .. })).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let started = log
            .entries(CHANNEL)
            .iter()
            .filter(|r| r.payload.contains(kind::UTTERANCE_STARTED))
            .count();
        assert_eq!(started, 1, "speech-mode utterance must not be acknowledged");
    }

    #[tokio::test(start_paused = true)]
    async fn posture_gesture_and_barge_in_handlers() {
        let log = Arc::new(MemoryEventLog::new());
        let (bus, _task) = started_task(Arc::clone(&log));
        let mut rx = bus.subscribe();

        let mut posture = foreign(kind::START_POSTURE);
        posture.posture = Some("Thinking, idle".to_string());
        push(&log, CHANNEL, &posture).await;
        recv_matching(&mut rx, |e| matches!(e, BusEvent::BotThinking { .. })).await;
        wait_for_kinds(&log, CHANNEL, kind::POSTURE_STARTED, 1).await;

        let mut gesture = foreign(kind::START_GESTURE);
        gesture.gesture = Some("Wave".to_string());
        push(&log, CHANNEL, &gesture).await;
        let event = recv_matching(&mut rx, |e| matches!(e, BusEvent::BotGesture { .. })).await;
        assert!(matches!(event, BusEvent::BotGesture { gesture } if gesture == "Wave"));
        wait_for_kinds(&log, CHANNEL, kind::GESTURE_FINISHED, 1).await;

        // Other thinking postures are acknowledged but raise no typing
        // indicator; the barge-in pushed behind one proves it was skipped.
        let mut talking = foreign(kind::START_POSTURE);
        talking.posture = Some("Thinking, talking".to_string());
        push(&log, CHANNEL, &talking).await;
        push(&log, CHANNEL, &foreign(kind::STOP_UTTERANCE)).await;
        let event = recv_matching(&mut rx, |e| {
            matches!(e, BusEvent::BotThinking { .. } | BusEvent::UserBargeIn)
        })
        .await;
        assert!(matches!(event, BusEvent::UserBargeIn));
        wait_for_kinds(&log, CHANNEL, kind::POSTURE_STARTED, 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn user_transcripts_surface_as_asr_events() {
        let log = Arc::new(MemoryEventLog::new());
        let (bus, _task) = started_task(Arc::clone(&log));
        let mut rx = bus.subscribe();

        let mut update = foreign(kind::USER_TRANSCRIPT_UPDATED);
        update.interim_transcript = Some("hel".to_string());
        push(&log, CHANNEL, &update).await;
        let event =
            recv_matching(&mut rx, |e| matches!(e, BusEvent::AsrAvailable { .. })).await;
        assert!(matches!(
            event,
            BusEvent::AsrAvailable { transcript, .. } if transcript == "hel"
        ));

        // Finished with an empty transcript raises nothing; a barge-in
        // pushed behind it proves the empty one was skipped.
        let mut empty = foreign(kind::USER_UTTERANCE_FINISHED);
        empty.final_transcript = Some(String::new());
        push(&log, CHANNEL, &empty).await;
        push(&log, CHANNEL, &foreign(kind::STOP_UTTERANCE)).await;
        let event = recv_matching(&mut rx, |e| {
            matches!(e, BusEvent::AsrAvailable { .. } | BusEvent::UserBargeIn)
        })
        .await;
        assert!(matches!(event, BusEvent::UserBargeIn));
    }

    #[tokio::test(start_paused = true)]
    async fn user_lifecycle_is_forwarded_to_the_log() {
        let log = Arc::new(MemoryEventLog::new());
        let (bus, _task) = started_task(Arc::clone(&log));

        bus.publish(BusEvent::UserStartedMessage {
            message_id: "d1".to_string(),
            text: "h".to_string(),
        });
        bus.publish(BusEvent::UserUpdatedMessage {
            message_id: "d1".to_string(),
            text: "hi".to_string(),
        });
        bus.publish(BusEvent::UserFinishedMessage {
            message_id: "d1".to_string(),
            text: "hi!".to_string(),
            bot_name: None,
        });

        wait_for_kinds(&log, CHANNEL, kind::USER_UTTERANCE_STARTED, 1).await;
        wait_for_kinds(&log, CHANNEL, kind::USER_TRANSCRIPT_UPDATED, 1).await;
        wait_for_kinds(&log, CHANNEL, kind::USER_UTTERANCE_FINISHED, 1).await;

        let finished = log
            .entries(CHANNEL)
            .iter()
            .find_map(|r| {
                let event: ActionEvent = serde_json::from_str(&r.payload).ok()?;
                (event.event_type == kind::USER_UTTERANCE_FINISHED).then_some(event)
            })
            .unwrap();
        assert_eq!(finished.final_transcript.as_deref(), Some("hi!"));
        assert_eq!(finished.source_uid, SOURCE);
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_lifecycle_is_announced_once() {
        let log = Arc::new(MemoryEventLog::new());
        let (_bus, task) = started_task(Arc::clone(&log));

        wait_for_kinds(&log, SYSTEM, kind::PIPELINE_ACQUIRED, 1).await;

        // Restart cycles never re-announce.
        task.stop();
        Arc::clone(&task).start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let acquired = log
            .entries(SYSTEM)
            .iter()
            .filter(|r| r.payload.contains(kind::PIPELINE_ACQUIRED))
            .count();
        assert_eq!(acquired, 1);

        task.stop();
        task.cleanup().await.unwrap();
        wait_for_kinds(&log, SYSTEM, kind::PIPELINE_RELEASED, 1).await;
    }
}
