//! Event-Log Action Protocol
//!
//! Flat representation of the action events exchanged over the durable
//! event log: bot utterances, timers, postures, gestures, user speech
//! lifecycle, and pipeline acquisition.
//!
//! # Design Philosophy
//!
//! The protocol defines a deep taxonomy of action classes; here it is one
//! struct with optional payload fields plus factory constructors per
//! action kind. Dispatch happens on the `type` string, and every field a
//! given kind does not use stays `None` and is omitted on the wire. The
//! `action_info_modality_policy` tag (parallel/override/replace/skip)
//! describes how the *backend* reconciles concurrent actions of one
//! modality; this crate produces and parses it but never enforces it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Action `type` tags understood by the event-log task.
pub mod kind {
    /// Backend asks us to start a timer.
    pub const START_TIMER: &str = "StartTimerBotAction";
    /// Backend asks us to cancel a running timer.
    pub const STOP_TIMER: &str = "StopTimerBotAction";
    /// Our acknowledgement that a timer started.
    pub const TIMER_STARTED: &str = "TimerBotActionStarted";
    /// Our acknowledgement that a timer finished.
    pub const TIMER_FINISHED: &str = "TimerBotActionFinished";
    /// Backend asks the avatar to assume a posture.
    pub const START_POSTURE: &str = "StartPostureBotAction";
    /// Backend asks the avatar to drop the posture.
    pub const STOP_POSTURE: &str = "StopPostureBotAction";
    /// Posture acknowledgement (started).
    pub const POSTURE_STARTED: &str = "PostureBotActionStarted";
    /// Posture acknowledgement (finished).
    pub const POSTURE_FINISHED: &str = "PostureBotActionFinished";
    /// Backend asks the avatar to perform a gesture.
    pub const START_GESTURE: &str = "StartGestureBotAction";
    /// Gesture acknowledgement (started).
    pub const GESTURE_STARTED: &str = "GestureBotActionStarted";
    /// Gesture acknowledgement (finished).
    pub const GESTURE_FINISHED: &str = "GestureBotActionFinished";
    /// Backend starts speaking.
    pub const START_UTTERANCE: &str = "StartUtteranceBotAction";
    /// Backend stops speaking (user barge-in).
    pub const STOP_UTTERANCE: &str = "StopUtteranceBotAction";
    /// Bot utterance acknowledgement (started).
    pub const UTTERANCE_STARTED: &str = "UtteranceBotActionStarted";
    /// Bot utterance acknowledgement (finished).
    pub const UTTERANCE_FINISHED: &str = "UtteranceBotActionFinished";
    /// The user started speaking or typing.
    pub const USER_UTTERANCE_STARTED: &str = "UtteranceUserActionStarted";
    /// The user's in-progress transcript changed.
    pub const USER_TRANSCRIPT_UPDATED: &str = "UtteranceUserActionTranscriptUpdated";
    /// The user finished speaking or typing.
    pub const USER_UTTERANCE_FINISHED: &str = "UtteranceUserActionFinished";
    /// A session's pipeline came up.
    pub const PIPELINE_ACQUIRED: &str = "PipelineAcquired";
    /// A session's pipeline went away.
    pub const PIPELINE_RELEASED: &str = "PipelineReleased";
}

/// One action event on the log, flattened: unused payload fields are
/// `None` and omitted from the serialized form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    /// Action kind tag; see [`kind`].
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unique identifier of this event.
    pub uid: String,
    /// Identity of the producer, used for self-echo suppression.
    pub source_uid: String,
    /// When the producer created the event.
    pub event_created_at: DateTime<Utc>,

    /// Identifier tying lifecycle events of one action together.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_uid: Option<String>,
    /// Modality of the action (`bot_speech`, `time`, `bot_posture`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_info_modality: Option<String>,
    /// How the backend reconciles concurrent actions of this modality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_info_modality_policy: Option<String>,
    /// When the action actually started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_started_at: Option<DateTime<Utc>>,
    /// When the action actually finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_finished_at: Option<DateTime<Utc>>,
    /// Whether the action completed successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_success: Option<bool>,

    /// Timer duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Requested posture, e.g. `"Thinking, idle"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posture: Option<String>,
    /// Requested gesture name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gesture: Option<String>,
    /// Text of a bot utterance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// In-progress user transcript.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interim_transcript: Option<String>,
    /// Final user transcript.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_transcript: Option<String>,
    /// Session stream this event belongs to (pipeline lifecycle only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_uid: Option<String>,
}

impl ActionEvent {
    fn base(event_type: &str, source: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            uid: Uuid::new_v4().to_string(),
            source_uid: source.to_string(),
            event_created_at: Utc::now(),
            action_uid: None,
            action_info_modality: None,
            action_info_modality_policy: None,
            action_started_at: None,
            action_finished_at: None,
            is_success: None,
            duration: None,
            posture: None,
            gesture: None,
            script: None,
            interim_transcript: None,
            final_transcript: None,
            stream_uid: None,
        }
    }

    fn with_modality(mut self, modality: &str, policy: &str) -> Self {
        self.action_info_modality = Some(modality.to_string());
        self.action_info_modality_policy = Some(policy.to_string());
        self
    }

    fn started_now(mut self) -> Self {
        self.action_started_at = Some(Utc::now());
        self
    }

    fn finished_now(mut self) -> Self {
        self.action_finished_at = Some(Utc::now());
        self.is_success = Some(true);
        self
    }

    /// Acknowledge a timer start.
    #[must_use]
    pub fn timer_started(source: &str, action_uid: &str) -> Self {
        let mut ev = Self::base(kind::TIMER_STARTED, source)
            .with_modality("time", "parallel")
            .started_now();
        ev.action_uid = Some(action_uid.to_string());
        ev
    }

    /// Acknowledge a timer completion.
    #[must_use]
    pub fn timer_finished(source: &str, action_uid: &str) -> Self {
        let mut ev = Self::base(kind::TIMER_FINISHED, source)
            .with_modality("time", "parallel")
            .finished_now();
        ev.action_uid = Some(action_uid.to_string());
        ev
    }

    /// Acknowledge a posture start.
    #[must_use]
    pub fn posture_started(source: &str, action_uid: &str) -> Self {
        let mut ev = Self::base(kind::POSTURE_STARTED, source)
            .with_modality("bot_posture", "override")
            .started_now();
        ev.action_uid = Some(action_uid.to_string());
        ev
    }

    /// Acknowledge a posture end.
    #[must_use]
    pub fn posture_finished(source: &str, action_uid: &str) -> Self {
        let mut ev = Self::base(kind::POSTURE_FINISHED, source)
            .with_modality("bot_posture", "override")
            .finished_now();
        ev.action_uid = Some(action_uid.to_string());
        ev
    }

    /// Acknowledge a gesture start.
    #[must_use]
    pub fn gesture_started(source: &str, action_uid: &str) -> Self {
        let mut ev = Self::base(kind::GESTURE_STARTED, source)
            .with_modality("bot_gesture", "override")
            .started_now();
        ev.action_uid = Some(action_uid.to_string());
        ev
    }

    /// Acknowledge a gesture completion.
    #[must_use]
    pub fn gesture_finished(source: &str, action_uid: &str) -> Self {
        let mut ev = Self::base(kind::GESTURE_FINISHED, source)
            .with_modality("bot_gesture", "override")
            .finished_now();
        ev.action_uid = Some(action_uid.to_string());
        ev
    }

    /// Acknowledge a bot utterance start.
    #[must_use]
    pub fn utterance_started(source: &str, action_uid: &str) -> Self {
        let mut ev = Self::base(kind::UTTERANCE_STARTED, source)
            .with_modality("bot_speech", "replace")
            .started_now();
        ev.action_uid = Some(action_uid.to_string());
        ev
    }

    /// Acknowledge a bot utterance completion.
    #[must_use]
    pub fn utterance_finished(source: &str, action_uid: &str) -> Self {
        let mut ev = Self::base(kind::UTTERANCE_FINISHED, source)
            .with_modality("bot_speech", "replace")
            .finished_now();
        ev.action_uid = Some(action_uid.to_string());
        ev
    }

    /// The user started composing an utterance.
    #[must_use]
    pub fn user_utterance_started(source: &str, action_uid: &str) -> Self {
        let mut ev = Self::base(kind::USER_UTTERANCE_STARTED, source)
            .with_modality("user_speech", "replace")
            .started_now();
        ev.action_uid = Some(action_uid.to_string());
        ev
    }

    /// The user's in-progress utterance changed.
    #[must_use]
    pub fn user_transcript_updated(source: &str, action_uid: &str, transcript: &str) -> Self {
        let mut ev = Self::base(kind::USER_TRANSCRIPT_UPDATED, source)
            .with_modality("user_speech", "replace");
        ev.action_uid = Some(action_uid.to_string());
        ev.interim_transcript = Some(transcript.to_string());
        ev
    }

    /// The user finished an utterance.
    #[must_use]
    pub fn user_utterance_finished(source: &str, action_uid: &str, transcript: &str) -> Self {
        let mut ev = Self::base(kind::USER_UTTERANCE_FINISHED, source)
            .with_modality("user_speech", "replace")
            .finished_now();
        ev.action_uid = Some(action_uid.to_string());
        ev.final_transcript = Some(transcript.to_string());
        ev
    }

    /// Announce that a session's pipeline came up.
    #[must_use]
    pub fn pipeline_acquired(source: &str, stream_uid: &str) -> Self {
        let mut ev = Self::base(kind::PIPELINE_ACQUIRED, source);
        ev.stream_uid = Some(stream_uid.to_string());
        ev
    }

    /// Announce that a session's pipeline went away.
    #[must_use]
    pub fn pipeline_released(source: &str, stream_uid: &str) -> Self {
        let mut ev = Self::base(kind::PIPELINE_RELEASED, source);
        ev.stream_uid = Some(stream_uid.to_string());
        ev
    }

    /// Seconds remaining until this timer event is due, measured against
    /// its declared creation time rather than receipt time, clamped to
    /// zero for timers already overdue.
    #[must_use]
    pub fn timer_remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        let duration = self.duration.unwrap_or(0.0);
        let due = self.event_created_at
            + chrono::Duration::milliseconds((duration * 1000.0) as i64);
        (due - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}
