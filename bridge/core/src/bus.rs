//! Session Event Bus
//!
//! Private publish/subscribe channel scoped to one session. Every task
//! talks to every other task exclusively through this bus; no task holds
//! a reference to another task.
//!
//! # Design Philosophy
//!
//! One broadcast channel carrying a tagged [`BusEvent`] union rather than
//! one channel per event kind. The single channel gives FIFO ordering per
//! kind for free (it is FIFO across all kinds), and subscribers simply
//! skip variants they do not care about. A subscriber that is not
//! receiving when an event fires misses it; there is no replay.

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::messages::InteractionMode;

/// Buffer depth of the bus. Audio chunks dominate the traffic; a lagging
/// subscriber loses oldest events first and is told how many it missed.
const BUS_CAPACITY: usize = 256;

/// Everything that can happen inside a session.
#[derive(Clone, Debug)]
pub enum BusEvent {
    /// Raw microphone audio from the user transport.
    UserAudioChunk(Bytes),
    /// The user started typing a new message.
    UserStartedMessage {
        /// Client-chosen draft identifier.
        message_id: String,
        /// Draft text so far.
        text: String,
    },
    /// The user edited the draft.
    UserUpdatedMessage {
        /// Client-chosen draft identifier.
        message_id: String,
        /// Draft text so far.
        text: String,
    },
    /// The user submitted a message.
    UserFinishedMessage {
        /// Client-chosen message identifier.
        message_id: String,
        /// Final text.
        text: String,
        /// Bot the message is addressed to, if any.
        bot_name: Option<String>,
    },
    /// The user switched interaction mode.
    UserToggledSpeech {
        /// The new mode.
        mode: InteractionMode,
    },
    /// The set of ready bots changed.
    BotRosterUpdated {
        /// Names of ready bots, in backend order.
        bots: Vec<String>,
    },
    /// A bot produced a complete utterance.
    BotUtterance {
        /// Message identifier for the UI.
        message_id: String,
        /// Utterance text.
        text: String,
        /// Originating bot, if known.
        bot_name: Option<String>,
    },
    /// A bot started thinking; the UI shows a typing indicator.
    BotThinking {
        /// Message identifier for the indicator.
        message_id: String,
    },
    /// A bot performed a gesture.
    BotGesture {
        /// Gesture name, resolved to an emoji by the transport bridge.
        gesture: String,
    },
    /// Synthesized bot audio to play back.
    BotAudioChunk(Bytes),
    /// A speech-recognition result is available.
    AsrAvailable {
        /// Recognized text so far.
        transcript: String,
        /// Identifier shared by partials of one utterance.
        message_id: String,
    },
    /// The user interrupted the bot.
    UserBargeIn,
    /// Session capability announcement.
    ConfigChanged {
        /// Whether speech mode is available.
        speech_supported: bool,
    },
    /// The session is shutting down; the bridge relays this to the user.
    Shutdown {
        /// Human-readable reason.
        reason: String,
    },
    /// The user transport closed.
    UserClosedSocket,
    /// A task hit an unrecoverable error; the supervisor tears the
    /// session down.
    FatalError {
        /// Name of the failing task.
        task: &'static str,
        /// What went wrong.
        message: String,
    },
}

/// Cloneable handle to a session's bus.
#[derive(Clone, Debug)]
pub struct SessionBus {
    tx: broadcast::Sender<BusEvent>,
}

impl SessionBus {
    /// Create a fresh bus for a new session.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers. Publishing with no
    /// subscribers is not an error; the event is simply dropped.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = SessionBus::new();
        let mut rx = bus.subscribe();
        bus.publish(BusEvent::UserBargeIn);
        bus.publish(BusEvent::BotThinking {
            message_id: "1".to_string(),
        });

        assert!(matches!(rx.recv().await.unwrap(), BusEvent::UserBargeIn));
        assert!(matches!(
            rx.recv().await.unwrap(),
            BusEvent::BotThinking { .. }
        ));
    }

    #[tokio::test]
    async fn late_subscribers_do_not_see_earlier_events() {
        let bus = SessionBus::new();
        // Keep one receiver alive so the channel has somewhere to go.
        let _early = bus.subscribe();
        bus.publish(BusEvent::UserBargeIn);

        let mut late = bus.subscribe();
        bus.publish(BusEvent::UserClosedSocket);
        assert!(matches!(
            late.recv().await.unwrap(),
            BusEvent::UserClosedSocket
        ));
    }
}
