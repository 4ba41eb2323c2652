//! User Transport Wire Messages
//!
//! The JSON envelope exchanged with the browser UI over the WebSocket.
//! Binary frames carry raw audio and never touch these types; every text
//! frame is one [`ChatMessage`].
//!
//! # Design Philosophy
//!
//! The envelope is deliberately dumb: `{author, content}` where `content`
//! is a tagged union. The UI renders what it is told and echoes user input
//! back in the same shape. Successive ASR messages sharing a `messageID`
//! update one on-screen utterance in place; a new `messageID` appends a
//! new one.

use serde::{Deserialize, Serialize};

/// Who a chat message is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Author {
    /// A backend bot.
    Bot,
    /// The connected user.
    User,
    /// The bridge itself (roster updates, shutdown notices, ...).
    System,
}

/// The session's interaction mode. Tasks declare which modes they
/// support; the supervisor starts and stops them as the mode changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionMode {
    /// Typed text turns.
    Text,
    /// Microphone audio with streaming transcription.
    Speech,
}

/// Tagged message payloads. Field names follow the wire protocol the web
/// client speaks, hence the camel-case renames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatContent {
    /// A completed text utterance.
    #[serde(rename = "TEXT")]
    Text {
        /// Stable identifier for the on-screen message.
        #[serde(rename = "messageID")]
        message_id: String,
        /// The utterance text.
        text: String,
        /// Addressed bot (user → server) or originating bot (server → user).
        #[serde(rename = "botName")]
        bot_name: Option<String>,
    },

    /// A gesture rendered as an emoji.
    #[serde(rename = "EMOJI")]
    Emoji {
        /// Stable identifier for the on-screen message.
        #[serde(rename = "messageID")]
        message_id: String,
        /// The emoji glyph.
        emoji: String,
        /// Human-readable gesture title.
        title: String,
        /// Originating bot, if known.
        #[serde(rename = "botName")]
        bot_name: Option<String>,
    },

    /// A typing indicator / in-progress draft.
    #[serde(rename = "TYPING")]
    Typing {
        /// Stable identifier for the draft being typed.
        #[serde(rename = "messageID")]
        message_id: String,
        /// Draft text so far (may be empty).
        text: String,
        /// True exactly when this starts a new draft.
        #[serde(rename = "isNewMessage")]
        is_new_message: bool,
    },

    /// A (possibly partial) speech-recognition result.
    #[serde(rename = "ASR")]
    Asr {
        /// Recognized text so far.
        transcript: String,
        /// Identifier shared by all partials of one utterance.
        #[serde(rename = "messageID")]
        message_id: String,
    },

    /// The current list of ready bots.
    #[serde(rename = "BOT_LIST")]
    BotList {
        /// Names of bots currently able to answer.
        #[serde(rename = "botList")]
        bot_list: Vec<String>,
    },

    /// The user interrupted the bot mid-utterance.
    #[serde(rename = "USER_BARGE_IN")]
    UserBargeIn {},

    /// Server capability announcement.
    #[serde(rename = "CONFIG_CHANGE")]
    ConfigChange {
        /// Whether this session can switch to speech mode.
        #[serde(rename = "speechSupported")]
        speech_supported: bool,
    },

    /// The session is going away.
    #[serde(rename = "SHUTDOWN")]
    Shutdown {
        /// Human-readable reason.
        reason: String,
    },

    /// The user toggled between text and speech mode.
    #[serde(rename = "TOGGLE_SPEECH")]
    ToggleSpeech {
        /// The mode the session should now be in.
        #[serde(rename = "interactionMode")]
        interaction_mode: InteractionMode,
    },
}

/// One text frame on the user transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message attribution.
    pub author: Author,
    /// Tagged payload.
    pub content: ChatContent,
}

impl ChatMessage {
    /// Build a bot-authored message.
    #[must_use]
    pub fn bot(content: ChatContent) -> Self {
        Self {
            author: Author::Bot,
            content,
        }
    }

    /// Build a user-authored message.
    #[must_use]
    pub fn user(content: ChatContent) -> Self {
        Self {
            author: Author::User,
            content,
        }
    }

    /// Build a system message.
    #[must_use]
    pub fn system(content: ChatContent) -> Self {
        Self {
            author: Author::System,
            content,
        }
    }
}
