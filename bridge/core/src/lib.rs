//! Bridge Core - Session Orchestration for the Chat-Bridge UI Server
//!
//! This crate contains the engine that mediates one live conversational
//! session between a user-facing message transport (a WebSocket carrying
//! JSON text frames and raw audio frames) and a remote conversational
//! backend reachable over one of three transports: a bidirectional
//! streaming RPC pipeline, a durable append-only event log, or a plain
//! HTTP request/response service with polling.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        User Transport                         │
//! │            (WebSocket: JSON text frames / audio)              │
//! └───────────────────────────┬──────────────────────────────────┘
//!                             │
//! ┌───────────────────────────┼──────────────────────────────────┐
//! │                      CHAT SESSION                             │
//! │  ┌────────────────────────┴───────────────────────────────┐  │
//! │  │                 Transport Bridge Task                   │  │
//! │  └────────────────────────┬───────────────────────────────┘  │
//! │                      Session Bus                              │
//! │  ┌──────────────┐  ┌─────┴────────┐  ┌───────────────────┐   │
//! │  │ Speech Tasks │  │  Text Relay  │  │    Supervisor     │   │
//! │  │ (stream/asr) │  │ (one of 3)   │  │ (modes, shutdown) │   │
//! │  └──────┬───────┘  └──────┬───────┘  └───────────────────┘   │
//! └─────────┼─────────────────┼──────────────────────────────────┘
//!           │                 │
//!     Streaming RPC    RPC / event log / HTTP
//! ```
//!
//! # Key Types
//!
//! - [`ChatSession`]: owns the task set and the bus, drives the session
//! - [`SessionBus`]: session-scoped publish/subscribe channel
//! - [`SessionTask`]: the start/stop/cleanup contract every task follows
//! - [`ChatMessage`]: the JSON envelope spoken over the user transport
//! - [`BackendClients`]: injected backend client handles
//!
//! Tasks never hold references to each other; all coordination flows over
//! the bus, and the supervisor is the only component that starts or stops
//! tasks.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod actions;
pub mod bus;
pub mod clients;
pub mod config;
pub mod gesture;
pub mod messages;
pub mod session;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

pub use bus::{BusEvent, SessionBus};
pub use clients::http::{BotStatus, ChatFragment, ChatReply, HttpChat, HttpChatClient};
pub use clients::log::{EventLog, LogRecord, RedisEventLog};
pub use clients::streaming::{
    AudioFrame, GrpcStreamingBackend, SpeechResult, StreamingBackend,
};
pub use clients::BackendError;
pub use config::BridgeConfig;
pub use gesture::{GestureLookup, GestureSymbol};
pub use messages::{Author, ChatContent, ChatMessage, InteractionMode};
pub use session::{BackendClients, ChatSession, SessionError, SessionId, TextStrategy};
pub use tasks::{RunState, SessionTask, TaskError};
pub use tasks::transport::{TransportError, TransportFrame, UserTransport};
