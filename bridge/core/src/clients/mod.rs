//! Backend Clients
//!
//! Client handles for the three backend transports. Tasks depend on the
//! traits defined here ([`StreamingBackend`](streaming::StreamingBackend),
//! [`EventLog`](log::EventLog), [`HttpChat`](http::HttpChat)); the
//! concrete implementations are constructed once at server startup and
//! injected into each session, with availability checked at session
//! construction rather than hidden behind lazily-built globals.

pub mod http;
pub mod log;
pub mod streaming;

use thiserror::Error;

/// Errors surfaced by backend clients.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connection-level fault that may succeed on retry (reset, refused,
    /// timeout). Only the HTTP roster poll actually retries these.
    #[error("connection failed: {0}")]
    Transient(String),
    /// The backend answered but the call failed.
    #[error("backend call failed: {0}")]
    Failed(String),
    /// The backend is not reachable at all.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}
