//! Session Tasks
//!
//! The cancellable, restartable units of work a session is made of. Each
//! task owns one concern (bridging the transport, relaying text turns,
//! streaming audio, ...) and talks to the others only over the session
//! bus.
//!
//! # Design Philosophy
//!
//! Tasks implement the [`SessionTask`] capability contract instead of
//! inheriting from a base class: `start()` installs a fresh cancellation
//! token and spawns the run loop, `stop()` cancels the token, and
//! `cleanup()` runs exactly once after the final stop to release external
//! resources. The token is scoped to one run cycle, so a task can be
//! stopped and restarted as the interaction mode flips without losing
//! state that must outlive a cycle (pipeline flags, queues, counters,
//! cursors all live on the task struct itself).

pub mod event_log;
pub mod speech;
pub mod text_http;
pub mod text_streaming;
pub mod transcription;
pub mod transport;

use std::future::Future;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::bus::{BusEvent, SessionBus};
use crate::clients::BackendError;
use crate::messages::InteractionMode;

/// Why a task's run loop ended.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The run cycle's cancellation token fired. Normal shutdown, never
    /// surfaced to the user.
    #[error("cancelled")]
    Cancelled,
    /// A backend client call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// Any other unrecoverable condition.
    #[error("{0}")]
    Fatal(String),
}

impl TaskError {
    /// Whether this is cooperative cancellation rather than a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Run-cycle bookkeeping shared by every task: a cancellation token that
/// is replaced on each `start()` and fired on `stop()`.
#[derive(Debug, Default)]
pub struct RunState {
    token: Mutex<Option<CancellationToken>>,
}

impl RunState {
    /// Install a fresh token for a new run cycle and return it.
    pub fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.token.lock().unwrap() = Some(token.clone());
        token
    }

    /// Fire the current token, if any. Idempotent; calling with no run
    /// in progress is a no-op.
    pub fn stop(&self) {
        if let Some(token) = self.token.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    /// Whether a run cycle is in progress: a token exists and has not
    /// fired.
    pub fn is_running(&self) -> bool {
        self.token
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}

/// The contract every session task follows.
#[async_trait]
pub trait SessionTask: Send + Sync {
    /// Stable task name used in logs and fatal-error events.
    fn name(&self) -> &'static str;

    /// Interaction modes this task runs in. The supervisor starts the
    /// task when the session enters one of these modes and stops it when
    /// the session leaves them.
    fn modes(&self) -> &'static [InteractionMode];

    /// The task's run-cycle bookkeeping.
    fn run_state(&self) -> &RunState;

    /// Begin a new run cycle: reset cancellation and spawn the work
    /// loop. The loop must observe the token at every suspension point.
    fn start(self: std::sync::Arc<Self>);

    /// Signal the current run cycle to unwind. Idempotent.
    fn stop(&self) {
        self.run_state().stop();
    }

    /// Whether a run cycle is currently in progress.
    fn is_running(&self) -> bool {
        self.run_state().is_running()
    }

    /// Whether this task runs in the given mode.
    fn supports(&self, mode: InteractionMode) -> bool {
        self.modes().contains(&mode)
    }

    /// Release externally-acquired resources. Called exactly once, after
    /// the final stop; never followed by another `start()`.
    async fn cleanup(&self) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Spawn a task's run future and route its outcome: cancellation is
/// silent, anything else is logged and published as a fatal-error event
/// for the supervisor to act on.
pub(crate) fn spawn_run<F>(bus: SessionBus, name: &'static str, fut: F)
where
    F: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => debug!(task = name, "run loop ended"),
            Err(err) if err.is_cancelled() => debug!(task = name, "stopped"),
            Err(err) => {
                error!(task = name, error = %err, "task failed");
                bus.publish(BusEvent::FatalError {
                    task: name,
                    message: err.to_string(),
                });
            }
        }
    });
}
