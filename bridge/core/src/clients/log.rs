//! Durable Event-Log Backend
//!
//! Append-only stream log used by the event-driven text strategy. The
//! bridge reads a per-session channel in bounded, blocking batches and
//! appends its own entries to the same channel (plus pipeline lifecycle
//! entries to a system-wide stream). Each entry stores one JSON document
//! under a single `event` field.

use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use super::BackendError;

/// One entry read from a log stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    /// Monotonic entry identifier; feed the last one back as the cursor.
    pub id: String,
    /// The JSON document stored under the `event` field.
    pub payload: String,
}

/// The append-only log as tasks see it.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Read up to `count` entries after `cursor`, waiting at most `block`
    /// for new ones. An empty result after the full block is normal.
    async fn read(
        &self,
        stream: &str,
        cursor: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>, BackendError>;

    /// Append one JSON payload; returns the new entry's identifier.
    async fn append(&self, stream: &str, payload: &str) -> Result<String, BackendError>;
}

/// Production [`EventLog`] over Redis streams (`XREAD`/`XADD`).
#[derive(Clone)]
pub struct RedisEventLog {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisEventLog {
    /// Connect to the log backend at `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client =
            redis::Client::open(url).map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn read(
        &self,
        stream: &str,
        cursor: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>, BackendError> {
        let options = StreamReadOptions::default()
            .count(count)
            .block(usize::try_from(block.as_millis()).unwrap_or(1000));
        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[cursor], &options)
            .await
            .map_err(|e| BackendError::Failed(e.to_string()))?;

        let mut records = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let payload: String = entry.get("event").unwrap_or_default();
                records.push(LogRecord {
                    id: entry.id.clone(),
                    payload,
                });
            }
        }
        Ok(records)
    }

    async fn append(&self, stream: &str, payload: &str) -> Result<String, BackendError> {
        let mut conn = self.conn.clone();
        conn.xadd(stream, "*", &[("event", payload)])
            .await
            .map_err(|e| BackendError::Failed(e.to_string()))
    }
}
