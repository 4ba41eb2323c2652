//! Shared test doubles: channel-backed transports, scripted backends,
//! and an in-memory event log. Production code never touches this
//! module.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, Notify};

use crate::bus::BusEvent;
use crate::clients::http::{BotStatus, ChatFragment, ChatReply, HttpChat};
use crate::clients::log::{EventLog, LogRecord};
use crate::clients::streaming::{AudioFrame, SpeechResult, StreamingBackend};
use crate::clients::BackendError;
use crate::gesture::{GestureLookup, GestureSymbol};
use crate::tasks::transport::{TransportError, TransportFrame, UserTransport};

/// Receive bus events until one satisfies `pred`, returning it. Panics
/// if the bus closes first.
pub(crate) async fn recv_matching(
    rx: &mut broadcast::Receiver<BusEvent>,
    pred: impl Fn(&BusEvent) -> bool,
) -> BusEvent {
    loop {
        let event = rx.recv().await.expect("bus closed while waiting");
        if pred(&event) {
            return event;
        }
    }
}

/// Channel-backed [`UserTransport`]: the test feeds inbound frames
/// through one channel and observes outbound frames on another.
pub(crate) struct MockTransport {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportFrame>>,
    outbound: mpsc::UnboundedSender<TransportFrame>,
}

impl MockTransport {
    /// The transport plus the test's ends of both channels. Dropping the
    /// inbound sender closes the transport.
    pub(crate) fn pair() -> (
        Arc<Self>,
        mpsc::UnboundedSender<TransportFrame>,
        mpsc::UnboundedReceiver<TransportFrame>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            inbound: tokio::sync::Mutex::new(inbound_rx),
            outbound: outbound_tx,
        });
        (transport, inbound_tx, outbound_rx)
    }
}

#[async_trait]
impl UserTransport for MockTransport {
    async fn send(&self, frame: TransportFrame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Option<TransportFrame>, TransportError> {
        // Only the bridge task polls the receiver; the lock is never
        // contended.
        let mut rx = self.inbound.lock().await;
        Ok(rx.recv().await)
    }
}

/// Fixed-table [`GestureLookup`].
pub(crate) struct MockGestures {
    table: HashMap<String, GestureSymbol>,
}

impl MockGestures {
    pub(crate) fn with_entry(name: &str, symbol: GestureSymbol) -> Arc<dyn GestureLookup> {
        let mut table = HashMap::new();
        table.insert(name.to_string(), symbol);
        Arc::new(Self { table })
    }

    pub(crate) fn empty() -> Arc<dyn GestureLookup> {
        Arc::new(Self {
            table: HashMap::new(),
        })
    }
}

#[async_trait]
impl GestureLookup for MockGestures {
    async fn find(&self, gesture: &str) -> Option<GestureSymbol> {
        self.table.get(gesture).cloned()
    }
}

/// Scripted [`StreamingBackend`]: uploads are captured for inspection,
/// downloads replay pre-loaded data and then stay open forever, like a
/// live backend with nothing more to say.
pub(crate) struct MockStreamingBackend {
    upload_tx: mpsc::UnboundedSender<AudioFrame>,
    upload_rx: Mutex<Option<mpsc::UnboundedReceiver<AudioFrame>>>,
    bot_audio: Mutex<Vec<Bytes>>,
    transcripts: Mutex<Vec<SpeechResult>>,
    chat_fragments: Mutex<Vec<String>>,
    chat_failure: Mutex<Option<String>>,
    created: AtomicUsize,
    freed: AtomicUsize,
}

impl MockStreamingBackend {
    pub(crate) fn new() -> Self {
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();
        Self {
            upload_tx,
            upload_rx: Mutex::new(Some(upload_rx)),
            bot_audio: Mutex::new(Vec::new()),
            transcripts: Mutex::new(Vec::new()),
            chat_fragments: Mutex::new(Vec::new()),
            chat_failure: Mutex::new(None),
            created: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        }
    }

    /// Take the receiver capturing every uploaded audio frame.
    pub(crate) fn take_upload_frames(&self) -> mpsc::UnboundedReceiver<AudioFrame> {
        self.upload_rx
            .lock()
            .unwrap()
            .take()
            .expect("upload frames already taken")
    }

    /// Queue one synthesized-audio chunk for the download feed.
    pub(crate) fn push_bot_audio(&self, chunk: Bytes) {
        self.bot_audio.lock().unwrap().push(chunk);
    }

    /// Queue transcription results for the transcript feed.
    pub(crate) fn push_transcripts(&self, results: Vec<SpeechResult>) {
        self.transcripts.lock().unwrap().extend(results);
    }

    /// Queue the fragments the next chat call streams back.
    pub(crate) fn push_chat_fragments(&self, fragments: Vec<String>) {
        self.chat_fragments.lock().unwrap().extend(fragments);
    }

    /// Make the next chat call fail outright.
    pub(crate) fn fail_next_chat(&self, message: &str) {
        *self.chat_failure.lock().unwrap() = Some(message.to_string());
    }

    pub(crate) fn pipelines_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn pipelines_freed(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamingBackend for MockStreamingBackend {
    async fn create_pipeline(&self, _stream_id: &str) -> Result<(), BackendError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn free_pipeline(&self, _stream_id: &str) -> Result<(), BackendError> {
        self.freed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn receive_audio(
        &self,
        _stream_id: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, BackendError>>, BackendError> {
        let scripted: Vec<_> = self.bot_audio.lock().unwrap().drain(..).collect();
        Ok(futures::stream::iter(scripted.into_iter().map(Ok))
            .chain(futures::stream::pending())
            .boxed())
    }

    async fn send_audio(
        &self,
        mut frames: BoxStream<'static, AudioFrame>,
    ) -> Result<(), BackendError> {
        while let Some(frame) = frames.next().await {
            let _ = self.upload_tx.send(frame);
        }
        Ok(())
    }

    async fn chat(
        &self,
        _stream_id: &str,
        _query_id: &str,
        _query: &str,
    ) -> Result<BoxStream<'static, Result<String, BackendError>>, BackendError> {
        if let Some(message) = self.chat_failure.lock().unwrap().take() {
            return Err(BackendError::Failed(message));
        }
        let scripted: Vec<_> = self.chat_fragments.lock().unwrap().drain(..).collect();
        Ok(futures::stream::iter(scripted.into_iter().map(Ok)).boxed())
    }

    async fn transcribe(
        &self,
        _stream_id: &str,
    ) -> Result<BoxStream<'static, Result<SpeechResult, BackendError>>, BackendError> {
        let scripted: Vec<_> = self.transcripts.lock().unwrap().drain(..).collect();
        Ok(futures::stream::iter(scripted.into_iter().map(Ok))
            .chain(futures::stream::pending())
            .boxed())
    }
}

/// One scripted outcome for a roster poll.
pub(crate) enum RosterStep {
    /// The poll succeeds with this availability list.
    Ok(Vec<BotStatus>),
    /// The poll fails with a transient error.
    Transient,
}

/// Scripted [`HttpChat`]: polls and chat calls consume queued outcomes;
/// an exhausted queue leaves the caller waiting, like a quiet backend.
pub(crate) struct MockHttpChat {
    roster: Mutex<VecDeque<RosterStep>>,
    replies: Mutex<VecDeque<ChatReply>>,
}

impl MockHttpChat {
    pub(crate) fn new() -> Self {
        Self {
            roster: Mutex::new(VecDeque::new()),
            replies: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push_roster(&self, step: RosterStep) {
        self.roster.lock().unwrap().push_back(step);
    }

    pub(crate) fn push_chat_reply(&self, reply: ChatReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub(crate) fn push_chunked_reply(&self, fragments: Vec<ChatFragment>) {
        let stream = futures::stream::iter(fragments.into_iter().map(Ok)).boxed();
        self.push_chat_reply(ChatReply::Chunked(stream));
    }
}

#[async_trait]
impl HttpChat for MockHttpChat {
    async fn ready_bots(&self) -> Result<Vec<BotStatus>, BackendError> {
        let step = self.roster.lock().unwrap().pop_front();
        match step {
            Some(RosterStep::Ok(bots)) => Ok(bots),
            Some(RosterStep::Transient) => {
                Err(BackendError::Transient("connection refused".to_string()))
            }
            None => futures::future::pending().await,
        }
    }

    async fn chat(
        &self,
        _user_id: &str,
        _query: &str,
        _bot_name: Option<&str>,
    ) -> Result<ChatReply, BackendError> {
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(reply) => Ok(reply),
            None => futures::future::pending().await,
        }
    }
}

/// In-memory [`EventLog`] with stream semantics: monotonically numbered
/// entries, cursor-relative reads, and blocking reads that wake on
/// append.
pub(crate) struct MemoryEventLog {
    streams: Mutex<HashMap<String, Vec<LogRecord>>>,
    seq: AtomicU64,
    appended: Notify,
}

impl MemoryEventLog {
    pub(crate) fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            appended: Notify::new(),
        }
    }

    /// Everything appended to `stream` so far.
    pub(crate) fn entries(&self, stream: &str) -> Vec<LogRecord> {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    fn after(&self, stream: &str, cursor: u64, count: usize) -> Vec<LogRecord> {
        self.entries(stream)
            .into_iter()
            .filter(|record| entry_seq(&record.id) > cursor)
            .take(count)
            .collect()
    }
}

fn entry_seq(id: &str) -> u64 {
    id.split('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn read(
        &self,
        stream: &str,
        cursor: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>, BackendError> {
        let cursor = entry_seq(cursor);
        // Arm the wakeup before checking so an append between the check
        // and the wait is not lost.
        let woken = self.appended.notified();
        let found = self.after(stream, cursor, count);
        if !found.is_empty() {
            return Ok(found);
        }
        if tokio::time::timeout(block, woken).await.is_err() {
            return Ok(Vec::new());
        }
        Ok(self.after(stream, cursor, count))
    }

    async fn append(&self, stream: &str, payload: &str) -> Result<String, BackendError> {
        let id = format!("{}-0", self.seq.fetch_add(1, Ordering::SeqCst) + 1);
        self.streams
            .lock()
            .unwrap()
            .entry(stream.to_string())
            .or_default()
            .push(LogRecord {
                id: id.clone(),
                payload: payload.to_string(),
            });
        self.appended.notify_waiters();
        Ok(id)
    }
}
