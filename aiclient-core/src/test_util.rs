//! In-memory transport and handler doubles for driving event sources in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use tokio::time::Instant;

use crate::error::StreamError;
use crate::event_source::{ByteStream, EventHandler, StreamRequest, StreamTransport};
use crate::sse::SseMessage;

/// What one `open()` call produces.
pub enum Script {
    Fail(StreamError),
    /// `open()` never resolves.
    Stall,
    Body {
        chunks: Vec<String>,
        end: BodyEnd,
    },
}

pub enum BodyEnd {
    /// Clean end of body.
    Close,
    /// Keep the connection open with no further data.
    Hang,
    Fail(StreamError),
}

impl Script {
    pub fn body(chunks: &[&str]) -> Self {
        Self::with_end(chunks, BodyEnd::Close)
    }

    pub fn hanging(chunks: &[&str]) -> Self {
        Self::with_end(chunks, BodyEnd::Hang)
    }

    pub fn body_then_fail(chunks: &[&str], error: StreamError) -> Self {
        Self::with_end(chunks, BodyEnd::Fail(error))
    }

    fn with_end(chunks: &[&str], end: BodyEnd) -> Self {
        Self::Body {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            end,
        }
    }
}

/// Counts dropped response bodies.
struct TeardownGuard(Arc<AtomicUsize>);

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    opens: Mutex<Vec<(Instant, StreamRequest)>>,
    teardowns: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            opens: Mutex::new(Vec::new()),
            teardowns: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.opens.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, StreamError> {
        self.opens
            .lock()
            .unwrap()
            .push((Instant::now(), request.clone()));
        let script = self.scripts.lock().unwrap().pop_front();
        let (chunks, end) = match script {
            None => return Err(StreamError::Connect("script exhausted".into())),
            Some(Script::Fail(err)) => return Err(err),
            Some(Script::Stall) => std::future::pending().await,
            Some(Script::Body { chunks, end }) => (chunks, end),
        };
        let data = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, StreamError>(Bytes::from(c))),
        );
        let body: ByteStream = match end {
            BodyEnd::Close => Box::pin(data),
            BodyEnd::Hang => Box::pin(data.chain(stream::pending())),
            BodyEnd::Fail(err) => Box::pin(data.chain(stream::iter([Err(err)]))),
        };
        let guard = TeardownGuard(Arc::clone(&self.teardowns));
        Ok(Box::pin(body.map(move |item| {
            let _alive = &guard;
            item
        })))
    }
}

/// Records handler callbacks as strings; finishes on `[DONE]`.
#[derive(Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn handler(&self) -> Box<dyn EventHandler> {
        Box::new(RecordingHandler {
            log: Arc::clone(&self.log),
            finished: false,
        })
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

struct RecordingHandler {
    log: Arc<Mutex<Vec<String>>>,
    finished: bool,
}

impl RecordingHandler {
    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl EventHandler for RecordingHandler {
    fn on_open(&mut self) {
        self.push("open".into());
    }

    fn on_message(&mut self, message: SseMessage) {
        self.finished |= message.data == "[DONE]";
        self.push(format!("msg:{}", message.data));
    }

    fn on_error(&mut self, error: &StreamError) {
        self.push(format!("error:{error}"));
    }

    fn on_closed(&mut self) {
        self.push("closed".into());
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Let spawned tasks (and aborts) run to quiescence on the current runtime.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn message(data: &str) -> SseMessage {
    SseMessage {
        event_type: crate::sse::DEFAULT_EVENT_TYPE.to_string(),
        data: data.to_string(),
        last_event_id: String::new(),
    }
}
