//! Turns raw SSE messages into throttled batches of decoded chunks.
//!
//! The first message after an idle period is delivered immediately; later
//! messages are coalesced and flushed on a repeating throttle tick. A message
//! whose data equals the shutdown token forces an immediate flush and ends the
//! stream. With a zero throttle every message is delivered on its own.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::event_source::{ConnectionState, EventHandler};
use crate::sse::SseMessage;

/// In-band end-of-stream marker used by the completion endpoints.
pub const SHUTDOWN_TOKEN: &str = "[DONE]";

pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(300);

type BatchFn<T> = Box<dyn FnMut(Vec<T>) -> anyhow::Result<()> + Send>;
type ClosedFn = Box<dyn FnOnce() + Send>;

/// Consumer callbacks. `on_closed` runs at most once.
pub struct StreamListener<T> {
    on_batch: BatchFn<T>,
    on_closed: Option<ClosedFn>,
}

impl<T> StreamListener<T> {
    pub fn new(
        on_batch: impl FnMut(Vec<T>) -> anyhow::Result<()> + Send + 'static,
        on_closed: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            on_batch: Box::new(on_batch),
            on_closed: Some(Box::new(on_closed)),
        }
    }

    pub fn batches_only(on_batch: impl FnMut(Vec<T>) -> anyhow::Result<()> + Send + 'static) -> Self {
        Self {
            on_batch: Box::new(on_batch),
            on_closed: None,
        }
    }
}

pub struct EventDispatcher<T> {
    shutdown_token: String,
    throttle: Duration,
    listener: StreamListener<T>,
    buffer: Vec<SseMessage>,
    next_flush: Option<Instant>,
    closing: bool,
    state: Option<watch::Receiver<ConnectionState>>,
}

impl<T: DeserializeOwned + Send + 'static> EventDispatcher<T> {
    pub fn new(listener: StreamListener<T>) -> Self {
        Self {
            shutdown_token: SHUTDOWN_TOKEN.to_string(),
            throttle: DEFAULT_THROTTLE,
            listener,
            buffer: Vec::new(),
            next_flush: None,
            closing: false,
            state: None,
        }
    }

    pub fn with_shutdown_token(mut self, token: impl Into<String>) -> Self {
        self.shutdown_token = token.into();
        self
    }

    /// `Duration::ZERO` disables batching.
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    fn is_shutdown_token(&self, message: &SseMessage) -> bool {
        message.data == self.shutdown_token
    }

    fn buffer_message(&mut self, message: SseMessage) {
        self.closing |= self.is_shutdown_token(&message);
        self.buffer.push(message);

        match (self.next_flush.is_some(), self.closing) {
            // first message is the shutdown token, or shutdown while idle
            (false, true) => self.flush(),
            // shutdown while a tick is pending: don't wait for it
            (true, true) => {
                self.flush();
                self.next_flush = None;
            }
            (false, false) => {
                self.flush();
                if !self.throttle.is_zero() && !self.source_stopped() {
                    self.next_flush = Some(Instant::now() + self.throttle);
                }
            }
            // the pending tick picks it up
            (true, false) => {}
        }
    }

    fn source_stopped(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.borrow().is_terminal())
    }

    /// Decode and deliver everything buffered. The buffer is cleared even when
    /// decoding or the listener fails, so nothing is delivered twice. Once the
    /// attached source has been stopped the buffer is discarded instead.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if self.source_stopped() {
            debug!(dropped = self.buffer.len(), "source stopped; discarding buffered messages");
            self.buffer.clear();
            self.next_flush = None;
            return;
        }
        let pending = std::mem::take(&mut self.buffer);
        let mut chunks = Vec::with_capacity(pending.len());
        for message in pending {
            if self.is_shutdown_token(&message) {
                continue;
            }
            match serde_json::from_str::<T>(&message.data) {
                Ok(chunk) => chunks.push(chunk),
                Err(err) => {
                    error!(data = %message.data, error = %err, "sse payload decode failed; dropping message");
                }
            }
        }
        if chunks.is_empty() {
            return;
        }
        if let Err(err) = (self.listener.on_batch)(chunks) {
            error!(error = %err, "stream listener failed to handle batch");
        }
    }

    fn notify_closed(&mut self) {
        if let Some(on_closed) = self.listener.on_closed.take() {
            on_closed();
        }
    }
}

impl<T: DeserializeOwned + Send + 'static> EventHandler for EventDispatcher<T> {
    fn attach(&mut self, state: watch::Receiver<ConnectionState>) {
        self.state = Some(state);
    }

    fn on_open(&mut self) {
        trace!("sse open");
    }

    fn on_message(&mut self, message: SseMessage) {
        trace!(
            event_type = %message.event_type,
            data = %message.data,
            last_event_id = %message.last_event_id,
            "sse message"
        );
        self.buffer_message(message);
    }

    fn on_closed(&mut self) {
        trace!("sse closed");
        self.flush();
        self.next_flush = None;
        self.notify_closed();
    }

    fn next_tick(&self) -> Option<Instant> {
        self.next_flush
    }

    fn on_tick(&mut self) {
        // nothing arrived during the window: go idle so the next frame is sent at once
        if self.buffer.is_empty() {
            self.next_flush = None;
            return;
        }
        self.flush();
        if let Some(due) = self.next_flush {
            let now = Instant::now();
            let mut next = due + self.throttle;
            if next <= now {
                next = now + self.throttle;
            }
            self.next_flush = Some(next);
        }
    }

    fn is_finished(&self) -> bool {
        self.closing
    }
}
