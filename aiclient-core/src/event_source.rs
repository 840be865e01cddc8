//! Long-lived SSE connection with reconnect/backoff.
//!
//! One [`EventSource`] owns one background task (the "driver"). The driver is
//! the only place that touches the connection, the reconnect delay and the
//! [`EventHandler`]: network reads, handler timer ticks and backoff sleeps are
//! all multiplexed in a single `select!`, so handler state never sees
//! concurrent access.
//!
//! ```text
//! Idle ──start──► Connecting ──ok──► Open ──error──► Closed ──delay──► Connecting ...
//!                     │                 │                │
//!                     └──────── handler says Shutdown ───┴──► Shutdown
//! stop() from any state ──► ShuttingDown ──► Shutdown
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout_at};
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::error::{ClientError, CoreResult, StreamError};
use crate::sse::{SseItem, SseMessage, SseParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Between a failed connection and the next attempt.
    Closed,
    ShuttingDown,
    Shutdown,
}

impl ConnectionState {
    /// True once `stop()` was called or the stream ended for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Shutdown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// A connection open at least this long resets the backoff.
    pub backoff_reset_threshold: Duration,
    /// Silence longer than this is a failure, whether waiting for response
    /// headers or for body bytes.
    pub idle_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_reset_threshold: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Exponential reconnect delay: `base * 2^failures`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    base: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            base: policy.initial_delay,
            attempts: 0,
        }
    }

    /// Replace the base delay (an SSE `retry:` field does this).
    pub fn set_base(&mut self, base: Duration) {
        self.base = base;
    }

    /// Delay before the next attempt. `healthy_for` is how long the failed
    /// connection had been open, if it ever opened.
    pub fn next_delay(&mut self, healthy_for: Option<Duration>) -> Duration {
        if let Some(up) = healthy_for
            && up >= self.policy.backoff_reset_threshold
        {
            self.attempts = 0;
        }
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.policy.max_delay);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorAction {
    Retry,
    Shutdown,
}

/// Sole authority on whether a failed connection is retried.
pub type ConnectionErrorHandler =
    Arc<dyn Fn(&StreamError) -> ConnectionErrorAction + Send + Sync>;

/// Never reconnect.
pub fn shutdown_on_error() -> ConnectionErrorHandler {
    Arc::new(|_| ConnectionErrorAction::Shutdown)
}

/// Reconnect on transient failures (network, idle timeout, 429, 5xx).
pub fn retry_transient() -> ConnectionErrorHandler {
    Arc::new(|err| {
        if err.is_transient() {
            ConnectionErrorAction::Retry
        } else {
            ConnectionErrorAction::Shutdown
        }
    })
}

/// Receives everything an event source produces. All calls happen on the
/// source's driver task, one at a time.
pub trait EventHandler: Send + 'static {
    /// Called once, before the source starts, with a view of its state.
    /// Handlers that deliver data elsewhere use it to drop late deliveries
    /// once `stop()` has been called.
    fn attach(&mut self, _state: watch::Receiver<ConnectionState>) {}

    fn on_open(&mut self) {}

    fn on_message(&mut self, message: SseMessage);

    fn on_comment(&mut self, comment: &str) {
        trace!(comment, "sse comment");
    }

    fn on_error(&mut self, _error: &StreamError) {}

    /// The stream is over (server-side or by policy). Not called after `stop()`.
    fn on_closed(&mut self);

    /// When the handler next wants `on_tick`, if at all.
    fn next_tick(&self) -> Option<Instant> {
        None
    }

    fn on_tick(&mut self) {}

    /// Checked after every message; `true` ends the stream without consulting
    /// the connection-error handler.
    fn is_finished(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: reqwest::Url,
    pub method: http::Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Sent as `Last-Event-ID`; maintained by the event source across reconnects.
    pub last_event_id: Option<String>,
}

impl StreamRequest {
    pub fn new(method: http::Method, url: reqwest::Url) -> Self {
        Self {
            url,
            method,
            headers: Vec::new(),
            body: None,
            last_event_id: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Raw body of an open streaming response.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// Opens long-lived requests. Dropping the returned stream cancels the request.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, StreamError>;
}

#[derive(Clone)]
pub struct EventSourceConfig {
    pub request: StreamRequest,
    pub policy: ReconnectPolicy,
    pub on_connection_error: ConnectionErrorHandler,
}

impl EventSourceConfig {
    pub fn new(request: StreamRequest) -> Self {
        Self {
            request,
            policy: ReconnectPolicy::default(),
            on_connection_error: shutdown_on_error(),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_error_handler(mut self, handler: ConnectionErrorHandler) -> Self {
        self.on_connection_error = handler;
        self
    }
}

pub struct EventSource {
    state: Arc<watch::Sender<ConnectionState>>,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    driver: Option<Driver>,
    task: Option<JoinHandle<()>>,
}

impl EventSource {
    pub fn new(
        config: EventSourceConfig,
        transport: Arc<dyn StreamTransport>,
        mut handler: Box<dyn EventHandler>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        handler.attach(state.subscribe());
        let state = Arc::new(state);
        let driver = Driver {
            backoff: Backoff::new(config.policy),
            request: config.request,
            policy: config.policy,
            on_error: config.on_connection_error,
            transport,
            handler,
            state: Arc::clone(&state),
        };
        Self {
            state,
            slot: Mutex::new(Slot {
                driver: Some(driver),
                task: None,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Spawn the driver on the current tokio runtime. Only the first call
    /// from `Idle` has an effect.
    pub fn start(&self) -> CoreResult<()> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(driver) = slot.driver.take() else {
            warn!(state = ?self.state(), "event source already started or stopped; ignoring start");
            return Ok(());
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                slot.driver = Some(driver);
                return Err(ClientError::NoRuntime);
            }
        };
        self.state.send_replace(ConnectionState::Connecting);
        let span = info_span!("sse", url = %driver.request.url);
        slot.task = Some(runtime.spawn(driver.run().instrument(span)));
        Ok(())
    }

    /// Abandon the connection, any pending reconnect and the handler.
    /// Idempotent; fine to call before `start()`.
    pub fn stop(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let was_live = self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = ConnectionState::ShuttingDown;
                true
            }
        });
        slot.driver = None;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        self.state.send_replace(ConnectionState::Shutdown);
        if was_live {
            debug!("event source stopped");
        }
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Outcome {
    /// The handler saw its end-of-stream marker.
    Finished,
    Failed {
        error: StreamError,
        healthy_for: Option<Duration>,
    },
    Stopped,
}

struct Driver {
    request: StreamRequest,
    policy: ReconnectPolicy,
    backoff: Backoff,
    on_error: ConnectionErrorHandler,
    transport: Arc<dyn StreamTransport>,
    handler: Box<dyn EventHandler>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if !self.set_state(ConnectionState::Connecting) {
                return;
            }
            debug!(last_event_id = ?self.request.last_event_id, "connecting");
            let transport = Arc::clone(&self.transport);
            let request = self.request.clone();
            // silence while waiting for response headers counts as idle too
            let idle = self.policy.idle_timeout;
            let deadline = Instant::now() + idle;
            let opened = self
                .with_ticks(timeout_at(deadline, async move {
                    transport.open(&request).await
                }))
                .await
                .unwrap_or(Err(StreamError::IdleTimeout(idle)));
            let outcome = match opened {
                Ok(body) => {
                    if !self.set_state(ConnectionState::Open) {
                        return;
                    }
                    debug!("connection open");
                    self.handler.on_open();
                    self.read(body).await
                }
                Err(error) => Outcome::Failed {
                    error,
                    healthy_for: None,
                },
            };

            let (error, healthy_for) = match outcome {
                Outcome::Stopped => return,
                Outcome::Finished => {
                    debug!("end of stream");
                    self.finish();
                    return;
                }
                Outcome::Failed { error, healthy_for } => (error, healthy_for),
            };
            if self.stopping() {
                return;
            }
            warn!(%error, "connection error");
            self.handler.on_error(&error);
            match (self.on_error)(&error) {
                ConnectionErrorAction::Shutdown => {
                    debug!("connection error handler requested shutdown");
                    self.finish();
                    return;
                }
                ConnectionErrorAction::Retry => {
                    self.set_state(ConnectionState::Closed);
                    let delay = self.backoff.next_delay(healthy_for);
                    debug!(?delay, "scheduling reconnect");
                    self.with_ticks(sleep(delay)).await;
                }
            }
        }
    }

    async fn read(&mut self, mut body: ByteStream) -> Outcome {
        let opened_at = Instant::now();
        let idle = self.policy.idle_timeout;
        let mut parser = SseParser::new();
        loop {
            let deadline = Instant::now() + idle;
            let next = self.with_ticks(timeout_at(deadline, body.next())).await;
            let healthy_for = Some(opened_at.elapsed());
            let bytes = match next {
                Err(_) => {
                    return Outcome::Failed {
                        error: StreamError::IdleTimeout(idle),
                        healthy_for,
                    };
                }
                Ok(None) => {
                    return Outcome::Failed {
                        error: StreamError::ClosedByServer,
                        healthy_for,
                    };
                }
                Ok(Some(Err(error))) => return Outcome::Failed { error, healthy_for },
                Ok(Some(Ok(bytes))) => bytes,
            };

            for item in parser.feed(&bytes) {
                if self.stopping() {
                    return Outcome::Stopped;
                }
                match item {
                    SseItem::Comment(comment) => self.handler.on_comment(&comment),
                    SseItem::Retry(ms) => {
                        debug!(ms, "server changed reconnect delay");
                        self.backoff.set_base(Duration::from_millis(ms));
                    }
                    SseItem::Event(message) => {
                        self.handler.on_message(message);
                        if self.handler.is_finished() {
                            return Outcome::Finished;
                        }
                    }
                }
            }
            if !parser.last_event_id().is_empty() {
                self.request.last_event_id = Some(parser.last_event_id().to_string());
            }
        }
    }

    /// Await `fut` while servicing handler ticks.
    async fn with_ticks<F: Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            let tick = if self.stopping() {
                None
            } else {
                self.handler.next_tick()
            };
            tokio::select! {
                out = &mut fut => return out,
                _ = sleep_until_opt(tick) => {
                    if !self.stopping() {
                        self.handler.on_tick();
                    }
                }
            }
        }
    }

    fn finish(&mut self) {
        if self.stopping() {
            return;
        }
        self.handler.on_closed();
        self.state.send_replace(ConnectionState::Shutdown);
    }

    /// Transition unless `stop()` got there first.
    fn set_state(&self, to: ConnectionState) -> bool {
        self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = to;
                true
            }
        })
    }

    fn stopping(&self) -> bool {
        self.state.borrow().is_terminal()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
