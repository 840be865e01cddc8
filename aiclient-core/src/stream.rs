//! Pull-style access to a stream of decoded batches.
//!
//! [`ChunkStream`] wraps the push-based dispatcher: each delivered batch is
//! forwarded into a channel, the closed notification finishes the channel,
//! and dropping the stream stops the underlying connection.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::debug;

use crate::dispatcher::{EventDispatcher, StreamListener};
use crate::error::CoreResult;
use crate::event_source::{ConnectionState, EventSourceConfig, StreamTransport};
use crate::streaming::StreamingClient;

/// Finite sequence of batches; ends on the shutdown token or when the
/// connection closes for good.
pub struct ChunkStream<T> {
    batches: mpsc::UnboundedReceiver<Vec<T>>,
    client: StreamingClient,
}

impl<T: DeserializeOwned + Send + 'static> ChunkStream<T> {
    /// Wire a dispatcher to a channel and start streaming.
    pub fn open(
        config: EventSourceConfig,
        transport: Arc<dyn StreamTransport>,
        shutdown_token: impl Into<String>,
        throttle: Duration,
    ) -> CoreResult<Self> {
        let (tx, batches) = mpsc::unbounded_channel();
        let sender = Arc::new(Mutex::new(Some(tx)));
        let batch_sender = Arc::clone(&sender);
        let listener = StreamListener::new(
            move |batch: Vec<T>| {
                let guard = batch_sender.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(tx) = guard.as_ref() {
                    tx.send(batch)
                        .map_err(|_| anyhow::anyhow!("stream consumer has gone away"))?;
                }
                Ok(())
            },
            move || {
                sender.lock().unwrap_or_else(PoisonError::into_inner).take();
            },
        );
        let dispatcher = EventDispatcher::new(listener)
            .with_shutdown_token(shutdown_token)
            .with_throttle(throttle);
        let client = StreamingClient::new(config, transport, dispatcher);
        client.start()?;
        Ok(Self { batches, client })
    }
}

impl<T> ChunkStream<T> {
    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Stop early; buffered batches already received stay readable.
    pub fn stop(&self) {
        self.client.stop();
    }
}

impl<T> Stream for ChunkStream<T> {
    type Item = Vec<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.batches.poll_recv(cx)
    }
}

impl<T> Drop for ChunkStream<T> {
    fn drop(&mut self) {
        if !self.client.state().is_terminal() {
            debug!("stream consumer went away; stopping connection");
        }
        self.client.stop();
    }
}
