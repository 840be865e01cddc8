use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::dispatcher::EventDispatcher;
use crate::error::CoreResult;
use crate::event_source::{
    ConnectionState, EventSource, EventSourceConfig, StreamTransport,
};

/// One streaming API call: an [`EventSource`] bound to an [`EventDispatcher`].
///
/// Nothing happens until [`start`](Self::start). Dropping the client stops it.
pub struct StreamingClient {
    source: EventSource,
}

impl StreamingClient {
    pub fn new<T: DeserializeOwned + Send + 'static>(
        config: EventSourceConfig,
        transport: Arc<dyn StreamTransport>,
        dispatcher: EventDispatcher<T>,
    ) -> Self {
        Self {
            source: EventSource::new(config, transport, Box::new(dispatcher)),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> CoreResult<()> {
        self.source.start()
    }

    pub fn stop(&self) {
        self.source.stop();
    }

    pub fn state(&self) -> ConnectionState {
        self.source.state()
    }

    /// Resolves once the stream reaches `Shutdown`, whether the server ended
    /// it or `stop()` was called. Never resolves for a client that is neither
    /// started nor stopped.
    pub async fn wait_for_shutdown(&self) {
        let mut state = self.source.subscribe();
        let _ = state
            .wait_for(|s| *s == ConnectionState::Shutdown)
            .await;
    }
}

impl Drop for StreamingClient {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde::Deserialize;
    use tracing::Level;

    use crate::dispatcher::StreamListener;
    use crate::event_source::{StreamRequest, retry_transient};
    use crate::test_log::install_capture;
    use crate::test_util::{Script, ScriptedTransport, settle};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Text {
        text: String,
    }

    #[derive(Clone, Default)]
    struct Sink {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Sink {
        fn dispatcher(&self, throttle: Duration) -> EventDispatcher<Text> {
            let batches = Arc::clone(&self.events);
            let closed = Arc::clone(&self.events);
            let listener = StreamListener::new(
                move |batch: Vec<Text>| {
                    let texts: Vec<String> = batch.into_iter().map(|t| t.text).collect();
                    batches.lock().unwrap().push(format!("{texts:?}"));
                    Ok(())
                },
                move || closed.lock().unwrap().push("closed".into()),
            );
            EventDispatcher::new(listener).with_throttle(throttle)
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    fn config() -> EventSourceConfig {
        let url = reqwest::Url::parse("http://localhost/v1/completions").unwrap();
        EventSourceConfig::new(StreamRequest::new(http::Method::POST, url).with_body("{}"))
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_done_terminates_stream() {
        let (logs, _guard) = install_capture();
        let transport = ScriptedTransport::new(vec![Script::hanging(&[
            "data: {\"text\":\"a\"}\n\n",
            "data: {\"text\":\"b\"}\n\n",
            "data: [DONE]\n\n",
        ])]);
        let sink = Sink::default();
        let client = StreamingClient::new(config(), transport.clone(), sink.dispatcher(Duration::ZERO));
        assert_eq!(client.state(), ConnectionState::Idle);
        client.start().unwrap();
        client.wait_for_shutdown().await;

        assert_eq!(sink.events(), vec![r#"["a"]"#, r#"["b"]"#, "closed"]);
        assert_eq!(client.state(), ConnectionState::Shutdown);
        assert_eq!(transport.teardowns(), 1);
        assert_eq!(logs.count(Level::ERROR, "decode failed"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_frames_in_one_chunk_arrive_as_batches() {
        let transport = ScriptedTransport::new(vec![Script::hanging(&[
            "data: {\"text\":\"a\"}\n\ndata: {\"text\":\"b\"}\n\ndata: {\"text\":\"c\"}\n\n",
            "data: [DONE]\n\n",
        ])]);
        let sink = Sink::default();
        let client = StreamingClient::new(
            config(),
            transport,
            sink.dispatcher(Duration::from_millis(300)),
        );
        client.start().unwrap();
        client.wait_for_shutdown().await;
        assert_eq!(sink.events(), vec![r#"["a"]"#, r#"["b", "c"]"#, "closed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_without_token_still_notifies_closed() {
        let transport = ScriptedTransport::new(vec![Script::body(&["data: {\"text\":\"a\"}\n\n"])]);
        let sink = Sink::default();
        let client = StreamingClient::new(config(), transport, sink.dispatcher(Duration::ZERO));
        client.start().unwrap();
        client.wait_for_shutdown().await;
        assert_eq!(sink.events(), vec![r#"["a"]"#, "closed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_frames_survive_a_reconnect() {
        let transport = ScriptedTransport::new(vec![
            Script::body_then_fail(
                &["data: {\"text\":\"a\"}\n\ndata: {\"text\":\"b\"}\n\n"],
                crate::error::StreamError::Read("reset".into()),
            ),
            Script::hanging(&["data: {\"text\":\"c\"}\n\ndata: [DONE]\n\n"]),
        ]);
        let sink = Sink::default();
        let client = StreamingClient::new(
            config().with_error_handler(retry_transient()),
            transport.clone(),
            sink.dispatcher(Duration::from_millis(300)),
        );
        client.start().unwrap();
        client.wait_for_shutdown().await;
        // "b" is flushed by a tick during the reconnect delay
        assert_eq!(sink.events(), vec![r#"["a"]"#, r#"["b"]"#, r#"["c"]"#, "closed"]);
        assert_eq!(transport.teardowns(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_discards_frames_waiting_for_a_tick() {
        let transport = ScriptedTransport::new(vec![Script::hanging(&[
            "data: {\"text\":\"a\"}\n\ndata: {\"text\":\"b\"}\n\n",
        ])]);
        let sink = Sink::default();
        let client = StreamingClient::new(
            config(),
            transport,
            sink.dispatcher(Duration::from_millis(300)),
        );
        client.start().unwrap();
        settle().await;
        assert_eq!(sink.events(), vec![r#"["a"]"#]);
        client.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.events(), vec![r#"["a"]"#]);
    }

    #[tokio::test]
    async fn stop_twice_and_before_start_is_quiet() {
        let transport = ScriptedTransport::new(vec![]);
        let sink = Sink::default();
        let client = StreamingClient::new(config(), transport, sink.dispatcher(Duration::ZERO));
        client.stop();
        client.stop();
        client.wait_for_shutdown().await;
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_client_releases_the_connection() {
        let transport = ScriptedTransport::new(vec![Script::hanging(&["data: {\"text\":\"a\"}\n\n"])]);
        let sink = Sink::default();
        let client = StreamingClient::new(config(), transport.clone(), sink.dispatcher(Duration::ZERO));
        client.start().unwrap();
        settle().await;
        assert_eq!(client.state(), ConnectionState::Open);
        drop(client);
        settle().await;
        assert_eq!(transport.teardowns(), 1);
        assert_eq!(sink.events(), vec![r#"["a"]"#]);
    }
}
