pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event_source;
pub mod http_client;
pub mod model;
pub mod sse;
pub mod stream;
pub mod streaming;
#[cfg(test)]
mod test_log;
#[cfg(test)]
pub(crate) mod test_util;

pub use client::OpenAiClient;
pub use config::Config;
pub use dispatcher::{EventDispatcher, SHUTDOWN_TOKEN, StreamListener};
pub use error::{ClientError, CoreResult, StreamError};
pub use event_source::{ConnectionState, EventSource, EventSourceConfig, ReconnectPolicy};
pub use stream::ChunkStream;
pub use streaming::StreamingClient;
