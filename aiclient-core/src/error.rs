use std::time::Duration;

use thiserror::Error;

/// Caller-visible error type for aiclient.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Raised synchronously, before any connection attempt.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("request encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("no tokio runtime available to drive the stream")]
    NoRuntime,

    #[error("rate limited by server")]
    RateLimited { retry_after: Option<u64> },

    #[error("server unavailable")]
    Unavailable,

    /// The server answered with a JSON error payload (`{"error": {...}}`).
    #[error("api error {code} ({kind}): {message}")]
    Api {
        code: u16,
        kind: String,
        message: String,
    },

    #[error("http error {code}: {message}")]
    HttpStatus { code: u16, message: String },

    #[error("response decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, ClientError>;

/// Transport failures seen by an event source. These never reach the caller
/// directly: they feed the connection-error handler, which decides between
/// reconnecting and shutting down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("unexpected status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),

    #[error("connection closed by server")]
    ClosedByServer,
}

impl StreamError {
    /// Failures worth a reconnect: network trouble, silence, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Read(_) | Self::IdleTimeout(_) => true,
            Self::Status { code, .. } => *code == 429 || (500..600).contains(code),
            Self::ClosedByServer => false,
        }
    }
}
