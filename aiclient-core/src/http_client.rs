use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE, HeaderMap, USER_AGENT};
use reqwest::multipart::Form;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::config::HttpCfg;
use crate::error::{ClientError, CoreResult, StreamError};
use crate::event_source::{ByteStream, StreamRequest, StreamTransport};
use crate::model::ApiErrorBody;

const ERROR_BODY_LIMIT: usize = 300;

/// Thin wrapper around reqwest::Client with defaults and helpers.
///
/// The underlying client has no overall timeout: a streaming body may stay
/// open indefinitely. `request_timeout` is applied per JSON call instead.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    request_timeout: Duration,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_config(&HttpCfg::default())
    }

    pub fn from_config(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(max) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(max);
        }
        let inner = builder
            .build()
            .map_err(|e| ClientError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("aiclient/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
        })
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &Url,
        body: &T,
        headers: &[(String, String)],
    ) -> CoreResult<R> {
        let req = self.inner.post(url.clone()).json(body);
        self.send_json(req, headers).await
    }

    pub async fn get_json<R: DeserializeOwned>(
        &self,
        url: &Url,
        headers: &[(String, String)],
    ) -> CoreResult<R> {
        let req = self.inner.get(url.clone());
        self.send_json(req, headers).await
    }

    /// `multipart/form-data` POST; the boundary header is set by reqwest.
    pub async fn post_multipart<R: DeserializeOwned>(
        &self,
        url: &Url,
        form: Form,
        headers: &[(String, String)],
    ) -> CoreResult<R> {
        let req = self.inner.post(url.clone()).multipart(form);
        self.send_json(req, headers).await
    }

    /// Like [`post_multipart`](Self::post_multipart) for endpoints that answer
    /// with plain text.
    pub async fn post_multipart_text(
        &self,
        url: &Url,
        form: Form,
        headers: &[(String, String)],
    ) -> CoreResult<String> {
        let req = self.inner.post(url.clone()).multipart(form);
        self.send(req, headers)
            .await?
            .text()
            .await
            .map_err(|e| ClientError::Decode(format!("text decode error: {e}")))
    }

    async fn send_json<R: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        headers: &[(String, String)],
    ) -> CoreResult<R> {
        self.send(req, headers)
            .await?
            .json::<R>()
            .await
            .map_err(|e| ClientError::Decode(format!("json decode error: {e}")))
    }

    async fn send(&self, mut req: RequestBuilder, headers: &[(String, String)]) -> CoreResult<Response> {
        req = req
            .timeout(self.request_timeout)
            .header(USER_AGENT, &self.user_agent);
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req.send().await.map_err(|e| {
            debug!(error = %e, "request failed");
            ClientError::Unavailable
        })?;

        let status = resp.status();
        if !status.is_success() {
            let ra = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_error(status, ra, &text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl StreamTransport for HttpClient {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, StreamError> {
        let mut req = self
            .inner
            .request(request.method.clone(), request.url.clone())
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = &request.last_event_id {
            req = req.header("Last-Event-ID", id.as_str());
        }
        for (k, v) in &request.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &request.body {
            req = req
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            // an error body that never finishes must not hold the stream open
            let body = match tokio::time::timeout(self.request_timeout, resp.text()).await {
                Ok(Ok(text)) => text,
                _ => String::new(),
            };
            return Err(StreamError::Status {
                code: status.as_u16(),
                body: truncate(&body, ERROR_BODY_LIMIT),
            });
        }

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::Read(e.to_string())));
        Ok(Box::pin(body))
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored
    None
}

fn map_http_error(status: StatusCode, retry_after: Option<u64>, body: &str) -> ClientError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ClientError::RateLimited { retry_after },
        s if s.is_server_error() => ClientError::Unavailable,
        s => match serde_json::from_str::<ApiErrorBody>(body) {
            Ok(api) => ClientError::Api {
                code: s.as_u16(),
                kind: api.error.kind.unwrap_or_default(),
                message: truncate(&api.error.message, ERROR_BODY_LIMIT),
            },
            Err(_) => ClientError::HttpStatus {
                code: s.as_u16(),
                message: truncate(body, ERROR_BODY_LIMIT),
            },
        },
    }
}

/// Cut to at most `max` characters, marking the cut with `...`.
fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
