//! OpenAI-style API facade. Each streaming endpoint comes in two forms: a
//! callback form returning an unstarted [`StreamingClient`], and a pull form
//! returning a started [`ChunkStream`].

use std::sync::Arc;

use http::Method;
use reqwest::Url;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::{Config, StreamCfg};
use crate::dispatcher::{EventDispatcher, StreamListener};
use crate::error::{ClientError, CoreResult};
use crate::event_source::{EventSourceConfig, StreamRequest, retry_transient, shutdown_on_error};
use crate::http_client::HttpClient;
use crate::model::{
    AudioFile, ChatChunk, ChatRequest, CompletionChunk, CompletionRequest, CompletionResponse,
    FineTuneEvent, ListModelsResponse, OpenAiFile, TranscriptionRequest, TranscriptionResponse,
};
use crate::stream::ChunkStream;
use crate::streaming::StreamingClient;

pub struct OpenAiClient {
    http: Arc<HttpClient>,
    base: Url,
    api_key: Option<SecretString>,
    organization: Option<String>,
    stream: StreamCfg,
}

impl OpenAiClient {
    /// Credentials are read from the environment variables named in `cfg.api`.
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        let api_key = std::env::var(&cfg.api.api_key_env)
            .ok()
            .map(|k| SecretString::new(k.into()));
        if api_key.is_none() {
            debug!(var = %cfg.api.api_key_env, "api key not set; sending unauthenticated requests");
        }
        let organization = cfg
            .api
            .organization_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok());
        Self::with_credentials(cfg, api_key, organization)
    }

    pub fn with_credentials(
        cfg: &Config,
        api_key: Option<SecretString>,
        organization: Option<String>,
    ) -> CoreResult<Self> {
        Ok(Self {
            base: parse_base_url(&cfg.api.base_url)?,
            http: Arc::new(HttpClient::from_config(&cfg.http)?),
            api_key,
            organization,
            stream: cfg.stream.clone(),
        })
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut h = Vec::new();
        if let Some(key) = &self.api_key {
            h.push((
                "Authorization".to_string(),
                format!("Bearer {}", key.expose_secret()),
            ));
        }
        if let Some(org) = &self.organization {
            h.push(("OpenAI-Organization".into(), org.clone()));
        }
        h
    }

    fn endpoint(&self, path: &str) -> CoreResult<Url> {
        self.base
            .join(path)
            .map_err(|e| ClientError::InvalidUrl(format!("{path}: {e}")))
    }

    fn event_source_config(&self, request: StreamRequest) -> EventSourceConfig {
        let on_error = if self.stream.retry_on_error {
            retry_transient()
        } else {
            shutdown_on_error()
        };
        EventSourceConfig::new(request)
            .with_policy(self.stream.reconnect_policy())
            .with_error_handler(on_error)
    }

    fn streaming_client<T: DeserializeOwned + Send + 'static>(
        &self,
        request: StreamRequest,
        listener: StreamListener<T>,
    ) -> StreamingClient {
        let dispatcher = EventDispatcher::new(listener)
            .with_shutdown_token(self.stream.shutdown_token.clone())
            .with_throttle(self.stream.throttle());
        StreamingClient::new(
            self.event_source_config(request),
            self.http.clone(),
            dispatcher,
        )
    }

    fn chunk_stream<T: DeserializeOwned + Send + 'static>(
        &self,
        request: StreamRequest,
    ) -> CoreResult<ChunkStream<T>> {
        ChunkStream::open(
            self.event_source_config(request),
            self.http.clone(),
            self.stream.shutdown_token.clone(),
            self.stream.throttle(),
        )
    }

    fn completion_request(&self, mut request: CompletionRequest) -> CoreResult<StreamRequest> {
        request.stream = true;
        let body = serde_json::to_vec(&request)?;
        Ok(StreamRequest::new(Method::POST, self.endpoint("completions")?)
            .with_headers(self.headers())
            .with_body(body))
    }

    fn chat_request(&self, mut request: ChatRequest) -> CoreResult<StreamRequest> {
        request.stream = true;
        let body = serde_json::to_vec(&request)?;
        Ok(
            StreamRequest::new(Method::POST, self.endpoint("chat/completions")?)
                .with_headers(self.headers())
                .with_body(body),
        )
    }

    fn fine_tune_events_request(&self, fine_tune_id: &str) -> CoreResult<StreamRequest> {
        let mut url = self.endpoint("fine-tunes")?;
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base.to_string()))?
            .push(fine_tune_id)
            .push("events");
        url.query_pairs_mut().append_pair("stream", "true");
        Ok(StreamRequest::new(Method::GET, url).with_headers(self.headers()))
    }

    pub async fn completion(&self, mut request: CompletionRequest) -> CoreResult<CompletionResponse> {
        request.stream = false;
        let url = self.endpoint("completions")?;
        self.http.post_json(&url, &request, &self.headers()).await
    }

    pub async fn models(&self) -> CoreResult<ListModelsResponse> {
        let url = self.endpoint("models")?;
        self.http.get_json(&url, &self.headers()).await
    }

    /// `POST /files` as multipart, e.g. a JSONL training file with purpose
    /// `fine-tune`.
    pub async fn upload_file(
        &self,
        filename: &str,
        content: Vec<u8>,
        purpose: &str,
    ) -> CoreResult<OpenAiFile> {
        let url = self.endpoint("files")?;
        let file = file_part(content, filename, "application/octet-stream")?;
        let form = Form::new()
            .text("purpose", purpose.to_string())
            .part("file", file);
        debug!(filename, purpose, "uploading file");
        self.http.post_multipart(&url, form, &self.headers()).await
    }

    /// `POST /audio/transcriptions`.
    pub async fn transcription(&self, request: TranscriptionRequest) -> CoreResult<TranscriptionResponse> {
        self.audio("audio/transcriptions", request, true).await
    }

    /// `POST /audio/translations`: speech to English text. `language` is not sent.
    pub async fn translation(&self, request: TranscriptionRequest) -> CoreResult<TranscriptionResponse> {
        self.audio("audio/translations", request, false).await
    }

    async fn audio(
        &self,
        path: &str,
        request: TranscriptionRequest,
        with_language: bool,
    ) -> CoreResult<TranscriptionResponse> {
        let url = self.endpoint(path)?;
        let format = request.response_format;
        let form = audio_form(request, with_language)?;
        if format.is_json() {
            self.http.post_multipart(&url, form, &self.headers()).await
        } else {
            let text = self.http.post_multipart_text(&url, form, &self.headers()).await?;
            Ok(TranscriptionResponse { text })
        }
    }

    /// `POST /completions` with `stream: true`. Call `start()` on the result.
    pub fn streaming_completion(
        &self,
        request: CompletionRequest,
        listener: StreamListener<CompletionChunk>,
    ) -> CoreResult<StreamingClient> {
        Ok(self.streaming_client(self.completion_request(request)?, listener))
    }

    pub fn completion_stream(
        &self,
        request: CompletionRequest,
    ) -> CoreResult<ChunkStream<CompletionChunk>> {
        self.chunk_stream(self.completion_request(request)?)
    }

    /// `POST /chat/completions` with `stream: true`. Call `start()` on the result.
    pub fn streaming_chat_completion(
        &self,
        request: ChatRequest,
        listener: StreamListener<ChatChunk>,
    ) -> CoreResult<StreamingClient> {
        Ok(self.streaming_client(self.chat_request(request)?, listener))
    }

    pub fn chat_completion_stream(&self, request: ChatRequest) -> CoreResult<ChunkStream<ChatChunk>> {
        self.chunk_stream(self.chat_request(request)?)
    }

    /// `GET /fine-tunes/{id}/events?stream=true`. Call `start()` on the result.
    pub fn streaming_fine_tune_events(
        &self,
        fine_tune_id: &str,
        listener: StreamListener<FineTuneEvent>,
    ) -> CoreResult<StreamingClient> {
        Ok(self.streaming_client(self.fine_tune_events_request(fine_tune_id)?, listener))
    }

    pub fn fine_tune_events_stream(
        &self,
        fine_tune_id: &str,
    ) -> CoreResult<ChunkStream<FineTuneEvent>> {
        self.chunk_stream(self.fine_tune_events_request(fine_tune_id)?)
    }
}

fn file_part(data: Vec<u8>, filename: &str, content_type: &str) -> CoreResult<Part> {
    Part::bytes(data)
        .file_name(filename.to_string())
        .mime_str(content_type)
        .map_err(|e| ClientError::Other(anyhow::anyhow!("invalid content type {content_type}: {e}")))
}

fn audio_form(request: TranscriptionRequest, with_language: bool) -> CoreResult<Form> {
    let TranscriptionRequest {
        file: AudioFile {
            filename,
            data,
            format,
        },
        model,
        prompt,
        temperature,
        language,
        response_format,
    } = request;
    let mut form = Form::new().text("model", model);
    if let Some(prompt) = prompt {
        form = form.text("prompt", prompt);
    }
    form = form.text("response_format", response_format.as_str());
    if let Some(temperature) = temperature {
        form = form.text("temperature", temperature.to_string());
    }
    if with_language && let Some(language) = language {
        form = form.text("language", language);
    }
    Ok(form.part("file", file_part(data, &filename, format.content_type())?))
}

/// The base must be an absolute http(s) URL; a trailing `/` is added so that
/// relative endpoint paths extend it instead of replacing its last segment.
fn parse_base_url(raw: &str) -> CoreResult<Url> {
    let mut url = Url::parse(raw).map_err(|e| ClientError::InvalidUrl(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ClientError::InvalidUrl(format!(
            "{raw}: unsupported scheme {}",
            url.scheme()
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
