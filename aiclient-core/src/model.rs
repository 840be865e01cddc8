use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Body of `POST /completions`. `stream` is overwritten by the client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Body of `POST /chat/completions`. `stream` is overwritten by the client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CompletionChoice {
    pub text: String,
    pub index: u32,
    #[serde(default)]
    pub logprobs: Option<serde_json::Value>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// One `/completions` fragment sent over SSE.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

impl CompletionChunk {
    /// Text of the first choice, empty when there is none.
    pub fn first_choice(&self) -> &str {
        self.choices.first().map_or("", |c| c.text.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ChatDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatChunkChoice {
    pub delta: ChatDelta,
    pub index: u32,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One `/chat/completions` fragment sent over SSE.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChunkChoice>,
}

impl ChatChunk {
    /// Delta content of the first choice, empty when absent.
    pub fn first_choice(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FineTuneEvent {
    pub object: String,
    pub created_at: i64,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub owned_by: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ListModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

/// Result of `POST /files`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OpenAiFile {
    pub id: String,
    pub object: String,
    pub bytes: u64,
    pub created_at: i64,
    pub filename: String,
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    Mp4,
    Mpeg,
    Mpga,
    M4a,
    Wav,
    Webm,
}

impl AudioFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mp3",
            Self::Mp4 | Self::M4a => "audio/mp4",
            Self::Mpeg | Self::Mpga => "audio/mpeg",
            Self::Wav => "audio/wav",
            Self::Webm => "audio/webm",
        }
    }

    /// Guess from a file name's extension.
    pub fn from_filename(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        Some(match ext.to_ascii_lowercase().as_str() {
            "mp3" => Self::Mp3,
            "mp4" => Self::Mp4,
            "mpeg" => Self::Mpeg,
            "mpga" => Self::Mpga,
            "m4a" => Self::M4a,
            "wav" => Self::Wav,
            "webm" => Self::Webm,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioFile {
    pub filename: String,
    pub data: Vec<u8>,
    pub format: AudioFormat,
}

/// Output format of a transcription or translation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionFormat {
    #[default]
    Json,
    Text,
    Srt,
    VerboseJson,
    Vtt,
}

impl TranscriptionFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
            Self::Srt => "srt",
            Self::VerboseJson => "verbose_json",
            Self::Vtt => "vtt",
        }
    }

    /// Whether the server answers with a JSON object rather than plain text.
    pub fn is_json(self) -> bool {
        matches!(self, Self::Json | Self::VerboseJson)
    }
}

/// Form of `POST /audio/transcriptions` and `POST /audio/translations`.
/// `language` is only sent for transcriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionRequest {
    pub file: AudioFile,
    pub model: String,
    pub prompt: Option<String>,
    pub temperature: Option<f32>,
    /// ISO-639-1 code of the spoken language.
    pub language: Option<String>,
    pub response_format: TranscriptionFormat,
}

impl TranscriptionRequest {
    pub fn new(model: impl Into<String>, file: AudioFile) -> Self {
        Self {
            file,
            model: model.into(),
            prompt: None,
            temperature: None,
            language: None,
            response_format: TranscriptionFormat::default(),
        }
    }
}

/// For the text formats `text` holds the raw body.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TranscriptionResponse {
    pub text: String,
}

/// Error payload: `{"error": {"message": ..., "type": ...}}`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ApiErrorDetail {
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_request_skips_unset_options() {
        let req = CompletionRequest::new("text-davinci-003", "Say hi");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"model": "text-davinci-003", "prompt": "Say hi", "stream": false})
        );
    }

    #[test]
    fn role_json_roundtrip_lowercase() {
        let json = r#"{"role":"assistant","content":"ok"}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        let back = serde_json::to_string(&msg).unwrap();
        assert!(back.contains("\"assistant\""));
    }

    #[test]
    fn completion_chunk_first_choice() {
        let json = r#"{"id":"cmpl-1","object":"text_completion","created":1,"model":"m",
            "choices":[{"text":"Hel","index":0,"logprobs":null,"finish_reason":null}]}"#;
        let chunk: CompletionChunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.first_choice(), "Hel");

        let empty = CompletionChunk {
            choices: vec![],
            ..chunk
        };
        assert_eq!(empty.first_choice(), "");
    }

    #[test]
    fn chat_chunk_first_choice_handles_role_only_delta() {
        let role_only = r#"{"id":"c","object":"chat.completion.chunk","created":1,"model":"m",
            "choices":[{"delta":{"role":"assistant"},"index":0,"finish_reason":null}]}"#;
        let chunk: ChatChunk = serde_json::from_str(role_only).unwrap();
        assert_eq!(chunk.first_choice(), "");
        assert_eq!(chunk.choices[0].delta.role, Some(Role::Assistant));

        let content = r#"{"id":"c","object":"chat.completion.chunk","created":1,"model":"m",
            "choices":[{"delta":{"content":"lo"},"index":0,"finish_reason":"stop"}]}"#;
        let chunk: ChatChunk = serde_json::from_str(content).unwrap();
        assert_eq!(chunk.first_choice(), "lo");
    }

    #[test]
    fn audio_format_from_filename_and_content_type() {
        assert_eq!(AudioFormat::from_filename("talk.M4A"), Some(AudioFormat::M4a));
        assert_eq!(AudioFormat::M4a.content_type(), "audio/mp4");
        assert_eq!(AudioFormat::from_filename("notes.txt"), None);
        assert_eq!(AudioFormat::from_filename("noext"), None);
        assert_eq!(TranscriptionFormat::VerboseJson.as_str(), "verbose_json");
        assert!(!TranscriptionFormat::Srt.is_json());
    }

    #[test]
    fn api_error_body_parses_type_as_kind() {
        let json = r#"{"error":{"message":"bad key","type":"invalid_request_error","code":"invalid_api_key"}}"#;
        let body: ApiErrorBody = serde_json::from_str(json).unwrap();
        assert_eq!(body.error.message, "bad key");
        assert_eq!(body.error.kind.as_deref(), Some("invalid_request_error"));
    }
}
