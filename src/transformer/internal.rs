//! Internal normalized LLM request/response model.
//!
//! The lingua franca between inbound and outbound codecs. The shape follows
//! the OpenAI chat completion wire format, extended with embedding fields and
//! bookkeeping fields that are never forwarded upstream. One-of wire shapes
//! (content, stop, tool choice, embedding input) serialize to the compact
//! string form when the scalar variant is populated.

use std::collections::HashMap;

use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::core::error::{AppError, Result};

// ============================================================================
// One-of wire shapes
// ============================================================================

/// `stop`: a single sequence or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stop {
    Single(String),
    Multiple(Vec<String>),
}

impl Stop {
    /// All stop sequences regardless of variant.
    pub fn sequences(&self) -> Vec<String> {
        match self {
            Stop::Single(s) => vec![s.clone()],
            Stop::Multiple(v) => v.clone(),
        }
    }
}

/// Embedding input: one string or many.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Multiple(Vec<String>),
}

impl EmbeddingInput {
    pub fn is_empty(&self) -> bool {
        match self {
            EmbeddingInput::Single(s) => s.is_empty(),
            EmbeddingInput::Multiple(v) => v.is_empty(),
        }
    }

    /// Concatenated text, for token counting.
    pub fn joined_text(&self) -> String {
        match self {
            EmbeddingInput::Single(s) => s.clone(),
            EmbeddingInput::Multiple(v) => v.concat(),
        }
    }
}

/// An embedding vector: float array or base64 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Embedding {
    Base64(String),
    Floats(Vec<f64>),
}

/// One embedding object in an embeddings response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingObject {
    pub object: String,
    pub index: i64,
    pub embedding: Embedding,
}

/// `tool_choice`: a mode string or a named function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Named(NamedToolChoice),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedToolChoice {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunctionRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunctionRef {
    pub name: String,
}

// ============================================================================
// Message content
// ============================================================================

/// Message content: a plain string or a list of typed parts.
///
/// Serialization collapses a single text part back to the string form; some
/// clients depend on that compact shape.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Serialize for MessageContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            MessageContent::Text(s) => serializer.serialize_str(s),
            MessageContent::Parts(parts) => {
                if parts.len() == 1 && parts[0].kind == "text" {
                    if let Some(text) = &parts[0].text {
                        return serializer.serialize_str(text);
                    }
                }
                let mut seq = serializer.serialize_seq(Some(parts.len()))?;
                for part in parts {
                    seq.serialize_element(part)?;
                }
                seq.end()
            }
        }
    }
}

impl MessageContent {
    pub fn text(s: impl Into<String>) -> Self {
        MessageContent::Text(s.into())
    }

    /// The plain string when this is the scalar variant.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(s) => Some(s),
            MessageContent::Parts(_) => None,
        }
    }

    pub fn parts(&self) -> &[ContentPart] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Parts(parts) => parts,
        }
    }

    /// Concatenation of the string form and every text part.
    pub fn all_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .concat(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

/// One typed content part.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentPart {
    /// "text", "image_url", "input_audio", "file"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<ImageUrl>,
    #[serde(rename = "input_audio", skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileData>,
    /// Provider cache-control marker; never serialized.
    #[serde(skip)]
    pub cache_control: Option<CacheControl>,
}

impl ContentPart {
    pub fn text_part(text: impl Into<String>) -> Self {
        ContentPart {
            kind: "text".to_string(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn image_part(url: impl Into<String>) -> Self {
        ContentPart {
            kind: "image_url".to_string(),
            image_url: Some(ImageUrl {
                url: url.into(),
                detail: None,
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioData {
    /// "wav" or "mp3"
    pub format: String,
    /// Base64 payload
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileData {
    pub filename: String,
    pub file_data: String,
}

/// Provider cache-control marker carried out-of-band.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheControl {
    pub kind: String,
    pub ttl: String,
}

// ============================================================================
// Messages
// ============================================================================

/// One conversation message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refusal: String,

    /// Index of the originating client message; threads tool results back to
    /// their surrounding turn. Never forwarded.
    #[serde(skip)]
    pub message_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Never forwarded.
    #[serde(skip)]
    pub tool_call_is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Image parts some providers return beside content; merged into content
    /// during response processing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ContentPart>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Alternative field name some providers use for the same purpose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_signature: Option<String>,

    /// Provider cache-control marker; never serialized.
    #[serde(skip)]
    pub cache_control: Option<CacheControl>,
}

impl Message {
    /// Reasoning text from whichever field the provider populated.
    pub fn reasoning_text(&self) -> &str {
        self.reasoning_content
            .as_deref()
            .or(self.reasoning.as_deref())
            .unwrap_or("")
    }

    /// Drop fields that must not reach an upstream service.
    pub fn clear_help_fields(&mut self) {
        self.reasoning_content = None;
        self.reasoning = None;
        self.reasoning_signature = None;
    }
}

/// One tool call issued by the assistant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub function: FunctionCall,
    /// Stream deltas correlate on this; 0 must not be omitted.
    #[serde(default)]
    pub index: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    /// JSON arguments as a string; may arrive in fragments while streaming.
    #[serde(default)]
    pub arguments: String,
}

// ============================================================================
// Tools
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tool {
    /// "function" or "image_generation"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub function: FunctionDef,
    /// Image-generation parameters; not valid in chat completion bodies, so
    /// never serialized there.
    #[serde(default, skip_serializing)]
    pub image_generation: Option<ImageGeneration>,
    #[serde(skip)]
    pub cache_control: Option<CacheControl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

/// Loose carrier for image-generation tool parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageGeneration {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub background: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_format: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub quality: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_compression: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    /// "text" | "json_object" | "json_schema"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

// ============================================================================
// Requests
// ============================================================================

/// The client-facing wire format a request arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiFormat {
    #[default]
    OpenAiChat,
    OpenAiResponse,
    OpenAiEmbedding,
    AnthropicMessages,
}

/// Normalized request covering chat and embeddings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InternalRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,

    // Embedding-only fields, mutually exclusive with messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_input: Option<EmbeddingInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dimensions: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_encoding_format: Option<String>,

    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub logit_bias: HashMap<String, i64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Subset of {"text", "image", "audio"}
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modalities: Vec<String>,

    /// "low" | "medium" | "high" | "minimal"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning_effort: String,
    /// Numeric thinking budget; never forwarded.
    #[serde(skip)]
    pub reasoning_budget: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Stop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,

    // Bookkeeping fields; never forwarded.
    #[serde(skip)]
    pub raw_api_format: ApiFormat,
    /// Format-preserving hints from the inbound codec.
    #[serde(skip)]
    pub transformer_metadata: HashMap<String, String>,
    /// Original URL query parameters from the client request.
    #[serde(skip)]
    pub query: Vec<(String, String)>,
}

impl InternalRequest {
    pub fn is_embedding_request(&self) -> bool {
        self.embedding_input.is_some()
    }

    pub fn is_chat_request(&self) -> bool {
        !self.messages.is_empty()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Reject requests that are neither chat nor embedding, or ambiguously
    /// both.
    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            return Err(AppError::InvalidRequest("model is required".to_string()));
        }
        let is_embedding = self.is_embedding_request();
        let is_chat = self.is_chat_request();

        if is_embedding && is_chat {
            return Err(AppError::InvalidRequest(
                "cannot specify both messages and input".to_string(),
            ));
        }
        if !is_embedding && !is_chat {
            return Err(AppError::InvalidRequest(
                "either messages or input is required".to_string(),
            ));
        }
        if let Some(input) = &self.embedding_input {
            if input.is_empty() {
                return Err(AppError::InvalidRequest("input cannot be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Drop fields that must not reach an upstream service.
    pub fn clear_help_fields(&mut self) {
        for msg in &mut self.messages {
            msg.clear_help_fields();
        }
    }

    /// Every text fragment in the request, for the token-count fallback.
    pub fn all_text(&self) -> String {
        let mut text = String::new();
        if let Some(input) = &self.embedding_input {
            text.push_str(&input.joined_text());
        }
        for msg in &self.messages {
            if let Some(content) = &msg.content {
                text.push_str(&content.all_text());
            }
        }
        text
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Normalized response, reusing one struct for stream and non-stream bodies
/// the way the OpenAI wire format does.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InternalResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding_data: Vec<EmbeddingObject>,
    /// "chat.completion", "chat.completion.chunk", "list", or the stream
    /// terminator sentinel "[DONE]"
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_fingerprint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_tier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// Sentinel `object` value marking the end of a stream.
pub const DONE_OBJECT: &str = "[DONE]";

impl InternalResponse {
    pub fn done() -> Self {
        InternalResponse {
            object: DONE_OBJECT.to_string(),
            ..Default::default()
        }
    }

    pub fn is_done(&self) -> bool {
        self.object == DONE_OBJECT
    }

    /// Every text fragment in the response, for the token-count fallback.
    pub fn all_text(&self) -> String {
        let mut text = String::new();
        for choice in &self.choices {
            if let Some(msg) = &choice.message {
                if let Some(content) = &msg.content {
                    text.push_str(&content.all_text());
                }
            }
        }
        text
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: i64,
    /// Present on non-stream responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    /// Present on stream chunks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Value>,
}

/// Token usage. The Anthropic flags are internal: Anthropic bills
/// `input_tokens` exclusive of cache reads, which changes the cost formula.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(default)]
    pub completion_tokens_details: Option<CompletionTokensDetails>,

    #[serde(skip)]
    pub anthropic_usage: bool,
    #[serde(skip)]
    pub cache_creation_input_tokens: i64,
}

impl Usage {
    pub fn cached_tokens(&self) -> i64 {
        self.prompt_tokens_details
            .as_ref()
            .map(|d| d.cached_tokens)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub audio_tokens: i64,
    #[serde(default)]
    pub cached_tokens: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub audio_tokens: i64,
    #[serde(default)]
    pub reasoning_tokens: i64,
    #[serde(default)]
    pub accepted_prediction_tokens: i64,
    #[serde(default)]
    pub rejected_prediction_tokens: i64,
}

/// Error details in the common `{code, message, type}` envelope shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl ErrorDetail {
    /// Lift into an [`AppError`] keeping the provider's envelope fields.
    pub fn into_app_error(self, status: u16) -> AppError {
        AppError::Upstream {
            status,
            code: self.code,
            error_type: self.kind,
            message: self.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stop_roundtrip() {
        let single: Stop = serde_json::from_str("\"END\"").unwrap();
        assert_eq!(single, Stop::Single("END".to_string()));
        assert_eq!(serde_json::to_string(&single).unwrap(), "\"END\"");

        let multi: Stop = serde_json::from_str("[\"a\",\"b\"]").unwrap();
        assert_eq!(serde_json::to_string(&multi).unwrap(), "[\"a\",\"b\"]");
    }

    #[test]
    fn test_embedding_input_variants() {
        let single: EmbeddingInput = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(single.joined_text(), "hello");

        let multi: EmbeddingInput = serde_json::from_str("[\"a\",\"b\"]").unwrap();
        assert_eq!(multi.joined_text(), "ab");
        assert!(!multi.is_empty());
    }

    #[test]
    fn test_embedding_variants() {
        let floats: Embedding = serde_json::from_str("[0.1, 0.2]").unwrap();
        assert!(matches!(floats, Embedding::Floats(ref v) if v.len() == 2));

        let b64: Embedding = serde_json::from_str("\"aGVsbG8=\"").unwrap();
        assert_eq!(serde_json::to_string(&b64).unwrap(), "\"aGVsbG8=\"");
    }

    #[test]
    fn test_message_content_string_form() {
        let content: MessageContent = serde_json::from_str("\"hi\"").unwrap();
        assert_eq!(content.as_text(), Some("hi"));
        assert_eq!(serde_json::to_string(&content).unwrap(), "\"hi\"");
    }

    #[test]
    fn test_message_content_single_text_part_collapses() {
        let content = MessageContent::Parts(vec![ContentPart::text_part("hi")]);
        assert_eq!(serde_json::to_string(&content).unwrap(), "\"hi\"");
    }

    #[test]
    fn test_message_content_mixed_parts_stay_array() {
        let content = MessageContent::Parts(vec![
            ContentPart::text_part("look:"),
            ContentPart::image_part("https://example.com/a.png"),
        ]);
        let value = serde_json::to_value(&content).unwrap();
        assert!(value.is_array());
        assert_eq!(value[1]["type"], "image_url");
    }

    #[test]
    fn test_tool_choice_variants() {
        let mode: ToolChoice = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(serde_json::to_string(&mode).unwrap(), "\"auto\"");

        let named: ToolChoice =
            serde_json::from_value(json!({"type": "function", "function": {"name": "f"}}))
                .unwrap();
        assert!(matches!(named, ToolChoice::Named(ref n) if n.function.name == "f"));
    }

    #[test]
    fn test_validate_requires_model() {
        let request = InternalRequest::default();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_both_messages_and_input() {
        let request = InternalRequest {
            model: "m".into(),
            messages: vec![Message {
                role: "user".into(),
                content: Some(MessageContent::text("hi")),
                ..Default::default()
            }],
            embedding_input: Some(EmbeddingInput::Single("hi".into())),
            ..Default::default()
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_neither() {
        let request = InternalRequest {
            model: "m".into(),
            ..Default::default()
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_chat_and_embedding() {
        let chat = InternalRequest {
            model: "m".into(),
            messages: vec![Message {
                role: "user".into(),
                content: Some(MessageContent::text("hi")),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(chat.validate().is_ok());

        let embedding = InternalRequest {
            model: "m".into(),
            embedding_input: Some(EmbeddingInput::Single("hi".into())),
            ..Default::default()
        };
        assert!(embedding.validate().is_ok());
    }

    #[test]
    fn test_help_fields_not_serialized() {
        let mut request = InternalRequest {
            model: "m".into(),
            messages: vec![Message {
                role: "user".into(),
                content: Some(MessageContent::text("hi")),
                reasoning_content: Some("thinking".into()),
                ..Default::default()
            }],
            reasoning_budget: Some(4096),
            ..Default::default()
        };
        request
            .transformer_metadata
            .insert("hint".into(), "x".into());
        request.query.push(("beta".into(), "true".into()));

        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("reasoning_budget").is_none());
        assert!(value.get("transformer_metadata").is_none());
        assert!(value.get("query").is_none());
        // reasoning_content is serialized until cleared
        assert_eq!(value["messages"][0]["reasoning_content"], "thinking");

        request.clear_help_fields();
        let value = serde_json::to_value(&request).unwrap();
        assert!(value["messages"][0].get("reasoning_content").is_none());
    }

    #[test]
    fn test_tool_call_index_zero_serialized() {
        let call = ToolCall {
            id: "call_1".into(),
            kind: "function".into(),
            function: FunctionCall {
                name: "f".into(),
                arguments: "{}".into(),
            },
            index: 0,
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["index"], 0);
    }

    #[test]
    fn test_image_generation_tool_not_serialized() {
        let tool = Tool {
            kind: "image_generation".into(),
            image_generation: Some(ImageGeneration::default()),
            ..Default::default()
        };
        let value = serde_json::to_value(&tool).unwrap();
        assert!(value.get("image_generation").is_none());
    }

    #[test]
    fn test_done_sentinel() {
        let done = InternalResponse::done();
        assert!(done.is_done());
        assert!(!InternalResponse::default().is_done());
    }

    #[test]
    fn test_all_text_gathers_fragments() {
        let request = InternalRequest {
            model: "m".into(),
            messages: vec![
                Message {
                    role: "user".into(),
                    content: Some(MessageContent::text("one ")),
                    ..Default::default()
                },
                Message {
                    role: "user".into(),
                    content: Some(MessageContent::Parts(vec![
                        ContentPart::text_part("two"),
                        ContentPart::image_part("data:image/png;base64,xxx"),
                    ])),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(request.all_text(), "one two");
    }
}
