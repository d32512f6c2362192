//! Outbound codecs: internal format ⇄ upstream provider wire format.
//!
//! An outbound codec synthesizes the upstream HTTP request (body, headers,
//! URL, auth) and parses the upstream response or SSE stream back into the
//! internal representation. Stream decoders are stateful across events.

mod anthropic;
mod gemini;
mod openai_chat;
mod openai_embeddings;
mod openai_responses;
mod volcengine;

pub use anthropic::AnthropicOutbound;
pub use gemini::GeminiOutbound;
pub use openai_chat::OpenAiChatOutbound;
pub use openai_embeddings::OpenAiEmbeddingOutbound;
pub use openai_responses::OpenAiResponsesOutbound;
pub use volcengine::VolcengineOutbound;

use crate::core::error::Result;
use crate::store::entities::ProviderKind;
use crate::transformer::internal::{InternalRequest, InternalResponse};

/// A synthesized upstream request, ready for the HTTP client. Always POST.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Provider-facing codec. One instance per attempt.
pub trait Outbound: Send {
    /// Build the upstream request: body in the provider's format, auth and
    /// provider-specific headers, URL with path suffix and query
    /// pass-through. Strips internal bookkeeping fields from the body.
    fn encode_request(
        &mut self,
        request: &mut InternalRequest,
        base_url: &str,
        key: &str,
    ) -> Result<UpstreamRequest>;

    /// Parse a non-stream upstream response body.
    fn decode_response(&mut self, status: u16, body: &[u8]) -> Result<InternalResponse>;

    /// Parse one raw SSE event payload into an internal-format delta.
    /// Returns `None` for events with no internal representation; returns
    /// the `[DONE]` sentinel at stream end. Stateful across calls.
    fn decode_stream_event(&mut self, event: &[u8]) -> Result<Option<InternalResponse>>;
}

/// Fresh per-attempt codec instance for a channel's provider kind.
pub fn create(kind: ProviderKind) -> Box<dyn Outbound> {
    match kind {
        ProviderKind::OpenAiChat => Box::new(OpenAiChatOutbound::default()),
        ProviderKind::OpenAiResponse => Box::new(OpenAiResponsesOutbound::default()),
        ProviderKind::OpenAiEmbedding => Box::new(OpenAiEmbeddingOutbound::default()),
        ProviderKind::Anthropic => Box::new(AnthropicOutbound::default()),
        ProviderKind::Gemini => Box::new(GeminiOutbound::default()),
        ProviderKind::Volcengine => Box::new(VolcengineOutbound::default()),
    }
}

/// Join a base URL and a path suffix, tolerating trailing slashes.
pub(crate) fn join_url(base_url: &str, suffix: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), suffix)
}

/// Append the client's original query parameters to a URL.
pub(crate) fn append_query(url: &mut String, query: &[(String, String)]) {
    if query.is_empty() {
        return;
    }
    let mut first = !url.contains('?');
    for (key, value) in query {
        url.push(if first { '?' } else { '&' });
        first = false;
        url.push_str(&urlencode(key));
        url.push('=');
        url.push_str(&urlencode(value));
    }
}

pub(crate) fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
