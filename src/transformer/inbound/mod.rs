//! Inbound codecs: client wire format ⇄ internal format.
//!
//! An inbound codec parses the client body into the internal request and
//! serializes internal responses (and stream deltas) back into the client's
//! format. Codec instances are per-request and stateful: stream encoders run
//! event state machines, and every codec stores what it emitted so the full
//! response can be recovered for telemetry.

mod anthropic;
mod openai_chat;
mod openai_embeddings;
mod openai_responses;

pub use anthropic::AnthropicInbound;
pub use openai_chat::OpenAiChatInbound;
pub use openai_embeddings::OpenAiEmbeddingInbound;
pub use openai_responses::OpenAiResponsesInbound;

use crate::core::error::Result;
use crate::transformer::internal::{InternalRequest, InternalResponse};

/// Client-facing codec. One instance per request.
pub trait Inbound: Send {
    /// Parse the client body into the internal request, storing any
    /// format-preserving hints in `transformer_metadata`.
    fn decode_request(&mut self, body: &[u8]) -> Result<InternalRequest>;

    /// Serialize a complete internal response into the client format,
    /// keeping it for later telemetry retrieval.
    fn encode_response(&mut self, response: InternalResponse) -> Result<Vec<u8>>;

    /// Feed one internal stream delta; returns zero or more framed SSE
    /// events. Stateful across calls.
    fn encode_stream_event(&mut self, chunk: InternalResponse) -> Result<Option<Vec<u8>>>;

    /// The complete response at terminal time: the stored non-stream
    /// response, or the aggregation of every stream chunk seen.
    fn internal_response(&mut self) -> Option<InternalResponse>;
}

/// Client-facing wire formats the gateway accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    OpenAiChat,
    OpenAiResponse,
    OpenAiEmbedding,
    Anthropic,
}

impl InboundKind {
    /// Fresh per-request codec instance.
    pub fn create(self) -> Box<dyn Inbound> {
        match self {
            InboundKind::OpenAiChat => Box::new(OpenAiChatInbound::default()),
            InboundKind::OpenAiResponse => Box::new(OpenAiResponsesInbound::default()),
            InboundKind::OpenAiEmbedding => Box::new(OpenAiEmbeddingInbound::default()),
            InboundKind::Anthropic => Box::new(AnthropicInbound::default()),
        }
    }
}

/// Frame an SSE data-only event.
pub(crate) fn format_sse_data(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\n\n");
    out
}

/// Frame a named SSE event.
pub(crate) fn format_sse_event(event: &str, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(event.len() + data.len() + 16);
    out.extend_from_slice(b"event:");
    out.extend_from_slice(event.as_bytes());
    out.extend_from_slice(b"\ndata:");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\n\n");
    out
}
