//! Transformer layer: bidirectional codecs between the internal normalized
//! LLM request/response and each provider's wire format.
//!
//! ```text
//! client body ──inbound.decode_request──▶ InternalRequest
//!     InternalRequest ──outbound.encode_request──▶ upstream HTTP request
//!     upstream response ──outbound.decode_response──▶ InternalResponse
//! InternalResponse ──inbound.encode_response──▶ client body
//! ```
//!
//! Streaming follows the same path per SSE event, through the stateful
//! `decode_stream_event` / `encode_stream_event` hooks.

pub mod aggregate;
pub mod anthropic;
pub mod dataurl;
pub mod gemini;
pub mod inbound;
pub mod internal;
pub mod outbound;
pub mod responses;

pub use inbound::{Inbound, InboundKind};
pub use internal::{InternalRequest, InternalResponse};
pub use outbound::{Outbound, UpstreamRequest};
