//! OpenAI Chat Completions outbound codec.
//!
//! The internal format is this wire format, so encoding is mostly
//! passthrough: help fields are stripped, the `developer` role is rewritten
//! to `system`, and streaming forces `stream_options.include_usage` so the
//! final chunk carries usage.

use crate::core::error::{AppError, Result};
use crate::transformer::internal::{
    ErrorDetail, InternalRequest, InternalResponse, StreamOptions,
};
use crate::transformer::outbound::{join_url, Outbound, UpstreamRequest};

#[derive(Default)]
pub struct OpenAiChatOutbound;

impl Outbound for OpenAiChatOutbound {
    fn encode_request(
        &mut self,
        request: &mut InternalRequest,
        base_url: &str,
        key: &str,
    ) -> Result<UpstreamRequest> {
        request.clear_help_fields();

        for msg in &mut request.messages {
            if msg.role == "developer" {
                msg.role = "system".to_string();
            }
        }

        if request.is_streaming() {
            match &mut request.stream_options {
                Some(options) => options.include_usage = true,
                None => request.stream_options = Some(StreamOptions { include_usage: true }),
            }
        }

        let body = serde_json::to_vec(request)?;
        Ok(UpstreamRequest {
            url: join_url(base_url, "/chat/completions"),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), format!("Bearer {key}")),
            ],
            body,
        })
    }

    fn decode_response(&mut self, _status: u16, body: &[u8]) -> Result<InternalResponse> {
        if body.is_empty() {
            return Err(AppError::Internal("response body is empty".to_string()));
        }
        let response: InternalResponse = serde_json::from_slice(body)?;
        Ok(response)
    }

    fn decode_stream_event(&mut self, event: &[u8]) -> Result<Option<InternalResponse>> {
        if event.starts_with(b"[DONE]") {
            return Ok(Some(InternalResponse::done()));
        }

        // Some upstreams surface errors as a bare error payload mid-stream.
        #[derive(serde::Deserialize)]
        struct ErrorCheck {
            error: Option<ErrorDetail>,
        }
        if let Ok(check) = serde_json::from_slice::<ErrorCheck>(event) {
            if let Some(detail) = check.error {
                return Err(detail.into_app_error(502));
            }
        }

        let response: InternalResponse = serde_json::from_slice(event)?;
        Ok(Some(response))
    }
}
