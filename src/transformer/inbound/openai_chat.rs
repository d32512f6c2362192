//! OpenAI Chat Completions inbound codec.
//!
//! The internal format is based on this wire format, so decoding and
//! encoding are transparent passthrough.

use serde_json::json;

use crate::core::error::{AppError, Result};
use crate::transformer::aggregate::aggregate_chunks;
use crate::transformer::inbound::{format_sse_data, Inbound};
use crate::transformer::internal::{ApiFormat, InternalRequest, InternalResponse};

#[derive(Default)]
pub struct OpenAiChatInbound {
    stream_chunks: Vec<InternalResponse>,
    stored_response: Option<InternalResponse>,
}

impl Inbound for OpenAiChatInbound {
    fn decode_request(&mut self, body: &[u8]) -> Result<InternalRequest> {
        let mut request: InternalRequest = serde_json::from_slice(body)
            .map_err(|e| AppError::InvalidRequest(e.to_string()))?;
        request.raw_api_format = ApiFormat::OpenAiChat;
        Ok(request)
    }

    fn encode_response(&mut self, response: InternalResponse) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(&response)?;
        self.stored_response = Some(response);
        Ok(body)
    }

    fn encode_stream_event(&mut self, chunk: InternalResponse) -> Result<Option<Vec<u8>>> {
        if chunk.is_done() {
            return Ok(Some(b"data: [DONE]\n\n".to_vec()));
        }

        let body = if chunk.choices.is_empty() && chunk.object == "chat.completion.chunk" {
            // Some clients require `choices` to be present even when empty.
            let mut value = serde_json::to_value(&chunk)?;
            value["choices"] = json!([]);
            serde_json::to_vec(&value)?
        } else {
            serde_json::to_vec(&chunk)?
        };

        self.stream_chunks.push(chunk);
        Ok(Some(format_sse_data(&body)))
    }

    fn internal_response(&mut self) -> Option<InternalResponse> {
        if let Some(stored) = self.stored_response.take() {
            return Some(stored);
        }
        let result = aggregate_chunks(&self.stream_chunks);
        self.stream_chunks.clear();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::internal::{Choice, Message, MessageContent, Usage};

    #[test]
    fn test_decode_request_passthrough() {
        let body = br#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}],"max_tokens":32,"stream":true}"#;
        let mut codec = OpenAiChatInbound::default();
        let request = codec.decode_request(body).unwrap();
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.messages.len(), 1);
        assert!(request.is_streaming());
        assert_eq!(request.raw_api_format, ApiFormat::OpenAiChat);
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        let mut codec = OpenAiChatInbound::default();
        assert!(codec.decode_request(b"not json").is_err());
    }

    #[test]
    fn test_identity_roundtrip() {
        // decode ∘ encode is byte-for-byte stable for a well-formed request
        // with no help fields set.
        let body = br#"{"messages":[{"role":"user","content":"hi"}],"model":"gpt-4o-mini","max_tokens":32}"#;
        let mut codec = OpenAiChatInbound::default();
        let request = codec.decode_request(body).unwrap();
        let reencoded = serde_json::to_value(&request).unwrap();
        let original: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(reencoded, original);
    }

    #[test]
    fn test_encode_response_stores_for_telemetry() {
        let mut codec = OpenAiChatInbound::default();
        let response = InternalResponse {
            id: "chatcmpl-1".into(),
            object: "chat.completion".into(),
            model: "gpt-4o-mini".into(),
            choices: vec![Choice {
                index: 0,
                message: Some(Message {
                    role: "assistant".into(),
                    content: Some(MessageContent::text("hello")),
                    ..Default::default()
                }),
                finish_reason: Some("stop".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let body = codec.encode_response(response).unwrap();
        assert!(std::str::from_utf8(&body).unwrap().contains("chatcmpl-1"));

        let stored = codec.internal_response().unwrap();
        assert_eq!(stored.id, "chatcmpl-1");
    }

    #[test]
    fn test_stream_done_marker() {
        let mut codec = OpenAiChatInbound::default();
        let out = codec.encode_stream_event(InternalResponse::done()).unwrap();
        assert_eq!(out.unwrap(), b"data: [DONE]\n\n");
    }

    #[test]
    fn test_empty_choices_chunk_keeps_choices_field() {
        let mut codec = OpenAiChatInbound::default();
        let chunk = InternalResponse {
            id: "chatcmpl-1".into(),
            object: "chat.completion.chunk".into(),
            usage: Some(Usage::default()),
            ..Default::default()
        };
        let out = codec.encode_stream_event(chunk).unwrap().unwrap();
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.contains("\"choices\":[]"));
    }

    #[test]
    fn test_stream_aggregation() {
        let mut codec = OpenAiChatInbound::default();
        for text in ["Hel", "lo"] {
            let chunk = InternalResponse {
                id: "chatcmpl-1".into(),
                object: "chat.completion.chunk".into(),
                choices: vec![Choice {
                    index: 0,
                    delta: Some(Message {
                        role: "assistant".into(),
                        content: Some(MessageContent::text(text)),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            };
            codec.encode_stream_event(chunk).unwrap();
        }
        let full = codec.internal_response().unwrap();
        let message = full.choices[0].message.as_ref().unwrap();
        assert_eq!(message.content.as_ref().unwrap().as_text(), Some("Hello"));
    }
}
