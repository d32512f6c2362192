//! Volcengine Responses outbound codec.
//!
//! Wraps the OpenAI Responses request with Volcengine quirks: `metadata` is
//! not supported and is stripped, `reasoning` only survives for an explicit
//! model allow-list, a top-level `thinking.type` is derived from the
//! reasoning effort, and a trailing assistant input item is marked
//! `partial: true` for continuation.

use serde_json::{json, Value};

use crate::core::error::{AppError, Result};
use crate::transformer::internal::{InternalRequest, InternalResponse};
use crate::transformer::outbound::openai_responses::build_responses_request;
use crate::transformer::outbound::{join_url, OpenAiResponsesOutbound, Outbound, UpstreamRequest};

/// Models that accept the `reasoning` field.
const REASONING_EFFORT_MODELS: &[&str] = &[
    "doubao-seed-1-8-251228",
    "doubao-seed-1-6-lite-251015",
    "doubao-seed-1-6-251015",
];

#[derive(Default)]
pub struct VolcengineOutbound {
    inner: OpenAiResponsesOutbound,
}

impl Outbound for VolcengineOutbound {
    fn encode_request(
        &mut self,
        request: &mut InternalRequest,
        base_url: &str,
        key: &str,
    ) -> Result<UpstreamRequest> {
        let responses_request = build_responses_request(request);
        let mut body = serde_json::to_value(&responses_request)?;

        let obj = body
            .as_object_mut()
            .ok_or_else(|| AppError::Internal("request body is not an object".to_string()))?;
        obj.remove("metadata");
        if !REASONING_EFFORT_MODELS.contains(&request.model.as_str()) {
            obj.remove("reasoning");
        }

        match request.reasoning_effort.as_str() {
            "minimal" => {
                obj.insert("thinking".to_string(), json!({"type": "disabled"}));
            }
            "low" | "medium" | "high" => {
                obj.insert("thinking".to_string(), json!({"type": "enabled"}));
            }
            _ => {}
        }

        if let Some(items) = obj.get_mut("input").and_then(Value::as_array_mut) {
            if let Some(last) = items.last_mut() {
                if last.get("role").and_then(Value::as_str) == Some("assistant") {
                    last["partial"] = json!(true);
                }
            }
        }

        Ok(UpstreamRequest {
            url: join_url(base_url, "/responses"),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), format!("Bearer {key}")),
            ],
            body: serde_json::to_vec(&body)?,
        })
    }

    fn decode_response(&mut self, status: u16, body: &[u8]) -> Result<InternalResponse> {
        self.inner.decode_response(status, body)
    }

    fn decode_stream_event(&mut self, event: &[u8]) -> Result<Option<InternalResponse>> {
        self.inner.decode_stream_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::internal::{Message, MessageContent};

    fn encode(request: &mut InternalRequest) -> (UpstreamRequest, Value) {
        let mut codec = VolcengineOutbound::default();
        let upstream = codec
            .encode_request(request, "https://ark.cn-beijing.volces.com/api/v3", "k")
            .unwrap();
        let body = serde_json::from_slice(&upstream.body).unwrap();
        (upstream, body)
    }

    fn multi_turn(model: &str) -> InternalRequest {
        InternalRequest {
            model: model.into(),
            messages: vec![
                Message {
                    role: "user".into(),
                    content: Some(MessageContent::text("q")),
                    ..Default::default()
                },
                Message {
                    role: "assistant".into(),
                    content: Some(MessageContent::text("partial answer")),
                    ..Default::default()
                },
            ],
            metadata: [("k".to_string(), "v".to_string())].into_iter().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_metadata_stripped_and_url() {
        let mut request = multi_turn("doubao-pro");
        let (upstream, body) = encode(&mut request);
        assert_eq!(
            upstream.url,
            "https://ark.cn-beijing.volces.com/api/v3/responses"
        );
        assert!(body.get("metadata").is_none());
    }

    #[test]
    fn test_reasoning_dropped_unless_allow_listed() {
        let mut request = multi_turn("doubao-pro");
        request.reasoning_effort = "high".into();
        let (_, body) = encode(&mut request);
        assert!(body.get("reasoning").is_none());
        assert_eq!(body["thinking"]["type"], "enabled");

        let mut request = multi_turn("doubao-seed-1-6-251015");
        request.reasoning_effort = "high".into();
        let (_, body) = encode(&mut request);
        assert_eq!(body["reasoning"]["effort"], "high");
    }

    #[test]
    fn test_thinking_type_from_effort() {
        let mut request = multi_turn("doubao-pro");
        request.reasoning_effort = "minimal".into();
        let (_, body) = encode(&mut request);
        assert_eq!(body["thinking"]["type"], "disabled");

        let mut request = multi_turn("doubao-pro");
        let (_, body) = encode(&mut request);
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn test_trailing_assistant_marked_partial() {
        let mut request = multi_turn("doubao-pro");
        let (_, body) = encode(&mut request);
        let items = body["input"].as_array().unwrap();
        assert_eq!(items.last().unwrap()["partial"], true);
        assert!(items[0].get("partial").is_none());
    }
}
