//! OpenAI Embeddings outbound codec. Non-streaming only.

use serde::Deserialize;
use serde_json::json;

use crate::core::error::{AppError, Result};
use crate::transformer::internal::{EmbeddingObject, InternalRequest, InternalResponse, Usage};
use crate::transformer::outbound::{join_url, Outbound, UpstreamRequest};

#[derive(Default)]
pub struct OpenAiEmbeddingOutbound;

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    object: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    model: String,
    #[serde(default)]
    data: Vec<EmbeddingObject>,
    #[serde(default)]
    usage: Option<Usage>,
}

impl Outbound for OpenAiEmbeddingOutbound {
    fn encode_request(
        &mut self,
        request: &mut InternalRequest,
        base_url: &str,
        key: &str,
    ) -> Result<UpstreamRequest> {
        let Some(input) = &request.embedding_input else {
            return Err(AppError::InvalidRequest(
                "not an embedding request".to_string(),
            ));
        };
        if request.is_streaming() {
            return Err(AppError::InvalidRequest(
                "streaming not supported for embeddings".to_string(),
            ));
        }

        let mut body = json!({
            "model": request.model,
            "input": input,
        });
        if let Some(dimensions) = request.embedding_dimensions {
            body["dimensions"] = json!(dimensions);
        }
        if let Some(format) = &request.embedding_encoding_format {
            body["encoding_format"] = json!(format);
        }
        if let Some(user) = &request.user {
            body["user"] = json!(user);
        }

        Ok(UpstreamRequest {
            url: join_url(base_url, "/embeddings"),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), format!("Bearer {key}")),
            ],
            body: serde_json::to_vec(&body)?,
        })
    }

    fn decode_response(&mut self, _status: u16, body: &[u8]) -> Result<InternalResponse> {
        if body.is_empty() {
            return Err(AppError::Internal("response body is empty".to_string()));
        }
        let resp: EmbeddingResponse = serde_json::from_slice(body)?;
        Ok(InternalResponse {
            id: resp.id,
            object: resp.object,
            created: resp.created,
            model: resp.model,
            embedding_data: resp.data,
            usage: resp.usage,
            ..Default::default()
        })
    }

    fn decode_stream_event(&mut self, _event: &[u8]) -> Result<Option<InternalResponse>> {
        Err(AppError::InvalidRequest(
            "streaming not supported for embeddings".to_string(),
        ))
    }
}
