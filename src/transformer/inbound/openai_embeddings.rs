//! OpenAI Embeddings inbound codec. Non-streaming only.

use serde::{Deserialize, Serialize};

use crate::core::error::{AppError, Result};
use crate::transformer::inbound::Inbound;
use crate::transformer::internal::{
    ApiFormat, EmbeddingInput, EmbeddingObject, InternalRequest, InternalResponse, Usage,
};

#[derive(Debug, Deserialize)]
struct EmbeddingRequest {
    model: String,
    input: EmbeddingInput,
    #[serde(default)]
    dimensions: Option<i64>,
    #[serde(default)]
    encoding_format: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingResponse<'a> {
    id: &'a str,
    object: &'a str,
    created: i64,
    model: &'a str,
    data: &'a [EmbeddingObject],
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: &'a Option<Usage>,
}

#[derive(Default)]
pub struct OpenAiEmbeddingInbound {
    stored_response: Option<InternalResponse>,
}

impl Inbound for OpenAiEmbeddingInbound {
    fn decode_request(&mut self, body: &[u8]) -> Result<InternalRequest> {
        let req: EmbeddingRequest = serde_json::from_slice(body)
            .map_err(|e| AppError::InvalidRequest(e.to_string()))?;

        Ok(InternalRequest {
            model: req.model,
            embedding_input: Some(req.input),
            embedding_dimensions: req.dimensions,
            embedding_encoding_format: req.encoding_format,
            user: req.user,
            raw_api_format: ApiFormat::OpenAiEmbedding,
            ..Default::default()
        })
    }

    fn encode_response(&mut self, response: InternalResponse) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(&EmbeddingResponse {
            id: &response.id,
            object: &response.object,
            created: response.created,
            model: &response.model,
            data: &response.embedding_data,
            usage: &response.usage,
        })?;
        self.stored_response = Some(response);
        Ok(body)
    }

    fn encode_stream_event(&mut self, _chunk: InternalResponse) -> Result<Option<Vec<u8>>> {
        Err(AppError::InvalidRequest(
            "streaming not supported for embeddings".to_string(),
        ))
    }

    fn internal_response(&mut self) -> Option<InternalResponse> {
        self.stored_response.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::internal::Embedding;

    #[test]
    fn test_decode_single_input() {
        let mut codec = OpenAiEmbeddingInbound::default();
        let request = codec
            .decode_request(br#"{"model":"text-embedding-3-small","input":"hello"}"#)
            .unwrap();
        assert!(request.is_embedding_request());
        assert!(!request.is_chat_request());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_decode_multi_input_with_options() {
        let mut codec = OpenAiEmbeddingInbound::default();
        let request = codec
            .decode_request(
                br#"{"model":"text-embedding-3-small","input":["a","b"],"dimensions":256,"encoding_format":"base64"}"#,
            )
            .unwrap();
        assert_eq!(request.embedding_dimensions, Some(256));
        assert_eq!(request.embedding_encoding_format.as_deref(), Some("base64"));
    }

    #[test]
    fn test_encode_response_uses_data_field() {
        let mut codec = OpenAiEmbeddingInbound::default();
        let response = InternalResponse {
            id: "emb_1".into(),
            object: "list".into(),
            model: "text-embedding-3-small".into(),
            embedding_data: vec![EmbeddingObject {
                object: "embedding".into(),
                index: 0,
                embedding: Embedding::Floats(vec![0.1, 0.2]),
            }],
            ..Default::default()
        };
        let body = codec.encode_response(response).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["data"][0]["embedding"][0], 0.1);
        assert!(value.get("embedding_data").is_none());
    }

    #[test]
    fn test_stream_is_rejected() {
        let mut codec = OpenAiEmbeddingInbound::default();
        assert!(codec.encode_stream_event(InternalResponse::done()).is_err());
    }
}
