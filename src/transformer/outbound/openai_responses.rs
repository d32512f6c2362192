//! OpenAI Responses outbound codec.
//!
//! Lowers the internal chat shape onto the Responses API: system messages
//! become `instructions`, the conversation becomes the `input` item list
//! (with the single-user-text shortcut), and streamed per-item lifecycle
//! events are folded back into internal chat chunks.

use serde::Deserialize;

use crate::core::error::{AppError, Result};
use crate::transformer::internal::{
    self, CompletionTokensDetails, ErrorDetail, InternalRequest, InternalResponse,
    MessageContent, PromptTokensDetails, ToolChoice, Usage,
};
use crate::transformer::outbound::{join_url, Outbound, UpstreamRequest};
use crate::transformer::responses::*;

#[derive(Default)]
pub struct OpenAiResponsesOutbound {
    stream_id: String,
    stream_model: String,
}

impl Outbound for OpenAiResponsesOutbound {
    fn encode_request(
        &mut self,
        request: &mut InternalRequest,
        base_url: &str,
        key: &str,
    ) -> Result<UpstreamRequest> {
        let responses_request = build_responses_request(request);
        let body = serde_json::to_vec(&responses_request)?;

        Ok(UpstreamRequest {
            url: join_url(base_url, "/responses"),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), format!("Bearer {key}")),
            ],
            body,
        })
    }

    fn decode_response(&mut self, status: u16, body: &[u8]) -> Result<InternalResponse> {
        if body.is_empty() {
            return Err(AppError::Internal("response body is empty".to_string()));
        }

        if status >= 400 {
            #[derive(Deserialize)]
            struct ErrorEnvelope {
                error: Option<ErrorDetail>,
            }
            if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body) {
                if let Some(detail) = envelope.error {
                    if !detail.message.is_empty() {
                        return Err(detail.into_app_error(status));
                    }
                }
            }
            return Err(AppError::Upstream {
                status,
                code: String::new(),
                error_type: String::new(),
                message: String::from_utf8_lossy(body).into_owned(),
            });
        }

        let response: ResponsesResponse = serde_json::from_slice(body)?;
        Ok(decode_responses_response(&response))
    }

    fn decode_stream_event(&mut self, event: &[u8]) -> Result<Option<InternalResponse>> {
        if event.is_empty() {
            return Ok(None);
        }
        if event.starts_with(b"[DONE]") {
            return Ok(Some(InternalResponse::done()));
        }

        let stream_event: ResponsesStreamEvent = serde_json::from_slice(event)?;
        let mut resp = InternalResponse {
            id: self.stream_id.clone(),
            model: self.stream_model.clone(),
            object: "chat.completion.chunk".to_string(),
            ..Default::default()
        };

        match stream_event.kind.as_str() {
            "response.created" | "response.in_progress" => {
                if let Some(response) = &stream_event.response {
                    self.stream_id = response.id.clone();
                    self.stream_model = response.model.clone();
                    resp.id = self.stream_id.clone();
                    resp.model = self.stream_model.clone();
                }
                resp.choices = vec![delta_choice(internal::Message {
                    role: "assistant".to_string(),
                    ..Default::default()
                })];
            }

            "response.output_text.delta" => {
                resp.choices = vec![delta_choice(internal::Message {
                    role: "assistant".to_string(),
                    content: Some(MessageContent::text(stream_event.delta.clone())),
                    ..Default::default()
                })];
            }

            "response.reasoning_summary_text.delta" => {
                resp.choices = vec![delta_choice(internal::Message {
                    role: "assistant".to_string(),
                    reasoning_content: Some(stream_event.delta.clone()),
                    ..Default::default()
                })];
            }

            "response.function_call_arguments.delta" => {
                resp.choices = vec![delta_choice(internal::Message {
                    role: "assistant".to_string(),
                    tool_calls: vec![internal::ToolCall {
                        index: stream_event.output_index.unwrap_or(0),
                        id: stream_event.call_id.clone(),
                        kind: "function".to_string(),
                        function: internal::FunctionCall {
                            name: stream_event.name.clone(),
                            arguments: stream_event.delta.clone(),
                        },
                    }],
                    ..Default::default()
                })];
            }

            "response.output_item.added" => {
                let Some(item) = &stream_event.item else { return Ok(None) };
                if item.kind != "function_call" {
                    return Ok(None);
                }
                resp.choices = vec![delta_choice(internal::Message {
                    role: "assistant".to_string(),
                    tool_calls: vec![internal::ToolCall {
                        index: stream_event.output_index.unwrap_or(0),
                        id: item.call_id.clone(),
                        kind: "function".to_string(),
                        function: internal::FunctionCall {
                            name: item.name.clone(),
                            arguments: String::new(),
                        },
                    }],
                    ..Default::default()
                })];
            }

            "response.completed" => {
                let Some(response) = &stream_event.response else {
                    return Ok(None);
                };
                let finish_reason = response.status.as_deref().and_then(|s| match s {
                    "completed" => Some("stop"),
                    "incomplete" => Some("length"),
                    "failed" => Some("error"),
                    _ => None,
                });
                resp.choices = vec![internal::Choice {
                    index: 0,
                    finish_reason: finish_reason.map(|r| r.to_string()),
                    ..Default::default()
                }];
                resp.usage = response.usage.as_ref().map(decode_responses_usage);
            }

            "response.failed" | "response.incomplete" | "error" => {
                resp.choices = vec![internal::Choice {
                    index: 0,
                    finish_reason: Some("error".to_string()),
                    ..Default::default()
                }];
            }

            _ => return Ok(None),
        }

        Ok(Some(resp))
    }
}

fn delta_choice(message: internal::Message) -> internal::Choice {
    internal::Choice {
        index: 0,
        delta: Some(message),
        ..Default::default()
    }
}

// ============================================================================
// Request building (shared with the Volcengine wrapper)
// ============================================================================

pub fn build_responses_request(request: &mut InternalRequest) -> ResponsesRequest {
    request.clear_help_fields();

    let mut result = ResponsesRequest {
        model: request.model.clone(),
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
        store: request.store,
        service_tier: request.service_tier.clone(),
        user: request.user.clone(),
        metadata: request.metadata.clone(),
        max_output_tokens: request.max_completion_tokens.or(request.max_tokens),
        parallel_tool_calls: request.parallel_tool_calls,
        ..Default::default()
    };

    result.instructions = collect_instructions(request);
    result.input = build_input(request);

    for tool in &request.tools {
        match tool.kind.as_str() {
            "function" => result.tools.push(ResponsesTool {
                kind: "function".to_string(),
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                parameters: Some(tool.function.parameters.clone()),
                strict: tool.function.strict,
                ..Default::default()
            }),
            "image_generation" => {
                let mut entry = ResponsesTool {
                    kind: "image_generation".to_string(),
                    ..Default::default()
                };
                if let Some(generation) = &tool.image_generation {
                    entry.background = generation.background.clone();
                    entry.output_format = generation.output_format.clone();
                    entry.quality = generation.quality.clone();
                    entry.size = generation.size.clone();
                    entry.output_compression = generation.output_compression;
                }
                result.tools.push(entry);
            }
            _ => {}
        }
    }

    if let Some(tool_choice) = &request.tool_choice {
        result.tool_choice = Some(match tool_choice {
            ToolChoice::Mode(mode) => ResponsesToolChoice::Mode(mode.clone()),
            ToolChoice::Named(named) => ResponsesToolChoice::Named {
                kind: named.kind.clone(),
                name: named.function.name.clone(),
            },
        });
    }

    if let Some(format) = &request.response_format {
        result.text = Some(ResponsesTextOptions {
            format: Some(ResponsesTextFormat {
                kind: format.kind.clone(),
                ..Default::default()
            }),
            verbosity: None,
        });
    }

    if !request.reasoning_effort.is_empty() || request.reasoning_budget.is_some() {
        result.reasoning = Some(ResponsesReasoning {
            effort: request.reasoning_effort.clone(),
            max_tokens: None,
        });
    }

    result
}

fn collect_instructions(request: &InternalRequest) -> String {
    let mut instructions = Vec::new();
    for msg in &request.messages {
        if msg.role != "system" && msg.role != "developer" {
            continue;
        }
        if let Some(content) = &msg.content {
            let text = content.all_text();
            if !text.is_empty() {
                instructions.push(text);
            }
        }
    }
    instructions.join("\n")
}

fn build_input(request: &InternalRequest) -> ResponsesInput {
    let conversational: Vec<&internal::Message> = request
        .messages
        .iter()
        .filter(|m| m.role != "system" && m.role != "developer")
        .collect();

    // Single plain user message keeps the compact string shape.
    if conversational.len() == 1 && conversational[0].role == "user" {
        if let Some(MessageContent::Text(text)) = &conversational[0].content {
            return ResponsesInput::Text(text.clone());
        }
    }

    let mut items = Vec::new();
    for msg in conversational {
        match msg.role.as_str() {
            "user" => items.push(user_item(msg)),
            "assistant" => items.extend(assistant_items(msg)),
            "tool" => items.push(tool_output_item(msg)),
            _ => {}
        }
    }
    ResponsesInput::Items(items)
}

fn user_item(msg: &internal::Message) -> ResponsesItem {
    let mut content_items = Vec::new();
    match &msg.content {
        Some(MessageContent::Text(text)) => content_items.push(ResponsesItem {
            kind: "input_text".to_string(),
            text: Some(text.clone()),
            ..Default::default()
        }),
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                match part.kind.as_str() {
                    "text" => {
                        if let Some(text) = &part.text {
                            content_items.push(ResponsesItem {
                                kind: "input_text".to_string(),
                                text: Some(text.clone()),
                                ..Default::default()
                            });
                        }
                    }
                    "image_url" => {
                        if let Some(image) = &part.image_url {
                            content_items.push(ResponsesItem {
                                kind: "input_image".to_string(),
                                image_url: Some(image.url.clone()),
                                detail: image.detail.clone(),
                                ..Default::default()
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        None => {}
    }

    ResponsesItem {
        role: msg.role.clone(),
        content: Some(Box::new(ResponsesInput::Items(content_items))),
        ..Default::default()
    }
}

fn assistant_items(msg: &internal::Message) -> Vec<ResponsesItem> {
    let mut items = Vec::new();

    for tool_call in &msg.tool_calls {
        items.push(ResponsesItem {
            kind: "function_call".to_string(),
            call_id: tool_call.id.clone(),
            name: tool_call.function.name.clone(),
            arguments: tool_call.function.arguments.clone(),
            ..Default::default()
        });
    }

    let mut content_items = Vec::new();
    match &msg.content {
        Some(MessageContent::Text(text)) => content_items.push(ResponsesItem {
            kind: "output_text".to_string(),
            text: Some(text.clone()),
            ..Default::default()
        }),
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                if part.kind == "text" {
                    if let Some(text) = &part.text {
                        content_items.push(ResponsesItem {
                            kind: "output_text".to_string(),
                            text: Some(text.clone()),
                            ..Default::default()
                        });
                    }
                }
            }
        }
        None => {}
    }

    if !content_items.is_empty() {
        items.push(ResponsesItem {
            kind: "message".to_string(),
            role: msg.role.clone(),
            status: Some("completed".to_string()),
            content: Some(Box::new(ResponsesInput::Items(content_items))),
            ..Default::default()
        });
    }

    items
}

fn tool_output_item(msg: &internal::Message) -> ResponsesItem {
    let output = match &msg.content {
        Some(MessageContent::Text(text)) => ResponsesInput::Text(text.clone()),
        Some(MessageContent::Parts(parts)) => {
            let items: Vec<ResponsesItem> = parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.clone())
                .map(|text| ResponsesItem {
                    kind: "input_text".to_string(),
                    text: Some(text),
                    ..Default::default()
                })
                .collect();
            if items.is_empty() {
                ResponsesInput::Text(String::new())
            } else {
                ResponsesInput::Items(items)
            }
        }
        None => ResponsesInput::Text(String::new()),
    };

    ResponsesItem {
        kind: "function_call_output".to_string(),
        call_id: msg.tool_call_id.clone().unwrap_or_default(),
        output: Some(Box::new(output)),
        ..Default::default()
    }
}

// ============================================================================
// Response decoding
// ============================================================================

fn decode_responses_response(resp: &ResponsesResponse) -> InternalResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    let mut image_parts: Vec<internal::ContentPart> = Vec::new();

    for item in &resp.output {
        match item.kind.as_str() {
            "message" => {
                if let Some(content) = &item.content {
                    for inner in content.items() {
                        if inner.kind == "output_text" {
                            if let Some(t) = &inner.text {
                                text.push_str(t);
                            }
                        }
                    }
                }
            }
            "output_text" => {
                if let Some(t) = &item.text {
                    text.push_str(t);
                }
            }
            "function_call" => {
                tool_calls.push(internal::ToolCall {
                    id: item.call_id.clone(),
                    kind: "function".to_string(),
                    index: tool_calls.len() as i64,
                    function: internal::FunctionCall {
                        name: item.name.clone(),
                        arguments: item.arguments.clone(),
                    },
                });
            }
            "reasoning" => {
                for summary in &item.summary {
                    reasoning.push_str(&summary.text);
                }
            }
            "image_generation_call" => {
                if let Some(result) = &item.result {
                    if !result.is_empty() {
                        let format = item.output_format.as_deref().unwrap_or("png");
                        image_parts.push(internal::ContentPart::image_part(format!(
                            "data:image/{format};base64,{result}"
                        )));
                    }
                }
            }
            _ => {}
        }
    }

    let mut message = internal::Message {
        role: "assistant".to_string(),
        tool_calls: tool_calls.clone(),
        ..Default::default()
    };
    if !reasoning.is_empty() {
        message.reasoning_content = Some(reasoning);
    }
    message.content = if !text.is_empty() && !image_parts.is_empty() {
        let mut parts = vec![internal::ContentPart::text_part(text)];
        parts.extend(image_parts);
        Some(MessageContent::Parts(parts))
    } else if !text.is_empty() {
        Some(MessageContent::Text(text))
    } else if !image_parts.is_empty() {
        Some(MessageContent::Parts(image_parts))
    } else {
        None
    };

    let finish_reason = if !tool_calls.is_empty() {
        Some("tool_calls".to_string())
    } else {
        resp.status.as_deref().and_then(|s| match s {
            "completed" => Some("stop".to_string()),
            "failed" => Some("error".to_string()),
            "incomplete" => Some("length".to_string()),
            _ => None,
        })
    };

    InternalResponse {
        id: resp.id.clone(),
        object: "chat.completion".to_string(),
        model: resp.model.clone(),
        created: resp.created_at,
        choices: vec![internal::Choice {
            index: 0,
            message: Some(message),
            finish_reason,
            ..Default::default()
        }],
        usage: resp.usage.as_ref().map(decode_responses_usage),
        ..Default::default()
    }
}

fn decode_responses_usage(usage: &ResponsesUsage) -> Usage {
    Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
        prompt_tokens_details: (usage.input_tokens_details.cached_tokens > 0).then(|| {
            PromptTokensDetails {
                cached_tokens: usage.input_tokens_details.cached_tokens,
                ..Default::default()
            }
        }),
        completion_tokens_details: (usage.output_tokens_details.reasoning_tokens > 0).then(
            || CompletionTokensDetails {
                reasoning_tokens: usage.output_tokens_details.reasoning_tokens,
                ..Default::default()
            },
        ),
        ..Default::default()
    }
}
