//! OpenAI Responses inbound codec.
//!
//! Decodes `/v1/responses` bodies into the internal format and re-encodes
//! internal responses as Responses API objects. The stream encoder speaks
//! the numbered-sequence protocol: `response.created`/`response.in_progress`
//! first, per-item lifecycle events in between, `response.completed` last,
//! with a strictly increasing `sequence_number` on every event. A
//! `function_call` item is always opened before its argument deltas.

use std::collections::HashMap;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::core::error::{AppError, Result};
use crate::transformer::aggregate::aggregate_chunks;
use crate::transformer::dataurl::extract_base64;
use crate::transformer::inbound::{format_sse_data, Inbound};
use crate::transformer::internal::{
    self, ApiFormat, ContentPart, ImageUrl, InternalRequest, InternalResponse, MessageContent,
    ResponseFormat, ToolCall, ToolChoice, Usage,
};
use crate::transformer::responses::*;

#[derive(Default)]
pub struct OpenAiResponsesInbound {
    // Stream state
    has_response_created: bool,
    has_message_item_started: bool,
    has_reasoning_item_started: bool,
    has_content_part_started: bool,
    has_finished: bool,
    response_completed: bool,

    response_id: String,
    model: String,
    created_at: i64,

    output_index: i64,
    content_index: i64,
    sequence_number: i64,
    current_item_id: String,

    accumulated_text: String,
    accumulated_reasoning: String,

    tool_calls: HashMap<i64, ToolCall>,
    tool_call_item_started: HashMap<i64, bool>,
    tool_call_output_index: HashMap<i64, i64>,

    usage: Option<Usage>,

    stream_chunks: Vec<InternalResponse>,
    stored_response: Option<InternalResponse>,
}

impl Inbound for OpenAiResponsesInbound {
    fn decode_request(&mut self, body: &[u8]) -> Result<InternalRequest> {
        let req: ResponsesRequest = serde_json::from_slice(body)
            .map_err(|e| AppError::InvalidRequest(e.to_string()))?;
        if req.model.is_empty() {
            return Err(AppError::InvalidRequest("model is required".to_string()));
        }
        decode_responses_request(req)
    }

    fn encode_response(&mut self, response: InternalResponse) -> Result<Vec<u8>> {
        let encoded = encode_responses_response(&response);
        let body = serde_json::to_vec(&encoded)?;
        self.stored_response = Some(response);
        Ok(body)
    }

    fn encode_stream_event(&mut self, chunk: InternalResponse) -> Result<Option<Vec<u8>>> {
        if chunk.is_done() {
            return Ok(Some(b"data: [DONE]\n\n".to_vec()));
        }

        let mut events: Vec<Vec<u8>> = Vec::new();

        if self.response_id.is_empty() && !chunk.id.is_empty() {
            self.response_id = chunk.id.clone();
        }
        if self.model.is_empty() && !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }
        if self.created_at == 0 && chunk.created != 0 {
            self.created_at = chunk.created;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage.clone();
        }

        if !self.has_response_created {
            self.has_response_created = true;
            let response = self.response_shell("in_progress", None);
            self.emit(
                &mut events,
                ResponsesStreamEvent {
                    kind: "response.created".to_string(),
                    response: Some(response.clone()),
                    ..Default::default()
                },
            )?;
            self.emit(
                &mut events,
                ResponsesStreamEvent {
                    kind: "response.in_progress".to_string(),
                    response: Some(response),
                    ..Default::default()
                },
            )?;
        }

        let choice = chunk.choices.first().cloned();
        if let Some(choice) = &choice {
            if let Some(delta) = &choice.delta {
                let reasoning = delta.reasoning_text().to_string();
                if !reasoning.is_empty() {
                    self.handle_reasoning(&mut events, &reasoning)?;
                }

                let text = delta
                    .content
                    .as_ref()
                    .and_then(|c| c.as_text())
                    .unwrap_or("")
                    .to_string();
                if !text.is_empty() {
                    self.handle_text(&mut events, &text)?;
                }

                if !delta.tool_calls.is_empty() {
                    self.handle_tool_calls(&mut events, &delta.tool_calls)?;
                }
            }

            if choice.finish_reason.is_some() && !self.has_finished {
                self.has_finished = true;
                self.close_content_part(&mut events)?;
                self.close_output_items(&mut events)?;
            }
        }

        if chunk.usage.is_some() && self.has_finished && !self.response_completed {
            self.response_completed = true;
            let usage = self.usage.as_ref().map(to_responses_usage);
            let response = self.response_shell("completed", usage);
            self.emit(
                &mut events,
                ResponsesStreamEvent {
                    kind: "response.completed".to_string(),
                    response: Some(response),
                    ..Default::default()
                },
            )?;
        }

        self.stream_chunks.push(chunk);

        if events.is_empty() {
            return Ok(None);
        }
        Ok(Some(events.concat()))
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

impl OpenAiResponsesInbound {
    fn response_shell(&self, status: &str, usage: Option<ResponsesUsage>) -> ResponsesResponse {
        ResponsesResponse {
            object: "response".to_string(),
            id: self.response_id.clone(),
            model: self.model.clone(),
            created_at: self.created_at,
            status: Some(status.to_string()),
            output: vec![],
            usage,
            error: None,
        }
    }

    /// Stamp the next sequence number and frame the event.
    fn emit(&mut self, events: &mut Vec<Vec<u8>>, mut event: ResponsesStreamEvent) -> Result<()> {
        event.sequence_number = self.sequence_number;
        self.sequence_number += 1;
        let data = serde_json::to_vec(&event)?;
        events.push(format_sse_data(&data));
        Ok(())
    }

    fn handle_reasoning(&mut self, events: &mut Vec<Vec<u8>>, content: &str) -> Result<()> {
        if !self.has_reasoning_item_started {
            self.close_output_items(events)?;
            self.has_reasoning_item_started = true;
            self.current_item_id = generate_item_id();

            self.emit(
                events,
                ResponsesStreamEvent {
                    kind: "response.output_item.added".to_string(),
                    output_index: Some(self.output_index),
                    item: Some(ResponsesItem {
                        id: self.current_item_id.clone(),
                        kind: "reasoning".to_string(),
                        status: Some("in_progress".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )?;
            self.emit(
                events,
                ResponsesStreamEvent {
                    kind: "response.reasoning_summary_part.added".to_string(),
                    item_id: Some(self.current_item_id.clone()),
                    output_index: Some(self.output_index),
                    summary_index: Some(0),
                    part: Some(ResponsesContentPart {
                        kind: "summary_text".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )?;
        }

        self.accumulated_reasoning.push_str(content);
        self.emit(
            events,
            ResponsesStreamEvent {
                kind: "response.reasoning_summary_text.delta".to_string(),
                item_id: Some(self.current_item_id.clone()),
                output_index: Some(self.output_index),
                summary_index: Some(0),
                delta: content.to_string(),
                ..Default::default()
            },
        )
    }

    fn handle_text(&mut self, events: &mut Vec<Vec<u8>>, content: &str) -> Result<()> {
        if self.has_reasoning_item_started {
            self.close_reasoning_item(events)?;
        }

        if !self.has_message_item_started {
            self.has_message_item_started = true;
            self.current_item_id = generate_item_id();
            self.emit(
                events,
                ResponsesStreamEvent {
                    kind: "response.output_item.added".to_string(),
                    output_index: Some(self.output_index),
                    item: Some(ResponsesItem {
                        id: self.current_item_id.clone(),
                        kind: "message".to_string(),
                        status: Some("in_progress".to_string()),
                        role: "assistant".to_string(),
                        content: Some(Box::new(ResponsesInput::Items(vec![]))),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )?;
        }

        if !self.has_content_part_started {
            self.has_content_part_started = true;
            self.emit(
                events,
                ResponsesStreamEvent {
                    kind: "response.content_part.added".to_string(),
                    item_id: Some(self.current_item_id.clone()),
                    output_index: Some(self.output_index),
                    content_index: Some(self.content_index),
                    part: Some(ResponsesContentPart {
                        kind: "output_text".to_string(),
                        text: Some(String::new()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )?;
        }

        self.accumulated_text.push_str(content);
        self.emit(
            events,
            ResponsesStreamEvent {
                kind: "response.output_text.delta".to_string(),
                item_id: Some(self.current_item_id.clone()),
                output_index: Some(self.output_index),
                content_index: Some(self.content_index),
                delta: content.to_string(),
                ..Default::default()
            },
        )
    }

    fn handle_tool_calls(
        &mut self,
        events: &mut Vec<Vec<u8>>,
        tool_calls: &[ToolCall],
    ) -> Result<()> {
        if self.has_message_item_started {
            self.close_message_item(events)?;
        }
        if self.has_reasoning_item_started {
            self.close_reasoning_item(events)?;
        }

        for tool_call in tool_calls {
            let index = tool_call.index;
            if !self.tool_calls.contains_key(&index) {
                self.close_content_part(events)?;
                self.close_output_items(events)?;

                self.tool_calls.insert(
                    index,
                    ToolCall {
                        index,
                        id: tool_call.id.clone(),
                        kind: tool_call.kind.clone(),
                        function: internal::FunctionCall {
                            name: tool_call.function.name.clone(),
                            arguments: String::new(),
                        },
                    },
                );

                let item_id = if tool_call.id.is_empty() {
                    generate_item_id()
                } else {
                    tool_call.id.clone()
                };
                self.emit(
                    events,
                    ResponsesStreamEvent {
                        kind: "response.output_item.added".to_string(),
                        output_index: Some(self.output_index),
                        item: Some(ResponsesItem {
                            id: item_id.clone(),
                            kind: "function_call".to_string(),
                            status: Some("in_progress".to_string()),
                            call_id: tool_call.id.clone(),
                            name: tool_call.function.name.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                )?;

                self.tool_call_item_started.insert(index, true);
                self.tool_call_output_index.insert(index, self.output_index);
                self.current_item_id = item_id;
                self.output_index += 1;
            }

            if let Some(accumulated) = self.tool_calls.get_mut(&index) {
                accumulated
                    .function
                    .arguments
                    .push_str(&tool_call.function.arguments);
            }

            if !tool_call.function.arguments.is_empty() {
                let item_id = {
                    let id = &self.tool_calls[&index].id;
                    if id.is_empty() {
                        self.current_item_id.clone()
                    } else {
                        id.clone()
                    }
                };
                self.emit(
                    events,
                    ResponsesStreamEvent {
                        kind: "response.function_call_arguments.delta".to_string(),
                        item_id: Some(item_id),
                        output_index: Some(self.output_index - 1),
                        content_index: Some(0),
                        delta: tool_call.function.arguments.clone(),
                        ..Default::default()
                    },
                )?;
            }
        }
        Ok(())
    }

    fn close_reasoning_item(&mut self, events: &mut Vec<Vec<u8>>) -> Result<()> {
        if !self.has_reasoning_item_started {
            return Ok(());
        }
        self.has_reasoning_item_started = false;
        let full = std::mem::take(&mut self.accumulated_reasoning);

        self.emit(
            events,
            ResponsesStreamEvent {
                kind: "response.reasoning_summary_text.done".to_string(),
                item_id: Some(self.current_item_id.clone()),
                output_index: Some(self.output_index),
                summary_index: Some(0),
                text: full.clone(),
                ..Default::default()
            },
        )?;
        self.emit(
            events,
            ResponsesStreamEvent {
                kind: "response.reasoning_summary_part.done".to_string(),
                item_id: Some(self.current_item_id.clone()),
                output_index: Some(self.output_index),
                summary_index: Some(0),
                part: Some(ResponsesContentPart {
                    kind: "summary_text".to_string(),
                    text: Some(full.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )?;
        self.emit(
            events,
            ResponsesStreamEvent {
                kind: "response.output_item.done".to_string(),
                output_index: Some(self.output_index),
                item: Some(ResponsesItem {
                    id: self.current_item_id.clone(),
                    kind: "reasoning".to_string(),
                    summary: vec![ReasoningSummary {
                        kind: "summary_text".to_string(),
                        text: full,
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
        )?;
        self.output_index += 1;
        Ok(())
    }

    fn close_message_item(&mut self, events: &mut Vec<Vec<u8>>) -> Result<()> {
        if !self.has_message_item_started {
            return Ok(());
        }
        self.has_message_item_started = false;

        self.close_content_part(events)?;

        let full = std::mem::take(&mut self.accumulated_text);
        self.emit(
            events,
            ResponsesStreamEvent {
                kind: "response.output_item.done".to_string(),
                output_index: Some(self.output_index),
                item: Some(ResponsesItem {
                    id: self.current_item_id.clone(),
                    kind: "message".to_string(),
                    status: Some("completed".to_string()),
                    role: "assistant".to_string(),
                    content: Some(Box::new(ResponsesInput::Items(vec![ResponsesItem {
                        kind: "output_text".to_string(),
                        text: Some(full),
                        ..Default::default()
                    }]))),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )?;
        self.output_index += 1;
        self.content_index = 0;
        Ok(())
    }

    fn close_content_part(&mut self, events: &mut Vec<Vec<u8>>) -> Result<()> {
        if !self.has_content_part_started {
            return Ok(());
        }
        self.has_content_part_started = false;
        let full = self.accumulated_text.clone();

        self.emit(
            events,
            ResponsesStreamEvent {
                kind: "response.output_text.done".to_string(),
                item_id: Some(self.current_item_id.clone()),
                output_index: Some(self.output_index),
                content_index: Some(self.content_index),
                text: full.clone(),
                ..Default::default()
            },
        )?;
        self.emit(
            events,
            ResponsesStreamEvent {
                kind: "response.content_part.done".to_string(),
                item_id: Some(self.current_item_id.clone()),
                output_index: Some(self.output_index),
                content_index: Some(self.content_index),
                part: Some(ResponsesContentPart {
                    kind: "output_text".to_string(),
                    text: Some(full),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    /// Close the open message/reasoning item and any open tool-call items.
    fn close_output_items(&mut self, events: &mut Vec<Vec<u8>>) -> Result<()> {
        if self.has_message_item_started {
            self.close_message_item(events)?;
        }
        if self.has_reasoning_item_started {
            self.close_reasoning_item(events)?;
        }

        let open: Vec<i64> = self
            .tool_call_item_started
            .iter()
            .filter(|(_, started)| **started)
            .map(|(idx, _)| *idx)
            .collect();
        for index in open {
            let tool_call = self.tool_calls[&index].clone();
            let item_id = if tool_call.id.is_empty() {
                self.current_item_id.clone()
            } else {
                tool_call.id.clone()
            };
            let output_index = self.tool_call_output_index[&index];

            self.emit(
                events,
                ResponsesStreamEvent {
                    kind: "response.function_call_arguments.done".to_string(),
                    item_id: Some(item_id.clone()),
                    output_index: Some(output_index),
                    arguments: tool_call.function.arguments.clone(),
                    ..Default::default()
                },
            )?;
            self.emit(
                events,
                ResponsesStreamEvent {
                    kind: "response.output_item.done".to_string(),
                    output_index: Some(output_index),
                    item: Some(ResponsesItem {
                        id: item_id,
                        kind: "function_call".to_string(),
                        status: Some("completed".to_string()),
                        call_id: tool_call.id.clone(),
                        name: tool_call.function.name.clone(),
                        arguments: tool_call.function.arguments.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )?;
            self.tool_call_item_started.insert(index, false);
        }
        Ok(())
    }
}

// ============================================================================
// Request decoding
// ============================================================================

fn decode_responses_request(req: ResponsesRequest) -> Result<InternalRequest> {
    let mut internal = InternalRequest {
        model: req.model,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        store: req.store,
        service_tier: req.service_tier,
        user: req.user,
        metadata: req.metadata,
        max_completion_tokens: req.max_output_tokens,
        top_logprobs: req.top_logprobs,
        raw_api_format: ApiFormat::OpenAiResponse,
        ..Default::default()
    };

    if let Some(reasoning) = &req.reasoning {
        if !reasoning.effort.is_empty() {
            internal.reasoning_effort = reasoning.effort.clone();
        }
        internal.reasoning_budget = reasoning.max_tokens;
    }

    if let Some(tool_choice) = req.tool_choice {
        internal.tool_choice = Some(match tool_choice {
            ResponsesToolChoice::Mode(mode) => ToolChoice::Mode(mode),
            ResponsesToolChoice::Named { kind, name } => {
                ToolChoice::Named(internal::NamedToolChoice {
                    kind,
                    function: internal::ToolFunctionRef { name },
                })
            }
        });
    }

    let mut messages = Vec::new();
    if !req.instructions.is_empty() {
        messages.push(internal::Message {
            role: "system".to_string(),
            content: Some(MessageContent::text(req.instructions.clone())),
            ..Default::default()
        });
    }
    messages.extend(decode_input(&req.input));
    internal.messages = messages;

    for tool in &req.tools {
        match tool.kind.as_str() {
            "function" => internal.tools.push(internal::Tool {
                kind: "function".to_string(),
                function: internal::FunctionDef {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone().unwrap_or_default(),
                    strict: tool.strict,
                },
                image_generation: None,
                cache_control: None,
            }),
            "image_generation" => internal.tools.push(internal::Tool {
                kind: "image_generation".to_string(),
                image_generation: Some(internal::ImageGeneration {
                    background: tool.background.clone(),
                    output_format: tool.output_format.clone(),
                    quality: tool.quality.clone(),
                    size: tool.size.clone(),
                    output_compression: tool.output_compression,
                }),
                ..Default::default()
            }),
            _ => {}
        }
    }

    if let Some(text) = &req.text {
        if let Some(format) = &text.format {
            if !format.kind.is_empty() {
                internal.response_format = Some(ResponseFormat {
                    kind: format.kind.clone(),
                    json_schema: None,
                });
            }
        }
    }

    Ok(internal)
}

fn decode_input(input: &ResponsesInput) -> Vec<internal::Message> {
    match input {
        // A single string lowers to one user message.
        ResponsesInput::Text(text) => vec![internal::Message {
            role: "user".to_string(),
            content: Some(MessageContent::text(text.clone())),
            ..Default::default()
        }],
        ResponsesInput::Items(items) => items.iter().filter_map(decode_item).collect(),
    }
}

fn decode_item(item: &ResponsesItem) -> Option<internal::Message> {
    match item.kind.as_str() {
        "message" | "input_text" | "" => {
            let mut msg = internal::Message {
                role: item.role.clone(),
                ..Default::default()
            };
            if let Some(content) = &item.content {
                msg.content = Some(decode_content(content));
            } else if let Some(text) = &item.text {
                msg.content = Some(MessageContent::text(text.clone()));
            }
            Some(msg)
        }
        "input_image" => item.image_url.as_ref().map(|url| internal::Message {
            role: if item.role.is_empty() {
                "user".to_string()
            } else {
                item.role.clone()
            },
            content: Some(MessageContent::Parts(vec![ContentPart {
                kind: "image_url".to_string(),
                image_url: Some(ImageUrl {
                    url: url.clone(),
                    detail: item.detail.clone(),
                }),
                ..Default::default()
            }])),
            ..Default::default()
        }),
        "function_call" => Some(internal::Message {
            role: "assistant".to_string(),
            tool_calls: vec![ToolCall {
                id: item.call_id.clone(),
                kind: "function".to_string(),
                function: internal::FunctionCall {
                    name: item.name.clone(),
                    arguments: item.arguments.clone(),
                },
                index: 0,
            }],
            ..Default::default()
        }),
        "function_call_output" => Some(internal::Message {
            role: "tool".to_string(),
            tool_call_id: Some(item.call_id.clone()),
            content: item.output.as_ref().map(|o| decode_content(o)),
            ..Default::default()
        }),
        "reasoning" => {
            let mut msg = internal::Message {
                role: "assistant".to_string(),
                ..Default::default()
            };
            let text: String = item.summary.iter().map(|s| s.text.as_str()).collect();
            if !text.is_empty() {
                msg.reasoning_content = Some(text);
            }
            if let Some(encrypted) = &item.encrypted_content {
                if !encrypted.is_empty() {
                    msg.reasoning_signature = Some(encrypted.clone());
                }
            }
            Some(msg)
        }
        _ => None,
    }
}

fn decode_content(input: &ResponsesInput) -> MessageContent {
    match input {
        ResponsesInput::Text(text) => MessageContent::text(text.clone()),
        ResponsesInput::Items(items) => {
            let mut parts = Vec::new();
            for item in items {
                match item.kind.as_str() {
                    "input_text" | "text" | "output_text" => {
                        if let Some(text) = &item.text {
                            parts.push(ContentPart::text_part(text.clone()));
                        }
                    }
                    "input_image" => {
                        if let Some(url) = &item.image_url {
                            parts.push(ContentPart {
                                kind: "image_url".to_string(),
                                image_url: Some(ImageUrl {
                                    url: url.clone(),
                                    detail: item.detail.clone(),
                                }),
                                ..Default::default()
                            });
                        }
                    }
                    _ => {}
                }
            }
            if parts.len() == 1 && parts[0].kind == "text" {
                MessageContent::Text(parts.remove(0).text.unwrap_or_default())
            } else {
                MessageContent::Parts(parts)
            }
        }
    }
}

// ============================================================================
// Response encoding
// ============================================================================

fn encode_responses_response(resp: &InternalResponse) -> ResponsesResponse {
    let mut result = ResponsesResponse {
        object: "response".to_string(),
        id: resp.id.clone(),
        model: resp.model.clone(),
        created_at: resp.created,
        output: Vec::new(),
        status: Some("completed".to_string()),
        usage: resp.usage.as_ref().map(to_responses_usage),
        error: None,
    };

    for choice in &resp.choices {
        let Some(message) = choice.message.as_ref().or(choice.delta.as_ref()) else {
            continue;
        };

        // A reasoning item precedes message/function_call items.
        let reasoning = message.reasoning_text();
        if !reasoning.is_empty() {
            result.output.push(ResponsesItem {
                id: generate_item_id(),
                kind: "reasoning".to_string(),
                status: Some("completed".to_string()),
                summary: vec![ReasoningSummary {
                    kind: "summary_text".to_string(),
                    text: reasoning.to_string(),
                }],
                ..Default::default()
            });
        }

        for tool_call in &message.tool_calls {
            result.output.push(ResponsesItem {
                id: tool_call.id.clone(),
                kind: "function_call".to_string(),
                call_id: tool_call.id.clone(),
                name: tool_call.function.name.clone(),
                arguments: tool_call.function.arguments.clone(),
                status: Some("completed".to_string()),
                ..Default::default()
            });
        }

        match &message.content {
            Some(MessageContent::Text(text)) if !text.is_empty() => {
                result.output.push(message_output_item(text.clone()));
            }
            Some(MessageContent::Parts(parts)) => {
                let mut content_items = Vec::new();
                for part in parts {
                    match part.kind.as_str() {
                        "text" => {
                            if let Some(text) = &part.text {
                                content_items.push(ResponsesItem {
                                    kind: "output_text".to_string(),
                                    text: Some(text.clone()),
                                    annotations: Some(vec![]),
                                    ..Default::default()
                                });
                            }
                        }
                        "image_url" => {
                            if let Some(image) = &part.image_url {
                                result.output.push(ResponsesItem {
                                    id: generate_item_id(),
                                    kind: "image_generation_call".to_string(),
                                    role: "assistant".to_string(),
                                    result: Some(extract_base64(&image.url).to_string()),
                                    status: Some("completed".to_string()),
                                    ..Default::default()
                                });
                            }
                        }
                        _ => {}
                    }
                }
                if !content_items.is_empty() {
                    result.output.push(ResponsesItem {
                        id: generate_item_id(),
                        kind: "message".to_string(),
                        role: "assistant".to_string(),
                        content: Some(Box::new(ResponsesInput::Items(content_items))),
                        status: Some("completed".to_string()),
                        ..Default::default()
                    });
                }
            }
            _ => {}
        }

        if let Some(finish_reason) = &choice.finish_reason {
            result.status = Some(
                match finish_reason.as_str() {
                    "length" => "incomplete",
                    "error" => "failed",
                    _ => "completed",
                }
                .to_string(),
            );
        }
    }

    if result.output.is_empty() {
        result.output.push(message_output_item(String::new()));
    }

    result
}

fn message_output_item(text: String) -> ResponsesItem {
    ResponsesItem {
        id: generate_item_id(),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        content: Some(Box::new(ResponsesInput::Items(vec![ResponsesItem {
            kind: "output_text".to_string(),
            text: Some(text),
            annotations: Some(vec![]),
            ..Default::default()
        }]))),
        status: Some("completed".to_string()),
        ..Default::default()
    }
}

fn to_responses_usage(usage: &Usage) -> ResponsesUsage {
    ResponsesUsage {
        input_tokens: usage.prompt_tokens,
        input_tokens_details: ResponsesInputTokensDetails {
            cached_tokens: usage.cached_tokens(),
        },
        output_tokens: usage.completion_tokens,
        output_tokens_details: ResponsesOutputTokensDetails {
            reasoning_tokens: usage
                .completion_tokens_details
                .as_ref()
                .map(|d| d.reasoning_tokens)
                .unwrap_or(0),
        },
        total_tokens: usage.total_tokens,
    }
}

fn generate_item_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("item_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::internal::Choice;
    use serde_json::Value;

    #[test]
    fn test_decode_string_input_becomes_user_message() {
        let mut codec = OpenAiResponsesInbound::default();
        let request = codec
            .decode_request(br#"{"model":"gpt-5","input":"hello"}"#)
            .unwrap();
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, "user");
        assert_eq!(
            request.messages[0].content.as_ref().unwrap().as_text(),
            Some("hello")
        );
    }

    #[test]
    fn test_decode_items_with_function_call_round() {
        let mut codec = OpenAiResponsesInbound::default();
        let request = codec
            .decode_request(
                br#"{"model":"gpt-5","input":[
                    {"type":"message","role":"user","content":"weather?"},
                    {"type":"function_call","call_id":"call_1","name":"get_weather","arguments":"{}"},
                    {"type":"function_call_output","call_id":"call_1","output":"sunny"}
                ]}"#,
            )
            .unwrap();
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[1].tool_calls[0].id, "call_1");
        assert_eq!(request.messages[2].role, "tool");
        assert_eq!(request.messages[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_decode_instructions_and_reasoning() {
        let mut codec = OpenAiResponsesInbound::default();
        let request = codec
            .decode_request(
                br#"{"model":"gpt-5","instructions":"be brief","input":"hi",
                    "reasoning":{"effort":"high"}}"#,
            )
            .unwrap();
        assert_eq!(request.messages[0].role, "system");
        assert_eq!(request.reasoning_effort, "high");
    }

    #[test]
    fn test_encode_reasoning_item_precedes_message() {
        let mut codec = OpenAiResponsesInbound::default();
        let response = InternalResponse {
            id: "resp_1".into(),
            model: "gpt-5".into(),
            choices: vec![Choice {
                index: 0,
                message: Some(internal::Message {
                    role: "assistant".into(),
                    reasoning_content: Some("thinking".into()),
                    content: Some(MessageContent::text("answer")),
                    ..Default::default()
                }),
                finish_reason: Some("stop".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let body = codec.encode_response(response).unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["output"][0]["type"], "reasoning");
        assert_eq!(value["output"][1]["type"], "message");
    }

    #[test]
    fn test_encode_image_output_as_image_generation_call() {
        let mut codec = OpenAiResponsesInbound::default();
        let response = InternalResponse {
            choices: vec![Choice {
                index: 0,
                message: Some(internal::Message {
                    role: "assistant".into(),
                    content: Some(MessageContent::Parts(vec![ContentPart::image_part(
                        "data:image/png;base64,AAAA",
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let body = codec.encode_response(response).unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        let call = value["output"]
            .as_array()
            .unwrap()
            .iter()
            .find(|o| o["type"] == "image_generation_call")
            .unwrap();
        assert_eq!(call["result"], "AAAA");
    }

    fn sequence_numbers(raw: &[u8]) -> Vec<i64> {
        std::str::from_utf8(raw)
            .unwrap()
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .filter(|l| !l.starts_with('['))
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["sequence_number"]
                .as_i64()
                .unwrap())
            .collect()
    }

    #[test]
    fn test_stream_sequence_numbers_strictly_increase() {
        let mut codec = OpenAiResponsesInbound::default();
        let mut all: Vec<i64> = Vec::new();

        for text in ["a", "b"] {
            let chunk = InternalResponse {
                id: "resp_1".into(),
                model: "gpt-5".into(),
                object: "chat.completion.chunk".into(),
                choices: vec![Choice {
                    index: 0,
                    delta: Some(internal::Message {
                        role: "assistant".into(),
                        content: Some(MessageContent::text(text)),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            };
            if let Some(out) = codec.encode_stream_event(chunk).unwrap() {
                all.extend(sequence_numbers(&out));
            }
        }
        let mut finish = InternalResponse {
            object: "chat.completion.chunk".into(),
            choices: vec![Choice {
                index: 0,
                finish_reason: Some("stop".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        finish.usage = Some(Usage::default());
        if let Some(out) = codec.encode_stream_event(finish).unwrap() {
            all.extend(sequence_numbers(&out));
        }

        assert!(!all.is_empty());
        for window in all.windows(2) {
            assert!(window[1] > window[0], "sequence numbers must increase");
        }
        assert_eq!(all[0], 0);
    }

    #[test]
    fn test_stream_tool_call_opens_item_before_arguments() {
        let mut codec = OpenAiResponsesInbound::default();
        let chunk = InternalResponse {
            id: "resp_1".into(),
            object: "chat.completion.chunk".into(),
            choices: vec![Choice {
                index: 0,
                delta: Some(internal::Message {
                    role: "assistant".into(),
                    tool_calls: vec![ToolCall {
                        id: "call_1".into(),
                        kind: "function".into(),
                        index: 0,
                        function: internal::FunctionCall {
                            name: "f".into(),
                            arguments: "{\"x\":1}".into(),
                        },
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let out = codec.encode_stream_event(chunk).unwrap().unwrap();
        let text = std::str::from_utf8(&out).unwrap();
        let added_pos = text.find("response.output_item.added").unwrap();
        let delta_pos = text
            .find("response.function_call_arguments.delta")
            .unwrap();
        assert!(added_pos < delta_pos);
    }

    #[test]
    fn test_stream_done_marker_passthrough() {
        let mut codec = OpenAiResponsesInbound::default();
        let out = codec.encode_stream_event(InternalResponse::done()).unwrap();
        assert_eq!(out.unwrap(), b"data: [DONE]\n\n");
    }
}
