//! Anthropic Messages outbound codec.
//!
//! Lowers the internal format onto the Anthropic wire: system messages fold
//! into the `system` array, internal `role=tool` messages are hoisted into
//! the next user turn as `tool_result` blocks sharing the same message
//! index, data-URL images become base64 sources, and `reasoning_effort`
//! maps back to a thinking budget.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::core::error::{AppError, Result};
use crate::transformer::anthropic::*;
use crate::transformer::dataurl::parse_data_url;
use crate::transformer::internal::{
    self, InternalRequest, InternalResponse, MessageContent, PromptTokensDetails, Usage,
};
use crate::transformer::outbound::{append_query, join_url, Outbound, UpstreamRequest};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Default)]
pub struct AnthropicOutbound {
    // Stream state
    stream_id: String,
    stream_model: String,
    stream_usage: Option<Usage>,
    tool_index: i64,
    tool_call_ids: HashMap<i64, String>,
    initialized: bool,
}

impl Outbound for AnthropicOutbound {
    fn encode_request(
        &mut self,
        request: &mut InternalRequest,
        base_url: &str,
        key: &str,
    ) -> Result<UpstreamRequest> {
        let anthropic_request = build_request(request);
        let body = serde_json::to_vec(&anthropic_request)?;

        let accept = if request.is_streaming() {
            "text/event-stream"
        } else {
            "application/json"
        };

        let mut url = join_url(base_url, "/messages");
        // Anthropic honors pass-through of the original query parameters.
        append_query(&mut url, &request.query);

        Ok(UpstreamRequest {
            url,
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), accept.to_string()),
                ("Anthropic-Version".to_string(), ANTHROPIC_VERSION.to_string()),
                ("X-API-Key".to_string(), key.to_string()),
            ],
            body,
        })
    }

    fn decode_response(&mut self, status: u16, body: &[u8]) -> Result<InternalResponse> {
        if body.is_empty() {
            return Err(AppError::Internal("response body is empty".to_string()));
        }

        if status >= 400 {
            if let Ok(err) = serde_json::from_slice::<AnthropicError>(body) {
                if !err.error.message.is_empty() {
                    return Err(AppError::Upstream {
                        status,
                        code: String::new(),
                        error_type: err.error.kind,
                        message: err.error.message,
                    });
                }
            }
            return Err(AppError::Upstream {
                status,
                code: String::new(),
                error_type: String::new(),
                message: String::from_utf8_lossy(body).into_owned(),
            });
        }

        let message: AnthropicMessage = serde_json::from_slice(body)?;
        Ok(decode_message(&message))
    }

    fn decode_stream_event(&mut self, event: &[u8]) -> Result<Option<InternalResponse>> {
        if event.is_empty() {
            return Ok(None);
        }
        if event.starts_with(b"[DONE]") {
            return Ok(Some(InternalResponse::done()));
        }

        if !self.initialized {
            self.initialized = true;
            self.tool_index = -1;
        }

        let stream_event: StreamEvent = serde_json::from_slice(event)?;
        let mut resp = InternalResponse {
            id: self.stream_id.clone(),
            model: self.stream_model.clone(),
            object: "chat.completion.chunk".to_string(),
            ..Default::default()
        };

        match stream_event.kind.as_str() {
            "message_start" => {
                if let Some(message) = &stream_event.message {
                    self.stream_id = message.id.clone();
                    self.stream_model = message.model.clone();
                    resp.id = self.stream_id.clone();
                    resp.model = self.stream_model.clone();
                    if let Some(usage) = &message.usage {
                        let usage = decode_usage(usage);
                        self.stream_usage = Some(usage.clone());
                        resp.usage = Some(usage);
                    }
                }
                resp.choices = vec![assistant_delta_choice(internal::Message {
                    role: "assistant".to_string(),
                    ..Default::default()
                })];
            }

            "content_block_start" => {
                let Some(block) = &stream_event.content_block else {
                    return Ok(None);
                };
                match block.kind.as_str() {
                    "tool_use" => {
                        self.tool_index += 1;
                        self.tool_call_ids.insert(self.tool_index, block.id.clone());
                        resp.choices = vec![assistant_delta_choice(internal::Message {
                            role: "assistant".to_string(),
                            tool_calls: vec![internal::ToolCall {
                                index: self.tool_index,
                                id: block.id.clone(),
                                kind: "function".to_string(),
                                function: internal::FunctionCall {
                                    name: block.name.clone().unwrap_or_default(),
                                    arguments: String::new(),
                                },
                            }],
                            ..Default::default()
                        })];
                    }
                    // Handled through their deltas.
                    _ => return Ok(None),
                }
            }

            "content_block_delta" => {
                let Some(delta) = &stream_event.delta else {
                    return Ok(None);
                };
                let mut message = internal::Message {
                    role: "assistant".to_string(),
                    ..Default::default()
                };
                match delta.kind.as_deref() {
                    Some("text_delta") => {
                        let Some(text) = &delta.text else { return Ok(None) };
                        message.content = Some(MessageContent::text(text.clone()));
                    }
                    Some("input_json_delta") => {
                        let Some(partial) = &delta.partial_json else {
                            return Ok(None);
                        };
                        if self.tool_index < 0 {
                            return Ok(None);
                        }
                        message.tool_calls = vec![internal::ToolCall {
                            index: self.tool_index,
                            id: self
                                .tool_call_ids
                                .get(&self.tool_index)
                                .cloned()
                                .unwrap_or_default(),
                            kind: "function".to_string(),
                            function: internal::FunctionCall {
                                name: String::new(),
                                arguments: partial.clone(),
                            },
                        }];
                    }
                    Some("thinking_delta") => {
                        let Some(thinking) = &delta.thinking else {
                            return Ok(None);
                        };
                        message.reasoning_content = Some(thinking.clone());
                    }
                    Some("signature_delta") => {
                        let Some(signature) = &delta.signature else {
                            return Ok(None);
                        };
                        message.reasoning_signature = Some(signature.clone());
                    }
                    _ => return Ok(None),
                }
                resp.choices = vec![assistant_delta_choice(message)];
            }

            "message_delta" => {
                if let Some(event_usage) = &stream_event.usage {
                    let mut usage = decode_usage(event_usage);
                    // message_delta usage only carries output tokens; keep
                    // the prompt counts from message_start.
                    if let Some(start_usage) = &self.stream_usage {
                        usage.prompt_tokens = start_usage.prompt_tokens;
                        usage.prompt_tokens_details = start_usage.prompt_tokens_details.clone();
                        usage.cache_creation_input_tokens =
                            start_usage.cache_creation_input_tokens;
                        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
                    }
                    self.stream_usage = Some(usage);
                }
                if let Some(delta) = &stream_event.delta {
                    if let Some(stop_reason) = &delta.stop_reason {
                        resp.choices = vec![internal::Choice {
                            index: 0,
                            finish_reason: Some(
                                stop_reason_to_finish_reason(stop_reason).to_string(),
                            ),
                            ..Default::default()
                        }];
                    }
                }
            }

            "message_stop" => {
                resp.choices = vec![];
                resp.usage = self.stream_usage.clone();
            }

            // content_block_stop and ping carry nothing for the client.
            _ => return Ok(None),
        }

        Ok(Some(resp))
    }
}

fn assistant_delta_choice(message: internal::Message) -> internal::Choice {
    internal::Choice {
        index: 0,
        delta: Some(message),
        ..Default::default()
    }
}

// ============================================================================
// Request building
// ============================================================================

fn build_request(request: &InternalRequest) -> MessageRequest {
    let mut result = MessageRequest {
        model: request.model.clone(),
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
        max_tokens: request
            .max_tokens
            .or(request.max_completion_tokens)
            .unwrap_or(8192),
        system: build_system_prompt(request),
        ..Default::default()
    };

    if let Some(user_id) = request.metadata.get("user_id") {
        if !user_id.is_empty() {
            result.metadata = Some(Metadata {
                user_id: user_id.clone(),
            });
        }
    }

    result.messages = build_messages(request);

    for tool in &request.tools {
        if tool.kind != "function" {
            continue;
        }
        result.tools.push(AnthropicTool {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            input_schema: tool.function.parameters.clone(),
            cache_control: to_anthropic_cache_control(&tool.cache_control),
        });
    }

    if let Some(stop) = &request.stop {
        result.stop_sequences = stop.sequences();
    }

    if !request.reasoning_effort.is_empty() {
        result.thinking = Some(Thinking {
            kind: "enabled".to_string(),
            budget_tokens: reasoning_effort_to_budget(
                &request.reasoning_effort,
                request.reasoning_budget,
            ),
        });
    }

    result
}

fn build_system_prompt(request: &InternalRequest) -> Option<SystemPrompt> {
    let parts: Vec<SystemPromptPart> = request
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| SystemPromptPart {
            kind: "text".to_string(),
            text: m
                .content
                .as_ref()
                .map(|c| c.all_text())
                .unwrap_or_default(),
            cache_control: to_anthropic_cache_control(&m.cache_control),
        })
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(SystemPrompt::Parts(parts))
    }
}

fn build_messages(request: &InternalRequest) -> Vec<MessageParam> {
    let mut out = Vec::with_capacity(request.messages.len());
    let mut processed_indexes: HashSet<usize> = HashSet::new();

    for msg in &request.messages {
        match msg.role.as_str() {
            "system" => continue,
            "tool" => {
                out.extend(build_tool_turn(msg, &request.messages, &mut processed_indexes));
            }
            "user" => {
                if let Some(index) = msg.message_index {
                    if processed_indexes.contains(&index) {
                        continue;
                    }
                }
                out.push(MessageParam {
                    role: "user".to_string(),
                    content: build_content(msg),
                });
            }
            "assistant" => {
                if let Some(param) = build_assistant_message(msg) {
                    out.push(param);
                }
            }
            _ => {}
        }
    }

    out
}

/// Hoist one or more tool-result messages (sharing a message index) into a
/// single user turn, appending the surrounding user content if any.
fn build_tool_turn(
    msg: &internal::Message,
    all: &[internal::Message],
    processed_indexes: &mut HashSet<usize>,
) -> Vec<MessageParam> {
    let Some(index) = msg.message_index else {
        return vec![MessageParam {
            role: "user".to_string(),
            content: AnthropicContent::Blocks(vec![tool_result_block(msg)]),
        }];
    };

    if processed_indexes.contains(&index) {
        return vec![];
    }

    let mut blocks: Vec<ContentBlock> = all
        .iter()
        .filter(|m| m.role == "tool" && m.message_index == Some(index))
        .map(tool_result_block)
        .collect();
    if blocks.is_empty() {
        return vec![];
    }

    if let Some(user_msg) = all
        .iter()
        .find(|m| m.role == "user" && m.message_index == Some(index))
    {
        match build_content(user_msg) {
            AnthropicContent::Blocks(user_blocks) => blocks.extend(user_blocks),
            AnthropicContent::Text(text) => {
                if !text.is_empty() {
                    blocks.push(ContentBlock {
                        kind: "text".to_string(),
                        text: Some(text),
                        ..Default::default()
                    });
                }
            }
        }
    }

    processed_indexes.insert(index);

    vec![MessageParam {
        role: "user".to_string(),
        content: AnthropicContent::Blocks(blocks),
    }]
}

fn tool_result_block(msg: &internal::Message) -> ContentBlock {
    let content = msg.content.as_ref().map(|content| match content {
        MessageContent::Text(text) => Box::new(AnthropicContent::Text(text.clone())),
        MessageContent::Parts(parts) => {
            let blocks = parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.clone())
                .map(|text| ContentBlock {
                    kind: "text".to_string(),
                    text: Some(text),
                    ..Default::default()
                })
                .collect();
            Box::new(AnthropicContent::Blocks(blocks))
        }
    });

    ContentBlock {
        kind: "tool_result".to_string(),
        tool_use_id: msg.tool_call_id.clone(),
        cache_control: to_anthropic_cache_control(&msg.cache_control),
        is_error: msg.tool_call_is_error,
        content,
        ..Default::default()
    }
}

fn build_assistant_message(msg: &internal::Message) -> Option<MessageParam> {
    if msg.tool_calls.is_empty() {
        return Some(MessageParam {
            role: "assistant".to_string(),
            content: build_content(msg),
        });
    }

    let mut blocks = Vec::new();

    let reasoning = msg.reasoning_text();
    if !reasoning.is_empty() {
        blocks.push(ContentBlock {
            kind: "thinking".to_string(),
            thinking: Some(reasoning.to_string()),
            signature: msg.reasoning_signature.clone(),
            ..Default::default()
        });
    }

    match &msg.content {
        Some(MessageContent::Text(text)) if !text.is_empty() => {
            blocks.push(ContentBlock {
                kind: "text".to_string(),
                text: Some(text.clone()),
                cache_control: to_anthropic_cache_control(&msg.cache_control),
                ..Default::default()
            });
        }
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                if part.kind == "text" {
                    if let Some(text) = &part.text {
                        blocks.push(ContentBlock {
                            kind: "text".to_string(),
                            text: Some(text.clone()),
                            cache_control: to_anthropic_cache_control(&part.cache_control),
                            ..Default::default()
                        });
                    }
                }
            }
        }
        _ => {}
    }

    for tool_call in &msg.tool_calls {
        blocks.push(ContentBlock {
            kind: "tool_use".to_string(),
            id: tool_call.id.clone(),
            name: Some(tool_call.function.name.clone()),
            input: Some(parse_arguments(&tool_call.function.arguments)),
            ..Default::default()
        });
    }

    if blocks.is_empty() {
        return None;
    }
    Some(MessageParam {
        role: "assistant".to_string(),
        content: AnthropicContent::Blocks(blocks),
    })
}

fn build_content(msg: &internal::Message) -> AnthropicContent {
    match &msg.content {
        Some(MessageContent::Text(text)) => {
            let reasoning = msg.reasoning_text();
            if msg.cache_control.is_none() && reasoning.is_empty() {
                return AnthropicContent::Text(text.clone());
            }
            let mut blocks = Vec::new();
            if !reasoning.is_empty() {
                blocks.push(ContentBlock {
                    kind: "thinking".to_string(),
                    thinking: Some(reasoning.to_string()),
                    signature: msg.reasoning_signature.clone(),
                    ..Default::default()
                });
            }
            blocks.push(ContentBlock {
                kind: "text".to_string(),
                text: Some(text.clone()),
                cache_control: to_anthropic_cache_control(&msg.cache_control),
                ..Default::default()
            });
            AnthropicContent::Blocks(blocks)
        }
        Some(MessageContent::Parts(parts)) => {
            let mut blocks = Vec::new();
            for part in parts {
                match part.kind.as_str() {
                    "text" => {
                        if let Some(text) = &part.text {
                            blocks.push(ContentBlock {
                                kind: "text".to_string(),
                                text: Some(text.clone()),
                                cache_control: to_anthropic_cache_control(&part.cache_control),
                                ..Default::default()
                            });
                        }
                    }
                    "image_url" => {
                        if let Some(image) = &part.image_url {
                            if !image.url.is_empty() {
                                blocks.push(image_block(&image.url, &part.cache_control));
                            }
                        }
                    }
                    _ => {}
                }
            }
            AnthropicContent::Blocks(blocks)
        }
        None => AnthropicContent::Blocks(vec![]),
    }
}

/// `data:<mime>;base64,<payload>` lowers to a base64 source; bare URLs lower
/// to a url source.
fn image_block(url: &str, cache_control: &Option<internal::CacheControl>) -> ContentBlock {
    let source = match parse_data_url(url) {
        Some(parsed) => ImageSource {
            kind: "base64".to_string(),
            media_type: parsed.media_type,
            data: parsed.data,
            url: String::new(),
        },
        None => ImageSource {
            kind: "url".to_string(),
            url: url.to_string(),
            ..Default::default()
        },
    };
    ContentBlock {
        kind: "image".to_string(),
        source: Some(source),
        cache_control: to_anthropic_cache_control(cache_control),
        ..Default::default()
    }
}

fn parse_arguments(arguments: &str) -> Value {
    if arguments.is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| serde_json::json!({}))
}

fn to_anthropic_cache_control(
    source: &Option<internal::CacheControl>,
) -> Option<CacheControl> {
    source.as_ref().map(|cc| CacheControl {
        kind: cc.kind.clone(),
        ttl: cc.ttl.clone(),
    })
}

// ============================================================================
// Response decoding
// ============================================================================

fn decode_message(message: &AnthropicMessage) -> InternalResponse {
    let mut text_parts: Vec<String> = Vec::new();
    let mut parts: Vec<internal::ContentPart> = Vec::new();
    let mut tool_calls = Vec::new();
    let mut thinking: Option<String> = None;
    let mut signature: Option<String> = None;

    for block in &message.content {
        match block.kind.as_str() {
            "text" => {
                if let Some(text) = &block.text {
                    if !text.is_empty() {
                        text_parts.push(text.clone());
                        parts.push(internal::ContentPart::text_part(text.clone()));
                    }
                }
            }
            "tool_use" => {
                if !block.id.is_empty() {
                    if let Some(name) = &block.name {
                        tool_calls.push(internal::ToolCall {
                            id: block.id.clone(),
                            kind: "function".to_string(),
                            index: tool_calls.len() as i64,
                            function: internal::FunctionCall {
                                name: name.clone(),
                                arguments: block
                                    .input
                                    .as_ref()
                                    .map(|v| v.to_string())
                                    .unwrap_or_else(|| "{}".to_string()),
                            },
                        });
                    }
                }
            }
            "thinking" => {
                if let Some(text) = &block.thinking {
                    thinking = Some(text.clone());
                }
                signature = block.signature.clone();
            }
            _ => {}
        }
    }

    // Text-only content keeps the compact string form.
    let content = if !text_parts.is_empty() && parts.len() == text_parts.len() {
        Some(MessageContent::Text(text_parts.concat()))
    } else if !parts.is_empty() {
        Some(MessageContent::Parts(parts))
    } else {
        None
    };

    InternalResponse {
        id: message.id.clone(),
        object: "chat.completion".to_string(),
        model: message.model.clone(),
        choices: vec![internal::Choice {
            index: 0,
            message: Some(internal::Message {
                role: message.role.clone(),
                content,
                tool_calls,
                reasoning_content: thinking,
                reasoning_signature: signature,
                ..Default::default()
            }),
            finish_reason: message
                .stop_reason
                .as_deref()
                .map(|r| stop_reason_to_finish_reason(r).to_string()),
            ..Default::default()
        }],
        usage: message.usage.as_ref().map(decode_usage),
        ..Default::default()
    }
}

/// Map an Anthropic stop_reason onto the internal finish-reason vocabulary.
fn stop_reason_to_finish_reason(stop_reason: &str) -> &str {
    match stop_reason {
        "end_turn" | "stop_sequence" | "pause_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "refusal" => "content_filter",
        other => other,
    }
}

fn decode_usage(usage: &AnthropicUsage) -> Usage {
    Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens
            + usage.output_tokens
            + usage.cache_read_input_tokens
            + usage.cache_creation_input_tokens,
        prompt_tokens_details: (usage.cache_read_input_tokens > 0).then(|| {
            PromptTokensDetails {
                cached_tokens: usage.cache_read_input_tokens,
                ..Default::default()
            }
        }),
        completion_tokens_details: None,
        anthropic_usage: true,
        cache_creation_input_tokens: usage.cache_creation_input_tokens,
    }
}
