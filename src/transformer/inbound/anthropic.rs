//! Anthropic Messages inbound codec.
//!
//! Decodes `/v1/messages` bodies into the internal format and re-encodes
//! internal responses as Anthropic `Message` objects. The stream encoder is
//! a state machine producing a strict
//! `message_start (content_block_start content_block_delta* content_block_stop)*
//! message_delta message_stop` trace; switching between thinking, text, and
//! tool_use blocks closes the open block and bumps the block index.

use std::collections::HashSet;

use serde_json::Value;

use crate::core::error::{AppError, Result};
use crate::core::tokenizer::count_tokens;
use crate::transformer::aggregate::aggregate_chunks;
use crate::transformer::anthropic::*;
use crate::transformer::dataurl::parse_data_url;
use crate::transformer::inbound::{format_sse_event, Inbound};
use crate::transformer::internal::{
    self, ApiFormat, ContentPart, ImageUrl, InternalRequest, InternalResponse, MessageContent,
    Stop, ToolCall,
};

#[derive(Default)]
pub struct AnthropicInbound {
    // Stream state
    has_started: bool,
    has_text_started: bool,
    has_thinking_started: bool,
    has_tool_started: bool,
    has_finished: bool,
    message_stopped: bool,
    message_id: String,
    model_name: String,
    content_index: i64,
    stop_reason: Option<String>,
    seen_tool_indices: HashSet<i64>,
    /// Request-side token estimate, for the synthetic message_start usage
    input_tokens: i64,

    stream_chunks: Vec<InternalResponse>,
    stored_response: Option<InternalResponse>,
}

impl Inbound for AnthropicInbound {
    fn decode_request(&mut self, body: &[u8]) -> Result<InternalRequest> {
        let req: MessageRequest = serde_json::from_slice(body)
            .map_err(|e| AppError::InvalidRequest(e.to_string()))?;

        let mut internal = InternalRequest {
            model: req.model.clone(),
            max_tokens: Some(req.max_tokens),
            temperature: req.temperature,
            top_p: req.top_p,
            stream: req.stream,
            raw_api_format: ApiFormat::AnthropicMessages,
            ..Default::default()
        };

        if let Some(metadata) = &req.metadata {
            internal
                .metadata
                .insert("user_id".to_string(), metadata.user_id.clone());
        }

        let mut messages = Vec::with_capacity(req.messages.len() + 1);

        match &req.system {
            Some(SystemPrompt::Text(text)) => {
                self.input_tokens += count_tokens(text, &req.model) as i64;
                messages.push(internal::Message {
                    role: "system".to_string(),
                    content: Some(MessageContent::text(text.clone())),
                    ..Default::default()
                });
            }
            Some(SystemPrompt::Parts(parts)) => {
                // Remember the array form so the outbound side reproduces it.
                internal
                    .transformer_metadata
                    .insert("anthropic_system_array_format".to_string(), "true".to_string());
                for part in parts {
                    self.input_tokens += count_tokens(&part.text, &req.model) as i64;
                    messages.push(internal::Message {
                        role: "system".to_string(),
                        content: Some(MessageContent::text(part.text.clone())),
                        cache_control: convert_cache_control(&part.cache_control),
                        ..Default::default()
                    });
                }
            }
            None => {}
        }

        for (msg_index, msg) in req.messages.iter().enumerate() {
            let mut chat_msg = internal::Message {
                role: msg.role.clone(),
                ..Default::default()
            };
            let mut has_content = false;
            let mut has_tool_result = false;

            match &msg.content {
                AnthropicContent::Text(text) => {
                    self.input_tokens += count_tokens(text, &req.model) as i64;
                    chat_msg.content = Some(MessageContent::text(text.clone()));
                    has_content = true;
                }
                AnthropicContent::Blocks(blocks) => {
                    let mut parts: Vec<ContentPart> = Vec::new();
                    let mut reasoning: Option<String> = None;
                    let mut signature: Option<String> = None;

                    for block in blocks {
                        match block.kind.as_str() {
                            "thinking" => {
                                if let Some(thinking) = &block.thinking {
                                    if !thinking.is_empty() {
                                        reasoning = Some(thinking.clone());
                                    }
                                }
                                if let Some(sig) = &block.signature {
                                    if !sig.is_empty() {
                                        signature = Some(sig.clone());
                                    }
                                }
                            }
                            "text" => {
                                if let Some(text) = &block.text {
                                    self.input_tokens += count_tokens(text, &req.model) as i64;
                                    parts.push(ContentPart {
                                        kind: "text".to_string(),
                                        text: Some(text.clone()),
                                        cache_control: convert_cache_control(&block.cache_control),
                                        ..Default::default()
                                    });
                                    has_content = true;
                                }
                            }
                            "image" => {
                                if let Some(source) = &block.source {
                                    let url = if source.kind == "base64" {
                                        format!(
                                            "data:{};base64,{}",
                                            source.media_type, source.data
                                        )
                                    } else {
                                        source.url.clone()
                                    };
                                    parts.push(ContentPart {
                                        kind: "image_url".to_string(),
                                        image_url: Some(ImageUrl { url, detail: None }),
                                        cache_control: convert_cache_control(&block.cache_control),
                                        ..Default::default()
                                    });
                                    has_content = true;
                                }
                            }
                            "tool_result" => {
                                has_tool_result = true;
                                if let Some(content) = &block.content {
                                    let mut tool_msg = internal::Message {
                                        role: "tool".to_string(),
                                        message_index: Some(msg_index),
                                        tool_call_id: block.tool_use_id.clone(),
                                        tool_call_is_error: block.is_error,
                                        cache_control: convert_cache_control(&block.cache_control),
                                        ..Default::default()
                                    };
                                    match content.as_ref() {
                                        AnthropicContent::Text(text) => {
                                            tool_msg.content =
                                                Some(MessageContent::text(text.clone()));
                                        }
                                        AnthropicContent::Blocks(inner) => {
                                            let mut tool_parts = Vec::new();
                                            for inner_block in inner {
                                                if inner_block.kind == "text" {
                                                    if let Some(text) = &inner_block.text {
                                                        self.input_tokens +=
                                                            count_tokens(text, &req.model) as i64;
                                                        tool_parts.push(ContentPart::text_part(
                                                            text.clone(),
                                                        ));
                                                    }
                                                }
                                            }
                                            tool_msg.content =
                                                Some(MessageContent::Parts(tool_parts));
                                        }
                                    }
                                    messages.push(tool_msg);
                                }
                            }
                            "tool_use" => {
                                chat_msg.tool_calls.push(ToolCall {
                                    id: block.id.clone(),
                                    kind: "function".to_string(),
                                    function: internal::FunctionCall {
                                        name: block.name.clone().unwrap_or_default(),
                                        arguments: block
                                            .input
                                            .as_ref()
                                            .map(|v| v.to_string())
                                            .unwrap_or_default(),
                                    },
                                    index: chat_msg.tool_calls.len() as i64,
                                });
                                has_content = true;
                            }
                            _ => {}
                        }
                    }

                    if parts.len() == 1 && parts[0].kind == "text" {
                        // Collapse to the string form; keep cache control at
                        // the message level.
                        let part = parts.remove(0);
                        chat_msg.cache_control = part.cache_control;
                        chat_msg.content = part.text.map(MessageContent::Text);
                        has_content = true;
                    } else if !parts.is_empty() {
                        chat_msg.content = Some(MessageContent::Parts(parts));
                        has_content = true;
                    }

                    chat_msg.reasoning_content = reasoning;
                    chat_msg.reasoning_signature = signature;
                }
            }

            if !has_content {
                continue;
            }
            if has_tool_result {
                chat_msg.message_index = Some(msg_index);
            }
            messages.push(chat_msg);
        }
        internal.messages = messages;

        if !req.tools.is_empty() {
            for tool in &req.tools {
                self.input_tokens += count_tokens(&tool.name, &req.model) as i64;
                self.input_tokens += count_tokens(&tool.description, &req.model) as i64;
                self.input_tokens +=
                    count_tokens(&tool.input_schema.to_string(), &req.model) as i64;
                internal.tools.push(internal::Tool {
                    kind: "function".to_string(),
                    function: internal::FunctionDef {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                        strict: None,
                    },
                    image_generation: None,
                    cache_control: convert_cache_control(&tool.cache_control),
                });
            }
            self.input_tokens += (internal.tools.len() * 3) as i64;
        }

        if !req.stop_sequences.is_empty() {
            internal.stop = Some(if req.stop_sequences.len() == 1 {
                Stop::Single(req.stop_sequences[0].clone())
            } else {
                Stop::Multiple(req.stop_sequences.clone())
            });
        }

        if let Some(thinking) = &req.thinking {
            if thinking.kind == "enabled" {
                internal.reasoning_effort =
                    budget_to_reasoning_effort(thinking.budget_tokens).to_string();
                internal.reasoning_budget = Some(thinking.budget_tokens);
            }
        }

        Ok(internal)
    }

    fn encode_response(&mut self, response: InternalResponse) -> Result<Vec<u8>> {
        let mut message = AnthropicMessage {
            id: response.id.clone(),
            kind: "message".to_string(),
            role: "assistant".to_string(),
            model: response.model.clone(),
            ..Default::default()
        };

        if let Some(choice) = response.choices.first() {
            let source = choice.message.as_ref().or(choice.delta.as_ref());
            if let Some(source) = source {
                let mut blocks = Vec::new();

                let reasoning = source.reasoning_text();
                if !reasoning.is_empty() {
                    let signature = source
                        .reasoning_signature
                        .clone()
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| REDACTED_THINKING_SIGNATURE.to_string());
                    blocks.push(ContentBlock {
                        kind: "thinking".to_string(),
                        thinking: Some(reasoning.to_string()),
                        signature: Some(signature),
                        ..Default::default()
                    });
                }

                match &source.content {
                    Some(MessageContent::Text(text)) if !text.is_empty() => {
                        blocks.push(ContentBlock {
                            kind: "text".to_string(),
                            text: Some(text.clone()),
                            ..Default::default()
                        });
                    }
                    Some(MessageContent::Parts(parts)) => {
                        for part in parts {
                            match part.kind.as_str() {
                                "text" => {
                                    if let Some(text) = &part.text {
                                        blocks.push(ContentBlock {
                                            kind: "text".to_string(),
                                            text: Some(text.clone()),
                                            ..Default::default()
                                        });
                                    }
                                }
                                "image_url" => {
                                    if let Some(image) = &part.image_url {
                                        if !image.url.is_empty() {
                                            blocks.push(image_url_to_block(&image.url));
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }

                for tool_call in &source.tool_calls {
                    blocks.push(ContentBlock {
                        kind: "tool_use".to_string(),
                        id: tool_call.id.clone(),
                        name: Some(tool_call.function.name.clone()),
                        input: Some(parse_tool_arguments(&tool_call.function.arguments)),
                        ..Default::default()
                    });
                }

                message.content = blocks;
            }

            message.stop_reason = choice
                .finish_reason
                .as_deref()
                .map(|r| finish_reason_to_stop_reason(r).to_string());
        }

        if let Some(usage) = &response.usage {
            message.usage = Some(to_anthropic_usage(usage));
        }

        let body = serde_json::to_vec(&message)?;
        self.stored_response = Some(response);
        Ok(body)
    }

    fn encode_stream_event(&mut self, chunk: InternalResponse) -> Result<Option<Vec<u8>>> {
        if chunk.is_done() {
            return Ok(None);
        }

        let mut events: Vec<Vec<u8>> = Vec::new();

        if self.message_id.is_empty() && !chunk.id.is_empty() {
            self.message_id = chunk.id.clone();
        }
        if self.model_name.is_empty() && !chunk.model.is_empty() {
            self.model_name = chunk.model.clone();
        }

        if !self.has_started {
            self.has_started = true;
            let usage = match &chunk.usage {
                Some(usage) => to_anthropic_usage(usage),
                None => AnthropicUsage {
                    input_tokens: self.input_tokens,
                    output_tokens: 1,
                    ..Default::default()
                },
            };
            self.push_event(
                &mut events,
                "message_start",
                &StreamEvent {
                    kind: "message_start".to_string(),
                    message: Some(StreamMessage {
                        id: self.message_id.clone(),
                        kind: "message".to_string(),
                        role: "assistant".to_string(),
                        content: vec![],
                        model: self.model_name.clone(),
                        usage: Some(usage),
                    }),
                    ..Default::default()
                },
            )?;
        }

        if let Some(choice) = chunk.choices.first() {
            if let Some(delta) = &choice.delta {
                let reasoning = delta.reasoning_text().to_string();
                if !reasoning.is_empty() {
                    if self.has_tool_started {
                        self.has_tool_started = false;
                        self.close_block(&mut events)?;
                    }
                    if !self.has_thinking_started {
                        self.has_thinking_started = true;
                        self.push_event(
                            &mut events,
                            "content_block_start",
                            &StreamEvent {
                                kind: "content_block_start".to_string(),
                                index: Some(self.content_index),
                                content_block: Some(ContentBlock {
                                    kind: "thinking".to_string(),
                                    thinking: Some(String::new()),
                                    signature: Some(String::new()),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        )?;
                    }
                    self.push_event(
                        &mut events,
                        "content_block_delta",
                        &StreamEvent {
                            kind: "content_block_delta".to_string(),
                            index: Some(self.content_index),
                            delta: Some(StreamDelta {
                                kind: Some("thinking_delta".to_string()),
                                thinking: Some(reasoning),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    )?;
                }

                if let Some(signature) = delta
                    .reasoning_signature
                    .as_ref()
                    .filter(|s| !s.is_empty())
                {
                    self.push_event(
                        &mut events,
                        "content_block_delta",
                        &StreamEvent {
                            kind: "content_block_delta".to_string(),
                            index: Some(self.content_index),
                            delta: Some(StreamDelta {
                                kind: Some("signature_delta".to_string()),
                                signature: Some(signature.clone()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    )?;
                }

                let text = delta
                    .content
                    .as_ref()
                    .and_then(|c| c.as_text())
                    .unwrap_or("")
                    .to_string();
                if !text.is_empty() {
                    if self.has_thinking_started {
                        self.has_thinking_started = false;
                        self.close_block(&mut events)?;
                    }
                    if self.has_tool_started {
                        self.has_tool_started = false;
                        self.close_block(&mut events)?;
                    }
                    if !self.has_text_started {
                        self.has_text_started = true;
                        self.push_event(
                            &mut events,
                            "content_block_start",
                            &StreamEvent {
                                kind: "content_block_start".to_string(),
                                index: Some(self.content_index),
                                content_block: Some(ContentBlock {
                                    kind: "text".to_string(),
                                    text: Some(String::new()),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        )?;
                    }
                    self.push_event(
                        &mut events,
                        "content_block_delta",
                        &StreamEvent {
                            kind: "content_block_delta".to_string(),
                            index: Some(self.content_index),
                            delta: Some(StreamDelta {
                                kind: Some("text_delta".to_string()),
                                text: Some(text),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    )?;
                }

                if !delta.tool_calls.is_empty() {
                    if self.has_thinking_started {
                        self.has_thinking_started = false;
                        self.close_block(&mut events)?;
                    }
                    if self.has_text_started {
                        self.has_text_started = false;
                        self.close_block(&mut events)?;
                    }

                    for tool_call in delta.tool_calls.clone() {
                        if !self.seen_tool_indices.contains(&tool_call.index) {
                            // A new tool call closes the previous tool block.
                            if tool_call.index > 0 {
                                self.close_block(&mut events)?;
                            }
                            self.seen_tool_indices.insert(tool_call.index);
                            self.has_tool_started = true;

                            self.push_event(
                                &mut events,
                                "content_block_start",
                                &StreamEvent {
                                    kind: "content_block_start".to_string(),
                                    index: Some(self.content_index),
                                    content_block: Some(ContentBlock {
                                        kind: "tool_use".to_string(),
                                        id: tool_call.id.clone(),
                                        name: Some(tool_call.function.name.clone()),
                                        input: Some(serde_json::json!({})),
                                        ..Default::default()
                                    }),
                                    ..Default::default()
                                },
                            )?;
                        }
                        if !tool_call.function.arguments.is_empty() {
                            self.push_event(
                                &mut events,
                                "content_block_delta",
                                &StreamEvent {
                                    kind: "content_block_delta".to_string(),
                                    index: Some(self.content_index),
                                    delta: Some(StreamDelta {
                                        kind: Some("input_json_delta".to_string()),
                                        partial_json: Some(tool_call.function.arguments.clone()),
                                        ..Default::default()
                                    }),
                                    ..Default::default()
                                },
                            )?;
                        }
                    }
                }
            }

            if let Some(finish_reason) = &choice.finish_reason {
                if !self.has_finished {
                    self.has_finished = true;
                    self.close_block(&mut events)?;
                    // Stored until the usage chunk arrives; message_delta
                    // carries stop_reason and final usage together.
                    self.stop_reason =
                        Some(finish_reason_to_stop_reason(finish_reason).to_string());
                }
            }
        }

        if chunk.usage.is_some() && self.has_finished && !self.message_stopped {
            let usage = to_anthropic_usage(chunk.usage.as_ref().unwrap());
            self.push_event(
                &mut events,
                "message_delta",
                &StreamEvent {
                    kind: "message_delta".to_string(),
                    delta: self.stop_reason.as_ref().map(|reason| StreamDelta {
                        stop_reason: Some(reason.clone()),
                        ..Default::default()
                    }),
                    usage: Some(usage),
                    ..Default::default()
                },
            )?;
            self.push_event(
                &mut events,
                "message_stop",
                &StreamEvent {
                    kind: "message_stop".to_string(),
                    ..Default::default()
                },
            )?;
            self.message_stopped = true;
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

impl AnthropicInbound {
    fn push_event(
        &mut self,
        events: &mut Vec<Vec<u8>>,
        name: &str,
        event: &StreamEvent,
    ) -> Result<()> {
        let data = serde_json::to_vec(event)?;
        events.push(format_sse_event(name, &data));
        Ok(())
    }

    /// Emit content_block_stop for the open block and advance the index.
    fn close_block(&mut self, events: &mut Vec<Vec<u8>>) -> Result<()> {
        self.push_event(
            events,
            "content_block_stop",
            &StreamEvent {
                kind: "content_block_stop".to_string(),
                index: Some(self.content_index),
                ..Default::default()
            },
        )?;
        self.content_index += 1;
        Ok(())
    }
}

fn convert_cache_control(
    source: &Option<CacheControl>,
) -> Option<internal::CacheControl> {
    source.as_ref().map(|cc| internal::CacheControl {
        kind: cc.kind.clone(),
        ttl: cc.ttl.clone(),
    })
}

fn image_url_to_block(url: &str) -> ContentBlock {
    match parse_data_url(url) {
        Some(parsed) => ContentBlock {
            kind: "image".to_string(),
            source: Some(ImageSource {
                kind: "base64".to_string(),
                media_type: parsed.media_type,
                data: parsed.data,
                url: String::new(),
            }),
            ..Default::default()
        },
        None => ContentBlock {
            kind: "image".to_string(),
            source: Some(ImageSource {
                kind: "url".to_string(),
                url: url.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

fn parse_tool_arguments(arguments: &str) -> Value {
    if arguments.is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| serde_json::json!({}))
}

/// Map an internal finish reason onto the Anthropic stop_reason vocabulary.
fn finish_reason_to_stop_reason(reason: &str) -> &str {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        other => other,
    }
}

fn to_anthropic_usage(usage: &internal::Usage) -> AnthropicUsage {
    let cached = usage.cached_tokens();
    AnthropicUsage {
        input_tokens: usage.prompt_tokens - cached,
        output_tokens: usage.completion_tokens,
        cache_read_input_tokens: cached,
        cache_creation_input_tokens: usage.cache_creation_input_tokens,
    }
}
