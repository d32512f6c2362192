//! Gemini generateContent outbound codec.
//!
//! Lowers the internal chat shape onto the Gemini wire: system/developer
//! messages collect into `system_instruction`, assistant becomes `model`,
//! tool results become user-role `functionResponse` parts, and tool schemas
//! pass through the Gemini schema sanitizer before sending.

use serde_json::Value;

use crate::core::error::{AppError, Result};
use crate::transformer::dataurl::parse_data_url;
use crate::transformer::gemini::*;
use crate::transformer::internal::{
    self, CompletionTokensDetails, InternalRequest, InternalResponse, MessageContent,
    PromptTokensDetails, ToolChoice, Usage,
};
use crate::transformer::outbound::{urlencode, Outbound, UpstreamRequest};

/// Signature accepted by Gemini when replaying tool-call turns that did not
/// originate from a Gemini thought.
const SKIP_THOUGHT_SIGNATURE: &str = "skip_thought_signature_validator";

#[derive(Default)]
pub struct GeminiOutbound;

impl Outbound for GeminiOutbound {
    fn encode_request(
        &mut self,
        request: &mut InternalRequest,
        base_url: &str,
        key: &str,
    ) -> Result<UpstreamRequest> {
        let gemini_request = build_request(request);
        let body = serde_json::to_vec(&gemini_request)?;

        let is_stream = request.is_streaming();
        let method = if is_stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let model_path = if request.model.contains('/') {
            request.model.clone()
        } else {
            format!("models/{}", request.model)
        };

        let mut url = format!(
            "{}/{}:{}?key={}",
            base_url.trim_end_matches('/'),
            model_path,
            method,
            urlencode(key)
        );
        if is_stream {
            url.push_str("&alt=sse");
        }

        Ok(UpstreamRequest {
            url,
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ],
            body,
        })
    }

    fn decode_response(&mut self, _status: u16, body: &[u8]) -> Result<InternalResponse> {
        if body.is_empty() {
            return Err(AppError::Internal("response body is empty".to_string()));
        }
        let response: GenerateContentResponse = serde_json::from_slice(body)?;
        Ok(decode_response(&response, false))
    }

    fn decode_stream_event(&mut self, event: &[u8]) -> Result<Option<InternalResponse>> {
        if event.is_empty() || event.starts_with(b"[DONE]") {
            return Ok(Some(InternalResponse::done()));
        }
        let response: GenerateContentResponse = serde_json::from_slice(event)?;
        Ok(Some(decode_response(&response, true)))
    }
}

/// Map a reasoning effort level onto a Gemini thinking budget; unknown
/// levels fall back to the dynamic sentinel.
fn effort_to_thinking_budget(effort: &str) -> i64 {
    match effort.to_ascii_lowercase().as_str() {
        "low" => 1024,
        "medium" => 4096,
        "high" => 24576,
        _ => -1,
    }
}

fn audio_mime_type(format: &str) -> &'static str {
    match format {
        "mp3" => "audio/mp3",
        "aiff" => "audio/aiff",
        "aac" => "audio/aac",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "audio/wav",
    }
}

// ============================================================================
// Request building
// ============================================================================

fn build_request(request: &InternalRequest) -> GenerateContentRequest {
    let mut gemini = GenerateContentRequest::default();
    let mut system_parts: Vec<Part> = Vec::new();

    for msg in &request.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &msg.content {
                    let text = content.all_text();
                    if !text.is_empty() {
                        system_parts.push(Part {
                            text,
                            ..Default::default()
                        });
                    }
                }
            }
            "user" => gemini.contents.push(user_content(msg)),
            "assistant" => gemini.contents.push(assistant_content(msg)),
            "tool" => gemini.contents.push(tool_result_content(msg)),
            _ => {}
        }
    }

    if !system_parts.is_empty() {
        gemini.system_instruction = Some(Content {
            role: String::new(),
            parts: system_parts,
        });
    }

    gemini.generation_config = build_generation_config(request);

    if !request.tools.is_empty() {
        let mut declarations = Vec::new();
        for tool in &request.tools {
            if tool.kind != "function" {
                continue;
            }
            let mut parameters = tool.function.parameters.clone();
            let parameters = if parameters.is_object() {
                clean_gemini_schema(&mut parameters);
                Some(parameters)
            } else {
                None
            };
            declarations.push(FunctionDeclaration {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                parameters,
            });
        }
        if !declarations.is_empty() {
            gemini.tools = vec![GeminiTool {
                function_declarations: declarations,
            }];
        }
    }

    if let Some(tool_choice) = &request.tool_choice {
        let mut mode = "AUTO".to_string();
        let mut allowed = Vec::new();
        match tool_choice {
            ToolChoice::Mode(raw) => {
                mode = match raw.to_ascii_lowercase().as_str() {
                    "required" => "ANY",
                    "none" => "NONE",
                    _ => "AUTO",
                }
                .to_string();
            }
            ToolChoice::Named(named) if named.kind == "function" => {
                mode = "ANY".to_string();
                if !named.function.name.is_empty() {
                    allowed.push(named.function.name.clone());
                }
            }
            ToolChoice::Named(_) => {}
        }
        gemini.tool_config = Some(ToolConfig {
            function_calling_config: Some(FunctionCallingConfig {
                mode,
                allowed_function_names: allowed,
            }),
        });
    }

    gemini
}

fn build_generation_config(request: &InternalRequest) -> Option<GenerationConfig> {
    let mut config = GenerationConfig::default();
    let mut has_config = false;

    if let Some(max_tokens) = request.max_tokens {
        config.max_output_tokens = Some(max_tokens);
        has_config = true;
    }
    if request.temperature.is_some() {
        config.temperature = request.temperature;
        has_config = true;
    }
    if request.top_p.is_some() {
        config.top_p = request.top_p;
        has_config = true;
    }
    if let Some(raw) = request.transformer_metadata.get("gemini_top_k") {
        if let Ok(top_k) = raw.parse::<i64>() {
            config.top_k = Some(top_k);
            has_config = true;
        }
    }
    if let Some(stop) = &request.stop {
        config.stop_sequences = stop.sequences();
        has_config = true;
    }
    if !request.reasoning_effort.is_empty() {
        config.thinking_config = Some(ThinkingConfig {
            include_thoughts: true,
            thinking_budget: Some(effort_to_thinking_budget(&request.reasoning_effort)),
        });
        has_config = true;
    }
    if let Some(format) = &request.response_format {
        config.response_mime_type = match format.kind.as_str() {
            "json_object" | "json_schema" => "application/json".to_string(),
            "text" => "text/plain".to_string(),
            _ => String::new(),
        };
        if !config.response_mime_type.is_empty() {
            has_config = true;
        }
    }
    if !request.modalities.is_empty() {
        // Gemini wants capitalized modality names.
        config.response_modalities = request
            .modalities
            .iter()
            .filter(|m| !m.is_empty())
            .map(|m| {
                let mut chars = m.chars();
                let first = chars.next().unwrap().to_ascii_uppercase();
                format!("{first}{}", chars.as_str().to_ascii_lowercase())
            })
            .collect();
        has_config = true;
    }

    has_config.then_some(config)
}

fn user_content(msg: &internal::Message) -> Content {
    let mut parts = Vec::new();
    match &msg.content {
        Some(MessageContent::Text(text)) => parts.push(Part {
            text: text.clone(),
            ..Default::default()
        }),
        Some(MessageContent::Parts(content_parts)) => {
            for part in content_parts {
                match part.kind.as_str() {
                    "text" => {
                        if let Some(text) = &part.text {
                            parts.push(Part {
                                text: text.clone(),
                                ..Default::default()
                            });
                        }
                    }
                    "image_url" => {
                        if let Some(image) = &part.image_url {
                            if let Some(parsed) = parse_data_url(&image.url) {
                                if parsed.is_base64 {
                                    parts.push(Part {
                                        inline_data: Some(Blob {
                                            mime_type: parsed.media_type,
                                            data: parsed.data,
                                        }),
                                        ..Default::default()
                                    });
                                }
                            }
                        }
                    }
                    "input_audio" => {
                        if let Some(audio) = &part.audio {
                            parts.push(Part {
                                inline_data: Some(Blob {
                                    mime_type: audio_mime_type(&audio.format).to_string(),
                                    data: audio.data.clone(),
                                }),
                                ..Default::default()
                            });
                        }
                    }
                    "file" => {
                        if let Some(file) = &part.file {
                            if let Some(parsed) = parse_data_url(&file.file_data) {
                                if parsed.is_base64 {
                                    parts.push(Part {
                                        inline_data: Some(Blob {
                                            mime_type: parsed.media_type,
                                            data: parsed.data,
                                        }),
                                        ..Default::default()
                                    });
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        None => {}
    }

    Content {
        role: "user".to_string(),
        parts,
    }
}

fn assistant_content(msg: &internal::Message) -> Content {
    let mut parts = Vec::new();
    if let Some(content) = &msg.content {
        let text = content.all_text();
        if !text.is_empty() {
            parts.push(Part {
                text,
                ..Default::default()
            });
        }
    }
    for tool_call in &msg.tool_calls {
        let args: Option<Value> = serde_json::from_str(&tool_call.function.arguments).ok();
        parts.push(Part {
            function_call: Some(FunctionCall {
                name: tool_call.function.name.clone(),
                args,
            }),
            thought_signature: SKIP_THOUGHT_SIGNATURE.to_string(),
            ..Default::default()
        });
    }
    Content {
        role: "model".to_string(),
        parts,
    }
}

/// Function responses are carried by the user role in Gemini.
fn tool_result_content(msg: &internal::Message) -> Content {
    let raw = msg
        .content
        .as_ref()
        .map(|c| c.all_text())
        .unwrap_or_default();
    let response: Value = serde_json::from_str(&raw)
        .ok()
        .filter(Value::is_object)
        .unwrap_or_else(|| serde_json::json!({"result": raw}));

    Content {
        role: "user".to_string(),
        parts: vec![Part {
            function_response: Some(FunctionResponse {
                name: msg.tool_call_id.clone().unwrap_or_default(),
                response,
            }),
            ..Default::default()
        }],
    }
}

// ============================================================================
// Response decoding
// ============================================================================

fn decode_response(gemini: &GenerateContentResponse, is_stream: bool) -> InternalResponse {
    let mut resp = InternalResponse {
        object: if is_stream {
            "chat.completion.chunk".to_string()
        } else {
            "chat.completion".to_string()
        },
        ..Default::default()
    };

    for candidate in &gemini.candidates {
        let mut choice = internal::Choice {
            index: candidate.index,
            finish_reason: candidate
                .finish_reason
                .as_deref()
                .map(|r| decode_finish_reason(r).to_string()),
            ..Default::default()
        };

        if let Some(content) = &candidate.content {
            let mut message = internal::Message {
                role: "assistant".to_string(),
                ..Default::default()
            };

            let mut text_parts: Vec<String> = Vec::new();
            let mut content_parts: Vec<internal::ContentPart> = Vec::new();
            let mut tool_calls = Vec::new();
            let mut reasoning: Option<String> = None;
            let mut has_inline_data = false;

            for (idx, part) in content.parts.iter().enumerate() {
                if part.thought {
                    if !part.text.is_empty() && reasoning.is_none() {
                        reasoning = Some(part.text.clone());
                    }
                } else if !part.text.is_empty() {
                    text_parts.push(part.text.clone());
                    content_parts.push(internal::ContentPart::text_part(part.text.clone()));
                }
                if let Some(inline) = &part.inline_data {
                    // Inline data lifts to a data-URL image part.
                    has_inline_data = true;
                    content_parts.push(internal::ContentPart::image_part(format!(
                        "data:{};base64,{}",
                        inline.mime_type, inline.data
                    )));
                }
                if let Some(call) = &part.function_call {
                    let arguments = call
                        .args
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "{}".to_string());
                    tool_calls.push(internal::ToolCall {
                        index: idx as i64,
                        id: format!("call_{}_{}", call.name, idx),
                        kind: "function".to_string(),
                        function: internal::FunctionCall {
                            name: call.name.clone(),
                            arguments,
                        },
                    });
                }
            }

            if has_inline_data {
                message.content = Some(MessageContent::Parts(content_parts));
            } else if !text_parts.is_empty() {
                message.content = Some(MessageContent::Text(text_parts.concat()));
            }
            message.reasoning_content = reasoning;
            if !tool_calls.is_empty() {
                message.tool_calls = tool_calls;
                if choice.finish_reason.is_none() {
                    choice.finish_reason = Some("tool_calls".to_string());
                }
            }

            if is_stream {
                choice.delta = Some(message);
            } else {
                choice.message = Some(message);
            }
        }

        resp.choices.push(choice);
    }

    if let Some(metadata) = &gemini.usage_metadata {
        let mut usage = Usage {
            prompt_tokens: metadata.prompt_token_count,
            completion_tokens: metadata.candidates_token_count,
            total_tokens: metadata.total_token_count,
            ..Default::default()
        };
        if metadata.cached_content_token_count > 0 {
            usage.prompt_tokens_details = Some(PromptTokensDetails {
                cached_tokens: metadata.cached_content_token_count,
                ..Default::default()
            });
        }
        if metadata.thoughts_token_count > 0 {
            usage.completion_tokens_details = Some(CompletionTokensDetails {
                reasoning_tokens: metadata.thoughts_token_count,
                ..Default::default()
            });
        }
        resp.usage = Some(usage);
    }

    resp
}

fn decode_finish_reason(reason: &str) -> &'static str {
    match reason {
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" => "content_filter",
        _ => "stop",
    }
}
