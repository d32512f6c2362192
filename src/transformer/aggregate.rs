//! Stream-chunk aggregation.
//!
//! Every inbound codec stores the internal deltas it is fed and, at terminal
//! time, folds them into one complete response for telemetry: content and
//! reasoning are string-appended, tool calls merge by index, choices are
//! indexed by position, and usage comes from the last chunk carrying it.

use std::collections::HashMap;

use crate::transformer::internal::{Choice, InternalResponse, Message, ToolCall};

/// Fold stream chunks into a single non-stream response.
/// Returns `None` for an empty chunk list.
pub fn aggregate_chunks(chunks: &[InternalResponse]) -> Option<InternalResponse> {
    let first = chunks.first()?;
    let mut result = InternalResponse {
        id: first.id.clone(),
        object: "chat.completion".to_string(),
        created: first.created,
        model: first.model.clone(),
        system_fingerprint: first.system_fingerprint.clone(),
        service_tier: first.service_tier.clone(),
        ..Default::default()
    };

    let mut choices: HashMap<i64, Choice> = HashMap::new();

    for chunk in chunks {
        // Some providers only send id/model on later chunks.
        if !chunk.id.is_empty() {
            result.id = chunk.id.clone();
        }
        if !chunk.model.is_empty() {
            result.model = chunk.model.clone();
        }
        if chunk.usage.is_some() {
            result.usage = chunk.usage.clone();
        }

        for choice in &chunk.choices {
            let entry = choices.entry(choice.index).or_insert_with(|| Choice {
                index: choice.index,
                message: Some(Message::default()),
                ..Default::default()
            });
            let message = entry.message.as_mut().unwrap();

            if let Some(delta) = &choice.delta {
                if !delta.role.is_empty() {
                    message.role = delta.role.clone();
                }

                if let Some(content) = &delta.content {
                    append_text(message, &content.all_text());
                    // Non-text parts (images, audio) accumulate as parts.
                    for part in content.parts() {
                        if part.kind != "text" {
                            push_part(message, part.clone());
                        }
                    }
                }
                for image in &delta.images {
                    push_part(message, image.clone());
                }

                let reasoning = delta.reasoning_text();
                if !reasoning.is_empty() {
                    let slot = message.reasoning_content.get_or_insert_with(String::new);
                    slot.push_str(reasoning);
                }
                if delta.reasoning_signature.is_some() {
                    message.reasoning_signature = delta.reasoning_signature.clone();
                }

                for tool_call in &delta.tool_calls {
                    merge_tool_call(&mut message.tool_calls, tool_call);
                }

                if !delta.refusal.is_empty() {
                    message.refusal = delta.refusal.clone();
                }
            }

            if choice.finish_reason.is_some() {
                entry.finish_reason = choice.finish_reason.clone();
            }
        }
    }

    let mut ordered: Vec<Choice> = choices.into_values().collect();
    ordered.sort_by_key(|c| c.index);
    result.choices = ordered;

    Some(result)
}

fn append_text(message: &mut Message, text: &str) {
    if text.is_empty() {
        return;
    }
    use crate::transformer::internal::MessageContent;
    match &mut message.content {
        Some(MessageContent::Text(existing)) => existing.push_str(text),
        Some(MessageContent::Parts(parts)) => {
            parts.push(crate::transformer::internal::ContentPart::text_part(text));
        }
        None => message.content = Some(MessageContent::Text(text.to_string())),
    }
}

fn push_part(message: &mut Message, part: crate::transformer::internal::ContentPart) {
    use crate::transformer::internal::MessageContent;
    match &mut message.content {
        Some(MessageContent::Parts(parts)) => parts.push(part),
        Some(MessageContent::Text(text)) => {
            let mut parts = vec![crate::transformer::internal::ContentPart::text_part(
                text.clone(),
            )];
            parts.push(part);
            message.content = Some(MessageContent::Parts(parts));
        }
        None => message.content = Some(MessageContent::Parts(vec![part])),
    }
}

/// Merge a tool-call delta into the accumulated list by `index`. The id can
/// be absent on later deltas, so index is the correlation key; names and
/// arguments concatenate.
pub fn merge_tool_call(tool_calls: &mut Vec<ToolCall>, delta: &ToolCall) {
    for existing in tool_calls.iter_mut() {
        if existing.index == delta.index {
            if !delta.id.is_empty() {
                existing.id = delta.id.clone();
            }
            if !delta.kind.is_empty() {
                existing.kind = delta.kind.clone();
            }
            existing.function.name.push_str(&delta.function.name);
            existing.function.arguments.push_str(&delta.function.arguments);
            return;
        }
    }
    tool_calls.push(delta.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::internal::{FunctionCall, MessageContent, Usage};

    fn delta_chunk(text: &str) -> InternalResponse {
        InternalResponse {
            id: "resp_1".into(),
            object: "chat.completion.chunk".into(),
            model: "gpt-4o-mini".into(),
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
        }
    }

    #[test]
    fn test_empty_chunks() {
        assert!(aggregate_chunks(&[]).is_none());
    }

    #[test]
    fn test_text_appends_in_order() {
        let chunks = vec![delta_chunk("Hel"), delta_chunk("lo"), delta_chunk("!")];
        let result = aggregate_chunks(&chunks).unwrap();
        let message = result.choices[0].message.as_ref().unwrap();
        assert_eq!(message.content.as_ref().unwrap().as_text(), Some("Hello!"));
        assert_eq!(result.object, "chat.completion");
    }

    #[test]
    fn test_single_terminal_chunk_yields_stored_content() {
        let mut chunk = delta_chunk("only");
        chunk.choices[0].finish_reason = Some("stop".into());
        chunk.usage = Some(Usage {
            prompt_tokens: 3,
            completion_tokens: 1,
            total_tokens: 4,
            ..Default::default()
        });

        let result = aggregate_chunks(&[chunk]).unwrap();
        let message = result.choices[0].message.as_ref().unwrap();
        assert_eq!(message.content.as_ref().unwrap().as_text(), Some("only"));
        assert_eq!(result.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(result.usage.as_ref().unwrap().prompt_tokens, 3);
    }

    #[test]
    fn test_usage_from_last_chunk_carrying_it() {
        let mut first = delta_chunk("a");
        first.usage = Some(Usage {
            prompt_tokens: 1,
            ..Default::default()
        });
        let mut last = delta_chunk("b");
        last.usage = Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 2,
            ..Default::default()
        });

        let result = aggregate_chunks(&[first, last]).unwrap();
        assert_eq!(result.usage.as_ref().unwrap().prompt_tokens, 10);
    }

    #[test]
    fn test_tool_calls_merge_by_index() {
        let mut calls = vec![];
        merge_tool_call(
            &mut calls,
            &ToolCall {
                id: "call_1".into(),
                kind: "function".into(),
                index: 0,
                function: FunctionCall {
                    name: "get_weather".into(),
                    arguments: "{\"ci".into(),
                },
            },
        );
        // Later deltas have no id, only index.
        merge_tool_call(
            &mut calls,
            &ToolCall {
                index: 0,
                function: FunctionCall {
                    name: String::new(),
                    arguments: "ty\":\"sf\"}".into(),
                },
                ..Default::default()
            },
        );
        merge_tool_call(
            &mut calls,
            &ToolCall {
                id: "call_2".into(),
                index: 1,
                function: FunctionCall {
                    name: "other".into(),
                    arguments: "{}".into(),
                },
                ..Default::default()
            },
        );

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.arguments, "{\"city\":\"sf\"}");
        assert_eq!(calls[1].function.name, "other");
    }

    #[test]
    fn test_reasoning_appends_separately_from_content() {
        let mut thinking = InternalResponse {
            object: "chat.completion.chunk".into(),
            choices: vec![Choice {
                index: 0,
                delta: Some(Message {
                    reasoning_content: Some("let me ".into()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let more = {
            let mut c = thinking.clone();
            c.choices[0].delta.as_mut().unwrap().reasoning_content = Some("think".into());
            c
        };
        thinking.choices[0].delta.as_mut().unwrap().reasoning_content = Some("let me ".into());

        let result = aggregate_chunks(&[thinking, more, delta_chunk("answer")]).unwrap();
        let message = result.choices[0].message.as_ref().unwrap();
        assert_eq!(message.reasoning_content.as_deref(), Some("let me think"));
        assert_eq!(message.content.as_ref().unwrap().as_text(), Some("answer"));
    }

    #[test]
    fn test_choices_indexed_by_position() {
        let mut chunk_b = delta_chunk("b");
        chunk_b.choices[0].index = 1;
        let chunks = vec![chunk_b, delta_chunk("a")];
        let result = aggregate_chunks(&chunks).unwrap();
        assert_eq!(result.choices.len(), 2);
        assert_eq!(result.choices[0].index, 0);
        assert_eq!(result.choices[1].index, 1);
    }
}
