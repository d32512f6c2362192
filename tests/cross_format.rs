//! Cross-format codec pipeline tests: client format in, a different
//! provider format out, and back.

use serde_json::{json, Value};

use octopus_gateway::store::entities::ProviderKind;
use octopus_gateway::transformer::inbound::{Inbound, InboundKind};
use octopus_gateway::transformer::{outbound, Outbound};

#[test]
fn test_anthropic_request_lowered_to_gemini() {
    let mut inbound = InboundKind::Anthropic.create();
    let mut internal = inbound
        .decode_request(
            json!({
                "model": "gemini-2.5-pro",
                "max_tokens": 256,
                "system": "be factual",
                "thinking": {"type": "enabled", "budget_tokens": 4000},
                "messages": [{"role": "user", "content": [
                    {"type": "text", "text": "describe"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}}
                ]}]
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();

    let mut gemini = outbound::create(ProviderKind::Gemini);
    let upstream = gemini
        .encode_request(&mut internal, "https://generativelanguage.googleapis.com/v1beta", "gk")
        .unwrap();

    assert!(upstream
        .url
        .contains("models/gemini-2.5-pro:generateContent"));
    let body: Value = serde_json::from_slice(&upstream.body).unwrap();
    assert_eq!(body["system_instruction"]["parts"][0]["text"], "be factual");
    // budget 4000 is classified "low"; Gemini's low budget is 1024.
    assert_eq!(
        body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
        1024
    );
    let parts = body["contents"][0]["parts"].as_array().unwrap();
    assert_eq!(parts[0]["text"], "describe");
    assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
    assert_eq!(parts[1]["inlineData"]["data"], "AAAA");
}

#[test]
fn test_gemini_response_raised_to_anthropic() {
    let mut gemini = outbound::create(ProviderKind::Gemini);
    let internal = gemini
        .decode_response(
            200,
            json!({
                "candidates": [{
                    "index": 0,
                    "finishReason": "STOP",
                    "content": {"role": "model", "parts": [{"text": "the answer"}]}
                }],
                "usageMetadata": {"promptTokenCount": 11, "candidatesTokenCount": 4, "totalTokenCount": 15}
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();

    let mut inbound = InboundKind::Anthropic.create();
    let body = inbound.encode_response(internal).unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["type"], "message");
    assert_eq!(value["stop_reason"], "end_turn");
    assert_eq!(value["content"][0]["text"], "the answer");
    assert_eq!(value["usage"]["input_tokens"], 11);
    assert_eq!(value["usage"]["output_tokens"], 4);
}

#[test]
fn test_openai_stream_raised_to_responses_protocol() {
    // An OpenAI-chat upstream stream re-encoded for a Responses client
    // must follow the numbered-sequence protocol.
    let mut upstream = outbound::create(ProviderKind::OpenAiChat);
    let mut inbound = InboundKind::OpenAiResponse.create();

    let frames = [
        json!({"id":"chatcmpl-1","object":"chat.completion.chunk","model":"gpt-5",
               "choices":[{"index":0,"delta":{"role":"assistant","content":"par"}}]}),
        json!({"id":"chatcmpl-1","object":"chat.completion.chunk","model":"gpt-5",
               "choices":[{"index":0,"delta":{"content":"tial"}}]}),
        json!({"id":"chatcmpl-1","object":"chat.completion.chunk","model":"gpt-5",
               "choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}),
        json!({"id":"chatcmpl-1","object":"chat.completion.chunk","model":"gpt-5","choices":[],
               "usage":{"prompt_tokens":4,"completion_tokens":2,"total_tokens":6}}),
    ];

    let mut kinds: Vec<String> = Vec::new();
    let mut sequence_numbers: Vec<i64> = Vec::new();
    for frame in frames {
        let chunk = upstream
            .decode_stream_event(frame.to_string().as_bytes())
            .unwrap()
            .unwrap();
        if let Some(out) = inbound.encode_stream_event(chunk).unwrap() {
            for line in std::str::from_utf8(&out).unwrap().lines() {
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let event: Value = serde_json::from_str(data).unwrap();
                kinds.push(event["type"].as_str().unwrap().to_string());
                sequence_numbers.push(event["sequence_number"].as_i64().unwrap());
            }
        }
    }

    assert_eq!(kinds.first().map(String::as_str), Some("response.created"));
    assert_eq!(kinds.get(1).map(String::as_str), Some("response.in_progress"));
    assert_eq!(
        kinds.last().map(String::as_str),
        Some("response.completed")
    );
    assert!(kinds.iter().any(|k| k == "response.output_text.delta"));
    assert!(kinds.iter().any(|k| k == "response.output_item.done"));
    for window in sequence_numbers.windows(2) {
        assert!(window[1] > window[0]);
    }

    // Aggregating the stored chunks yields the full text for telemetry.
    let full = inbound.internal_response().unwrap();
    let message = full.choices[0].message.as_ref().unwrap();
    assert_eq!(
        message.content.as_ref().unwrap().as_text(),
        Some("partial")
    );
    assert_eq!(full.usage.as_ref().unwrap().total_tokens, 6);
}

#[test]
fn test_openai_stream_raised_to_anthropic_trace() {
    let mut upstream = outbound::create(ProviderKind::OpenAiChat);
    let mut inbound = InboundKind::Anthropic.create();

    let frames = [
        json!({"id":"chatcmpl-1","object":"chat.completion.chunk","model":"gpt-4o-mini",
               "choices":[{"index":0,"delta":{"role":"assistant","content":"hey"}}]}),
        json!({"id":"chatcmpl-1","object":"chat.completion.chunk","model":"gpt-4o-mini",
               "choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}),
        json!({"id":"chatcmpl-1","object":"chat.completion.chunk","model":"gpt-4o-mini","choices":[],
               "usage":{"prompt_tokens":4,"completion_tokens":1,"total_tokens":5}}),
    ];

    let mut events: Vec<String> = Vec::new();
    for frame in frames {
        let chunk = upstream
            .decode_stream_event(frame.to_string().as_bytes())
            .unwrap()
            .unwrap();
        if let Some(out) = inbound.encode_stream_event(chunk).unwrap() {
            events.extend(
                std::str::from_utf8(&out)
                    .unwrap()
                    .lines()
                    .filter_map(|l| l.strip_prefix("event:"))
                    .map(str::to_string),
            );
        }
    }

    // message_start (content_block_start content_block_delta* content_block_stop)*
    // message_delta message_stop
    assert_eq!(
        events,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
}
