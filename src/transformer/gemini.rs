//! Gemini generateContent wire types and the tool-schema sanitizer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<GeminiTool>,
    #[serde(rename = "toolConfig", default, skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    #[serde(
        rename = "generationConfig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(rename = "inlineData", default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
    #[serde(
        rename = "functionCall",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub function_call: Option<FunctionCall>,
    #[serde(
        rename = "functionResponse",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub function_response: Option<FunctionResponse>,
    /// True when the part is model thought
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub thought: bool,
    #[serde(
        rename = "thoughtSignature",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub thought_signature: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Blob {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Base64 payload
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeminiTool {
    #[serde(
        rename = "functionDeclarations",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(
        rename = "functionCallingConfig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub function_calling_config: Option<FunctionCallingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCallingConfig {
    /// "AUTO" | "ANY" | "NONE"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(
        rename = "allowedFunctionNames",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub allowed_function_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(rename = "topP", default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(rename = "topK", default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(
        rename = "maxOutputTokens",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_output_tokens: Option<i64>,
    #[serde(
        rename = "stopSequences",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub stop_sequences: Vec<String>,
    #[serde(
        rename = "responseMimeType",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub response_mime_type: String,
    #[serde(
        rename = "responseModalities",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub response_modalities: Vec<String>,
    #[serde(
        rename = "thinkingConfig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "includeThoughts", default)]
    pub include_thoughts: bool,
    /// -1 means dynamic
    #[serde(
        rename = "thinkingBudget",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub thinking_budget: Option<i64>,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(
        rename = "usageMetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(
        rename = "modelVersion",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub model_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(
        rename = "finishReason",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    pub prompt_token_count: i64,
    #[serde(rename = "candidatesTokenCount", default)]
    pub candidates_token_count: i64,
    #[serde(rename = "totalTokenCount", default)]
    pub total_token_count: i64,
    #[serde(rename = "cachedContentTokenCount", default)]
    pub cached_content_token_count: i64,
    #[serde(rename = "thoughtsTokenCount", default)]
    pub thoughts_token_count: i64,
}

// ============================================================================
// Schema sanitizer
// ============================================================================

/// Keys Gemini's schema dialect rejects.
const UNSUPPORTED_KEYS: &[&str] = &[
    "title",
    "$schema",
    "$ref",
    "strict",
    "exclusiveMaximum",
    "exclusiveMinimum",
    "additionalProperties",
    "oneOf",
    "default",
    "$defs",
];

/// Rewrite a JSON-schema tool declaration into the subset Gemini accepts:
/// local `$ref` resolution, `allOf` merging, uppercased types, tuple-items
/// collapse, `anyOf` flattening, default-value hints, and removal of
/// unsupported keys. Self-referential `$ref` chains are cut by a
/// resolution-stack guard.
pub fn clean_gemini_schema(schema: &mut Value) {
    let root = schema.clone();
    let mut resolving = HashSet::new();
    transform(schema, &root, &mut resolving);
}

fn transform(node: &mut Value, root: &Value, resolving: &mut HashSet<String>) {
    match node {
        Value::Array(items) => {
            for item in items {
                transform(item, root, resolving);
            }
        }
        Value::Object(_) => transform_object(node, root, resolving),
        _ => {}
    }
}

fn transform_object(node: &mut Value, root: &Value, resolving: &mut HashSet<String>) {
    // 1) Resolve local $ref (#/...) against the root. The guard set holds
    // refs currently being expanded; a ref seen again on the same branch is
    // a cycle and is only stripped, not expanded.
    let ref_path = node
        .get("$ref")
        .and_then(|r| r.as_str())
        .filter(|r| r.starts_with("#/"))
        .map(|r| r.to_string());
    let mut entered_ref = None;
    if let Some(ref_path) = ref_path {
        if resolving.insert(ref_path.clone()) {
            if let Some(Value::Object(resolved)) = lookup_pointer(root, &ref_path) {
                let obj = node.as_object_mut().unwrap();
                // Keep local overrides over the resolved body.
                let overlay: Map<String, Value> = obj
                    .iter()
                    .filter(|(k, _)| k.as_str() != "$ref")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                obj.clear();
                for (k, v) in resolved.clone() {
                    obj.insert(k, v);
                }
                for (k, v) in overlay {
                    obj.insert(k, v);
                }
                obj.remove("$ref");
            }
            entered_ref = Some(ref_path);
        } else {
            node.as_object_mut().unwrap().remove("$ref");
        }
    }

    // 2) Merge allOf into the node; existing keys win, properties merge
    // key-wise, required concatenates.
    if let Some(Value::Array(mut all_of)) = node.as_object_mut().unwrap().remove("allOf") {
        for item in &mut all_of {
            transform(item, root, resolving);
        }
        for item in all_of {
            let Value::Object(item_map) = item else { continue };
            let obj = node.as_object_mut().unwrap();
            for (key, value) in item_map {
                match key.as_str() {
                    "properties" => {
                        let props = obj
                            .entry("properties")
                            .or_insert_with(|| Value::Object(Map::new()));
                        if let (Value::Object(props), Value::Object(item_props)) = (props, value) {
                            for (k, v) in item_props {
                                props.entry(k).or_insert(v);
                            }
                        }
                    }
                    "required" => {
                        let merged = [take_string_list(obj.get("required")), take_string_list(Some(&value))]
                            .concat();
                        obj.insert("required".into(), string_list_value(dedupe(merged)));
                    }
                    _ => {
                        obj.entry(key).or_insert(value);
                    }
                }
            }
        }
    }

    // 3) Uppercase the type, picking the first non-null member of a union.
    if let Some(type_value) = node.get("type").cloned() {
        let primary = match &type_value {
            Value::String(s) => Some(s.clone()),
            Value::Array(members) => members
                .iter()
                .filter_map(|m| m.as_str())
                .find(|s| !s.eq_ignore_ascii_case("null"))
                .map(|s| s.to_string()),
            _ => None,
        };
        if let Some(primary) = primary {
            let mapped = match primary.to_ascii_lowercase().as_str() {
                "string" => Some("STRING"),
                "number" => Some("NUMBER"),
                "integer" => Some("INTEGER"),
                "boolean" => Some("BOOLEAN"),
                "array" => Some("ARRAY"),
                "object" => Some("OBJECT"),
                _ => None,
            };
            if let Some(mapped) = mapped {
                node.as_object_mut()
                    .unwrap()
                    .insert("type".into(), Value::String(mapped.into()));
            }
        }
    }

    // 4) ARRAY items: materialize {} when missing; collapse tuples, keeping
    // a description hint with the original member types.
    if node.get("type").and_then(|t| t.as_str()) == Some("ARRAY") {
        let items = node.get("items").cloned();
        match items {
            None | Some(Value::Null) => {
                node.as_object_mut()
                    .unwrap()
                    .insert("items".into(), Value::Object(Map::new()));
            }
            Some(Value::Array(mut tuple)) => {
                let hint_types: Vec<String> = tuple
                    .iter()
                    .map(|it| {
                        it.get("type")
                            .and_then(|t| t.as_str())
                            .filter(|t| !t.is_empty())
                            .unwrap_or("any")
                            .to_string()
                    })
                    .collect();
                let hint = format!("(Tuple: [{}])", hint_types.join(", "));
                append_description(node, &hint);

                for item in &mut tuple {
                    transform(item, root, resolving);
                }

                let first_type = tuple
                    .first()
                    .and_then(|it| it.get("type"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("")
                    .to_string();
                let homogeneous = !first_type.is_empty()
                    && tuple.iter().all(|it| {
                        it.get("type").and_then(|t| t.as_str()) == Some(first_type.as_str())
                    });

                let collapsed = if homogeneous && !tuple.is_empty() {
                    tuple.remove(0)
                } else {
                    Value::Object(Map::new())
                };
                node.as_object_mut().unwrap().insert("items".into(), collapsed);
            }
            Some(_) => {}
        }
    }

    // 5) anyOf: every branch a const becomes an enum; otherwise inline the
    // first typed branch when the node itself has no type.
    if let Some(Value::Array(mut any_of)) = node.as_object_mut().unwrap().remove("anyOf") {
        for item in &mut any_of {
            transform(item, root, resolving);
        }

        let mut all_const = true;
        let mut enum_values = Vec::new();
        for item in &any_of {
            let Some(item_map) = item.as_object() else {
                all_const = false;
                break;
            };
            let Some(const_value) = item_map.get("const") else {
                all_const = false;
                break;
            };
            match const_value {
                Value::Null => {}
                Value::String(s) if s.is_empty() => {}
                Value::String(s) => enum_values.push(s.clone()),
                other => enum_values.push(other.to_string()),
            }
        }

        let obj = node.as_object_mut().unwrap();
        if all_const && !enum_values.is_empty() {
            obj.insert("type".into(), Value::String("STRING".into()));
            obj.insert("enum".into(), string_list_value(enum_values));
        } else if !obj.contains_key("type") {
            for item in any_of {
                if let Some(item_map) = item.as_object() {
                    if item_map.contains_key("type") || item_map.contains_key("enum") {
                        for (k, v) in item_map.clone() {
                            obj.insert(k, v);
                        }
                        break;
                    }
                }
            }
        }
    }

    // 6) Hoist the default value into the description.
    if let Some(default) = node.get("default").cloned() {
        let description = node
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or("");
        if !description.is_empty() {
            let hinted = format!("{description} (Default: {default})");
            node.as_object_mut()
                .unwrap()
                .insert("description".into(), Value::String(hinted));
        }
    }

    // 7) Strip unsupported keys.
    {
        let obj = node.as_object_mut().unwrap();
        for key in UNSUPPORTED_KEYS {
            obj.remove(*key);
        }
    }

    // 8) Recurse into properties and items.
    if let Some(Value::Object(props)) = node.get_mut("properties") {
        let keys: Vec<String> = props.keys().cloned().collect();
        for key in keys {
            if let Some(prop) = props.get_mut(&key) {
                transform(prop, root, resolving);
            }
        }
    }
    if let Some(items) = node.get_mut("items") {
        if !items.is_null() {
            transform(items, root, resolving);
        }
    }

    // 9) De-dupe required (allOf merging can introduce duplicates).
    if let Some(required) = node.get("required") {
        let deduped = dedupe(take_string_list(Some(required)));
        if !deduped.is_empty() {
            node.as_object_mut()
                .unwrap()
                .insert("required".into(), string_list_value(deduped));
        }
    }

    if let Some(ref_path) = entered_ref {
        resolving.remove(&ref_path);
    }
}

fn lookup_pointer<'a>(root: &'a Value, ref_path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in ref_path[2..].split('/') {
        let segment = segment.replace("~1", "/").replace("~0", "~");
        current = current.as_object()?.get(&segment)?;
    }
    Some(current)
}

fn append_description(node: &mut Value, hint: &str) {
    let existing = node
        .get("description")
        .and_then(|d| d.as_str())
        .unwrap_or("")
        .to_string();
    let combined = if existing.is_empty() {
        hint.to_string()
    } else {
        format!("{} {}", existing.trim(), hint)
    };
    node.as_object_mut()
        .unwrap()
        .insert("description".into(), Value::String(combined));
}

fn take_string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect(),
        _ => Vec::new(),
    }
}

fn string_list_value(items: Vec<String>) -> Value {
    Value::Array(items.into_iter().map(Value::String).collect())
}

fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sanitize(mut schema: Value) -> Value {
        clean_gemini_schema(&mut schema);
        schema
    }

    #[test]
    fn test_uppercase_types() {
        let result = sanitize(json!({"type": "object", "properties": {
            "name": {"type": "string"},
            "age": {"type": "integer"},
            "ok": {"type": "boolean"},
        }}));
        assert_eq!(result["type"], "OBJECT");
        assert_eq!(result["properties"]["name"]["type"], "STRING");
        assert_eq!(result["properties"]["age"]["type"], "INTEGER");
        assert_eq!(result["properties"]["ok"]["type"], "BOOLEAN");
    }

    #[test]
    fn test_nullable_union_type_picks_non_null() {
        let result = sanitize(json!({"type": ["null", "number"]}));
        assert_eq!(result["type"], "NUMBER");
    }

    #[test]
    fn test_array_without_items_gets_empty_schema() {
        let result = sanitize(json!({"type": "array"}));
        assert_eq!(result["items"], json!({}));
    }

    #[test]
    fn test_homogeneous_tuple_collapses_with_hint() {
        let result = sanitize(json!({
            "type": "array",
            "items": [{"type": "string"}, {"type": "string"}],
        }));
        assert_eq!(result["type"], "ARRAY");
        assert_eq!(result["items"], json!({"type": "STRING"}));
        assert_eq!(result["description"], "(Tuple: [string, string])");
    }

    #[test]
    fn test_heterogeneous_tuple_loosens_items() {
        let result = sanitize(json!({
            "type": "array",
            "items": [{"type": "string"}, {"type": "integer"}],
            "description": "pair",
        }));
        assert_eq!(result["items"], json!({}));
        assert_eq!(result["description"], "pair (Tuple: [string, integer])");
    }

    #[test]
    fn test_all_of_merges_with_default_hint() {
        let result = sanitize(json!({
            "allOf": [{"type": "string"}],
            "default": "x",
            "description": "name",
        }));
        assert_eq!(result["type"], "STRING");
        assert_eq!(result["description"], "name (Default: \"x\")");
        assert!(result.get("allOf").is_none());
        assert!(result.get("default").is_none());
    }

    #[test]
    fn test_all_of_existing_properties_win() {
        let result = sanitize(json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "allOf": [
                {"properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                 "required": ["a", "b"]},
                {"required": ["a"]},
            ],
        }));
        assert_eq!(result["properties"]["a"]["type"], "STRING");
        assert_eq!(result["properties"]["b"]["type"], "INTEGER");
        assert_eq!(result["required"], json!(["a", "b"]));
    }

    #[test]
    fn test_any_of_all_const_becomes_enum() {
        let result = sanitize(json!({
            "anyOf": [{"const": "red"}, {"const": "green"}, {"const": "blue"}],
        }));
        assert_eq!(result["type"], "STRING");
        assert_eq!(result["enum"], json!(["red", "green", "blue"]));
        assert!(result.get("anyOf").is_none());
    }

    #[test]
    fn test_any_of_inlines_first_typed_branch() {
        let result = sanitize(json!({
            "anyOf": [{"description": "no type"}, {"type": "integer"}],
        }));
        assert_eq!(result["type"], "INTEGER");
    }

    #[test]
    fn test_local_ref_resolution() {
        let result = sanitize(json!({
            "type": "object",
            "properties": {"item": {"$ref": "#/$defs/item"}},
            "$defs": {"item": {"type": "string", "description": "one item"}},
        }));
        assert_eq!(result["properties"]["item"]["type"], "STRING");
        assert_eq!(result["properties"]["item"]["description"], "one item");
        assert!(result.get("$defs").is_none());
    }

    #[test]
    fn test_cyclic_ref_terminates() {
        // node -> #/$defs/a -> #/$defs/a ... must not loop forever.
        let result = sanitize(json!({
            "type": "object",
            "properties": {"next": {"$ref": "#/$defs/a"}},
            "$defs": {"a": {"type": "object", "properties": {"next": {"$ref": "#/$defs/a"}}}},
        }));
        assert_eq!(result["properties"]["next"]["type"], "OBJECT");
    }

    #[test]
    fn test_unsupported_keys_stripped() {
        let result = sanitize(json!({
            "type": "object",
            "title": "T",
            "$schema": "http://json-schema.org/draft-07/schema#",
            "additionalProperties": false,
            "exclusiveMinimum": 0,
            "oneOf": [{"type": "string"}],
        }));
        for key in ["title", "$schema", "additionalProperties", "exclusiveMinimum", "oneOf"] {
            assert!(result.get(key).is_none(), "{key} should be stripped");
        }
    }

    #[test]
    fn test_default_without_description_is_just_dropped() {
        let result = sanitize(json!({"type": "string", "default": "x"}));
        assert!(result.get("default").is_none());
        assert!(result.get("description").is_none());
    }
}
