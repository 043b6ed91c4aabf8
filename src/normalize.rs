use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::AppError;

/// Canonicalize a chat-completions-shaped request into Responses-API input.
/// Top-level keys pass through untouched apart from the token-budget alias,
/// the tool shape flattening, and the `messages` → `input` conversion. A
/// request that already carries `input` is returned as-is, which makes the
/// transformation idempotent.
pub fn normalize_chat(req: Map<String, Value>) -> Result<Map<String, Value>, AppError> {
    let mut normalized = req;

    // chat.completions clients commonly send max_tokens/max_completion_tokens;
    // the Responses API expects max_output_tokens.
    if !normalized.contains_key("max_output_tokens") {
        if let Some(value) = normalized.get("max_completion_tokens").cloned() {
            normalized.insert("max_output_tokens".to_string(), value);
        } else if let Some(value) = normalized.get("max_tokens").cloned() {
            normalized.insert("max_output_tokens".to_string(), value);
        }
    }

    if let Some(Value::Array(tools)) = normalized.get("tools") {
        let converted: Vec<Value> = tools.iter().map(convert_tool).collect();
        normalized.insert("tools".to_string(), Value::Array(converted));
    }

    if normalized.contains_key("input") {
        return Ok(normalized);
    }

    let messages = match normalized.get("messages") {
        Some(Value::Array(messages)) if !messages.is_empty() => messages.clone(),
        _ => return Err(AppError::invalid_request("messages is required")),
    };

    let mut system_instructions: Vec<String> = Vec::new();
    let mut input_items: Vec<Value> = Vec::new();

    for raw in &messages {
        let msg = match raw.as_object() {
            Some(msg) => msg,
            None => continue,
        };
        let role = match msg.get("role").and_then(Value::as_str) {
            Some(role) if !role.is_empty() => role,
            _ => continue,
        };
        let content_text = extract_message_text(msg.get("content"));
        let content_parts = build_input_content(msg.get("content"));

        if role == "system" {
            if !content_text.trim().is_empty() {
                system_instructions.push(content_text);
            }
            continue;
        }

        if role == "assistant" {
            if let Some(Value::Array(tool_calls)) = msg.get("tool_calls") {
                if !tool_calls.is_empty() {
                    for (i, raw_call) in tool_calls.iter().enumerate() {
                        if let Some(item) = convert_tool_call(raw_call, i) {
                            input_items.push(item);
                        }
                    }
                    // Some clients send assistant text alongside tool_calls.
                    // Preserve it as a normal message so downstream context
                    // stays intact.
                    if has_non_empty_message_content(&content_parts) {
                        let mut item = Map::new();
                        item.insert("type".to_string(), Value::String("message".to_string()));
                        item.insert("role".to_string(), Value::String(role.to_string()));
                        item.insert("content".to_string(), parts_to_value(content_parts));
                        input_items.push(Value::Object(item));
                    }
                    continue;
                }
            }
        }

        if role == "tool" {
            let mut item = Map::new();
            item.insert(
                "type".to_string(),
                Value::String("function_call_output".to_string()),
            );
            item.insert("output".to_string(), Value::String(content_text));
            if let Some(call_id) = msg.get("tool_call_id").and_then(Value::as_str) {
                if !call_id.trim().is_empty() {
                    item.insert("call_id".to_string(), Value::String(call_id.to_string()));
                }
            }
            input_items.push(Value::Object(item));
            continue;
        }

        let mut item = Map::new();
        item.insert("type".to_string(), Value::String("message".to_string()));
        item.insert("role".to_string(), Value::String(role.to_string()));
        item.insert(
            "content".to_string(),
            parts_to_value(ensure_non_empty_message_content(content_parts, content_text)),
        );
        input_items.push(Value::Object(item));
    }

    if input_items.is_empty() {
        return Err(AppError::invalid_request("messages is required"));
    }

    normalized.insert("input".to_string(), Value::Array(input_items));
    if !normalized.contains_key("instructions") && !system_instructions.is_empty() {
        normalized.insert(
            "instructions".to_string(),
            Value::String(system_instructions.join("\n\n")),
        );
    }
    normalized.remove("messages");

    Ok(normalized)
}

/// Flatten `{"type":"function","function":{...}}` to the Responses tool
/// shape. Unknown tool shapes pass through verbatim.
fn convert_tool(tool: &Value) -> Value {
    let tool_map = match tool.as_object() {
        Some(map) => map,
        None => return tool.clone(),
    };
    if tool_map.get("type").and_then(Value::as_str) != Some("function") {
        return tool.clone();
    }
    let function = match tool_map.get("function").and_then(Value::as_object) {
        Some(function) => function,
        None => return tool.clone(),
    };
    let mut converted = Map::new();
    converted.insert("type".to_string(), Value::String("function".to_string()));
    for key in ["name", "description", "parameters", "strict"] {
        if let Some(value) = function.get(key) {
            converted.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(converted)
}

fn convert_tool_call(raw: &Value, index: usize) -> Option<Value> {
    let call = raw.as_object()?;
    match call.get("type").and_then(Value::as_str) {
        None | Some("") | Some("function") => {}
        Some(_) => return None,
    }
    let call_id = match call.get("id").and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => format!("call_{}", index),
    };
    let function = call.get("function")?.as_object()?;
    let name = function.get("name").and_then(Value::as_str)?;
    if name.trim().is_empty() {
        return None;
    }

    let arguments = match function.get("arguments") {
        Some(Value::String(s)) => s.clone(),
        None | Some(Value::Null) => String::new(),
        // Keep compatibility with clients that send parsed objects instead
        // of a JSON string.
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    };

    let mut item = Map::new();
    item.insert("type".to_string(), Value::String("function_call".to_string()));
    item.insert("call_id".to_string(), Value::String(call_id));
    item.insert("name".to_string(), Value::String(name.to_string()));
    item.insert("arguments".to_string(), Value::String(arguments));
    Some(Value::Object(item))
}

fn extract_message_text(raw: Option<&Value>) -> String {
    match raw {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => {
            let mut out = String::new();
            for part in parts {
                let part = match part.as_object() {
                    Some(part) => part,
                    None => continue,
                };
                match part.get("type").and_then(Value::as_str) {
                    Some("text") | Some("input_text") | Some("output_text") => {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            out.push_str(text);
                        }
                    }
                    // Non-text segments are ignored here rather than failing.
                    _ => {}
                }
            }
            out
        }
        _ => String::new(),
    }
}

fn build_input_content(raw: Option<&Value>) -> Vec<Map<String, Value>> {
    match raw {
        Some(Value::String(text)) => {
            vec![text_part(text.clone())]
        }
        Some(Value::Array(raw_parts)) => {
            let mut parts = Vec::with_capacity(raw_parts.len());
            for raw_part in raw_parts {
                let part = match raw_part.as_object() {
                    Some(part) => part,
                    None => continue,
                };
                match part.get("type").and_then(Value::as_str) {
                    Some("text") | Some("input_text") | Some("output_text") => {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            parts.push(text_part(text.to_string()));
                        }
                    }
                    Some("image_url") => {
                        let (url, detail) = extract_image_url_part(part.get("image_url"));
                        if url.trim().is_empty() {
                            continue;
                        }
                        let mut item = Map::new();
                        item.insert("type".to_string(), Value::String("input_image".to_string()));
                        item.insert("image_url".to_string(), Value::String(url));
                        if !detail.trim().is_empty() {
                            item.insert("detail".to_string(), Value::String(detail));
                        }
                        parts.push(item);
                    }
                    Some("input_image") => {
                        let mut item = Map::new();
                        item.insert("type".to_string(), Value::String("input_image".to_string()));
                        for key in ["image_url", "detail", "file_id"] {
                            if let Some(value) = part.get(key).and_then(Value::as_str) {
                                if !value.trim().is_empty() {
                                    item.insert(key.to_string(), Value::String(value.to_string()));
                                }
                            }
                        }
                        if item.len() > 1 {
                            parts.push(item);
                        }
                    }
                    // Unsupported multimodal segments are dropped for
                    // compatibility; the raw stats pass counts them.
                    _ => {}
                }
            }
            parts
        }
        _ => Vec::new(),
    }
}

fn extract_image_url_part(raw: Option<&Value>) -> (String, String) {
    match raw {
        Some(Value::String(url)) => (url.clone(), String::new()),
        Some(Value::Object(object)) => {
            let url = object.get("url").and_then(Value::as_str).unwrap_or_default();
            let detail = object.get("detail").and_then(Value::as_str).unwrap_or_default();
            (url.to_string(), detail.to_string())
        }
        _ => (String::new(), String::new()),
    }
}

fn has_non_empty_message_content(parts: &[Map<String, Value>]) -> bool {
    parts.iter().any(|part| {
        match part.get("type").and_then(Value::as_str) {
            Some("input_text") => part
                .get("text")
                .and_then(Value::as_str)
                .map(|text| !text.trim().is_empty())
                .unwrap_or(false),
            Some("input_image") => ["image_url", "file_id"].iter().any(|key| {
                part.get(*key)
                    .and_then(Value::as_str)
                    .map(|value| !value.trim().is_empty())
                    .unwrap_or(false)
            }),
            _ => false,
        }
    })
}

fn ensure_non_empty_message_content(
    parts: Vec<Map<String, Value>>,
    fallback_text: String,
) -> Vec<Map<String, Value>> {
    if !parts.is_empty() {
        return parts;
    }
    vec![text_part(fallback_text)]
}

fn text_part(text: String) -> Map<String, Value> {
    let mut part = Map::new();
    part.insert("type".to_string(), Value::String("input_text".to_string()));
    part.insert("text".to_string(), Value::String(text));
    part
}

fn parts_to_value(parts: Vec<Map<String, Value>>) -> Value {
    Value::Array(parts.into_iter().map(Value::Object).collect())
}

#[derive(Debug, Default)]
pub struct RawContentStats {
    pub raw_messages: u64,
    pub raw_image_parts: u64,
    pub raw_invalid_image_parts: u64,
    pub raw_unknown_parts: u64,
    unknown_types: BTreeMap<String, u64>,
}

impl RawContentStats {
    pub fn unknown_types_string(&self) -> String {
        if self.unknown_types.is_empty() {
            return "-".to_string();
        }
        self.unknown_types
            .iter()
            .map(|(key, count)| format!("{}:{}", key, count))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Default)]
pub struct NormalizedInputStats {
    pub input_items: u64,
    pub input_text_parts: u64,
    pub input_image_parts: u64,
}

pub fn collect_raw_stats(messages: Option<&Value>) -> RawContentStats {
    let mut stats = RawContentStats::default();
    let items = match messages.and_then(Value::as_array) {
        Some(items) => items,
        None => return stats,
    };
    stats.raw_messages = items.len() as u64;
    for raw in items {
        let msg = match raw.as_object() {
            Some(msg) => msg,
            None => continue,
        };
        let content = match msg.get("content") {
            Some(content) => content,
            None => continue,
        };
        match content {
            // String content has no explicit multimodal part type.
            Value::String(_) => continue,
            Value::Array(parts) => {
                for raw_part in parts {
                    let part = match raw_part.as_object() {
                        Some(part) => part,
                        None => {
                            stats.raw_unknown_parts += 1;
                            *stats.unknown_types.entry("non_object".to_string()).or_default() += 1;
                            continue;
                        }
                    };
                    match part.get("type").and_then(Value::as_str) {
                        Some("text") | Some("input_text") | Some("output_text") => continue,
                        Some("image_url") => {
                            stats.raw_image_parts += 1;
                            let (url, _) = extract_image_url_part(part.get("image_url"));
                            if url.trim().is_empty() {
                                stats.raw_invalid_image_parts += 1;
                            }
                        }
                        Some("input_image") => {
                            stats.raw_image_parts += 1;
                            let url = part.get("image_url").and_then(Value::as_str).unwrap_or_default();
                            let file_id = part.get("file_id").and_then(Value::as_str).unwrap_or_default();
                            if url.trim().is_empty() && file_id.trim().is_empty() {
                                stats.raw_invalid_image_parts += 1;
                            }
                        }
                        other => {
                            stats.raw_unknown_parts += 1;
                            let key = other.map(str::trim).filter(|k| !k.is_empty()).unwrap_or("unknown");
                            *stats.unknown_types.entry(key.to_string()).or_default() += 1;
                        }
                    }
                }
            }
            _ => {
                stats.raw_unknown_parts += 1;
                *stats
                    .unknown_types
                    .entry("non_array_content".to_string())
                    .or_default() += 1;
            }
        }
    }
    stats
}

pub fn collect_normalized_stats(input: Option<&Value>) -> NormalizedInputStats {
    let mut stats = NormalizedInputStats::default();
    let items = match input.and_then(Value::as_array) {
        Some(items) => items,
        None => return stats,
    };
    stats.input_items = items.len() as u64;
    for raw in items {
        let item = match raw.as_object() {
            Some(item) => item,
            None => continue,
        };
        if item.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let parts = match item.get("content").and_then(Value::as_array) {
            Some(parts) => parts,
            None => continue,
        };
        for part in parts {
            match part.get("type").and_then(Value::as_str) {
                Some("input_text") => stats.input_text_parts += 1,
                Some("input_image") => stats.input_image_parts += 1,
                _ => {}
            }
        }
    }
    stats
}

/// Structured observation for multimodal traffic: anything the conversion
/// counted as an image, invalid, unknown, or dropped is worth a log line.
pub fn log_normalization_observations(model: &str, raw: &RawContentStats, normalized: &NormalizedInputStats) {
    if raw.raw_image_parts > 0 || raw.raw_unknown_parts > 0 || raw.raw_invalid_image_parts > 0 {
        tracing::info!(
            model = %model,
            raw_messages = raw.raw_messages,
            raw_images = raw.raw_image_parts,
            invalid_images = raw.raw_invalid_image_parts,
            raw_unknown_parts = raw.raw_unknown_parts,
            unknown_types = %raw.unknown_types_string(),
            normalized_input_items = normalized.input_items,
            normalized_images = normalized.input_image_parts,
            normalized_text_parts = normalized.input_text_parts,
            "multimodal normalization"
        );
    }
    if raw.raw_image_parts > normalized.input_image_parts {
        tracing::warn!(
            model = %model,
            raw_images = raw.raw_image_parts,
            normalized_images = normalized.input_image_parts,
            dropped = raw.raw_image_parts - normalized.input_image_parts,
            "image parts dropped during normalization"
        );
    }
}
