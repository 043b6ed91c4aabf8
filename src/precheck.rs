use serde_json::{Map, Value};

use crate::error::AppError;

/// Reject `function_call_output` items that the upstream cannot resolve,
/// before any slot is taken or upstream I/O happens. Resolvable context is
/// a non-empty `previous_response_id`, a tool-call item carrying a call_id,
/// or `item_reference` ids covering every dangling call_id.
pub fn validate_function_call_context(req: &Map<String, Value>) -> Result<(), AppError> {
    if !has_function_call_output(req) {
        return Ok(());
    }
    if let Some(previous) = req.get("previous_response_id").and_then(Value::as_str) {
        if !previous.trim().is_empty() {
            return Ok(());
        }
    }
    if has_tool_call_context(req) {
        return Ok(());
    }
    if has_output_missing_call_id(req) {
        return Err(AppError::invalid_request(
            "function_call_output requires call_id or previous_response_id; \
             if relying on history, ensure store=true and reuse previous_response_id",
        ));
    }
    let call_ids = function_call_output_call_ids(req);
    if !has_item_reference_for(req, &call_ids) {
        return Err(AppError::invalid_request(
            "function_call_output requires item_reference ids matching each call_id, \
             or previous_response_id/tool_call context; if relying on history, \
             ensure store=true and reuse previous_response_id",
        ));
    }
    Ok(())
}

fn input_items(req: &Map<String, Value>) -> impl Iterator<Item = &Map<String, Value>> {
    req.get("input")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn has_function_call_output(req: &Map<String, Value>) -> bool {
    input_items(req).any(|item| item.get("type").and_then(Value::as_str) == Some("function_call_output"))
}

fn has_tool_call_context(req: &Map<String, Value>) -> bool {
    input_items(req).any(|item| {
        matches!(
            item.get("type").and_then(Value::as_str),
            Some("function_call") | Some("tool_call")
        ) && item
            .get("call_id")
            .and_then(Value::as_str)
            .map(|id| !id.trim().is_empty())
            .unwrap_or(false)
    })
}

fn has_output_missing_call_id(req: &Map<String, Value>) -> bool {
    input_items(req).any(|item| {
        item.get("type").and_then(Value::as_str) == Some("function_call_output")
            && item
                .get("call_id")
                .and_then(Value::as_str)
                .map(|id| id.trim().is_empty())
                .unwrap_or(true)
    })
}

fn function_call_output_call_ids(req: &Map<String, Value>) -> Vec<String> {
    input_items(req)
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("function_call_output"))
        .filter_map(|item| item.get("call_id").and_then(Value::as_str))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

fn has_item_reference_for(req: &Map<String, Value>, call_ids: &[String]) -> bool {
    if call_ids.is_empty() {
        return false;
    }
    let reference_ids: Vec<&str> = input_items(req)
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("item_reference"))
        .filter_map(|item| item.get("id").and_then(Value::as_str))
        .collect();
    call_ids
        .iter()
        .all(|call_id| reference_ids.iter().any(|id| id.trim() == call_id))
}
