//! Response normalizer.
//!
//! The tool protocol wraps its payload inconsistently: some servers return
//! an MCP-style `content` list of text parts, some wrap the tree in a
//! `result` field, some return the tree directly. This module maps all of
//! them onto one canonical UI-tree shape. Normalization is total — an
//! unrecognized shape degrades to pass-through, never an error — and
//! idempotent on canonical input.

use serde_json::Value;

/// Minimal empty-container tree: the deliberate "tool produced unstructured
/// text" fallback. The orchestrator decides whether this is a warning or a
/// failure; here it is just a value.
pub fn empty_container() -> Value {
    serde_json::json!({ "type": "Container", "children": [] })
}

/// True for the tree shape [`empty_container`] synthesizes.
pub fn is_empty_container(tree: &Value) -> bool {
    tree.get("type").and_then(Value::as_str) == Some("Container")
        && tree
            .get("children")
            .and_then(Value::as_array)
            .is_none_or(Vec::is_empty)
}

/// Map a raw tool response onto the canonical tree shape.
///
/// Priority order:
/// 1. `content` list with a text part: parse the text as JSON, falling back
///    to the empty container when it is not a JSON object.
/// 2. `result` field: taken directly when already an object, parsed when it
///    is a string that decodes to an object.
/// 3. Anything else passes through unchanged.
pub fn normalize(raw: Value) -> Value {
    let Value::Object(map) = raw else {
        return raw;
    };

    if let Some(Value::Array(items)) = map.get("content")
        && let Some(text) = first_text_part(items)
    {
        return match serde_json::from_str::<Value>(text) {
            Ok(parsed @ Value::Object(_)) => parsed,
            _ => empty_container(),
        };
    }

    match map.get("result") {
        Some(Value::Object(_)) => map.get("result").cloned().unwrap_or(Value::Null),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ Value::Object(_)) => parsed,
            _ => Value::Object(map),
        },
        _ => Value::Object(map),
    }
}

fn first_text_part(items: &[Value]) -> Option<&str> {
    items
        .iter()
        .find_map(|item| item.get("text").and_then(Value::as_str))
}
