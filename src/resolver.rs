//! Tool-call resolution
//!
//! Native tool calls always win. When a backend returned only text, the
//! resolver looks for calls the model wrote inline, trying each strategy in
//! turn after reasoning blocks are stripped:
//!
//! 1. tagged blocks (`[TOOL_CALL_START]`, `<|tool_call_start|>`, `<tool_call>`)
//! 2. `name({...})` function-call text
//! 3. a fenced call object, or a fenced bare argument object whose keys fit
//!    exactly one known tool
//! 4. inline `{"name": ...}` objects anywhere in the text
//!
//! If none match but the text opens a call that never closes, the turn is
//! [`Resolution::Truncated`]. Every recovered call is marked
//! `recovered_from_text`.

use crate::text::{Scan, balanced_slice, fences, scan_balanced, strip_reasoning};
use crate::tools::{ToolDefinition, find_tool};
use crate::types::ToolCall;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

const TAGS: &[(&str, &str)] = &[
    ("[TOOL_CALL_START]", "[TOOL_CALL_END]"),
    ("<|tool_call_start|>", "<|tool_call_end|>"),
    ("<tool_call>", "</tool_call>"),
];

static FUNCTION_FORM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z_][A-Za-z0-9_.\-]*)\s*\(\s*\{").expect("valid regex")
});
static NAME_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{\s*"name"\s*:"#).expect("valid regex"));
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("valid regex"));

/// Outcome of resolving one assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Native(Vec<ToolCall>),
    Recovered(Vec<ToolCall>),
    /// A call was opened in the text but its JSON never closed.
    Truncated { partial: String },
    None,
}

impl Resolution {
    pub fn calls(&self) -> &[ToolCall] {
        match self {
            Resolution::Native(calls) | Resolution::Recovered(calls) => calls,
            _ => &[],
        }
    }

    pub fn into_calls(self) -> Vec<ToolCall> {
        match self {
            Resolution::Native(calls) | Resolution::Recovered(calls) => calls,
            _ => Vec::new(),
        }
    }
}

type Strategy = fn(&str, &[ToolDefinition]) -> Vec<ToolCall>;

const STRATEGIES: &[Strategy] = &[tagged_blocks, function_form, fenced_call, inline_objects];

/// Resolve the tool calls of one turn.
pub fn resolve(text: &str, native: Vec<ToolCall>, tools: &[ToolDefinition]) -> Resolution {
    if !native.is_empty() {
        return Resolution::Native(native);
    }
    recover_from_text(text, tools)
}

/// Run the text cascade only.
pub fn recover_from_text(text: &str, tools: &[ToolDefinition]) -> Resolution {
    let cleaned = strip_reasoning(text);
    if cleaned.trim().is_empty() {
        return Resolution::None;
    }
    for strategy in STRATEGIES {
        let calls = strategy(&cleaned, tools);
        if !calls.is_empty() {
            return Resolution::Recovered(calls);
        }
    }
    match truncated_prefix(&cleaned, tools) {
        Some(partial) => Resolution::Truncated { partial },
        None => Resolution::None,
    }
}

/// Arguments as raw JSON text. A string holding JSON is unwrapped.
fn arguments_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "{}".to_string(),
        Some(Value::String(s)) => {
            if serde_json::from_str::<Value>(s).is_ok() {
                s.trim().to_string()
            } else {
                Value::String(s.clone()).to_string()
            }
        }
        Some(other) => other.to_string(),
    }
}

/// `{"name", "arguments"|"parameters"}` or `{"function": {...}}` to a call.
fn call_from_object(value: &Value, tools: &[ToolDefinition], require_known: bool) -> Option<ToolCall> {
    let obj = value.as_object()?;
    let inner = obj.get("function").and_then(Value::as_object).unwrap_or(obj);
    let name = inner.get("name")?.as_str()?.trim();
    if name.is_empty() || (require_known && find_tool(tools, name).is_none()) {
        return None;
    }
    let args = inner.get("arguments").or_else(|| inner.get("parameters"));
    Some(ToolCall::recovered(name, arguments_text(args)))
}

/// Object or array of objects, each a call.
fn calls_from_json(value: &Value, tools: &[ToolDefinition], require_known: bool) -> Vec<ToolCall> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| call_from_object(v, tools, require_known))
            .collect(),
        other => call_from_object(other, tools, require_known).into_iter().collect(),
    }
}

fn parse_tag_body(body: &str, tools: &[ToolDefinition]) -> Vec<ToolCall> {
    let body = body.trim();
    if body.starts_with('{') || body.starts_with('[') {
        if let Some(slice) = balanced_slice(body, 0) {
            if let Ok(value) = serde_json::from_str::<Value>(slice) {
                return calls_from_json(&value, tools, false);
            }
        }
        return Vec::new();
    }

    let calls = function_form(body, &[]);
    if !calls.is_empty() {
        return calls;
    }

    // `name` on its own line, arguments after it
    let (name, rest) = body.split_once(['\n', ' ']).unwrap_or((body, ""));
    let name = name.trim();
    if !IDENTIFIER.is_match(name) {
        return Vec::new();
    }
    let rest = rest.trim();
    if rest.is_empty() {
        return vec![ToolCall::recovered(name, "{}")];
    }
    let Some(open) = rest.find('{') else {
        return Vec::new();
    };
    match balanced_slice(rest, open) {
        Some(args) if serde_json::from_str::<Value>(args).is_ok() => {
            vec![ToolCall::recovered(name, args)]
        }
        _ => Vec::new(),
    }
}

fn tagged_blocks(text: &str, tools: &[ToolDefinition]) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    for (open, close) in TAGS {
        let mut rest = text;
        while let Some(start) = rest.find(open) {
            let after = &rest[start + open.len()..];
            match after.find(close) {
                Some(end) => {
                    calls.extend(parse_tag_body(&after[..end], tools));
                    rest = &after[end + close.len()..];
                }
                None => {
                    // Missing closer; accept the body only if it parses whole.
                    calls.extend(parse_tag_body(after, tools));
                    break;
                }
            }
        }
        if !calls.is_empty() {
            break;
        }
    }
    calls
}

fn function_form(text: &str, tools: &[ToolDefinition]) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    for caps in FUNCTION_FORM.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if !tools.is_empty() && find_tool(tools, name.as_str()).is_none() {
            continue;
        }
        let open = whole.end() - 1;
        if let Some(args) = balanced_slice(text, open) {
            if serde_json::from_str::<Value>(args).map(|v| v.is_object()).unwrap_or(false) {
                calls.push(ToolCall::recovered(name.as_str(), args));
            }
        }
    }
    calls
}

/// Keys fit the tool: all required present, nothing undeclared.
fn fits_schema(obj: &serde_json::Map<String, Value>, tool: &ToolDefinition) -> bool {
    let props = tool.property_names();
    !props.is_empty()
        && obj.keys().all(|k| props.contains(&k.as_str()))
        && tool.required_properties().iter().all(|r| obj.contains_key(*r))
}

fn fenced_call(text: &str, tools: &[ToolDefinition]) -> Vec<ToolCall> {
    for fence in fences(text).into_iter().filter(|f| !f.unclosed) {
        let Ok(value) = serde_json::from_str::<Value>(fence.body) else {
            continue;
        };
        let calls = calls_from_json(&value, tools, false);
        if !calls.is_empty() {
            return calls;
        }
        let Some(obj) = value.as_object().filter(|o| !o.is_empty()) else {
            continue;
        };
        let mut fitting = tools.iter().filter(|t| fits_schema(obj, t));
        if let (Some(tool), None) = (fitting.next(), fitting.next()) {
            return vec![ToolCall::recovered(tool.name(), fence.body)];
        }
    }
    Vec::new()
}

fn inline_objects(text: &str, tools: &[ToolDefinition]) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut pos = 0;
    while let Some(rel) = text[pos..].find('{') {
        let start = pos + rel;
        pos = start + 1;
        let Some(slice) = balanced_slice(text, start) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(slice) else {
            continue;
        };
        let Some(obj) = value.as_object() else {
            continue;
        };
        let call = if tools.is_empty() {
            // Without a tool list, only objects that look like calls count
            if obj.contains_key("arguments") || obj.contains_key("parameters") {
                call_from_object(&value, tools, false)
            } else {
                None
            }
        } else {
            call_from_object(&value, tools, true)
        };
        if let Some(call) = call {
            calls.push(call);
            pos = start + slice.len();
        }
    }
    calls
}

/// Text before the first opened-but-never-closed call, if there is one.
fn truncated_prefix(text: &str, tools: &[ToolDefinition]) -> Option<String> {
    let mut markers: Vec<usize> = TAGS
        .iter()
        .filter_map(|(open, _)| text.find(open))
        .collect();
    markers.extend(NAME_OBJECT.find_iter(text).map(|m| m.start()));
    markers.extend(
        FUNCTION_FORM
            .captures_iter(text)
            .filter(|c| {
                c.get(1)
                    .is_some_and(|n| tools.is_empty() || find_tool(tools, n.as_str()).is_some())
            })
            .filter_map(|c| c.get(0).map(|m| m.start())),
    );
    markers.sort_unstable();

    for marker in markers {
        let tag = TAGS
            .iter()
            .find(|(open, _)| text[marker..].starts_with(open))
            .map(|(open, _)| open.len());
        // The payload starts after the tag, whose own brackets are not JSON.
        let body = marker + tag.unwrap_or(0);
        let Some(rel) = text[body..].find(['{', '[']) else {
            // A tag opened with nothing after it
            if tag.is_some() {
                return Some(text[..marker].trim().to_string());
            }
            continue;
        };
        if scan_balanced(text, body + rel) == Scan::Unterminated {
            return Some(text[..marker].trim().to_string());
        }
    }
    None
}
