// Copyright 2026 The OpenGNK Project
// SPDX-License-Identifier: Apache-2.0

// Tool-call simulation.
//
// Rewrites OpenAI-style tool-call requests into plain chat-completion
// prompts and converts the model's JSON response back into the proper
// tool_calls format. This allows tool calling to work even when the
// upstream inference server doesn't support it natively.

use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// A declared function tool, retained from the request so the response
/// parser can validate names against it.
#[derive(Debug, Clone, Deserialize)]
pub struct Tool {
    pub function: FunctionDef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolSimError {
    #[error("request body is not a JSON object: {0}")]
    InvalidBody(serde_json::Error),

    #[error("tools field is malformed: {0}")]
    InvalidTools(serde_json::Error),

    #[error("failed to re-serialize request: {0}")]
    Serialize(serde_json::Error),
}

/// True if the request contains a non-empty `tools` array and therefore
/// needs simulation.
pub fn needs_simulation(body: &[u8]) -> bool {
    let Ok(root) = serde_json::from_slice::<Value>(body) else {
        return false;
    };
    root.get("tools")
        .and_then(|t| t.as_array())
        .is_some_and(|t| !t.is_empty())
}

/// Rewrite the original request (with tools) into a plain prompt request.
///
/// Returns the new body, the declared tools (for response parsing), and
/// whether the caller originally asked for streaming. All fields other than
/// `messages`, `tools`, `tool_choice`, and `stream` pass through verbatim.
pub fn rewrite_request(body: &[u8]) -> Result<(Vec<u8>, Vec<Tool>, bool), ToolSimError> {
    let mut raw: Map<String, Value> =
        serde_json::from_slice(body).map_err(ToolSimError::InvalidBody)?;

    let tools: Vec<Tool> = match raw.get("tools") {
        Some(t) => serde_json::from_value(t.clone()).map_err(ToolSimError::InvalidTools)?,
        None => Vec::new(),
    };
    if tools.is_empty() {
        return Ok((body.to_vec(), Vec::new(), false));
    }

    let was_stream = raw
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);

    let choice_hint = raw
        .get("tool_choice")
        .map(|tc| tool_choice_hint(tc))
        .unwrap_or_default();

    let sys_prompt = build_system_prompt(&build_tool_description(&tools), &choice_hint);

    // Prepend our instruction as the first system message.
    let mut messages = match raw.remove("messages") {
        Some(Value::Array(msgs)) => msgs,
        _ => Vec::new(),
    };
    messages.insert(0, json!({"role": "system", "content": sys_prompt}));
    raw.insert("messages".to_string(), Value::Array(messages));

    // Upstream nodes don't support tools; strip them before forwarding, and
    // force non-streaming so the full response is available for parsing.
    raw.remove("tools");
    raw.remove("tool_choice");
    raw.insert("stream".to_string(), Value::Bool(false));

    let new_body = serde_json::to_vec(&raw).map_err(ToolSimError::Serialize)?;
    tracing::debug!(tools = tools.len(), original_stream = was_stream, "toolsim: rewrote request");
    Ok((new_body, tools, was_stream))
}

/// Convert the upstream response back into OpenAI tool_calls format.
///
/// If the assistant's content parses as one or more valid tool calls, the
/// first choice's message is rewritten (`content: null`, `tool_calls`,
/// `finish_reason: "tool_calls"`). Otherwise the original body is returned
/// unchanged (text reply).
pub fn parse_response(resp_body: &[u8], tools: &[Tool]) -> Vec<u8> {
    let Ok(mut resp) = serde_json::from_slice::<Value>(resp_body) else {
        return resp_body.to_vec();
    };

    let Some(content) = resp
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
    else {
        return resp_body.to_vec();
    };

    let calls = extract_tool_calls(&content, tools);
    if calls.is_empty() {
        return resp_body.to_vec();
    }
    tracing::debug!(count = calls.len(), "toolsim: parsed tool calls from response");

    let tool_calls: Vec<Value> = calls
        .into_iter()
        .map(|c| {
            json!({
                "id": generate_tool_call_id(),
                "type": "function",
                "function": {"name": c.name, "arguments": c.arguments}
            })
        })
        .collect();

    let choice = &mut resp["choices"][0];
    choice["message"] = json!({
        "role": "assistant",
        "content": Value::Null,
        "tool_calls": tool_calls,
    });
    choice["finish_reason"] = json!("tool_calls");

    serde_json::to_vec(&resp).unwrap_or_else(|_| resp_body.to_vec())
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct ParsedToolCall {
    name: String,
    /// JSON-encoded arguments object, as OpenAI expects.
    arguments: String,
}

fn build_tool_description(tools: &[Tool]) -> String {
    let mut out = String::new();
    for (i, t) in tools.iter().enumerate() {
        if i > 0 {
            out.push_str("\n\n");
        }
        out.push_str(&format!("### Function {}: `{}`\n", i + 1, t.function.name));
        if !t.function.description.is_empty() {
            out.push_str(&format!("Description: {}\n", t.function.description));
        }
        if !t.function.parameters.is_null() {
            out.push_str(&format!(
                "Parameters (JSON Schema):\n```json\n{}\n```",
                t.function.parameters
            ));
        }
    }
    out
}

fn tool_choice_hint(tool_choice: &Value) -> String {
    if let Some(s) = tool_choice.as_str() {
        return match s {
            "none" => "Do NOT call any tools. Respond normally.".to_string(),
            "required" => "You MUST call at least one tool.".to_string(),
            // "auto": the model decides on its own.
            _ => String::new(),
        };
    }
    // {"type": "function", "function": {"name": "..."}}
    if let Some(name) = tool_choice
        .get("function")
        .and_then(|f| f.get("name"))
        .and_then(|n| n.as_str())
    {
        if !name.is_empty() {
            return format!("You MUST call the `{name}` function.");
        }
    }
    String::new()
}

fn build_system_prompt(tool_desc: &str, choice_hint: &str) -> String {
    let mut out = String::new();
    out.push_str("You have access to the following tools/functions:\n\n");
    out.push_str(tool_desc);
    out.push_str("\n\n## Instructions\n");
    out.push_str(
        "If the user's request can be answered by calling one or more of these tools, \
         respond with ONLY a JSON array of tool calls in this exact format:\n",
    );
    out.push_str("```json\n[{\"name\": \"function_name\", \"arguments\": {\"param1\": \"value1\"}}]\n```\n\n");
    out.push_str("Rules:\n");
    out.push_str("- Output ONLY the raw JSON array, no markdown code fences, no explanation.\n");
    out.push_str("- `arguments` must be a JSON object matching the parameter schema.\n");
    out.push_str("- You may call multiple tools by including multiple objects in the array.\n");
    out.push_str("- If you do NOT need to call any tool, respond normally with plain text.\n");
    if !choice_hint.is_empty() {
        out.push_str(&format!("\nIMPORTANT: {choice_hint}\n"));
    }
    out
}

fn extract_tool_calls(content: &str, tools: &[Tool]) -> Vec<ParsedToolCall> {
    let content = strip_code_fences(content.trim());
    let content = content.trim();

    let valid = |name: &str| tools.iter().any(|t| t.function.name == name);

    // Try to parse the whole content as a JSON array of tool calls.
    if let Some(calls) = parse_call_array(content, &valid) {
        return calls;
    }

    // Try a JSON array embedded in surrounding text.
    if let (Some(start), Some(end)) = (content.find('['), content.rfind(']')) {
        if end > start {
            if let Some(calls) = parse_call_array(&content[start..=end], &valid) {
                return calls;
            }
        }
    }

    // Try a single object (model returned one call without the array).
    if let Ok(single) = serde_json::from_str::<Value>(content) {
        if let Some(name) = single.get("name").and_then(|n| n.as_str()) {
            if valid(name) {
                return vec![ParsedToolCall {
                    name: name.to_string(),
                    arguments: coerce_arguments(single.get("arguments")),
                }];
            }
        }
    }

    Vec::new()
}

fn parse_call_array(content: &str, valid: &impl Fn(&str) -> bool) -> Option<Vec<ParsedToolCall>> {
    let calls: Vec<Value> = serde_json::from_str(content).ok()?;
    if calls.is_empty() {
        return None;
    }
    let result: Vec<ParsedToolCall> = calls
        .iter()
        .filter_map(|c| {
            let name = c.get("name")?.as_str()?;
            if !valid(name) {
                return None;
            }
            Some(ParsedToolCall {
                name: name.to_string(),
                arguments: coerce_arguments(c.get("arguments")),
            })
        })
        .collect();
    if result.is_empty() {
        None
    } else {
        Some(result)
    }
}

/// Missing or null arguments become "{}"; anything else is re-encoded as the
/// JSON string OpenAI clients expect.
fn coerce_arguments(arguments: Option<&Value>) -> String {
    match arguments {
        None | Some(Value::Null) => "{}".to_string(),
        Some(v) => serde_json::to_string(v).unwrap_or_else(|_| "{}".to_string()),
    }
}

fn strip_code_fences(s: &str) -> String {
    let mut s = s;
    if s.starts_with("```") {
        if let Some(idx) = s.find('\n') {
            s = &s[idx + 1..];
        }
        if let Some(idx) = s.rfind("```") {
            s = &s[..idx];
        }
    }
    s.to_string()
}

fn generate_tool_call_id() -> String {
    let mut raw = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("call_{}", hex::encode(raw))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
