//! Shared wire and event types for the agent crate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Truncate a string at a safe UTF-8 char boundary (from the start).
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Get a &str starting from approximately `start_pos`, adjusted forward to a
/// safe UTF-8 boundary.
pub fn safe_slice_from(s: &str, start_pos: usize) -> &str {
    if start_pos >= s.len() {
        return "";
    }
    let mut start = start_pos;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

// ─── OpenAI-compatible chat types ───────────────────────────────────────────

/// A chat message in OpenAI format, with the optional `reasoning` channel
/// some providers emit alongside content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.to_string()),
            reasoning: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.to_string()),
            reasoning: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.to_string()),
            reasoning: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant_with_tool_calls(
        content: &str,
        reasoning: Option<&str>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.to_string()),
            reasoning: reasoning.map(str::to_string),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, name: &str, content: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.to_string()),
            reasoning: None,
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
            name: Some(name.to_string()),
        }
    }
}

/// A tool call in OpenAI wire shape (arguments as a JSON string).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// A tool call after stream finalization: arguments parsed into a Value
/// (an unparsable argument string degrades to `{}`).
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolInvocation {
    /// Back to wire shape for the assistant transcript message.
    pub fn to_wire(&self) -> ToolCall {
        ToolCall {
            id: self.id.clone(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: self.name.clone(),
                arguments: serde_json::to_string(&self.arguments)
                    .unwrap_or_else(|_| "{}".to_string()),
            },
        }
    }

    /// Canonical signature used for duplicate and repeat-loop detection.
    /// Key order never changes the signature.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.name, canonical_json(&self.arguments))
    }
}

/// Serialize with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// OpenAI-compatible tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDef {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Token usage reported by the API, when the provider sends it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

// ─── Event sink ─────────────────────────────────────────────────────────────

/// Output seam between the agent core and whatever renders it.
/// The core never recovers from sink failures; implementations must not panic.
pub trait EventSink: Send {
    /// Full assistant text once a response is complete (non-streamed path).
    fn on_text(&mut self, text: &str);
    /// Incremental content while streaming.
    fn on_text_chunk(&mut self, _chunk: &str) {}
    /// Incremental reasoning while streaming.
    fn on_reasoning_chunk(&mut self, _chunk: &str) {}
    /// A tool is about to be dispatched.
    fn on_tool_call(&mut self, name: &str, arguments: &str);
    /// A tool finished (in request order).
    fn on_tool_result(&mut self, name: &str, result: &str, is_error: bool, duration_ms: u64);
    /// Status and warning lines (loop guards, errors survived).
    fn on_notice(&mut self, message: &str);
    /// Blocking user confirmation; returns true when approved.
    fn on_confirmation_request(&mut self, prompt: &str) -> bool;
}

/// Sink that records everything; used by tests and available to embedders.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    pub texts: Vec<String>,
    pub chunks: Vec<String>,
    pub reasoning: Vec<String>,
    pub tool_calls: Vec<String>,
    pub tool_results: Vec<(String, String, bool)>,
    pub notices: Vec<String>,
    pub approve_confirmations: bool,
    pub confirmations_seen: usize,
}

impl CollectingEventSink {
    pub fn approving() -> Self {
        Self {
            approve_confirmations: true,
            ..Default::default()
        }
    }
}

impl EventSink for CollectingEventSink {
    fn on_text(&mut self, text: &str) {
        self.texts.push(text.to_string());
    }

    fn on_text_chunk(&mut self, chunk: &str) {
        self.chunks.push(chunk.to_string());
    }

    fn on_reasoning_chunk(&mut self, chunk: &str) {
        self.reasoning.push(chunk.to_string());
    }

    fn on_tool_call(&mut self, name: &str, _arguments: &str) {
        self.tool_calls.push(name.to_string());
    }

    fn on_tool_result(&mut self, name: &str, result: &str, is_error: bool, _duration_ms: u64) {
        self.tool_results
            .push((name.to_string(), result.to_string(), is_error));
    }

    fn on_notice(&mut self, message: &str) {
        self.notices.push(message.to_string());
    }

    fn on_confirmation_request(&mut self, _prompt: &str) -> bool {
        self.confirmations_seen += 1;
        self.approve_confirmations
    }
}
