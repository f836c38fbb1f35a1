//! Typed SSE frames and delta accumulation for streaming chat completions.
//!
//! Each `data:` payload decodes into a [`StreamChunk`] once, at the wire
//! boundary. Content and reasoning deltas are pushed to the sink as they
//! arrive; tool-call fragments accumulate silently per index and are
//! finalized in first-seen order after the stream ends.

use serde::Deserialize;
use serde_json::Value;

use crate::types::{EventSink, ToolInvocation, Usage};

#[derive(Debug, Deserialize)]
pub(crate) struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[allow(dead_code)]
    pub finish_reason: Option<String>,
}

/// Providers disagree on the reasoning field name; accept both spellings.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamDelta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolCallDelta {
    pub index: Option<u64>,
    pub id: Option<String>,
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// A finished chat invocation, streaming or not.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolInvocation>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Default)]
pub(crate) struct StreamAccumulator {
    content: String,
    reasoning: String,
    tool_calls: Vec<PartialToolCall>,
    usage: Option<Usage>,
}

impl StreamAccumulator {
    /// Handle one `data:` payload. Malformed frames are skipped.
    pub(crate) fn push_data(&mut self, data: &str, sink: &mut dyn EventSink) {
        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(_) => return,
        };

        // A chunk without choices is the usage frame some providers append.
        if chunk.choices.is_empty() {
            if let Some(usage) = chunk.usage {
                self.usage = Some(usage);
            }
            return;
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(reasoning) = delta.reasoning_content.or(delta.reasoning) {
                if !reasoning.is_empty() {
                    self.reasoning.push_str(&reasoning);
                    sink.on_reasoning_chunk(&reasoning);
                }
            }
            if let Some(text) = delta.content {
                if !text.is_empty() {
                    self.content.push_str(&text);
                    sink.on_text_chunk(&text);
                }
            }
            if let Some(deltas) = delta.tool_calls {
                for tc in deltas {
                    let idx = tc.index.unwrap_or(0) as usize;
                    while self.tool_calls.len() <= idx {
                        self.tool_calls.push(PartialToolCall::default());
                    }
                    let slot = &mut self.tool_calls[idx];
                    if let Some(id) = tc.id {
                        if !id.is_empty() {
                            slot.id = id;
                        }
                    }
                    if let Some(function) = tc.function {
                        if let Some(name) = function.name {
                            slot.name.push_str(&name);
                        }
                        if let Some(arguments) = function.arguments {
                            slot.arguments.push_str(&arguments);
                        }
                    }
                }
            }
        }
    }

    /// Finalize after `[DONE]` or EOF. A tool call whose argument buffer is
    /// not valid JSON degrades to `{}`; the others are unaffected.
    pub(crate) fn finish(self) -> ChatOutcome {
        let tool_calls = self
            .tool_calls
            .into_iter()
            .map(|partial| {
                let arguments: Value = if partial.arguments.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&partial.arguments)
                        .unwrap_or_else(|_| Value::Object(Default::default()))
                };
                ToolInvocation {
                    id: partial.id,
                    name: partial.name,
                    arguments,
                }
            })
            .collect();

        ChatOutcome {
            content: self.content,
            reasoning: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning)
            },
            tool_calls,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CollectingEventSink;
    use serde_json::json;

    fn push(acc: &mut StreamAccumulator, sink: &mut CollectingEventSink, value: serde_json::Value) {
        acc.push_data(&value.to_string(), sink);
    }

    #[test]
    fn reassembles_content_split_across_frames() {
        let mut acc = StreamAccumulator::default();
        let mut sink = CollectingEventSink::default();
        push(&mut acc, &mut sink, json!({"choices":[{"delta":{"content":"Hel"}}]}));
        push(&mut acc, &mut sink, json!({"choices":[{"delta":{"content":"lo"}}]}));

        let outcome = acc.finish();
        assert_eq!(outcome.content, "Hello");
        assert_eq!(sink.chunks, vec!["Hel", "lo"]);
    }

    #[test]
    fn reassembles_tool_call_fragments_by_index() {
        let mut acc = StreamAccumulator::default();
        let mut sink = CollectingEventSink::default();
        push(
            &mut acc,
            &mut sink,
            json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"call_a","function":{"name":"read_","arguments":"{\"file"}}
            ]}}]}),
        );
        push(
            &mut acc,
            &mut sink,
            json!({"choices":[{"delta":{"tool_calls":[
                {"index":1,"id":"call_b","function":{"name":"grep_search","arguments":"{}"}}
            ]}}]}),
        );
        push(
            &mut acc,
            &mut sink,
            json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"function":{"name":"file","arguments":"path\": \"a.rs\"}"}}
            ]}}]}),
        );

        let outcome = acc.finish();
        assert_eq!(outcome.tool_calls.len(), 2);
        assert_eq!(outcome.tool_calls[0].id, "call_a");
        assert_eq!(outcome.tool_calls[0].name, "read_file");
        assert_eq!(outcome.tool_calls[0].arguments, json!({"filepath": "a.rs"}));
        assert_eq!(outcome.tool_calls[1].name, "grep_search");
    }

    #[test]
    fn malformed_arguments_degrade_to_empty_object() {
        let mut acc = StreamAccumulator::default();
        let mut sink = CollectingEventSink::default();
        push(
            &mut acc,
            &mut sink,
            json!({"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"c1","function":{"name":"read_file","arguments":"{not json"}},
                {"index":1,"id":"c2","function":{"name":"grep_search","arguments":"{\"pattern\":\"x\"}"}}
            ]}}]}),
        );

        let outcome = acc.finish();
        assert_eq!(outcome.tool_calls[0].arguments, json!({}));
        assert_eq!(outcome.tool_calls[1].arguments, json!({"pattern": "x"}));
    }

    #[test]
    fn usage_only_frame_is_captured() {
        let mut acc = StreamAccumulator::default();
        let mut sink = CollectingEventSink::default();
        push(&mut acc, &mut sink, json!({"choices":[{"delta":{"content":"hi"}}]}));
        push(
            &mut acc,
            &mut sink,
            json!({"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}),
        );

        let outcome = acc.finish();
        let usage = outcome.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn reasoning_is_streamed_separately_from_content() {
        let mut acc = StreamAccumulator::default();
        let mut sink = CollectingEventSink::default();
        push(
            &mut acc,
            &mut sink,
            json!({"choices":[{"delta":{"reasoning_content":"let me think"}}]}),
        );
        push(&mut acc, &mut sink, json!({"choices":[{"delta":{"content":"done"}}]}));

        let outcome = acc.finish();
        assert_eq!(outcome.reasoning.as_deref(), Some("let me think"));
        assert_eq!(outcome.content, "done");
        assert_eq!(sink.reasoning, vec!["let me think"]);
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let mut acc = StreamAccumulator::default();
        let mut sink = CollectingEventSink::default();
        acc.push_data("not json at all", &mut sink);
        push(&mut acc, &mut sink, json!({"choices":[{"delta":{"content":"ok"}}]}));
        assert_eq!(acc.finish().content, "ok");
    }
}
