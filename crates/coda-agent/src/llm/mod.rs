//! OpenAI-compatible chat client with streaming, capability fallbacks,
//! and per-call usage accounting.
//!
//! Two local fallbacks cover capability mismatches, both remembered for the
//! client's lifetime after the first rejection:
//!   - `stream_options: {include_usage}` refused → retry without it
//!   - tool calling unsupported → retry the same request without tools
//!
//! Every invocation records exactly one usage observation, from reported
//! token counts when the provider sends them or a `serialized_len / 4`
//! estimate when it does not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use coda_core::runtime::{
    AI_DEFAULT_MAX_TOKENS, AI_DEFAULT_TEMPERATURE, AI_DEFAULT_TOP_P, CHAT_TIMEOUT_SECS,
    SUMMARIZE_SYSTEM_PROMPT, SUMMARY_MAX_TOKENS, SUMMARY_TAIL_MESSAGES,
};
use coda_core::stats::SessionStats;

use crate::types::{ChatMessage, EventSink, ToolCall, ToolDefinition, Usage};

mod stream;

pub use stream::ChatOutcome;
use stream::StreamAccumulator;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("chat request failed: {0}")]
    Transport(String),

    #[error("failed to decode chat response: {0}")]
    Decode(String),

    #[error("no API key configured for provider '{0}'")]
    MissingApiKey(String),
}

/// Sampling parameters for one request.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: AI_DEFAULT_MAX_TOKENS,
            temperature: AI_DEFAULT_TEMPERATURE,
            top_p: AI_DEFAULT_TOP_P,
        }
    }
}

/// Seam between the orchestrators and the HTTP client, so tests can inject
/// scripted backends.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat_streaming(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        params: &GenerationParams,
        cancel: &CancellationToken,
        sink: &mut dyn EventSink,
    ) -> Result<ChatOutcome, LlmError>;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        params: &GenerationParams,
    ) -> Result<ChatOutcome, LlmError>;

    /// Never fails; an unusable summary comes back as an error string.
    async fn summarize_conversation(&self, messages: &[ChatMessage]) -> String;
}

#[derive(Debug, Clone)]
struct Identity {
    provider: String,
    base_url: String,
    api_key: String,
    model: String,
}

/// HTTP chat client. Cheap to share behind `Arc`; the identity can be
/// swapped at runtime without resetting the session's usage counters.
pub struct ChatClient {
    http: reqwest::Client,
    identity: Mutex<Identity>,
    stats: Arc<SessionStats>,
    /// Capability memos, set after the first provider rejection.
    no_stream_options: AtomicBool,
    no_tools: AtomicBool,
}

impl ChatClient {
    pub fn new(
        provider: &str,
        base_url: &str,
        api_key: &str,
        model: &str,
        stats: Arc<SessionStats>,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(CHAT_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            identity: Mutex::new(Identity {
                provider: provider.to_string(),
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key: api_key.trim().to_string(),
                model: model.to_string(),
            }),
            stats,
            no_stream_options: AtomicBool::new(false),
            no_tools: AtomicBool::new(false),
        })
    }

    /// Swap provider endpoint, key, and model. Usage counters are session
    /// scoped and survive the swap.
    pub fn set_identity(&self, provider: &str, base_url: &str, api_key: &str, model: &str) {
        let mut identity = self.identity.lock().expect("identity lock poisoned");
        identity.provider = provider.to_string();
        identity.base_url = base_url.trim_end_matches('/').to_string();
        identity.api_key = api_key.trim().to_string();
        identity.model = model.to_string();
    }

    pub fn model(&self) -> String {
        self.identity.lock().expect("identity lock poisoned").model.clone()
    }

    fn snapshot(&self) -> Identity {
        self.identity.lock().expect("identity lock poisoned").clone()
    }

    fn build_body(
        &self,
        identity: &Identity,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        params: &GenerationParams,
        streaming: bool,
    ) -> Value {
        let mut body = json!({
            "model": identity.model,
            "messages": messages,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
        });
        if streaming {
            body["stream"] = json!(true);
            if !self.no_stream_options.load(Ordering::Relaxed) {
                body["stream_options"] = json!({"include_usage": true});
            }
        }
        if !self.no_tools.load(Ordering::Relaxed) {
            if let Some(tools) = tools {
                if !tools.is_empty() {
                    body["tools"] = serde_json::to_value(tools).unwrap_or(Value::Null);
                }
            }
        }
        body
    }

    /// Decide whether an API rejection is a capability mismatch we can fall
    /// back from. Each memo is set at most once per client.
    fn note_capability_rejection(&self, error_text: &str, sent_tools: bool) -> bool {
        if is_stream_options_rejection(error_text)
            && !self.no_stream_options.swap(true, Ordering::Relaxed)
        {
            tracing::warn!("provider rejected stream_options, retrying without usage frames");
            return true;
        }
        if sent_tools
            && is_tool_calling_unsupported(error_text)
            && !self.no_tools.swap(true, Ordering::Relaxed)
        {
            tracing::warn!("provider rejected tool calling, retrying without tools");
            return true;
        }
        false
    }

    async fn chat_streaming_inner(
        &self,
        identity: &Identity,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        params: &GenerationParams,
        cancel: &CancellationToken,
        sink: &mut dyn EventSink,
    ) -> Result<ChatOutcome, LlmError> {
        let url = format!("{}/chat/completions", identity.base_url);

        let resp = loop {
            let body = self.build_body(identity, messages, tools, params, true);
            let sent_tools = body.get("tools").is_some();
            let resp = self
                .http
                .post(&url)
                .header("Authorization", format!("Bearer {}", identity.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| LlmError::Transport(e.to_string()))?;

            let status = resp.status();
            if status.is_success() {
                break resp;
            }
            let text = resp.text().await.unwrap_or_default();
            if self.note_capability_rejection(&text, sent_tools) {
                continue;
            }
            return Err(LlmError::Transport(format!(
                "chat API error ({}): {}",
                status, text
            )));
        };

        let mut acc = StreamAccumulator::default();
        let mut buffer = String::new();
        let mut stream = resp.bytes_stream();

        'read: while let Some(chunk_result) = stream.next().await {
            if cancel.is_cancelled() {
                tracing::debug!("stream consumption cancelled");
                break;
            }
            let chunk = chunk_result.map_err(|e| LlmError::Transport(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline_pos) = buffer.find('\n') {
                let line = buffer[..newline_pos].trim().to_string();
                buffer = buffer[newline_pos + 1..].to_string();

                if line.is_empty() || line.starts_with(':') || !line.starts_with("data: ") {
                    continue;
                }
                let data = &line[6..];
                if data == "[DONE]" {
                    break 'read;
                }
                acc.push_data(data, sink);
            }
        }

        let outcome = acc.finish();
        if !outcome.content.is_empty() {
            sink.on_text(&outcome.content);
        }
        Ok(outcome)
    }

    async fn chat_inner(
        &self,
        identity: &Identity,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        params: &GenerationParams,
    ) -> Result<ChatOutcome, LlmError> {
        let url = format!("{}/chat/completions", identity.base_url);

        let response: ChatCompletionResponse = loop {
            let body = self.build_body(identity, messages, tools, params, false);
            let sent_tools = body.get("tools").is_some();
            let resp = self
                .http
                .post(&url)
                .header("Authorization", format!("Bearer {}", identity.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| LlmError::Transport(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                if self.note_capability_rejection(&text, sent_tools) {
                    continue;
                }
                return Err(LlmError::Transport(format!(
                    "chat API error ({}): {}",
                    status, text
                )));
            }
            break resp
                .json()
                .await
                .map_err(|e| LlmError::Decode(e.to_string()))?;
        };

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Decode("no choices in response".to_string()))?;

        // Non-streaming tool arguments are parsed eagerly; a malformed
        // argument string fails the whole call here, unlike the per-call
        // fallback on the streaming path.
        let mut tool_calls = Vec::new();
        for tc in choice.message.tool_calls.unwrap_or_default() {
            let arguments: Value = if tc.function.arguments.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&tc.function.arguments).map_err(|e| {
                    LlmError::Decode(format!(
                        "invalid arguments for tool call '{}': {}",
                        tc.function.name, e
                    ))
                })?
            };
            tool_calls.push(crate::types::ToolInvocation {
                id: tc.id,
                name: tc.function.name,
                arguments,
            });
        }

        Ok(ChatOutcome {
            content: choice.message.content.unwrap_or_default(),
            reasoning: choice
                .message
                .reasoning_content
                .or(choice.message.reasoning),
            tool_calls,
            usage: response.usage,
        })
    }

    /// Record the per-call usage observation at the single exit point, then
    /// normalize rate-limit errors into their own kind.
    fn finish_call(
        &self,
        identity: &Identity,
        serialized_len: usize,
        started: Instant,
        result: Result<ChatOutcome, LlmError>,
    ) -> Result<ChatOutcome, LlmError> {
        let estimate = (serialized_len / 4) as u64;
        let (input_tokens, output_tokens) = match &result {
            Ok(outcome) => match &outcome.usage {
                Some(usage) if usage.prompt_tokens > 0 => {
                    (usage.prompt_tokens, usage.completion_tokens)
                }
                _ => (estimate, 0),
            },
            Err(_) => (estimate, 0),
        };
        self.stats.record_api_call(
            &identity.model,
            input_tokens,
            output_tokens,
            started.elapsed().as_millis() as u64,
        );

        result.map_err(|err| match err {
            LlmError::Transport(text) if text.contains("429") => LlmError::RateLimited(text),
            other => other,
        })
    }
}

#[async_trait]
impl ChatBackend for ChatClient {
    async fn chat_streaming(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        params: &GenerationParams,
        cancel: &CancellationToken,
        sink: &mut dyn EventSink,
    ) -> Result<ChatOutcome, LlmError> {
        let identity = self.snapshot();
        if identity.api_key.is_empty() {
            return Err(LlmError::MissingApiKey(identity.provider));
        }
        let serialized_len = serde_json::to_string(messages).map(|s| s.len()).unwrap_or(0);
        let started = Instant::now();
        let result = self
            .chat_streaming_inner(&identity, messages, tools, params, cancel, sink)
            .await;
        self.finish_call(&identity, serialized_len, started, result)
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        params: &GenerationParams,
    ) -> Result<ChatOutcome, LlmError> {
        let identity = self.snapshot();
        if identity.api_key.is_empty() {
            return Err(LlmError::MissingApiKey(identity.provider));
        }
        let serialized_len = serde_json::to_string(messages).map(|s| s.len()).unwrap_or(0);
        let started = Instant::now();
        let result = self.chat_inner(&identity, messages, tools, params).await;
        self.finish_call(&identity, serialized_len, started, result)
    }

    async fn summarize_conversation(&self, messages: &[ChatMessage]) -> String {
        if messages.is_empty() {
            return String::new();
        }
        let tail_start = messages.len().saturating_sub(SUMMARY_TAIL_MESSAGES);
        let raw = serde_json::to_string(&messages[tail_start..]).unwrap_or_default();
        let prompt = vec![
            ChatMessage::system(SUMMARIZE_SYSTEM_PROMPT),
            ChatMessage::user(&format!(
                "Please summarize this conversation history:\n\n{}",
                raw
            )),
        ];
        let params = GenerationParams {
            max_tokens: SUMMARY_MAX_TOKENS,
            ..Default::default()
        };
        match self.chat(&prompt, None, &params).await {
            Ok(outcome) if !outcome.content.is_empty() => outcome.content,
            Ok(_) => "Conversation summary not available.".to_string(),
            Err(e) => format!("Error generating summary: {}", e),
        }
    }
}

// ─── Non-streaming response types ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    reasoning: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

// ─── Capability rejection detection ─────────────────────────────────────────

fn is_stream_options_rejection(error_text: &str) -> bool {
    error_text.to_lowercase().contains("stream_options")
}

fn is_tool_calling_unsupported(error_text: &str) -> bool {
    let text = error_text.to_lowercase();
    (text.contains("tool calling") && text.contains("not supported"))
        || text.contains("param': 'tool calling'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolDefinition;
    use serde_json::json;

    fn test_client() -> ChatClient {
        ChatClient::new(
            "test",
            "http://localhost:9/v1",
            "key",
            "gpt-4o",
            Arc::new(SessionStats::new()),
        )
        .unwrap()
    }

    fn sample_tools() -> Vec<ToolDefinition> {
        vec![ToolDefinition::function(
            "read_file",
            "Read a file",
            json!({"type":"object","properties":{},"required":[]}),
        )]
    }

    #[test]
    fn stream_body_includes_usage_option_until_rejected() {
        let client = test_client();
        let identity = client.snapshot();
        let params = GenerationParams::default();

        let body = client.build_body(&identity, &[], None, &params, true);
        assert_eq!(body["stream_options"]["include_usage"], json!(true));

        // First rejection memoizes; subsequent bodies omit the option so the
        // fallback costs exactly one extra request for the whole client.
        assert!(client.note_capability_rejection("stream_options is not allowed", false));
        let body = client.build_body(&identity, &[], None, &params, true);
        assert!(body.get("stream_options").is_none());
        assert!(!client.note_capability_rejection("stream_options is not allowed", false));
    }

    #[test]
    fn tool_rejection_memoizes_and_strips_tools() {
        let client = test_client();
        let identity = client.snapshot();
        let params = GenerationParams::default();
        let tools = sample_tools();

        let body = client.build_body(&identity, &[], Some(&tools), &params, false);
        assert!(body.get("tools").is_some());

        assert!(client.note_capability_rejection("Tool calling is not supported for this model", true));
        let body = client.build_body(&identity, &[], Some(&tools), &params, false);
        assert!(body.get("tools").is_none());
        assert!(!client.note_capability_rejection("tool calling is not supported", true));
    }

    #[test]
    fn unrelated_errors_are_not_capability_rejections() {
        let client = test_client();
        assert!(!client.note_capability_rejection("internal server error", true));
        assert!(client.build_body(&client.snapshot(), &[], None, &GenerationParams::default(), true)
            .get("stream_options")
            .is_some());
    }

    #[test]
    fn rate_limit_errors_are_distinguished() {
        let client = test_client();
        let identity = client.snapshot();
        let result = client.finish_call(
            &identity,
            400,
            Instant::now(),
            Err(LlmError::Transport("chat API error (429): slow down".to_string())),
        );
        assert!(matches!(result, Err(LlmError::RateLimited(_))));
    }

    #[test]
    fn usage_estimate_is_recorded_when_provider_omits_tokens() {
        let stats = Arc::new(SessionStats::new());
        let client = ChatClient::new("t", "http://x/v1", "k", "m", Arc::clone(&stats)).unwrap();
        let identity = client.snapshot();
        let outcome = ChatOutcome::default();
        client
            .finish_call(&identity, 4000, Instant::now(), Ok(outcome))
            .unwrap();
        // 4000 serialized chars -> ~1000 token estimate.
        assert_eq!(stats.total_tokens(), 1000);
    }

    #[test]
    fn identity_swap_keeps_session_counters() {
        let stats = Arc::new(SessionStats::new());
        let client = ChatClient::new(
            "openai",
            "https://api.openai.com/v1",
            "key-a",
            "gpt-4o",
            Arc::clone(&stats),
        )
        .unwrap();
        let identity = client.snapshot();
        client
            .finish_call(&identity, 4000, Instant::now(), Ok(ChatOutcome::default()))
            .unwrap();
        assert_eq!(stats.total_tokens(), 1000);

        client.set_identity("local", "http://localhost:8080/v1/", "key-b", "qwen2.5");

        let swapped = client.snapshot();
        assert_eq!(swapped.provider, "local");
        // Trailing slash is normalized away on swap, same as in new().
        assert_eq!(swapped.base_url, "http://localhost:8080/v1");
        assert_eq!(client.model(), "qwen2.5");
        // Usage is session scoped, not provider scoped.
        assert_eq!(stats.total_tokens(), 1000);
        client
            .finish_call(&swapped, 400, Instant::now(), Ok(ChatOutcome::default()))
            .unwrap();
        assert_eq!(stats.total_tokens(), 1100);
    }

    #[test]
    fn reported_usage_wins_over_the_estimate() {
        let stats = Arc::new(SessionStats::new());
        let client = ChatClient::new("t", "http://x/v1", "k", "m", Arc::clone(&stats)).unwrap();
        let identity = client.snapshot();
        let outcome = ChatOutcome {
            usage: Some(Usage {
                prompt_tokens: 50,
                completion_tokens: 25,
                total_tokens: 75,
            }),
            ..Default::default()
        };
        client
            .finish_call(&identity, 4000, Instant::now(), Ok(outcome))
            .unwrap();
        assert_eq!(stats.total_tokens(), 75);
    }
}
