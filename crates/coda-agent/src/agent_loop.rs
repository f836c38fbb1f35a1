//! The model ↔ tool round loop.
//!
//! Streams one assistant response, executes any requested tools, and feeds
//! the results back, up to `MAX_TOOL_ROUNDS` rounds. Two guards terminate a
//! runaway loop: the round cap, and a cross-round repeat check that halts
//! when every signature in a round has been requested before in this turn.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use coda_core::runtime::MAX_TOOL_ROUNDS;

use crate::llm::{ChatBackend, GenerationParams, LlmError};
use crate::orchestrator::{run_tool_round, ApplyHandoff, RoundOutcome};
use crate::session::PendingWrite;
use crate::tools::ToolRegistry;
use crate::types::{ChatMessage, EventSink};

pub const REPEAT_LOOP_NOTICE: &str = "Stopped tool loop: repeated tool call detected.";
pub const MAX_ROUNDS_NOTICE: &str = "Stopped tool loop: reached max tool rounds.";

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The model answered without requesting tools.
    Completed,
    Cancelled,
    RepeatedToolCalls,
    MaxRounds,
    /// The backend failed; the error was surfaced as a notice.
    BackendError,
}

#[derive(Debug)]
pub struct LoopResult {
    pub stop: LoopStop,
    pub rounds: usize,
}

#[allow(clippy::too_many_arguments)]
pub async fn run_response_loop(
    backend: &dyn ChatBackend,
    registry: &Arc<ToolRegistry>,
    params: &GenerationParams,
    conversation_id: &str,
    messages: &mut Vec<ChatMessage>,
    pending_writes: &mut Vec<PendingWrite>,
    apply_handoff: &mut ApplyHandoff<'_>,
    on_round: &mut dyn FnMut(&RoundOutcome),
    cancel: &CancellationToken,
    sink: &mut dyn EventSink,
) -> LoopResult {
    let tools = registry.definitions();
    let mut seen_signatures: HashSet<String> = HashSet::new();

    for round in 0..MAX_TOOL_ROUNDS {
        if cancel.is_cancelled() {
            return LoopResult { stop: LoopStop::Cancelled, rounds: round };
        }

        let outcome = match backend
            .chat_streaming(messages, Some(&tools), params, cancel, sink)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                report_backend_error(&e, sink);
                return LoopResult { stop: LoopStop::BackendError, rounds: round };
            }
        };

        let has_content = !outcome.content.is_empty() || outcome.reasoning.is_some();
        if !has_content && outcome.tool_calls.is_empty() {
            // Nothing to keep from an empty response.
            return LoopResult { stop: LoopStop::Completed, rounds: round };
        }

        let assistant = if outcome.tool_calls.is_empty() {
            let mut msg = ChatMessage::assistant(&outcome.content);
            msg.reasoning = outcome.reasoning.clone();
            msg
        } else {
            ChatMessage::assistant_with_tool_calls(
                &outcome.content,
                outcome.reasoning.as_deref(),
                outcome.tool_calls.iter().map(|tc| tc.to_wire()).collect(),
            )
        };
        pending_writes.push(PendingWrite::from_message(conversation_id, &assistant));
        messages.push(assistant);

        if outcome.tool_calls.is_empty() {
            return LoopResult { stop: LoopStop::Completed, rounds: round };
        }

        let signatures: Vec<String> =
            outcome.tool_calls.iter().map(|tc| tc.signature()).collect();
        if signatures.iter().all(|sig| seen_signatures.contains(sig)) {
            tracing::warn!("tool loop repeated an entire round of calls, stopping");
            sink.on_notice(REPEAT_LOOP_NOTICE);
            return LoopResult { stop: LoopStop::RepeatedToolCalls, rounds: round };
        }
        seen_signatures.extend(signatures);

        let round_outcome = run_tool_round(
            registry,
            &outcome.tool_calls,
            conversation_id,
            messages,
            pending_writes,
            apply_handoff,
            sink,
        )
        .await;
        on_round(&round_outcome);
        if !round_outcome.should_continue {
            return LoopResult { stop: LoopStop::Completed, rounds: round + 1 };
        }
    }

    tracing::warn!("tool loop hit the round cap");
    sink.on_notice(MAX_ROUNDS_NOTICE);
    LoopResult { stop: LoopStop::MaxRounds, rounds: MAX_TOOL_ROUNDS }
}

fn report_backend_error(error: &LlmError, sink: &mut dyn EventSink) {
    tracing::error!("chat request failed: {}", error);
    let notice = match error {
        LlmError::RateLimited(_) => {
            "Error: Rate limited by the provider. Please retry shortly.".to_string()
        }
        other => format!("Error: {}", other),
    };
    sink.on_notice(&notice);
}
