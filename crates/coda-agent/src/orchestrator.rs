//! One round of tool execution.
//!
//! Calls run with bounded parallelism but every observable side effect —
//! sink events, transcript appends, pending writes — happens in the order
//! the model requested the calls. Duplicate signatures within a round are
//! skipped before dispatch; a task that panics or goes missing becomes a
//! synthetic error result so its `tool_call_id` still gets an answer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use coda_core::runtime::TOOL_MAX_PARALLEL;

use crate::session::PendingWrite;
use crate::tools::{parse_handoff, HandoffPayload, ToolRegistry};
use crate::types::{ChatMessage, EventSink, ToolInvocation};

pub const DUPLICATE_RESULT: &str = "Error: Duplicate tool call detected and skipped.";
pub const LOST_TASK_RESULT: &str = "Error: tool task failed unexpectedly";
pub const INVALID_HANDOFF_RESULT: &str = "Error: Invalid handoff payload.";

/// What a round did, for the loop's guards.
#[derive(Debug, Default)]
pub struct RoundOutcome {
    pub should_continue: bool,
    pub executed: usize,
    pub failed_signatures: HashSet<String>,
    pub handoffs: usize,
    pub successes: usize,
}

/// Apply-handoff callback: `Ok(message)` when the agent switch took effect,
/// `Err(message)` when it was refused.
pub type ApplyHandoff<'a> = dyn FnMut(&HandoffPayload) -> Result<String, String> + 'a;

pub async fn run_tool_round(
    registry: &Arc<ToolRegistry>,
    invocations: &[ToolInvocation],
    conversation_id: &str,
    messages: &mut Vec<ChatMessage>,
    pending_writes: &mut Vec<PendingWrite>,
    apply_handoff: &mut ApplyHandoff<'_>,
    sink: &mut dyn EventSink,
) -> RoundOutcome {
    let mut outcome = RoundOutcome::default();
    let mut slots: Vec<Option<(String, u64)>> = vec![None; invocations.len()];

    // Pre-fill duplicates so they never reach a handler.
    let mut seen = HashSet::new();
    let mut dispatch = Vec::new();
    for (idx, invocation) in invocations.iter().enumerate() {
        if !seen.insert(invocation.signature()) {
            tracing::warn!(tool = %invocation.name, "duplicate tool call skipped");
            slots[idx] = Some((DUPLICATE_RESULT.to_string(), 0));
            continue;
        }
        sink.on_tool_call(&invocation.name, &invocation.arguments.to_string());
        dispatch.push(idx);
    }

    let semaphore = Arc::new(Semaphore::new(TOOL_MAX_PARALLEL));
    let mut join_set = JoinSet::new();
    for idx in dispatch {
        let registry = Arc::clone(registry);
        let semaphore = Arc::clone(&semaphore);
        let invocation = invocations[idx].clone();
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let started = Instant::now();
            let result = registry.execute(&invocation.name, &invocation.arguments).await;
            (idx, result, started.elapsed().as_millis() as u64)
        });
        outcome.executed += 1;
    }
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((idx, result, duration_ms)) => slots[idx] = Some((result, duration_ms)),
            Err(e) => tracing::warn!("tool task did not complete: {}", e),
        }
    }

    // Side effects strictly in request order.
    for (idx, invocation) in invocations.iter().enumerate() {
        let (mut result, duration_ms) = slots[idx]
            .take()
            .unwrap_or_else(|| (LOST_TASK_RESULT.to_string(), 0));

        if invocation.name == "handoff_agent" {
            result = match resolve_handoff(&result, apply_handoff) {
                HandoffResolution::Applied(message) => {
                    outcome.handoffs += 1;
                    pending_writes.push(PendingWrite {
                        conversation_id: conversation_id.to_string(),
                        role: "system".to_string(),
                        content: message.clone(),
                        tool_calls: None,
                        reasoning: None,
                        tool_call_id: None,
                        name: None,
                    });
                    message
                }
                HandoffResolution::NotApplied(message) => message,
            };
        }

        let is_error = result.starts_with("Error:");
        sink.on_tool_result(&invocation.name, &result, is_error, duration_ms);
        if is_error {
            outcome.failed_signatures.insert(invocation.signature());
        } else {
            outcome.successes += 1;
        }

        let tool_msg = ChatMessage::tool_result(&invocation.id, &invocation.name, &result);
        pending_writes.push(PendingWrite::from_message(conversation_id, &tool_msg));
        messages.push(tool_msg);
    }

    outcome.should_continue = outcome.executed > 0;
    outcome
}

enum HandoffResolution {
    Applied(String),
    NotApplied(String),
}

fn resolve_handoff(result: &str, apply: &mut ApplyHandoff<'_>) -> HandoffResolution {
    match parse_handoff(result) {
        None => HandoffResolution::NotApplied(result.to_string()),
        Some(Err(())) => HandoffResolution::NotApplied(INVALID_HANDOFF_RESULT.to_string()),
        Some(Ok(payload)) => match apply(&payload) {
            Ok(message) => HandoffResolution::Applied(format!("Handoff applied. {}", message)),
            Err(message) => HandoffResolution::NotApplied(message),
        },
    }
}
