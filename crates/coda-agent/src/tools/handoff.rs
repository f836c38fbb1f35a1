//! `handoff_agent`: delegate the rest of the turn to another agent profile.
//!
//! The tool does not switch agents itself. It validates the target and
//! returns a marker string the orchestrator recognizes and applies after
//! the round's results are ordered.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use coda_core::runtime::AGENT_NAMES;

use crate::types::ToolDefinition;

use super::{ToolContext, ToolHandler, ToolRegistry};

pub const HANDOFF_PREFIX: &str = "__HANDOFF__:";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandoffPayload {
    pub to_agent: String,
    pub task: String,
    #[serde(default)]
    pub context: String,
}

/// Recognize a handoff marker in a tool result. `Some(Err(()))` means the
/// marker was present but the payload did not parse.
pub fn parse_handoff(result: &str) -> Option<Result<HandoffPayload, ()>> {
    let raw = result.strip_prefix(HANDOFF_PREFIX)?;
    Some(serde_json::from_str(raw).map_err(|_| ()))
}

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(
        ToolDefinition::function(
            "handoff_agent",
            "Delegate the current work to another specialized agent. Use when another agent is better suited for the next step.",
            json!({
                "type": "object",
                "properties": {
                    "to_agent": {
                        "type": "string",
                        "enum": AGENT_NAMES,
                        "description": "Target agent name"
                    },
                    "task": {
                        "type": "string",
                        "minLength": 3,
                        "description": "Clear task assignment for the next agent"
                    },
                    "context": {
                        "type": "string",
                        "description": "Optional handoff context or constraints"
                    }
                },
                "required": ["to_agent", "task"]
            }),
        ),
        Arc::new(HandoffAgent),
    );
}

struct HandoffAgent;

#[async_trait]
impl ToolHandler for HandoffAgent {
    async fn run(&self, args: &Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        let to_agent = args.get("to_agent").and_then(Value::as_str).unwrap_or_default();
        if !AGENT_NAMES.contains(&to_agent) {
            let mut names: Vec<&str> = AGENT_NAMES.to_vec();
            names.sort_unstable();
            return Ok(format!(
                "Error: Invalid handoff target. Available agents: {}",
                names.join(", ")
            ));
        }
        let task = args
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim();
        if task.is_empty() {
            return Ok("Error: task is required for handoff_agent".to_string());
        }
        let payload = HandoffPayload {
            to_agent: to_agent.to_string(),
            task: task.to_string(),
            context: args
                .get("context")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string(),
        };
        Ok(format!("{}{}", HANDOFF_PREFIX, serde_json::to_string(&payload)?))
    }
}
