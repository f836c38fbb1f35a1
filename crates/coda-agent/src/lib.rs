//! Agent core: streaming chat client, tool registry and executor, parallel
//! tool-round orchestration, plan-gated turns, and the chat session that
//! ties them to persistent storage.
//!
//! Module map:
//!   - `types`        — wire shapes (messages, tool calls), signatures, `EventSink`
//!   - `llm`          — OpenAI-compatible chat client + typed SSE accumulation
//!   - `tools`        — registry, schema validation, builtin tool handlers
//!   - `orchestrator` — one bounded-parallel batch of tool calls
//!   - `agent_loop`   — the model ↔ tool round loop with termination guards
//!   - `turn`         — plan gate (Plan mode checklist + confirmation)
//!   - `session`      — transcript ownership, persistence, compaction, handoffs

pub mod agent_loop;
pub mod llm;
pub mod orchestrator;
pub mod session;
pub mod tools;
pub mod turn;
pub mod types;

pub use llm::{ChatBackend, ChatClient, ChatOutcome, GenerationParams, LlmError};
pub use session::ChatSession;
pub use tools::ToolRegistry;
pub use types::{ChatMessage, EventSink, ToolCall, ToolDefinition, ToolInvocation};
