//! Runtime constants: loop budgets, generation defaults, and the fixed
//! instruction strings used by the plan gate and the context compactor.

/// Application modes. Plan mode gates multi-step work behind an approved checklist.
pub const BUILD_MODE: &str = "Build";
pub const PLAN_MODE: &str = "Plan";
pub const DEFAULT_MODE: &str = PLAN_MODE;

/// Agent roster for handoffs. The default persona writes code.
pub const DEFAULT_AGENT_NAME: &str = "coder";
pub const AGENT_NAMES: &[&str] = &[
    "general",
    "coder",
    "explorer",
    "reviewer",
    "architect",
    "security",
];

/// Model context window assumed when deciding whether to auto-compact.
pub const CONTEXT_LIMIT_TOKENS: u64 = 128_000;

/// Auto-compaction triggers below this remaining-context percentage,
/// but only once the transcript is long enough to be worth summarizing.
pub const COMPACT_THRESHOLD_PERCENT: i64 = 20;
pub const COMPACT_MIN_MESSAGES: usize = 10;

/// Prefix of the single assistant message a compacted conversation is reset to.
pub const COMPACT_MESSAGE_PREFIX: &str = "[COMPACTED]";

pub const PLAN_PROMPT_TEMPLATE: &str = "Decide whether a plan is needed for this request.\n\
If the request is simple/single-step/small-talk, return exactly [NO_PLAN].\n\
If the request is complex/multi-step/high-risk, return only a concise markdown checklist with 3-7 steps.\n\
Do not add any extra text.\n\n\
Request:\n{user_input}";

pub const PLAN_MESSAGE_PREFIX: &str = "[PLAN]\n";
pub const PLAN_SKIP_TOKEN: &str = "[NO_PLAN]";

/// Generation defaults applied when a setting is absent or unparsable.
pub const AI_DEFAULT_MAX_TOKENS: u32 = 4096;
pub const AI_DEFAULT_TEMPERATURE: f64 = 0.5;
pub const AI_DEFAULT_TOP_P: f64 = 1.0;

/// The planning call is deliberately low-temperature and short.
pub const PLAN_TEMPERATURE: f64 = 0.2;

/// Hard cap on model->tool->model rounds within one user turn.
pub const MAX_TOOL_ROUNDS: usize = 8;

/// Concurrency width for one batch of tool calls.
pub const TOOL_MAX_PARALLEL: usize = 3;

/// Agent handoffs allowed within one turn.
pub const TOOL_MAX_HANDOFFS: usize = 3;

/// Wall-clock budget for a single chat completion request.
pub const CHAT_TIMEOUT_SECS: u64 = 120;

/// Subprocess budgets. Test runs get the longer leash.
pub const COMMAND_TIMEOUT_SECS: u64 = 60;
pub const TEST_COMMAND_TIMEOUT_SECS: u64 = 120;

/// Conversation titles are clipped to this many characters of the first user message.
pub const TITLE_MAX_CHARS: usize = 30;

/// Summarization call parameters.
pub const SUMMARY_TAIL_MESSAGES: usize = 20;
pub const SUMMARY_MAX_TOKENS: u32 = 1000;

pub const SUMMARIZE_SYSTEM_PROMPT: &str = "You are a context manager. Summarize the following \
technical conversation concisely. Focus on: 1) The current goal/task. 2) Key decisions made. \
3) Current state of the project/files. 4) Any specific constraints. Keep it under 500 words. \
Do not use conversational filler.";
