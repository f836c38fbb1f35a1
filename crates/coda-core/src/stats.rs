//! Session metrics: API token/cost accounting and tool-call outcomes.
//!
//! One `SessionStats` instance is created per session and shared via `Arc`
//! between the chat client, the tool registry, and the shell. The end-of-run
//! summary is plain text so the binary can print it after the UI shuts down.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::runtime::{COMPACT_THRESHOLD_PERCENT, CONTEXT_LIMIT_TOKENS};

/// Rough per-1M-token prices for popular models, matched by substring.
const MODEL_COSTS: &[(&str, f64, f64)] = &[
    ("gpt-4o", 5.0, 15.0),
    ("claude-3-5-sonnet", 3.0, 15.0),
    ("deepseek-v3", 0.14, 0.28),
    ("deepseek-r1", 0.55, 2.19),
    ("llama-3", 0.05, 0.1),
];
const DEFAULT_COST: (f64, f64) = (1.0, 3.0);

#[derive(Debug, Default, Clone)]
pub struct ModelUsage {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl ModelUsage {
    pub fn cost(&self, model: &str) -> f64 {
        let model_lower = model.to_lowercase();
        let (price_in, price_out) = MODEL_COSTS
            .iter()
            .find(|(k, _, _)| model_lower.contains(k))
            .map(|(_, i, o)| (*i, *o))
            .unwrap_or(DEFAULT_COST);
        self.input_tokens as f64 * price_in / 1_000_000.0
            + self.output_tokens as f64 * price_out / 1_000_000.0
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    model_usage: BTreeMap<String, ModelUsage>,
    tool_calls_total: u64,
    tool_calls_success: u64,
    tool_calls_failure: u64,
    api_time_ms: u64,
    tool_time_ms: u64,
}

#[derive(Debug)]
pub struct SessionStats {
    session_id: String,
    started: Instant,
    inner: Mutex<StatsInner>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            started: Instant::now(),
            inner: Mutex::new(StatsInner::default()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// One observation per chat completion invocation, fallbacks included.
    pub fn record_api_call(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        duration_ms: u64,
    ) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        let usage = inner.model_usage.entry(model.to_string()).or_default();
        usage.requests += 1;
        usage.input_tokens += input_tokens;
        usage.output_tokens += output_tokens;
        inner.api_time_ms += duration_ms;
    }

    /// Success is judged by the `Error:` result convention.
    pub fn record_tool_call(&self, success: bool) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.tool_calls_total += 1;
        if success {
            inner.tool_calls_success += 1;
        } else {
            inner.tool_calls_failure += 1;
        }
    }

    /// Wall time of an actual handler execution (validation rejects don't run).
    pub fn record_tool_execution(&self, duration_ms: u64) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.tool_time_ms += duration_ms;
    }

    pub fn total_tokens(&self) -> u64 {
        let inner = self.inner.lock().expect("stats lock poisoned");
        inner
            .model_usage
            .values()
            .map(|u| u.input_tokens + u.output_tokens)
            .sum()
    }

    /// Percentage of the model context window still considered free,
    /// computed from cumulative session usage. Clamped to [0, 100].
    pub fn context_remaining_percent(&self) -> i64 {
        let total = self.total_tokens();
        let used = (total * 100 / CONTEXT_LIMIT_TOKENS) as i64;
        (100 - used).max(0)
    }

    pub fn should_compact(&self) -> bool {
        self.context_remaining_percent() < COMPACT_THRESHOLD_PERCENT
    }

    /// Plain-text end-of-session summary.
    pub fn summary(&self) -> String {
        let inner = self.inner.lock().expect("stats lock poisoned");
        let wall = self.started.elapsed();
        let agent_active_ms = inner.api_time_ms + inner.tool_time_ms;

        let success_rate = if inner.tool_calls_total > 0 {
            inner.tool_calls_success as f64 / inner.tool_calls_total as f64 * 100.0
        } else {
            0.0
        };
        let total_cost: f64 = inner
            .model_usage
            .iter()
            .map(|(m, u)| u.cost(m))
            .sum();

        let mut out = String::new();
        out.push_str("Interaction Summary\n");
        out.push_str(&format!("Session ID:    {}\n", self.session_id));
        out.push_str(&format!(
            "Tool Calls:    {} (ok {} / failed {})\n",
            inner.tool_calls_total, inner.tool_calls_success, inner.tool_calls_failure
        ));
        out.push_str(&format!("Success Rate:  {:.1}%\n", success_rate));
        out.push_str(&format!("Total Cost:    ${:.4}\n", total_cost));
        out.push('\n');
        out.push_str("Performance\n");
        out.push_str(&format!(
            "Wall Time:     {}\n",
            format_duration_ms(wall.as_millis() as u64)
        ));
        out.push_str(&format!(
            "Agent Active:  {} (api {} / tools {})\n",
            format_duration_ms(agent_active_ms),
            format_duration_ms(inner.api_time_ms),
            format_duration_ms(inner.tool_time_ms)
        ));
        if !inner.model_usage.is_empty() {
            out.push('\n');
            out.push_str("Model Usage\n");
            for (model, usage) in &inner.model_usage {
                out.push_str(&format!(
                    "{}: {} reqs, {} in / {} out, ${:.4}\n",
                    model,
                    usage.requests,
                    usage.input_tokens,
                    usage.output_tokens,
                    usage.cost(model)
                ));
            }
        }
        out
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

fn format_duration_ms(ms: u64) -> String {
    let seconds = ms / 1000;
    if seconds < 60 {
        format!("{}s", seconds)
    } else {
        format!("{}m {}s", seconds / 60, seconds % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_api_usage_per_model() {
        let stats = SessionStats::new();
        stats.record_api_call("gpt-4o", 1000, 500, 250);
        stats.record_api_call("gpt-4o", 2000, 100, 100);
        assert_eq!(stats.total_tokens(), 3600);
    }

    #[test]
    fn cost_table_matches_by_substring() {
        let usage = ModelUsage {
            requests: 1,
            input_tokens: 1_000_000,
            output_tokens: 0,
        };
        assert!((usage.cost("openai/gpt-4o-2024") - 5.0).abs() < 1e-9);
        assert!((usage.cost("totally-unknown") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn context_remaining_saturates_at_zero() {
        let stats = SessionStats::new();
        stats.record_api_call("m", CONTEXT_LIMIT_TOKENS * 2, 0, 0);
        assert_eq!(stats.context_remaining_percent(), 0);
        assert!(stats.should_compact());
    }

    #[test]
    fn fresh_session_does_not_compact() {
        let stats = SessionStats::new();
        assert_eq!(stats.context_remaining_percent(), 100);
        assert!(!stats.should_compact());
    }

    #[test]
    fn tool_outcomes_are_tallied() {
        let stats = SessionStats::new();
        stats.record_tool_call(true);
        stats.record_tool_call(false);
        stats.record_tool_execution(42);
        let summary = stats.summary();
        assert!(summary.contains("ok 1 / failed 1"));
    }
}
