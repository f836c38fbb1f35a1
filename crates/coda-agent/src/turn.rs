//! Plan gate: in Plan mode a multi-step request is turned into a checklist
//! the user must approve before the agent loop runs.

use coda_core::runtime::{
    BUILD_MODE, PLAN_MESSAGE_PREFIX, PLAN_MODE, PLAN_PROMPT_TEMPLATE, PLAN_SKIP_TOKEN,
    PLAN_TEMPERATURE,
};

use crate::llm::{ChatBackend, GenerationParams, LlmError};
use crate::types::ChatMessage;

pub const PLAN_APPROVED_MESSAGE: &str = "Plan approved. Executing...";
pub const PLAN_CANCELLED_NOTICE: &str = "Plan execution cancelled.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Plan,
    Build,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Plan => PLAN_MODE,
            Mode::Build => BUILD_MODE,
        }
    }

    /// Unknown values fall back to the default so a corrupted setting never
    /// locks the session out.
    pub fn parse(raw: &str) -> Mode {
        if raw.eq_ignore_ascii_case(BUILD_MODE) {
            Mode::Build
        } else {
            Mode::Plan
        }
    }
}

/// Ask the model whether a plan is needed. Returns the raw plan text, or the
/// skip sentinel / empty string when no plan is warranted.
pub async fn generate_plan(backend: &dyn ChatBackend, user_input: &str) -> Result<String, LlmError> {
    let prompt = PLAN_PROMPT_TEMPLATE.replace("{user_input}", user_input);
    let params = GenerationParams {
        temperature: PLAN_TEMPERATURE,
        ..Default::default()
    };
    let outcome = backend.chat(&[ChatMessage::user(&prompt)], None, &params).await?;
    Ok(outcome.content)
}

pub fn plan_skipped(plan_summary: &str) -> bool {
    let trimmed = plan_summary.trim();
    trimmed.is_empty() || trimmed == PLAN_SKIP_TOKEN
}

/// Full instruction appended to the live transcript after approval.
pub fn approval_instruction(plan_summary: &str) -> String {
    format!(
        "Execution plan approved by user. Execute the approved plan now. \
         Do not generate a new plan. Apply this plan step by step and deliver outcomes.\n\n\
         Approved plan:\n{}",
        plan_summary
    )
}

/// Shorter form persisted to storage.
pub fn approval_record(plan_summary: &str) -> String {
    format!(
        "Execution plan approved by user.\n\nApproved plan:\n{}",
        plan_summary
    )
}

/// Checklist progress for the current turn.
#[derive(Debug, Clone, Default)]
pub struct PlanTracker {
    pub items: Vec<String>,
    pub completed: usize,
    pub active: bool,
}

impl PlanTracker {
    pub fn new(items: Vec<String>) -> Self {
        Self { items, completed: 0, active: false }
    }

    /// One step forward, called per tool round with at least one success.
    pub fn advance(&mut self) {
        if self.active && self.completed < self.items.len() {
            self.completed += 1;
        }
    }

    /// The loop finished without cancellation; everything is done.
    pub fn finish(&mut self) {
        if self.active {
            self.completed = self.items.len();
            self.active = false;
        }
    }

    pub fn render(&self) -> String {
        format_plan_items(&self.items, self.completed)
    }

    pub fn message(&self) -> String {
        format!("{}{}", PLAN_MESSAGE_PREFIX, self.render())
    }
}

/// Pull checklist items out of whatever markdown the model produced.
pub fn extract_plan_items(plan_summary: &str) -> Vec<String> {
    let numbered = regex::Regex::new(r"^\d+\.\s+").ok();
    let mut items = Vec::new();
    for raw in plan_summary.lines() {
        let mut line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
            line = rest.trim();
        } else if let Some(re) = &numbered {
            if let Some(m) = re.find(line) {
                line = line[m.end()..].trim();
            }
        }
        for marker in ["[ ]", "[x]", "[X]"] {
            if let Some(rest) = line.strip_prefix(marker) {
                line = rest.trim();
                break;
            }
        }
        if !line.is_empty() {
            items.push(line.to_string());
        }
    }
    if items.is_empty() && !plan_summary.trim().is_empty() {
        items = plan_summary
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
    }
    items
}

pub fn format_plan_items(items: &[String], completed: usize) -> String {
    let done = completed.min(items.len());
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let mark = if idx < done { "x" } else { " " };
            format!("- [{}] {}", mark, item)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes_with_plan_fallback() {
        assert_eq!(Mode::parse("Build"), Mode::Build);
        assert_eq!(Mode::parse("build"), Mode::Build);
        assert_eq!(Mode::parse("Plan"), Mode::Plan);
        assert_eq!(Mode::parse("garbage"), Mode::Plan);
        assert_eq!(Mode::default(), Mode::Plan);
    }

    #[test]
    fn extracts_dash_and_star_bullets() {
        let items = extract_plan_items("- first step\n* second step\n");
        assert_eq!(items, vec!["first step", "second step"]);
    }

    #[test]
    fn extracts_numbered_items_and_checkbox_markers() {
        let items = extract_plan_items("1. do a thing\n2. [ ] another\n- [x] already done");
        assert_eq!(items, vec!["do a thing", "another", "already done"]);
    }

    #[test]
    fn falls_back_to_non_blank_lines() {
        let items = extract_plan_items("read the config\n\nwrite the patch");
        assert_eq!(items, vec!["read the config", "write the patch"]);
    }

    #[test]
    fn formats_checklist_with_progress() {
        let items = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(format_plan_items(&items, 0), "- [ ] a\n- [ ] b\n- [ ] c");
        assert_eq!(format_plan_items(&items, 2), "- [x] a\n- [x] b\n- [ ] c");
        assert_eq!(format_plan_items(&items, 9), "- [x] a\n- [x] b\n- [x] c");
    }

    #[test]
    fn tracker_advances_only_while_active() {
        let mut tracker = PlanTracker::new(vec!["a".to_string(), "b".to_string()]);
        tracker.advance();
        assert_eq!(tracker.completed, 0);

        tracker.active = true;
        tracker.advance();
        assert_eq!(tracker.completed, 1);
        tracker.advance();
        tracker.advance();
        assert_eq!(tracker.completed, 2);

        tracker.finish();
        assert!(!tracker.active);
        assert_eq!(tracker.completed, 2);
    }

    #[test]
    fn skip_sentinel_and_blank_plans_bypass_the_gate() {
        assert!(plan_skipped(""));
        assert!(plan_skipped("  [NO_PLAN]  "));
        assert!(!plan_skipped("- [ ] step one"));
    }

    #[test]
    fn plan_message_carries_the_prefix() {
        let mut tracker = PlanTracker::new(vec!["step".to_string()]);
        tracker.active = true;
        assert_eq!(tracker.message(), "[PLAN]\n- [ ] step");
    }

    #[test]
    fn approval_texts_embed_the_plan() {
        let full = approval_instruction("- [ ] a");
        assert!(full.starts_with("Execution plan approved by user. Execute the approved plan now."));
        assert!(full.ends_with("Approved plan:\n- [ ] a"));
        let record = approval_record("- [ ] a");
        assert_eq!(record, "Execution plan approved by user.\n\nApproved plan:\n- [ ] a");
    }
}
