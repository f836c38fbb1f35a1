//! Text search across the workspace.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::types::ToolDefinition;

use super::{ToolContext, ToolHandler, ToolRegistry};

const MATCH_LIMIT: usize = 100;
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", "__pycache__", ".venv", "venv"];

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(
        ToolDefinition::function(
            "grep_search",
            "Search for a regex pattern within files. Returns path:line: text matches.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regex pattern to search for"},
                    "directory": {"type": "string", "description": "Directory to search (default: workspace root)"},
                    "include": {"type": "string", "description": "File name filter (e.g., '*.rs')"},
                    "case_sensitive": {"type": "boolean", "description": "Perform case-sensitive search"}
                },
                "required": ["pattern"]
            }),
        ),
        Arc::new(GrepSearch),
    );
}

struct GrepSearch;

#[async_trait]
impl ToolHandler for GrepSearch {
    async fn run(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let raw_dir = args
            .get("directory")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let dir = if raw_dir.is_empty() {
            ctx.workspace.clone()
        } else {
            ctx.resolve(raw_dir)
        };
        if !dir.is_dir() {
            return Ok(format!("Error: Directory not found: {}", raw_dir));
        }

        let pattern = args.get("pattern").and_then(Value::as_str).unwrap_or_default();
        let case_sensitive = args
            .get("case_sensitive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let raw = if case_sensitive {
            pattern.to_string()
        } else {
            format!("(?i){}", pattern)
        };
        let regex = match regex::Regex::new(&raw) {
            Ok(re) => re,
            Err(e) => return Ok(format!("Error: Invalid regex pattern: {}", e)),
        };

        let include = args
            .get("include")
            .and_then(Value::as_str)
            .map(str::to_string);

        let matches = tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            search_dir(&dir, &regex, include.as_deref(), &mut matches);
            matches
        })
        .await?;

        if matches.is_empty() {
            Ok("No matches found".to_string())
        } else {
            Ok(matches.join("\n"))
        }
    }
}

fn search_dir(dir: &Path, regex: &regex::Regex, include: Option<&str>, matches: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        if matches.len() >= MATCH_LIMIT {
            return;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if !SKIP_DIRS.contains(&name.as_str()) {
                search_dir(&path, regex, include, matches);
            }
            continue;
        }
        if let Some(filter) = include {
            if !name_matches(filter, &name) {
                continue;
            }
        }
        // Binary files fail utf-8 decoding and are skipped.
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for (i, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(format!("{}:{}: {}", path.display(), i + 1, line.trim_end()));
                if matches.len() >= MATCH_LIMIT {
                    return;
                }
            }
        }
    }
}

/// `*.rs`-style filter: a leading `*` matches by suffix, anything else by
/// exact file name.
fn name_matches(filter: &str, name: &str) -> bool {
    match filter.strip_prefix('*') {
        Some(suffix) => name.ends_with(suffix),
        None => name == filter,
    }
}
