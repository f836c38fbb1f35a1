//! Tool registry and executor.
//!
//! Tools never fail at the type level: every outcome is a string, and
//! failures follow the `Error:` prefix convention so the model can read
//! them. Arguments are validated against the tool's declared schema before
//! the handler runs; a validation failure never invokes the handler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use coda_core::stats::SessionStats;

use crate::types::ToolDefinition;

mod exec;
mod file_ops;
mod handoff;
mod search;
mod validate;
mod web;

pub use handoff::{parse_handoff, HandoffPayload, HANDOFF_PREFIX};

/// Shared state handed to every tool handler.
pub struct ToolContext {
    pub workspace: PathBuf,
    /// Short-timeout client for `read_webpage`; separate from the chat client.
    pub http: reqwest::Client,
}

impl ToolContext {
    pub fn new(workspace: PathBuf) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { workspace, http }
    }

    /// Resolve a user-supplied path: `~` expands to the home directory,
    /// relative paths are anchored at the workspace.
    pub fn resolve(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return Path::new(&home).join(rest);
            }
        }
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace.join(p)
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn run(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String>;
}

struct RegisteredTool {
    def: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    ctx: ToolContext,
    stats: Arc<SessionStats>,
}

impl ToolRegistry {
    pub fn new(workspace: PathBuf, stats: Arc<SessionStats>) -> Self {
        Self {
            tools: Vec::new(),
            ctx: ToolContext::new(workspace),
            stats,
        }
    }

    /// Registry with the builtin tool set.
    pub fn with_builtins(workspace: PathBuf, stats: Arc<SessionStats>) -> Self {
        let mut registry = Self::new(workspace, stats);
        file_ops::register(&mut registry);
        search::register(&mut registry);
        exec::register(&mut registry);
        web::register(&mut registry);
        handoff::register(&mut registry);
        registry
    }

    /// Registering an existing name replaces the previous handler.
    pub fn register(&mut self, def: ToolDefinition, handler: Arc<dyn ToolHandler>) {
        self.tools.retain(|t| t.def.function.name != def.function.name);
        self.tools.push(RegisteredTool { def, handler });
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.def.clone()).collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.def.function.name == name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .iter()
            .map(|t| t.def.function.name.clone())
            .collect()
    }

    /// Execute one tool call. Never fails; unknown tools, invalid arguments,
    /// and handler errors all come back as `Error:` strings.
    pub async fn execute(&self, name: &str, arguments: &Value) -> String {
        tracing::debug!(tool = name, "executing tool");
        let Some(tool) = self.tools.iter().find(|t| t.def.function.name == name) else {
            tracing::warn!(tool = name, "tool not found");
            self.stats.record_tool_call(false);
            return format!(
                "Error: Tool '{}' not found. Available: {}",
                name,
                self.tool_names().join(", ")
            );
        };

        if let Err(message) =
            validate::validate_arguments(name, &tool.def.function.parameters, arguments)
        {
            tracing::warn!(tool = name, %message, "argument validation failed");
            self.stats.record_tool_call(false);
            return message;
        }

        let started = Instant::now();
        let result = match tool.handler.run(arguments, &self.ctx).await {
            Ok(output) => output,
            Err(e) => format!("Error: {}", e),
        };
        self.stats
            .record_tool_execution(started.elapsed().as_millis() as u64);

        let success = !result.starts_with("Error:");
        if !success {
            tracing::warn!(tool = name, "tool returned error: {}", result);
        }
        self.stats.record_tool_call(success);
        result
    }
}
