//! Shell execution tools: `execute_command` and `run_tests`.
//!
//! Both run through the shell with a hard timeout; an expired command is
//! killed, not left running. Long output keeps its head and tail with a
//! marker naming how much was dropped.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use coda_core::runtime::{COMMAND_TIMEOUT_SECS, TEST_COMMAND_TIMEOUT_SECS};

use crate::types::{safe_slice_from, safe_truncate, ToolDefinition};

use super::{ToolContext, ToolHandler, ToolRegistry};

const OUTPUT_CAP: usize = 5000;
const KEEP_HEAD: usize = 1000;
const KEEP_TAIL: usize = 1000;

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(
        ToolDefinition::function(
            "execute_command",
            "Run shell commands. Use for builds, package managers, etc.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to execute"},
                    "timeout": {"type": "integer", "description": "Timeout in seconds", "minimum": 1},
                    "working_dir": {"type": "string", "description": "Working directory"}
                },
                "required": ["command"]
            }),
        ),
        Arc::new(ExecuteCommand),
    );
    registry.register(
        ToolDefinition::function(
            "run_tests",
            "Run tests and capture output. Use for verification.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Test command (e.g., cargo test)"},
                    "working_dir": {"type": "string", "description": "Working directory"}
                },
                "required": ["command"]
            }),
        ),
        Arc::new(RunTests),
    );
}

struct ExecuteCommand;

#[async_trait]
impl ToolHandler for ExecuteCommand {
    async fn run(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let timeout = args
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(COMMAND_TIMEOUT_SECS);
        run_shell(
            args.get("command").and_then(Value::as_str).unwrap_or_default(),
            timeout,
            resolve_cwd(args, ctx),
        )
        .await
    }
}

struct RunTests;

#[async_trait]
impl ToolHandler for RunTests {
    async fn run(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        run_shell(
            args.get("command").and_then(Value::as_str).unwrap_or_default(),
            TEST_COMMAND_TIMEOUT_SECS,
            resolve_cwd(args, ctx),
        )
        .await
    }
}

fn resolve_cwd(args: &Value, ctx: &ToolContext) -> PathBuf {
    match args.get("working_dir").and_then(Value::as_str) {
        Some(dir) if !dir.is_empty() => ctx.resolve(dir),
        _ => ctx.workspace.clone(),
    }
}

async fn run_shell(command: &str, timeout_secs: u64, cwd: PathBuf) -> anyhow::Result<String> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let collect = async {
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut stdout).await;
        }
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        let status = child.wait().await?;
        anyhow::Ok((stdout, stderr, status))
    };

    let (stdout, stderr, status) =
        match tokio::time::timeout(Duration::from_secs(timeout_secs), collect).await {
            Ok(result) => result?,
            Err(_) => {
                // The collect future is dropped by the timeout, releasing the
                // borrow so the child can be killed.
                let _ = child.kill().await;
                return Ok(format!("Error: Command timed out after {} seconds", timeout_secs));
            }
        };

    let mut parts = Vec::new();
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    if !stdout.is_empty() {
        parts.push(stdout.to_string());
    }
    if !stderr.is_empty() {
        parts.push(format!("stderr: {}", stderr));
    }
    if !status.success() {
        parts.push(format!("Exit code: {}", status.code().unwrap_or(-1)));
    }
    let result = if parts.is_empty() {
        "Command completed with no output".to_string()
    } else {
        parts.join("\n")
    };
    Ok(truncate_output(&result, OUTPUT_CAP))
}

/// Head+tail truncation for long tool output.
pub(crate) fn truncate_output(output: &str, max_len: usize) -> String {
    if output.len() <= max_len {
        return output.to_string();
    }
    format!(
        "{}\n\n... ({} chars truncated) ...\n\n{}",
        safe_truncate(output, KEEP_HEAD),
        output.len() - (KEEP_HEAD + KEEP_TAIL),
        safe_slice_from(output, output.len() - KEEP_TAIL)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn ctx(dir: &Path) -> ToolContext {
        ToolContext::new(dir.to_path_buf())
    }

    #[test]
    fn short_output_is_untouched() {
        assert_eq!(truncate_output("hello", OUTPUT_CAP), "hello");
    }

    #[test]
    fn long_output_keeps_head_and_tail() {
        let output = "x".repeat(6000);
        let truncated = truncate_output(&output, OUTPUT_CAP);
        assert!(truncated.contains("... (4000 chars truncated) ..."));
        assert!(truncated.len() < output.len());
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let output = "é".repeat(4000);
        let truncated = truncate_output(&output, OUTPUT_CAP);
        assert!(truncated.contains("chars truncated"));
    }

    #[tokio::test]
    async fn captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let result = ExecuteCommand
            .run(&json!({"command": "echo hello"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(result, "hello");
    }

    #[tokio::test]
    async fn reports_stderr_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let result = ExecuteCommand
            .run(&json!({"command": "echo oops >&2; exit 3"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert!(result.contains("stderr: oops"));
        assert!(result.contains("Exit code: 3"));
    }

    #[tokio::test]
    async fn silent_success_has_a_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let result = ExecuteCommand
            .run(&json!({"command": "true"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(result, "Command completed with no output");
    }

    #[tokio::test]
    async fn timed_out_command_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let result = ExecuteCommand
            .run(&json!({"command": "sleep 10", "timeout": 1}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(result, "Error: Command timed out after 1 seconds");
    }

    #[tokio::test]
    async fn commands_run_in_the_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/marker.txt"), "").unwrap();
        let result = ExecuteCommand
            .run(&json!({"command": "ls", "working_dir": "sub"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(result, "marker.txt");
    }
}
