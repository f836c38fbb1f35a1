//! Filesystem tools: read, write, edit, list, find.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::types::ToolDefinition;

use super::{ToolContext, ToolHandler, ToolRegistry};

const FIND_FILES_LIMIT: usize = 100;
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", "__pycache__", ".venv", "venv"];

fn str_arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn int_arg(args: &Value, key: &str) -> Option<i64> {
    args.get(key).and_then(Value::as_i64)
}

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(
        ToolDefinition::function(
            "read_file",
            "Read file content, optionally by line range. Use for understanding existing code before editing.",
            json!({
                "type": "object",
                "properties": {
                    "filepath": {"type": "string", "description": "Path to the file"},
                    "start_line": {"type": "integer", "description": "Start line number (1-indexed)", "minimum": 1},
                    "end_line": {"type": "integer", "description": "End line number (1-indexed)", "minimum": 1}
                },
                "required": ["filepath"]
            }),
        ),
        Arc::new(ReadFile),
    );
    registry.register(
        ToolDefinition::function(
            "write_file",
            "Create new file or overwrite existing. Use ONLY for new files, prefer edit_file for modifications.",
            json!({
                "type": "object",
                "properties": {
                    "filepath": {"type": "string", "description": "Path to the file"},
                    "content": {"type": "string", "description": "Content to write"}
                },
                "required": ["filepath", "content"]
            }),
        ),
        Arc::new(WriteFile),
    );
    registry.register(
        ToolDefinition::function(
            "edit_file",
            "Replace exact text block in existing file. MUST read file first. search_block must match exactly.",
            json!({
                "type": "object",
                "properties": {
                    "filepath": {"type": "string", "description": "Path to the file"},
                    "search_block": {"type": "string", "description": "Exact text to find and replace"},
                    "replace_block": {"type": "string", "description": "New text to insert"}
                },
                "required": ["filepath", "search_block", "replace_block"]
            }),
        ),
        Arc::new(EditFile),
    );
    registry.register(
        ToolDefinition::function(
            "list_directory",
            "List files and folders in a directory.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory path"}
                },
                "required": ["path"]
            }),
        ),
        Arc::new(ListDirectory),
    );
    registry.register(
        ToolDefinition::function(
            "find_files",
            "Find files by name pattern (e.g., '*.rs', 'config.json').",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Glob pattern to match"},
                    "directory": {"type": "string", "description": "Starting directory (default: workspace root)"}
                },
                "required": ["pattern"]
            }),
        ),
        Arc::new(FindFiles),
    );
}

struct ReadFile;

#[async_trait]
impl ToolHandler for ReadFile {
    async fn run(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let filepath = str_arg(args, "filepath");
        let path = ctx.resolve(filepath);
        if !path.exists() {
            return Ok(format!("Error: File not found: {}", filepath));
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let Some(start_line) = int_arg(args, "start_line") else {
            return Ok(content);
        };
        let lines: Vec<&str> = content.lines().collect();
        let start_idx = (start_line.max(1) - 1) as usize;
        let end_idx = int_arg(args, "end_line")
            .map(|e| e.max(0) as usize)
            .unwrap_or(lines.len())
            .min(lines.len());
        if start_idx >= end_idx {
            return Ok(String::new());
        }
        Ok(lines[start_idx..end_idx].join("\n"))
    }
}

struct WriteFile;

#[async_trait]
impl ToolHandler for WriteFile {
    async fn run(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let filepath = str_arg(args, "filepath");
        let path = ctx.resolve(filepath);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, str_arg(args, "content")).await?;
        Ok(format!("Success: Written to {}", filepath))
    }
}

struct EditFile;

#[async_trait]
impl ToolHandler for EditFile {
    async fn run(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let filepath = str_arg(args, "filepath");
        let path = ctx.resolve(filepath);
        if !path.exists() {
            return Ok(format!("Error: File not found: {}", filepath));
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let search_block = str_arg(args, "search_block");
        if !content.contains(search_block) {
            return Ok(
                "Error: search_block not found in file. Please ensure exact match or use read_file to check content."
                    .to_string(),
            );
        }
        let new_content = content.replacen(search_block, str_arg(args, "replace_block"), 1);
        tokio::fs::write(&path, new_content).await?;
        Ok(format!("Success: Edited {}", filepath))
    }
}

struct ListDirectory;

#[async_trait]
impl ToolHandler for ListDirectory {
    async fn run(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let raw = str_arg(args, "path");
        let path = ctx.resolve(raw);
        if !path.is_dir() {
            return Ok(format!("Error: Directory not found: {}", raw));
        }
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let suffix = if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                "/"
            } else {
                ""
            };
            entries.push(format!("{}{}", name, suffix));
        }
        entries.sort();
        Ok(entries.join("\n"))
    }
}

struct FindFiles;

#[async_trait]
impl ToolHandler for FindFiles {
    async fn run(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let raw_dir = str_arg(args, "directory");
        let dir = if raw_dir.is_empty() {
            ctx.workspace.clone()
        } else {
            ctx.resolve(raw_dir)
        };
        if !dir.is_dir() {
            return Ok(format!("Error: Directory not found: {}", raw_dir));
        }
        let pattern = glob_to_regex(str_arg(args, "pattern"))?;

        // Directory walk is blocking work.
        let results = tokio::task::spawn_blocking(move || {
            let mut results = Vec::new();
            walk_files(&dir, &pattern, &mut results);
            results
        })
        .await?;

        if results.is_empty() {
            Ok("No files found matching pattern".to_string())
        } else {
            Ok(results.join("\n"))
        }
    }
}

fn glob_to_regex(pattern: &str) -> anyhow::Result<regex::Regex> {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Ok(regex::Regex::new(&out)?)
}

fn walk_files(dir: &Path, pattern: &regex::Regex, results: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        if results.len() >= FIND_FILES_LIMIT {
            return;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if !SKIP_DIRS.contains(&name.as_str()) {
                walk_files(&path, pattern, results);
            }
        } else if pattern.is_match(&name) {
            results.push(path.to_string_lossy().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn ctx(dir: &Path) -> ToolContext {
        ToolContext::new(dir.to_path_buf())
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let result = WriteFile
            .run(&json!({"filepath": "a.txt", "content": "one\ntwo\nthree"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result, "Success: Written to a.txt");

        let content = ReadFile
            .run(&json!({"filepath": "a.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(content, "one\ntwo\nthree");
    }

    #[tokio::test]
    async fn read_file_honors_line_range() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        WriteFile
            .run(&json!({"filepath": "a.txt", "content": "1\n2\n3\n4\n5"}), &ctx)
            .await
            .unwrap();
        let content = ReadFile
            .run(&json!({"filepath": "a.txt", "start_line": 2, "end_line": 4}), &ctx)
            .await
            .unwrap();
        assert_eq!(content, "2\n3\n4");
    }

    #[tokio::test]
    async fn read_missing_file_is_a_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ReadFile
            .run(&json!({"filepath": "nope.txt"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(result, "Error: File not found: nope.txt");
    }

    #[tokio::test]
    async fn edit_file_replaces_first_occurrence_only() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        WriteFile
            .run(&json!({"filepath": "a.txt", "content": "foo bar foo"}), &ctx)
            .await
            .unwrap();
        let result = EditFile
            .run(
                &json!({"filepath": "a.txt", "search_block": "foo", "replace_block": "baz"}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(result, "Success: Edited a.txt");
        let content = ReadFile.run(&json!({"filepath": "a.txt"}), &ctx).await.unwrap();
        assert_eq!(content, "baz bar foo");
    }

    #[tokio::test]
    async fn edit_file_requires_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        WriteFile
            .run(&json!({"filepath": "a.txt", "content": "hello"}), &ctx)
            .await
            .unwrap();
        let result = EditFile
            .run(
                &json!({"filepath": "a.txt", "search_block": "HELLO", "replace_block": "x"}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(result.starts_with("Error: search_block not found"));
    }

    #[tokio::test]
    async fn list_directory_sorts_and_marks_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        let result = ListDirectory
            .run(&json!({"path": "."}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(result, "a.txt\nb.txt\nsub/");
    }

    #[tokio::test]
    async fn find_files_matches_glob_and_skips_vendor_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "").unwrap();
        std::fs::write(dir.path().join("node_modules/dep.rs"), "").unwrap();
        std::fs::write(dir.path().join("notes.md"), "").unwrap();

        let result = FindFiles
            .run(&json!({"pattern": "*.rs"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert!(result.contains("main.rs"));
        assert!(!result.contains("dep.rs"));
        assert!(!result.contains("notes.md"));
    }

    #[tokio::test]
    async fn find_files_reports_no_matches() {
        let dir = tempfile::tempdir().unwrap();
        let result = FindFiles
            .run(&json!({"pattern": "*.zig"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(result, "No files found matching pattern");
    }

    #[test]
    fn tilde_paths_resolve_to_home() {
        let ctx = ToolContext::new(PathBuf::from("/work"));
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(ctx.resolve("~/x.txt"), Path::new(&home).join("x.txt"));
        }
        assert_eq!(ctx.resolve("rel.txt"), Path::new("/work/rel.txt"));
        assert_eq!(ctx.resolve("/abs.txt"), Path::new("/abs.txt"));
    }
}
