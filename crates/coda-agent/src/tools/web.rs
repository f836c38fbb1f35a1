//! `read_webpage`: fetch a URL and reduce it to readable text.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::types::{safe_truncate, ToolDefinition};

use super::{ToolContext, ToolHandler, ToolRegistry};

const TEXT_CAP: usize = 8000;

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(
        ToolDefinition::function(
            "read_webpage",
            "Fetch and extract text from a URL.",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "URL to fetch"}
                },
                "required": ["url"]
            }),
        ),
        Arc::new(ReadWebpage),
    );
}

struct ReadWebpage;

#[async_trait]
impl ToolHandler for ReadWebpage {
    async fn run(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let url = args.get("url").and_then(Value::as_str).unwrap_or_default();
        match fetch_text(ctx, url).await {
            Ok(text) => Ok(text),
            Err(e) => Ok(format!("Error fetching {}: {}", url, e)),
        }
    }
}

async fn fetch_text(ctx: &ToolContext, url: &str) -> anyhow::Result<String> {
    let response = ctx.http.get(url).send().await?.error_for_status()?;
    let html = response.text().await?;
    Ok(extract_text(&html))
}

/// Strip scripts, styles, comments, and tags; collapse whitespace; cap length.
fn extract_text(html: &str) -> String {
    let script_style = regex::Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>");
    let comments = regex::Regex::new(r"(?s)<!--.*?-->");
    let tags = regex::Regex::new(r"<[^>]+>");

    let mut text = html.to_string();
    if let Ok(re) = script_style {
        text = re.replace_all(&text, "").into_owned();
    }
    if let Ok(re) = comments {
        text = re.replace_all(&text, "").into_owned();
    }
    if let Ok(re) = tags {
        text = re.replace_all(&text, " ").into_owned();
    }
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() > TEXT_CAP {
        format!(
            "{}... (truncated, {} total chars)",
            safe_truncate(&collapsed, TEXT_CAP),
            collapsed.len()
        )
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_collapses_whitespace() {
        let html = "<html><body><h1>Title</h1>\n\n<p>Some   text</p></body></html>";
        assert_eq!(extract_text(html), "Title Some text");
    }

    #[test]
    fn drops_script_and_style_bodies() {
        let html = "<script>var x = 1;</script><style>.a{}</style><p>visible</p>";
        assert_eq!(extract_text(html), "visible");
    }

    #[test]
    fn drops_html_comments() {
        let html = "<!-- hidden --><p>shown</p>";
        assert_eq!(extract_text(html), "shown");
    }

    #[test]
    fn caps_long_pages() {
        let html = format!("<p>{}</p>", "word ".repeat(3000));
        let text = extract_text(&html);
        assert!(text.contains("... (truncated,"));
        assert!(text.len() < 9000);
    }
}
