//! Terminal renderer for agent events.

use std::io::Write;

use coda_agent::EventSink;

pub struct TerminalEventSink {
    verbose: bool,
    /// Bytes of the current response already printed by the chunk stream.
    streamed: String,
}

impl TerminalEventSink {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            streamed: String::new(),
        }
    }
}

impl EventSink for TerminalEventSink {
    fn on_text(&mut self, text: &str) {
        // The full text arrives after streaming; print only what the chunk
        // stream has not already shown.
        if let Some(rest) = text.strip_prefix(self.streamed.as_str()) {
            print!("{}", rest);
        } else if self.streamed.is_empty() {
            print!("{}", text);
        }
        println!();
        let _ = std::io::stdout().flush();
        self.streamed.clear();
    }

    fn on_text_chunk(&mut self, chunk: &str) {
        self.streamed.push_str(chunk);
        print!("{}", chunk);
        let _ = std::io::stdout().flush();
    }

    fn on_reasoning_chunk(&mut self, chunk: &str) {
        if self.verbose {
            eprint!("{}", chunk);
            let _ = std::io::stderr().flush();
        }
    }

    fn on_tool_call(&mut self, name: &str, arguments: &str) {
        if self.verbose {
            eprintln!("→ {} {}", name, arguments);
        } else {
            eprintln!("→ {}", name);
        }
    }

    fn on_tool_result(&mut self, name: &str, result: &str, is_error: bool, duration_ms: u64) {
        let mark = if is_error { "✗" } else { "✓" };
        eprintln!("{} {} ({} ms)", mark, name, duration_ms);
        if self.verbose || is_error {
            let preview: String = result.chars().take(200).collect();
            eprintln!("  {}", preview);
        }
    }

    fn on_notice(&mut self, message: &str) {
        eprintln!("! {}", message);
    }

    fn on_confirmation_request(&mut self, _prompt: &str) -> bool {
        eprint!("Execute this plan? [y/N] ");
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}
