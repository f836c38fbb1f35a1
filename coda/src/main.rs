mod cli;
mod sink;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use coda_agent::turn::Mode;
use coda_agent::{ChatClient, ChatSession, ToolRegistry};
use coda_core::config::{self, AppConfig};
use coda_core::stats::SessionStats;
use coda_store::Store;

use cli::Cli;
use sink::TerminalEventSink;

fn init_tracing(verbose: bool) {
    let default = if verbose { "coda=debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("CODA_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let app_config = AppConfig::load()?;
    let provider = app_config.resolve_active(args.provider.as_deref())?;
    let base_url = args.api_base.clone().unwrap_or(provider.base_url.clone());
    let model = args.model.clone().unwrap_or(provider.default_model.clone());

    let db_path = match &args.db {
        Some(path) => PathBuf::from(path),
        None => config::default_db_path()?,
    };
    let store = Store::open(&db_path, &config::key_file_path()?)?;

    let api_key = match args.api_key.clone().or_else(config::api_key_from_env) {
        Some(key) => key,
        None => store
            .get_api_key(&provider.name)
            .await?
            .unwrap_or_default(),
    };
    if api_key.is_empty() {
        tracing::warn!(
            provider = %provider.name,
            "no API key configured; requests will fail until one is set"
        );
    }

    let workspace = match &args.workspace {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir().context("could not determine working directory")?,
    };

    let stats = Arc::new(SessionStats::new());
    let client = Arc::new(ChatClient::new(
        &provider.name,
        &base_url,
        &api_key,
        &model,
        Arc::clone(&stats),
    )?);
    let registry = Arc::new(ToolRegistry::with_builtins(workspace, Arc::clone(&stats)));
    let mut session =
        ChatSession::load(client.clone(), registry, store.clone(), Arc::clone(&stats)).await?;

    let mut sink = TerminalEventSink::new(args.verbose);
    let result = match &args.message {
        Some(message) => run_turn(&mut session, message, &mut sink).await,
        None => repl(&mut session, &store, &client, &app_config, &model, &mut sink).await,
    };

    store.shutdown();
    if args.message.is_none() {
        eprintln!("\n{}", stats.summary());
    }
    result
}

/// Run one turn; Ctrl-C cancels the in-flight work instead of killing the
/// process, so pending writes still flush.
async fn run_turn(
    session: &mut ChatSession,
    input: &str,
    sink: &mut TerminalEventSink,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let turn = session.run_turn(input, &cancel, sink);
    tokio::pin!(turn);
    loop {
        tokio::select! {
            result = &mut turn => return result,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("^C");
                cancel.cancel();
            }
        }
    }
}

async fn repl(
    session: &mut ChatSession,
    store: &Store,
    client: &Arc<ChatClient>,
    config: &AppConfig,
    model: &str,
    sink: &mut TerminalEventSink,
) -> Result<()> {
    eprintln!("coda (model: {}, mode: {})", model, session.mode().as_str());
    eprintln!(
        "Commands: /new /compact /mode [plan|build] /provider <name> /conversations /resume <id> /quit\n"
    );

    let mut editor = rustyline::DefaultEditor::new()
        .map_err(|e| anyhow::anyhow!("failed to create line editor: {}", e))?;
    if let Ok(history) = store.recent_user_history(500).await {
        for entry in history {
            let _ = editor.add_history_entry(entry);
        }
    }

    loop {
        match editor.readline("you> ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(input);
                if input.starts_with('/') {
                    if !handle_command(session, store, client, config, input).await? {
                        break;
                    }
                    continue;
                }
                if let Err(e) = run_turn(session, input, sink).await {
                    eprintln!("Error: {}", e);
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                eprintln!("^C");
                continue;
            }
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        }
    }
    Ok(())
}

/// Returns false when the REPL should exit.
async fn handle_command(
    session: &mut ChatSession,
    store: &Store,
    client: &Arc<ChatClient>,
    config: &AppConfig,
    input: &str,
) -> Result<bool> {
    let mut parts = input.splitn(2, ' ');
    let command = parts.next().unwrap_or_default();
    let argument = parts.next().unwrap_or("").trim();

    match command {
        "/quit" | "/exit" | "/q" => return Ok(false),
        "/new" => {
            session.new_conversation();
            eprintln!("Started a new conversation.");
        }
        "/compact" => {
            session.compact_conversation().await?;
            eprintln!("Conversation compacted.");
        }
        "/mode" => {
            if argument.is_empty() {
                eprintln!("Mode: {}", session.mode().as_str());
            } else {
                let mode = Mode::parse(argument);
                session.set_mode(mode).await?;
                eprintln!("Mode set to {}.", mode.as_str());
            }
        }
        "/provider" => {
            if argument.is_empty() {
                for provider in &config.providers {
                    eprintln!("{}  {}  ({})", provider.name, provider.default_model, provider.base_url);
                }
            } else {
                match config.resolve_active(Some(argument)) {
                    Ok(provider) => {
                        let api_key = config::api_key_from_env()
                            .or(store.get_api_key(&provider.name).await?)
                            .unwrap_or_default();
                        client.set_identity(
                            &provider.name,
                            &provider.base_url,
                            &api_key,
                            &provider.default_model,
                        );
                        eprintln!(
                            "Switched to provider {} (model {}).",
                            provider.name, provider.default_model
                        );
                    }
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
        }
        "/conversations" => {
            let conversations = store.list_conversations().await?;
            if conversations.is_empty() {
                eprintln!("No conversations yet.");
            }
            for conversation in conversations {
                eprintln!(
                    "{}  {}  ({})",
                    conversation.id, conversation.title, conversation.updated_at
                );
            }
        }
        "/resume" => {
            if argument.is_empty() {
                eprintln!("Usage: /resume <conversation-id>");
            } else {
                session.resume(argument).await?;
                eprintln!(
                    "Resumed conversation {} ({} messages).",
                    argument,
                    session.messages().len()
                );
            }
        }
        other => eprintln!("Unknown command: {}", other),
    }
    Ok(true)
}
