//! Chat session: owns the transcript, wires the plan gate and agent loop
//! together, and persists everything through the store.
//!
//! Writes produced while a turn is running are queued as pending writes and
//! flushed in order afterwards; a store that closed mid-flush abandons the
//! remainder instead of failing the turn.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use coda_core::runtime::{
    AGENT_NAMES, AI_DEFAULT_MAX_TOKENS, AI_DEFAULT_TEMPERATURE, AI_DEFAULT_TOP_P,
    COMPACT_MESSAGE_PREFIX, COMPACT_MIN_MESSAGES, DEFAULT_AGENT_NAME, TITLE_MAX_CHARS,
    TOOL_MAX_HANDOFFS,
};
use coda_core::stats::SessionStats;
use coda_store::{Store, StoreError, StoredMessage};

use crate::agent_loop::{run_response_loop, LoopStop};
use crate::llm::{ChatBackend, GenerationParams};
use crate::orchestrator::RoundOutcome;
use crate::tools::{HandoffPayload, ToolRegistry};
use crate::turn::{
    approval_instruction, approval_record, extract_plan_items, generate_plan, plan_skipped, Mode,
    PlanTracker, PLAN_APPROVED_MESSAGE, PLAN_CANCELLED_NOTICE,
};
use crate::types::{ChatMessage, EventSink, ToolCall};

const MODE_SETTING_KEY: &str = "current_mode";

/// A message queued for persistence after the turn.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub tool_calls: Option<String>,
    pub reasoning: Option<String>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
}

impl PendingWrite {
    pub fn from_message(conversation_id: &str, message: &ChatMessage) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            role: message.role.clone(),
            content: message.content.clone().unwrap_or_default(),
            tool_calls: message
                .tool_calls
                .as_ref()
                .and_then(|calls| serde_json::to_string(calls).ok()),
            reasoning: message.reasoning.clone(),
            tool_call_id: message.tool_call_id.clone(),
            name: message.name.clone(),
        }
    }
}

struct SessionState {
    conversation_id: Option<String>,
    messages: Vec<ChatMessage>,
    pending_writes: Vec<PendingWrite>,
    active_agent: String,
    mode: Mode,
    plan: Option<PlanTracker>,
    handoffs_this_turn: usize,
}

pub struct ChatSession {
    backend: Arc<dyn ChatBackend>,
    registry: Arc<ToolRegistry>,
    store: Store,
    stats: Arc<SessionStats>,
    state: SessionState,
}

impl ChatSession {
    /// Build a session, restoring the persisted mode.
    pub async fn load(
        backend: Arc<dyn ChatBackend>,
        registry: Arc<ToolRegistry>,
        store: Store,
        stats: Arc<SessionStats>,
    ) -> anyhow::Result<Self> {
        let settings = store.get_all_settings().await.unwrap_or_default();
        let mode = settings
            .get(MODE_SETTING_KEY)
            .map(|raw| Mode::parse(raw))
            .unwrap_or_default();
        Ok(Self {
            backend,
            registry,
            store,
            stats,
            state: SessionState {
                conversation_id: None,
                messages: Vec::new(),
                pending_writes: Vec::new(),
                active_agent: DEFAULT_AGENT_NAME.to_string(),
                mode,
                plan: None,
                handoffs_this_turn: 0,
            },
        })
    }

    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    pub async fn set_mode(&mut self, mode: Mode) -> Result<(), StoreError> {
        self.state.mode = mode;
        self.store.save_setting(MODE_SETTING_KEY, mode.as_str()).await
    }

    pub fn active_agent(&self) -> &str {
        &self.state.active_agent
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.state.conversation_id.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.state.messages
    }

    /// Generation parameters from persisted settings, with fixed defaults for
    /// anything absent or unparsable.
    pub async fn generation_params(&self) -> GenerationParams {
        let settings = self.store.get_all_settings().await.unwrap_or_default();
        GenerationParams {
            max_tokens: settings
                .get("max_tokens")
                .and_then(|v| v.parse().ok())
                .unwrap_or(AI_DEFAULT_MAX_TOKENS),
            temperature: settings
                .get("temperature")
                .and_then(|v| v.parse().ok())
                .unwrap_or(AI_DEFAULT_TEMPERATURE),
            top_p: settings
                .get("top_p")
                .and_then(|v| v.parse().ok())
                .unwrap_or(AI_DEFAULT_TOP_P),
        }
    }

    /// Start an empty conversation; the row is created lazily on first use.
    pub fn new_conversation(&mut self) {
        self.state.conversation_id = None;
        self.state.messages.clear();
        self.state.pending_writes.clear();
        self.state.plan = None;
        self.state.active_agent = DEFAULT_AGENT_NAME.to_string();
    }

    /// Load an existing conversation into the session.
    pub async fn resume(&mut self, conversation_id: &str) -> Result<(), StoreError> {
        let stored = self.store.get_messages(conversation_id).await?;
        self.state.messages = stored.into_iter().map(stored_to_chat).collect();
        self.state.conversation_id = Some(conversation_id.to_string());
        self.state.pending_writes.clear();
        self.state.plan = None;
        Ok(())
    }

    async fn ensure_conversation(&mut self, user_input: &str) -> Result<String, StoreError> {
        if let Some(id) = &self.state.conversation_id {
            return Ok(id.clone());
        }
        let id = Uuid::new_v4().to_string();
        let title: String = user_input.chars().take(TITLE_MAX_CHARS).collect();
        self.store.create_conversation(&id, title.trim()).await?;
        self.state.conversation_id = Some(id.clone());
        Ok(id)
    }

    /// One user turn: plan gate, agent loop, finalizers.
    pub async fn run_turn(
        &mut self,
        user_input: &str,
        cancel: &CancellationToken,
        sink: &mut dyn EventSink,
    ) -> anyhow::Result<()> {
        let params = self.generation_params().await;

        if self.state.mode == Mode::Plan {
            match generate_plan(self.backend.as_ref(), user_input).await {
                Ok(plan_summary) if !plan_skipped(&plan_summary) => {
                    if !self.gate_on_plan(user_input, &plan_summary, sink).await? {
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("plan generation failed: {}", e);
                    sink.on_notice(&format!("Error: {}", e));
                    return Ok(());
                }
            }
        }

        let conversation_id = self.ensure_conversation(user_input).await?;
        let user_msg = ChatMessage::user(user_input);
        self.store
            .save_message(&conversation_id, "user", user_input, None, None)
            .await?;
        self.state.messages.push(user_msg);
        self.state.handoffs_this_turn = 0;

        let backend = Arc::clone(&self.backend);
        let registry = Arc::clone(&self.registry);
        let SessionState {
            messages,
            pending_writes,
            active_agent,
            plan,
            handoffs_this_turn,
            ..
        } = &mut self.state;

        let mut apply_handoff = |payload: &HandoffPayload| {
            apply_agent_handoff(payload, active_agent, handoffs_this_turn)
        };
        let mut on_round = |round: &RoundOutcome| {
            if round.successes > 0 {
                if let Some(tracker) = plan.as_mut() {
                    tracker.advance();
                }
            }
        };

        let result = run_response_loop(
            backend.as_ref(),
            &registry,
            &params,
            &conversation_id,
            messages,
            pending_writes,
            &mut apply_handoff,
            &mut on_round,
            cancel,
            sink,
        )
        .await;

        if result.stop != LoopStop::Cancelled {
            if let Some(tracker) = self.state.plan.as_mut() {
                tracker.finish();
            }
        }

        self.flush_pending_writes().await?;
        self.finalize_context(sink).await;
        Ok(())
    }

    /// Render the plan, ask for confirmation, and set up the approved run.
    /// Returns false when the user rejected the plan.
    async fn gate_on_plan(
        &mut self,
        user_input: &str,
        plan_summary: &str,
        sink: &mut dyn EventSink,
    ) -> anyhow::Result<bool> {
        let conversation_id = self.ensure_conversation(user_input).await?;
        let mut tracker = PlanTracker::new(extract_plan_items(plan_summary));
        let plan_msg = tracker.message();
        self.state.messages.push(ChatMessage::assistant(&plan_msg));
        self.store
            .save_message(&conversation_id, "assistant", &plan_msg, None, None)
            .await?;
        sink.on_text(&plan_msg);

        if !sink.on_confirmation_request(plan_summary) {
            sink.on_notice(PLAN_CANCELLED_NOTICE);
            return Ok(false);
        }

        self.state
            .messages
            .push(ChatMessage::system(&approval_instruction(plan_summary)));
        self.store
            .save_message(
                &conversation_id,
                "system",
                &approval_record(plan_summary),
                None,
                None,
            )
            .await?;

        tracker.active = true;
        self.state.plan = Some(tracker);

        self.state
            .messages
            .push(ChatMessage::assistant(PLAN_APPROVED_MESSAGE));
        sink.on_text(PLAN_APPROVED_MESSAGE);
        if let Err(e) = self
            .store
            .save_message(&conversation_id, "assistant", PLAN_APPROVED_MESSAGE, None, None)
            .await
        {
            tracing::warn!("failed to persist plan transition message: {}", e);
        }
        Ok(true)
    }

    /// Persist queued writes in order. A store that reports itself closed
    /// abandons the remainder; any other failure propagates.
    pub async fn flush_pending_writes(&mut self) -> Result<(), StoreError> {
        let writes = std::mem::take(&mut self.state.pending_writes);
        for write in writes {
            let result = self
                .store
                .save_message(
                    &write.conversation_id,
                    &write.role,
                    &write.content,
                    write.tool_calls.as_deref(),
                    write.reasoning.as_deref(),
                )
                .await;
            if let Err(e) = result {
                if e.to_string().to_lowercase().contains("closed") {
                    tracing::warn!("store closed mid-flush, dropping remaining writes");
                    return Ok(());
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Auto-compact when the remaining context estimate runs low and the
    /// transcript is long enough to be worth summarizing.
    async fn finalize_context(&mut self, sink: &mut dyn EventSink) {
        if self.stats.should_compact() && self.state.messages.len() > COMPACT_MIN_MESSAGES {
            if let Err(e) = self.compact_conversation().await {
                tracing::warn!("auto-compaction failed: {}", e);
                return;
            }
            sink.on_notice("Context compacted.");
        }
    }

    /// Replace the transcript with one summary message. Compacting an empty
    /// or already-compacted conversation is a no-op.
    pub async fn compact_conversation(&mut self) -> anyhow::Result<()> {
        if self.state.messages.is_empty() {
            return Ok(());
        }
        if let [only] = self.state.messages.as_slice() {
            if only
                .content
                .as_deref()
                .is_some_and(|c| c.starts_with(COMPACT_MESSAGE_PREFIX))
            {
                return Ok(());
            }
        }

        let summary = self
            .backend
            .summarize_conversation(&self.state.messages)
            .await;
        let compacted = format!("{} {}", COMPACT_MESSAGE_PREFIX, summary);
        self.state.messages = vec![ChatMessage::assistant(&compacted)];
        if let Some(conversation_id) = self.state.conversation_id.clone() {
            self.store
                .save_message(&conversation_id, "assistant", &compacted, None, None)
                .await?;
        }
        Ok(())
    }
}

fn apply_agent_handoff(
    payload: &HandoffPayload,
    active_agent: &mut String,
    handoffs_this_turn: &mut usize,
) -> Result<String, String> {
    if *handoffs_this_turn >= TOOL_MAX_HANDOFFS {
        return Err("Error: Handoff limit reached for this turn.".to_string());
    }
    if !AGENT_NAMES.contains(&payload.to_agent.as_str()) {
        return Err("Error: Invalid handoff target.".to_string());
    }
    *active_agent = payload.to_agent.clone();
    *handoffs_this_turn += 1;
    let mut message = format!(
        "Switched to agent '{}'. Task: {}",
        payload.to_agent, payload.task
    );
    if !payload.context.is_empty() {
        message.push_str(&format!("\nContext: {}", payload.context));
    }
    Ok(message)
}

fn stored_to_chat(stored: StoredMessage) -> ChatMessage {
    ChatMessage {
        role: stored.role,
        content: Some(stored.content),
        reasoning: stored.reasoning,
        tool_calls: stored
            .tool_calls
            .and_then(|raw| serde_json::from_str::<Vec<ToolCall>>(&raw).ok()),
        tool_call_id: None,
        name: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatOutcome, LlmError};
    use crate::types::{CollectingEventSink, ToolDefinition};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedBackend {
        script: Mutex<Vec<ChatOutcome>>,
        chat_calls: AtomicUsize,
        summarize_calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(mut outcomes: Vec<ChatOutcome>) -> Self {
            outcomes.reverse();
            Self {
                script: Mutex::new(outcomes),
                chat_calls: AtomicUsize::new(0),
                summarize_calls: AtomicUsize::new(0),
            }
        }

        fn next(&self) -> ChatOutcome {
            self.chat_calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().pop().unwrap_or_default()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn chat_streaming(
            &self,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
            _params: &GenerationParams,
            _cancel: &CancellationToken,
            sink: &mut dyn EventSink,
        ) -> Result<ChatOutcome, LlmError> {
            let outcome = self.next();
            if !outcome.content.is_empty() {
                sink.on_text(&outcome.content);
            }
            Ok(outcome)
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
            _params: &GenerationParams,
        ) -> Result<ChatOutcome, LlmError> {
            Ok(self.next())
        }

        async fn summarize_conversation(&self, _messages: &[ChatMessage]) -> String {
            self.summarize_calls.fetch_add(1, Ordering::SeqCst);
            "the conversation so far".to_string()
        }
    }

    fn text(content: &str) -> ChatOutcome {
        ChatOutcome { content: content.to_string(), ..Default::default() }
    }

    async fn session_with(
        dir: &tempfile::TempDir,
        backend: Arc<ScriptedBackend>,
    ) -> ChatSession {
        let stats = Arc::new(SessionStats::new());
        let store = Store::open(&dir.path().join("data.db"), &dir.path().join(".key")).unwrap();
        let registry = Arc::new(ToolRegistry::new(
            PathBuf::from("."),
            Arc::clone(&stats),
        ));
        ChatSession::load(backend, registry, store, stats).await.unwrap()
    }

    #[tokio::test]
    async fn build_mode_skips_the_plan_call() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![text("done")]));
        let mut session = session_with(&dir, Arc::clone(&backend)).await;
        session.set_mode(Mode::Build).await.unwrap();

        let mut sink = CollectingEventSink::approving();
        session
            .run_turn("hello", &CancellationToken::new(), &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.confirmations_seen, 0);
        assert_eq!(backend.chat_calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.texts.last().map(String::as_str), Some("done"));
    }

    #[tokio::test]
    async fn skip_sentinel_bypasses_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![text("[NO_PLAN]"), text("answer")]));
        let mut session = session_with(&dir, Arc::clone(&backend)).await;

        let mut sink = CollectingEventSink::approving();
        session
            .run_turn("hi", &CancellationToken::new(), &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.confirmations_seen, 0);
        assert_eq!(sink.texts.last().map(String::as_str), Some("answer"));
    }

    #[tokio::test]
    async fn rejected_plan_stops_the_turn_and_persists_only_the_plan() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![
            text("- [ ] step one\n- [ ] step two"),
            text("should never run"),
        ]));
        let mut session = session_with(&dir, Arc::clone(&backend)).await;

        let mut sink = CollectingEventSink::default();
        session
            .run_turn("refactor everything", &CancellationToken::new(), &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.confirmations_seen, 1);
        assert!(sink.notices.contains(&PLAN_CANCELLED_NOTICE.to_string()));
        // Only the plan call happened; the loop never ran.
        assert_eq!(backend.chat_calls.load(Ordering::SeqCst), 1);

        let conversation_id = session.conversation_id().unwrap().to_string();
        let stored = session.store.get_messages(&conversation_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].content.starts_with("[PLAN]\n"));
    }

    #[tokio::test]
    async fn approved_plan_runs_with_the_approval_instruction() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![
            text("- [ ] inspect\n- [ ] fix"),
            text("all fixed"),
        ]));
        let mut session = session_with(&dir, Arc::clone(&backend)).await;

        let mut sink = CollectingEventSink::approving();
        session
            .run_turn("fix the bug", &CancellationToken::new(), &mut sink)
            .await
            .unwrap();

        let roles: Vec<&str> = session.messages().iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["assistant", "system", "assistant", "user", "assistant"]);
        assert!(session.messages()[1]
            .content
            .as_deref()
            .unwrap()
            .starts_with("Execution plan approved by user. Execute the approved plan now."));
        assert_eq!(
            session.messages()[2].content.as_deref(),
            Some(PLAN_APPROVED_MESSAGE)
        );

        let conversation_id = session.conversation_id().unwrap().to_string();
        let stored = session.store.get_messages(&conversation_id).await.unwrap();
        let contents: Vec<&str> = stored.iter().map(|m| m.content.as_str()).collect();
        assert!(contents.iter().any(|c| c.starts_with("Execution plan approved by user.\n")));
        assert!(contents.contains(&"fix the bug"));
        assert!(contents.contains(&"all fixed"));
    }

    #[tokio::test]
    async fn compaction_is_idempotent_and_skips_empty_transcripts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let mut session = session_with(&dir, Arc::clone(&backend)).await;

        session.compact_conversation().await.unwrap();
        assert_eq!(backend.summarize_calls.load(Ordering::SeqCst), 0);

        session.state.messages.push(ChatMessage::user("a"));
        session.state.messages.push(ChatMessage::assistant("b"));
        session.compact_conversation().await.unwrap();
        assert_eq!(backend.summarize_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.messages().len(), 1);
        assert!(session.messages()[0]
            .content
            .as_deref()
            .unwrap()
            .starts_with(COMPACT_MESSAGE_PREFIX));

        session.compact_conversation().await.unwrap();
        assert_eq!(backend.summarize_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handoffs_are_capped_per_turn() {
        let payload = HandoffPayload {
            to_agent: "reviewer".to_string(),
            task: "look".to_string(),
            context: String::new(),
        };
        let mut agent = DEFAULT_AGENT_NAME.to_string();
        let mut count = 0;
        for _ in 0..TOOL_MAX_HANDOFFS {
            assert!(apply_agent_handoff(&payload, &mut agent, &mut count).is_ok());
        }
        let err = apply_agent_handoff(&payload, &mut agent, &mut count).unwrap_err();
        assert_eq!(err, "Error: Handoff limit reached for this turn.");
        assert_eq!(agent, "reviewer");
    }

    #[tokio::test]
    async fn handoff_message_includes_task_and_context() {
        let payload = HandoffPayload {
            to_agent: "security".to_string(),
            task: "audit the auth flow".to_string(),
            context: "focus on token storage".to_string(),
        };
        let mut agent = DEFAULT_AGENT_NAME.to_string();
        let mut count = 0;
        let message = apply_agent_handoff(&payload, &mut agent, &mut count).unwrap();
        assert_eq!(
            message,
            "Switched to agent 'security'. Task: audit the auth flow\nContext: focus on token storage"
        );
    }

    #[tokio::test]
    async fn generation_params_come_from_settings_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let session = session_with(&dir, backend).await;

        let params = session.generation_params().await;
        assert_eq!(params.max_tokens, AI_DEFAULT_MAX_TOKENS);
        assert_eq!(params.temperature, AI_DEFAULT_TEMPERATURE);

        session.store.save_setting("temperature", "0.8").await.unwrap();
        session.store.save_setting("max_tokens", "not a number").await.unwrap();
        let params = session.generation_params().await;
        assert_eq!(params.temperature, 0.8);
        assert_eq!(params.max_tokens, AI_DEFAULT_MAX_TOKENS);
    }

    #[tokio::test]
    async fn resume_restores_tool_call_history() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let mut session = session_with(&dir, backend).await;

        session.store.create_conversation("c1", "t").await.unwrap();
        session
            .store
            .save_message(
                "c1",
                "assistant",
                "checking",
                Some(r#"[{"id":"x","type":"function","function":{"name":"read_file","arguments":"{}"}}]"#),
                None,
            )
            .await
            .unwrap();
        session.resume("c1").await.unwrap();

        assert_eq!(session.messages().len(), 1);
        let calls = session.messages()[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "read_file");
    }

    #[tokio::test]
    async fn mode_persists_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = Arc::new(ScriptedBackend::new(vec![]));
            let mut session = session_with(&dir, backend).await;
            session.set_mode(Mode::Build).await.unwrap();
        }
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let session = session_with(&dir, backend).await;
        assert_eq!(session.mode(), Mode::Build);
    }
}
