// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use freja_config::{AgentConfig, ThinkingLevel};
use freja_model::{
    AssistantMessage, Message, ModelError, ModelProvider, StopReason, StreamOptions,
    StreamRequest, ToolCall, ToolResultMessage,
};
use freja_session::{EntryPayload, SessionStore};
use freja_tools::{ToolEventFn, ToolExecutionEvent, ToolExecutor, ToolRegistry};

use crate::assembler::{AssemblyEvent, MessageAssembler};
use crate::compact::{compact_messages, needs_compaction, CompactionError};
use crate::events::AgentEvent;
use crate::queue::MessageQueue;
use crate::state::AgentState;

/// Payload synthesized for tool calls skipped by a steering interruption.
pub const SKIPPED_TOOL_CALL_TEXT: &str = "Tool call skipped due to user interruption";

// ─── Caller hooks ─────────────────────────────────────────────────────────────

/// Reshape the message history into the LLM-facing context.  Runs every turn.
pub type ConvertToLlmFn = Arc<dyn Fn(&[Message]) -> Vec<Message> + Send + Sync>;

/// Prune or inject messages before conversion.  Observes the run's
/// cancellation token.
pub type TransformContextFn = Arc<
    dyn Fn(Vec<Message>, CancellationToken) -> BoxFuture<'static, anyhow::Result<Vec<Message>>>
        + Send
        + Sync,
>;

/// Resolve the API key for a provider; called every turn so short-lived
/// OAuth tokens stay fresh.
pub type GetApiKeyFn = Arc<dyn Fn(&str) -> BoxFuture<'static, Option<String>> + Send + Sync>;

/// External message source polled alongside the internal queues.
pub type MessageSourceFn = Arc<dyn Fn() -> Vec<Message> + Send + Sync>;

/// Optional integration points supplied by the host.
#[derive(Default, Clone)]
pub struct AgentHooks {
    pub convert_to_llm: Option<ConvertToLlmFn>,
    pub transform_context: Option<TransformContextFn>,
    pub get_api_key: Option<GetApiKeyFn>,
    pub get_steering_messages: Option<MessageSourceFn>,
    pub get_follow_up_messages: Option<MessageSourceFn>,
}

/// Default conversion: keep user, assistant and tool-result messages; custom
/// entries are invisible to the LLM.
pub fn default_convert_to_llm(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .filter(|m| !matches!(m, Message::Custom(_)))
        .cloned()
        .collect()
}

// ─── Event fan-out ────────────────────────────────────────────────────────────

/// Subscriber callback; receives every event of every run, in order.
pub type EventHandler = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// Handle returned by [`Agent::subscribe`]; pass to [`Agent::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    handlers: Mutex<Vec<(u64, EventHandler)>>,
    next_id: AtomicU64,
}

impl Subscribers {
    fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().unwrap().push((id, handler));
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.handlers.lock().unwrap().retain(|(h, _)| *h != id.0);
    }

    /// Copy-on-iterate so subscribe/unsubscribe during emission is safe.
    fn emit(&self, event: &AgentEvent) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

/// Per-run sink: fan out to subscribers and the run's channel.
#[derive(Clone)]
struct EventSink {
    subscribers: Arc<Subscribers>,
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl EventSink {
    fn emit(&self, event: AgentEvent) {
        self.subscribers.emit(&event);
        let _ = self.tx.send(event);
    }
}

// ─── The agent ────────────────────────────────────────────────────────────────

enum TurnOutcome {
    /// Stream finished normally; the message is committed and `message_end`
    /// emitted.
    Completed(AssistantMessage),
    /// Provider reported an in-stream terminal error; committed, run ends.
    Errored,
    /// Cancelled; any committable partial is persisted.
    Aborted,
    /// Configuration/protocol/retry-cap failure; nothing committed yet.
    Fatal(String),
}

enum RetryDecision {
    Retry,
    Fatal(String),
    Aborted,
}

/// The agent core: drives the conversation to a stop condition while
/// exposing the lifecycle event stream.  Single writer to its message list;
/// at most one run may be active at a time.
pub struct Agent {
    state: AgentState,
    provider: Arc<dyn ModelProvider>,
    executor: ToolExecutor,
    config: AgentConfig,
    hooks: AgentHooks,
    steering: Arc<MessageQueue>,
    follow_up: Arc<MessageQueue>,
    subscribers: Arc<Subscribers>,
    session: Option<SessionStore>,
    /// Session entry id per message in `state.messages` (None when the
    /// message has no persisted entry, e.g. a compaction summary).
    entry_ids: Vec<Option<String>>,
    /// Summary and file-ops details of the newest compaction on the path.
    last_compaction: Option<(String, freja_session::FileOpsDetails)>,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        let thinking_level = config.thinking_level;
        Self {
            state: AgentState { thinking_level, ..Default::default() },
            provider,
            executor: ToolExecutor::new(tools),
            config,
            hooks: AgentHooks::default(),
            steering: Arc::new(MessageQueue::new()),
            follow_up: Arc::new(MessageQueue::new()),
            subscribers: Arc::new(Subscribers::default()),
            session: None,
            entry_ids: Vec::new(),
            last_compaction: None,
        }
    }

    pub fn with_hooks(mut self, hooks: AgentHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Attach a session store, loading its current path as the conversation
    /// history.
    pub fn with_session(mut self, store: SessionStore) -> Self {
        let pairs = store.build_context_with_ids();
        self.state.messages = pairs.iter().map(|(_, m)| m.clone()).collect();
        self.entry_ids = pairs.into_iter().map(|(id, _)| Some(id)).collect();
        self.last_compaction = store.latest_compaction().and_then(|e| match &e.payload {
            EntryPayload::Compaction { summary, details, .. } => {
                Some((summary.clone(), details.clone()))
            }
            _ => None,
        });
        self.session = Some(store);
        self
    }

    // ── Accessors & idle-time setters ────────────────────────────────────────

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.state.messages
    }

    pub fn is_streaming(&self) -> bool {
        self.state.is_streaming
    }

    pub fn session(&self) -> Option<&SessionStore> {
        self.session.as_ref()
    }

    /// Queue handle for mid-run injections; clone it before starting a run.
    pub fn steering_queue(&self) -> Arc<MessageQueue> {
        self.steering.clone()
    }

    /// Queue handle for messages delivered when the agent is about to stop.
    pub fn follow_up_queue(&self) -> Arc<MessageQueue> {
        self.follow_up.clone()
    }

    pub fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        self.subscribers.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.unsubscribe(id);
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) -> anyhow::Result<()> {
        self.ensure_idle()?;
        self.state.system_prompt = prompt.into();
        Ok(())
    }

    pub fn set_thinking_level(&mut self, level: ThinkingLevel) -> anyhow::Result<()> {
        self.ensure_idle()?;
        self.state.thinking_level = level;
        if let Some(store) = &mut self.session {
            store
                .append(EntryPayload::ThinkingLevelChange { thinking_level: level })
                .context("recording thinking level change")?;
        }
        Ok(())
    }

    pub fn set_provider(&mut self, provider: Arc<dyn ModelProvider>) -> anyhow::Result<()> {
        self.ensure_idle()?;
        if let Some(store) = &mut self.session {
            store
                .append(EntryPayload::ModelChange {
                    provider: provider.name().to_string(),
                    model_id: provider.model().id.clone(),
                })
                .context("recording model change")?;
        }
        self.provider = provider;
        Ok(())
    }

    /// Name the current state of the path.
    pub fn label(&mut self, label: impl Into<String>) -> anyhow::Result<()> {
        self.ensure_idle()?;
        if let Some(store) = &mut self.session {
            store
                .append(EntryPayload::Label { label: label.into() })
                .context("recording label")?;
        }
        Ok(())
    }

    fn ensure_idle(&self) -> anyhow::Result<()> {
        if self.state.is_streaming {
            bail!("agent is streaming; enqueue a steering message instead");
        }
        Ok(())
    }

    // ── Running ──────────────────────────────────────────────────────────────

    /// Start a run with a single user message and a fresh cancellation
    /// handle.  Fails when a run is already in flight.
    pub async fn prompt(
        &mut self,
        text: impl Into<String>,
        tx: mpsc::UnboundedSender<AgentEvent>,
    ) -> anyhow::Result<()> {
        self.run(vec![Message::user(text)], CancellationToken::new(), tx).await
    }

    /// Start a run with an optional initial message list and an external
    /// cancellation handle.  `cancel` propagates to the provider stream and
    /// to the currently executing tool; `abort()` it from any thread.
    ///
    /// Exactly one `AgentEnd` is emitted per run, on every outcome.
    pub async fn run(
        &mut self,
        initial: Vec<Message>,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<AgentEvent>,
    ) -> anyhow::Result<()> {
        if self.state.is_streaming {
            bail!("a run is already active on this agent");
        }
        let sink = EventSink { subscribers: self.subscribers.clone(), tx };
        self.state.is_streaming = true;
        self.state.last_error = None;
        sink.emit(AgentEvent::AgentStart);

        let outcome = self.run_loop(initial, &cancel, &sink).await;

        self.state.finish_run();
        sink.emit(AgentEvent::AgentEnd { messages: self.state.messages.clone() });
        outcome
    }

    /// The state machine: PrepareTurn → Stream → ToolPhase → CheckSteering →
    /// CheckStop, looping until a stop condition or a terminal failure.
    async fn run_loop(
        &mut self,
        initial: Vec<Message>,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> anyhow::Result<()> {
        let mut pending: Vec<Message> = initial;
        loop {
            sink.emit(AgentEvent::TurnStart);

            // PrepareTurn: inject queued/initial messages as entries.
            for message in std::mem::take(&mut pending) {
                self.push_message(message.clone())?;
                sink.emit(AgentEvent::MessageStart { message: message.clone() });
                sink.emit(AgentEvent::MessageEnd { message });
            }

            // In-line compaction before the stream opens.
            if needs_compaction(
                &self.state.messages,
                self.provider.model().context_window,
                &self.config.compaction,
            ) {
                match self.run_compaction(cancel).await {
                    Ok(()) => {}
                    Err(CompactionError::Aborted) => {
                        sink.emit(AgentEvent::TurnEnd);
                        return Ok(());
                    }
                    Err(CompactionError::Failed(e)) => {
                        self.synthesize_error_message(&e, sink)?;
                        sink.emit(AgentEvent::TurnEnd);
                        return Ok(());
                    }
                }
            }

            // Context transform, then LLM conversion.
            let mut context = self.state.messages.clone();
            if let Some(transform) = self.hooks.transform_context.clone() {
                let transformed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        sink.emit(AgentEvent::TurnEnd);
                        return Ok(());
                    }
                    result = transform(context, cancel.clone()) => result,
                };
                context = match transformed {
                    Ok(messages) => messages,
                    Err(e) => {
                        self.synthesize_error_message(&format!("context transform failed: {e}"), sink)?;
                        sink.emit(AgentEvent::TurnEnd);
                        return Ok(());
                    }
                };
            }
            let llm_messages = match &self.hooks.convert_to_llm {
                Some(convert) => convert(&context),
                None => default_convert_to_llm(&context),
            };

            // Stream.
            let assistant = match self.stream_turn(llm_messages, cancel, sink).await? {
                TurnOutcome::Completed(message) => message,
                TurnOutcome::Errored | TurnOutcome::Aborted => {
                    sink.emit(AgentEvent::TurnEnd);
                    return Ok(());
                }
                TurnOutcome::Fatal(error) => {
                    self.synthesize_error_message(&error, sink)?;
                    sink.emit(AgentEvent::TurnEnd);
                    return Ok(());
                }
            };

            // ToolPhase: strictly sequential, in declaration order.
            let calls: Vec<ToolCall> = assistant.tool_calls().into_iter().cloned().collect();
            let mut executed = 0usize;
            let mut skip_from: Option<usize> = None;
            for (i, call) in calls.iter().enumerate() {
                pending = self.drain_steering();
                if !pending.is_empty() {
                    skip_from = Some(i);
                    break;
                }
                self.state.pending_tool_calls.insert(call.id.clone());
                let result = self
                    .executor
                    .execute_call(call, cancel.clone(), tool_event_forwarder(sink))
                    .await;
                self.state.pending_tool_calls.remove(&call.id);
                executed += 1;
                self.push_message(Message::ToolResult(result.clone()))?;
                let message = Message::ToolResult(result);
                sink.emit(AgentEvent::MessageStart { message: message.clone() });
                sink.emit(AgentEvent::MessageEnd { message });

                if cancel.is_cancelled() {
                    sink.emit(AgentEvent::TurnEnd);
                    return Ok(());
                }
            }
            if let Some(from) = skip_from {
                for skipped in &calls[from..] {
                    let result = ToolResultMessage::text(
                        &skipped.id,
                        &skipped.name,
                        SKIPPED_TOOL_CALL_TEXT,
                        false,
                    );
                    self.push_message(Message::ToolResult(result.clone()))?;
                    let message = Message::ToolResult(result);
                    sink.emit(AgentEvent::MessageStart { message: message.clone() });
                    sink.emit(AgentEvent::MessageEnd { message });
                }
            }

            // CheckSteering: injections open the next turn.
            if pending.is_empty() {
                pending = self.drain_steering();
            }
            if !pending.is_empty() {
                sink.emit(AgentEvent::TurnEnd);
                continue;
            }

            // CheckStop.
            if assistant.stop_reason == StopReason::ToolUse && calls.is_empty() {
                warn!("assistant stopped with tool_use but no tool calls; treating as normal stop");
            }
            if assistant.stop_reason == StopReason::ToolUse && executed > 0 {
                sink.emit(AgentEvent::TurnEnd);
                continue;
            }
            pending = self.drain_follow_up();
            if !pending.is_empty() {
                sink.emit(AgentEvent::TurnEnd);
                continue;
            }
            sink.emit(AgentEvent::TurnEnd);
            return Ok(());
        }
    }

    /// Open the provider stream (with retry/backoff) and assemble the reply.
    async fn stream_turn(
        &mut self,
        llm_messages: Vec<Message>,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> anyhow::Result<TurnOutcome> {
        let model = self.provider.model().clone();
        if self.state.thinking_level == ThinkingLevel::Xhigh && !model.supports_xhigh {
            return Ok(TurnOutcome::Fatal(format!(
                "model {} does not support thinking level xhigh",
                model.id
            )));
        }
        let tools = self.executor.registry().schemas();
        let cap = self.config.max_retry_delay_ms;
        let mut backoff_ms: u64 = 2_000;

        'attempt: loop {
            // Re-resolve the API key on every attempt: OAuth tokens are
            // short-lived.
            let api_key = match &self.hooks.get_api_key {
                Some(resolve) => resolve(&model.provider).await,
                None => None,
            };
            let request = StreamRequest {
                system_prompt: self.state.system_prompt.clone(),
                messages: llm_messages.clone(),
                tools: tools.clone(),
                options: StreamOptions {
                    api_key,
                    session_id: self.session.as_ref().map(|s| s.id().to_string()),
                    max_retry_delay_ms: Some(cap),
                    reasoning: self.state.thinking_level,
                    ..Default::default()
                },
            };

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TurnOutcome::Aborted),
                opened = self.provider.stream(request) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => match self.classify_failure(e, &mut backoff_ms, cancel).await {
                    RetryDecision::Retry => continue 'attempt,
                    RetryDecision::Fatal(msg) => return Ok(TurnOutcome::Fatal(msg)),
                    RetryDecision::Aborted => return Ok(TurnOutcome::Aborted),
                },
            };

            let mut assembler =
                MessageAssembler::new(self.provider.name(), self.provider.api(), &model.id);
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.commit_aborted_partial(assembler, sink)?;
                        return Ok(TurnOutcome::Aborted);
                    }
                    item = stream.next() => item,
                };
                let event = match item {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        self.discard_failed_attempt(&mut assembler, sink, &e.to_string());
                        match self.classify_failure(e, &mut backoff_ms, cancel).await {
                            RetryDecision::Retry => continue 'attempt,
                            RetryDecision::Fatal(msg) => return Ok(TurnOutcome::Fatal(msg)),
                            RetryDecision::Aborted => return Ok(TurnOutcome::Aborted),
                        }
                    }
                    None => {
                        let e = ModelError::transport("stream ended before a terminal event");
                        self.discard_failed_attempt(&mut assembler, sink, &e.to_string());
                        match self.classify_failure(e, &mut backoff_ms, cancel).await {
                            RetryDecision::Retry => continue 'attempt,
                            RetryDecision::Fatal(msg) => return Ok(TurnOutcome::Fatal(msg)),
                            RetryDecision::Aborted => return Ok(TurnOutcome::Aborted),
                        }
                    }
                };

                match assembler.apply(event) {
                    Err(e) => {
                        // Malformed provider event: record once, abort the run.
                        self.discard_failed_attempt(&mut assembler, sink, &e.to_string());
                        return Ok(TurnOutcome::Fatal(e.to_string()));
                    }
                    Ok(AssemblyEvent::Start { partial }) => {
                        self.state.stream_message = Some(partial.clone());
                        sink.emit(AgentEvent::MessageStart {
                            message: Message::Assistant(partial),
                        });
                    }
                    Ok(AssemblyEvent::Done { message }) => {
                        self.state.stream_message = None;
                        self.push_message(Message::Assistant(message.clone()))?;
                        sink.emit(AgentEvent::MessageEnd {
                            message: Message::Assistant(message.clone()),
                        });
                        return Ok(TurnOutcome::Completed(message));
                    }
                    Ok(AssemblyEvent::Error { message }) => {
                        self.state.stream_message = None;
                        self.state.last_error = Some(
                            message
                                .error_message
                                .clone()
                                .unwrap_or_else(|| "provider error".into()),
                        );
                        self.push_message(Message::Assistant(message.clone()))?;
                        sink.emit(AgentEvent::MessageEnd {
                            message: Message::Assistant(message),
                        });
                        return Ok(TurnOutcome::Errored);
                    }
                    Ok(progress) => {
                        if let Some(partial) = assembly_partial(&progress) {
                            self.state.stream_message = Some(partial.clone());
                            sink.emit(AgentEvent::MessageUpdate {
                                message: Message::Assistant(partial),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Transport errors retry with exponential backoff (base 2 s) up to the
    /// configured cap; a server-requested wait beyond the cap fails the run
    /// without sleeping.  Everything else is fatal or an abort.
    async fn classify_failure(
        &self,
        error: ModelError,
        backoff_ms: &mut u64,
        cancel: &CancellationToken,
    ) -> RetryDecision {
        match error {
            ModelError::Transport { message, retry_after_ms } => {
                let cap = self.config.max_retry_delay_ms;
                let wait = retry_after_ms.unwrap_or(*backoff_ms);
                if cap != 0 && wait > cap {
                    return RetryDecision::Fatal(format!(
                        "transport error: {message} (server requested a {wait} ms wait, \
                         exceeding the {cap} ms retry cap)"
                    ));
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => RetryDecision::Aborted,
                    _ = tokio::time::sleep(Duration::from_millis(wait)) => {
                        *backoff_ms *= 2;
                        if cap != 0 {
                            *backoff_ms = (*backoff_ms).min(cap);
                        }
                        RetryDecision::Retry
                    }
                }
            }
            ModelError::Aborted => RetryDecision::Aborted,
            other => RetryDecision::Fatal(other.to_string()),
        }
    }

    /// A streaming attempt failed after `message_start` may have been
    /// emitted: close the event pair with an error-marked snapshot and drop
    /// the partial (it is not committed).
    fn discard_failed_attempt(
        &mut self,
        assembler: &mut MessageAssembler,
        sink: &EventSink,
        error: &str,
    ) {
        self.state.stream_message = None;
        let replaced = std::mem::replace(
            assembler,
            MessageAssembler::new(self.provider.name(), self.provider.api(), &self.provider.model().id),
        );
        if let Some(mut partial) = replaced.into_partial() {
            partial.stop_reason = StopReason::Error;
            partial.error_message = Some(error.to_string());
            sink.emit(AgentEvent::MessageEnd { message: Message::Assistant(partial) });
        }
    }

    /// Cancellation mid-stream: persist the partial iff it has at least one
    /// non-empty block, and close the event pair either way.
    fn commit_aborted_partial(
        &mut self,
        assembler: MessageAssembler,
        sink: &EventSink,
    ) -> anyhow::Result<()> {
        self.state.stream_message = None;
        if let Some(mut partial) = assembler.into_partial() {
            partial.stop_reason = StopReason::Aborted;
            partial.error_message = Some("Aborted".into());
            if partial.has_committable_content() {
                self.push_message(Message::Assistant(partial.clone()))?;
            }
            sink.emit(AgentEvent::MessageEnd { message: Message::Assistant(partial) });
        }
        Ok(())
    }

    /// Fatal failure: synthesize an empty assistant message carrying the
    /// error, per the run-level failure contract.
    fn synthesize_error_message(&mut self, error: &str, sink: &EventSink) -> anyhow::Result<()> {
        let mut message =
            AssistantMessage::empty(self.provider.name(), self.provider.api(), &self.provider.model().id);
        message.stop_reason = StopReason::Error;
        message.error_message = Some(error.to_string());
        self.state.last_error = Some(error.to_string());
        self.push_message(Message::Assistant(message.clone()))?;
        let message = Message::Assistant(message);
        sink.emit(AgentEvent::MessageStart { message: message.clone() });
        sink.emit(AgentEvent::MessageEnd { message });
        Ok(())
    }

    async fn run_compaction(&mut self, cancel: &CancellationToken) -> Result<(), CompactionError> {
        let previous = self.last_compaction.clone();
        let (previous_summary, previous_details) = match &previous {
            Some((summary, details)) => (Some(summary.as_str()), details.clone()),
            None => (None, Default::default()),
        };
        let Some(result) = compact_messages(
            &self.provider,
            &self.state.messages,
            previous_summary,
            &previous_details,
            &self.config.compaction,
            cancel,
        )
        .await?
        else {
            return Ok(());
        };

        if let Some(store) = &mut self.session {
            let first_kept_entry_id = resolve_first_kept_entry_id(
                store,
                &self.entry_ids,
                result.first_kept_index,
            );
            store
                .append(EntryPayload::Compaction {
                    summary: result.summary.clone(),
                    first_kept_entry_id,
                    tokens_before: result.tokens_before,
                    details: result.details.clone(),
                })
                .map_err(|e| CompactionError::Failed(e.to_string()))?;
        }

        let kept_messages = self.state.messages.split_off(result.first_kept_index);
        let kept_ids = self.entry_ids.split_off(result.first_kept_index);
        self.state.messages = std::iter::once(Message::user(result.summary.clone()))
            .chain(kept_messages)
            .collect();
        self.entry_ids = std::iter::once(None).chain(kept_ids).collect();
        self.last_compaction = Some((result.summary, result.details));
        Ok(())
    }

    fn drain_steering(&self) -> Vec<Message> {
        let mut messages = self.steering.poll(self.config.steering_mode);
        if let Some(source) = &self.hooks.get_steering_messages {
            messages.extend(source());
        }
        messages
    }

    fn drain_follow_up(&self) -> Vec<Message> {
        let mut messages = self.follow_up.poll(self.config.follow_up_mode);
        if let Some(source) = &self.hooks.get_follow_up_messages {
            messages.extend(source());
        }
        messages
    }

    /// Append a message to the state and, when a session is attached, to the
    /// log.  A session write error fails the run.
    fn push_message(&mut self, message: Message) -> anyhow::Result<()> {
        let entry_id = match &mut self.session {
            Some(store) => {
                let payload = match &message {
                    Message::Custom(custom) => EntryPayload::CustomMessage {
                        tag: custom.tag.clone(),
                        payload: custom.payload.clone(),
                    },
                    other => EntryPayload::Message { message: other.clone() },
                };
                Some(store.append(payload).context("appending session entry")?)
            }
            None => None,
        };
        self.entry_ids.push(entry_id);
        self.state.messages.push(message);
        Ok(())
    }
}

/// Map the first-kept message index onto a session entry id, absorbing any
/// immediately preceding non-message entries (settings changes survive the
/// cut alongside the retained suffix).
fn resolve_first_kept_entry_id(
    store: &SessionStore,
    entry_ids: &[Option<String>],
    first_kept_index: usize,
) -> String {
    let first_kept = entry_ids[first_kept_index..]
        .iter()
        .find_map(|id| id.clone())
        .unwrap_or_else(|| store.current_leaf().id.clone());
    let path = store.current_path();
    let Some(mut pos) = path.iter().position(|e| e.id == first_kept) else {
        return first_kept;
    };
    while pos > 1
        && !path[pos - 1].payload.is_message()
        && !matches!(path[pos - 1].payload, EntryPayload::Session { .. })
    {
        pos -= 1;
    }
    path[pos].id.clone()
}

fn tool_event_forwarder(sink: &EventSink) -> ToolEventFn {
    let sink = sink.clone();
    Arc::new(move |event: ToolExecutionEvent| {
        let mapped = match event {
            ToolExecutionEvent::Start { tool_call_id, tool_name, args } => {
                AgentEvent::ToolExecutionStart { tool_call_id, tool_name, args }
            }
            ToolExecutionEvent::Update { tool_call_id, tool_name, content, details } => {
                AgentEvent::ToolExecutionUpdate { tool_call_id, tool_name, content, details }
            }
            ToolExecutionEvent::End { tool_call_id, tool_name, result, is_error } => {
                AgentEvent::ToolExecutionEnd { tool_call_id, tool_name, result, is_error }
            }
        };
        sink.emit(mapped);
    })
}

fn assembly_partial(event: &AssemblyEvent) -> Option<AssistantMessage> {
    match event {
        AssemblyEvent::TextStart { partial, .. }
        | AssemblyEvent::TextDelta { partial, .. }
        | AssemblyEvent::TextEnd { partial, .. }
        | AssemblyEvent::ThinkingStart { partial, .. }
        | AssemblyEvent::ThinkingDelta { partial, .. }
        | AssemblyEvent::ThinkingEnd { partial, .. }
        | AssemblyEvent::ToolCallStart { partial, .. }
        | AssemblyEvent::ToolCallDelta { partial, .. }
        | AssemblyEvent::ToolCallEnd { partial, .. } => Some(partial.clone()),
        AssemblyEvent::Start { .. } | AssemblyEvent::Done { .. } | AssemblyEvent::Error { .. } => {
            None
        }
    }
}
