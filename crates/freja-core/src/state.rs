// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;

use freja_config::ThinkingLevel;
use freja_model::{AssistantMessage, Message};

/// In-memory agent state.  Mutated only by the agent loop during a run, or
/// by the idle-time setters on [`crate::Agent`].
#[derive(Debug, Default)]
pub struct AgentState {
    pub system_prompt: String,
    pub thinking_level: ThinkingLevel,
    /// Conversation history, derived from the session path when a session
    /// store is attached.
    pub messages: Vec<Message>,
    /// True iff a run is in flight.
    pub is_streaming: bool,
    /// The assistant message currently being assembled, if any.
    pub stream_message: Option<AssistantMessage>,
    /// Ids of tool calls currently executing.  Non-empty only while
    /// `is_streaming` is true.
    pub pending_tool_calls: HashSet<String>,
    /// Error string from the last failed run; cleared when a run succeeds.
    pub last_error: Option<String>,
}

impl AgentState {
    /// Reset the per-run flags at the end of a run.
    pub(crate) fn finish_run(&mut self) {
        self.is_streaming = false;
        self.stream_message = None;
        self.pending_tool_calls.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
