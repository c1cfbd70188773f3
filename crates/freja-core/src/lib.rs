// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod assembler;
mod compact;
mod events;
mod queue;
mod state;

pub use agent::{
    default_convert_to_llm, Agent, AgentHooks, ConvertToLlmFn, EventHandler, GetApiKeyFn,
    MessageSourceFn, SubscriptionId, TransformContextFn, SKIPPED_TOOL_CALL_TEXT,
};
pub use assembler::{AssemblyEvent, MessageAssembler};
pub use compact::{
    compact_messages, estimate_context_tokens, needs_compaction, select_cut_point,
    CompactionError, CompactionResult, CutPoint,
};
pub use events::AgentEvent;
pub use queue::MessageQueue;
pub use state::AgentState;
