// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

use freja_model::{ContentBlock, Message, ToolResultMessage};

/// Lifecycle events emitted by the agent, in the per-run order:
///
/// ```text
/// agent_start
///   (turn_start
///      message_start message_update* message_end        [per message]
///      (tool_execution_start tool_execution_update*
///       tool_execution_end)*                            [in call order]
///    turn_end)+
/// agent_end
/// ```
///
/// Message payloads are snapshots: the partial assistant message is cloned
/// before it leaves the loop, so subscribers can hold events without racing
/// the reassembler.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    TurnStart,
    MessageStart {
        message: Message,
    },
    /// Streaming progress on the assistant message being assembled.
    MessageUpdate {
        message: Message,
    },
    MessageEnd {
        message: Message,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        content: Vec<ContentBlock>,
        details: Value,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: ToolResultMessage,
        is_error: bool,
    },
    TurnEnd,
    /// Exactly one per run, on every outcome.
    AgentEnd {
        messages: Vec<Message>,
    },
}
