// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

use freja_model::{ContentBlock, ToolResultMessage};

/// Events emitted by the executor while a single tool call runs.
/// The agent loop forwards these verbatim into its lifecycle stream.
#[derive(Debug, Clone)]
pub enum ToolExecutionEvent {
    Start {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    Update {
        tool_call_id: String,
        tool_name: String,
        content: Vec<ContentBlock>,
        details: Value,
    },
    End {
        tool_call_id: String,
        tool_name: String,
        result: ToolResultMessage,
        is_error: bool,
    },
}
