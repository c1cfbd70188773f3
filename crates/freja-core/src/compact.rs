// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context compaction: token estimation, cut-point selection and summary
//! generation.
//!
//! Fires at the start of a turn when the estimated context exceeds
//! `context_window - reserve_tokens`.  Everything before the chosen cut is
//! replaced by a single structured summary produced by the same model that
//! drives the conversation.

use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use freja_config::{CompactionConfig, ThinkingLevel};
use freja_model::{
    ContentBlock, Message, ModelProvider, StopReason, StreamEvent, StreamOptions, StreamRequest,
};
use freja_session::FileOpsDetails;

// ─── Summary prompts ──────────────────────────────────────────────────────────

const SUMMARY_PROMPT: &str = "\
You are compacting an agent conversation to free context space. Produce a \
state checkpoint from the history below using EXACTLY the following Markdown \
sections — do not add or remove sections. Be information-dense: preserve \
file paths, identifiers, error messages and decisions verbatim where they \
matter.

## Goal
What the user is ultimately trying to achieve.

## Constraints
Requirements and preferences that must be preserved.

## Progress
### Done
### In Progress
### Blocked

## Key Decisions
Significant technical decisions and why they were made.

## Next Steps
The immediate follow-up actions.

## Critical Context
Facts, values and snippets the agent will need to continue correctly.";

const UPDATE_SUMMARY_PROMPT: &str = "\
You are updating an existing conversation checkpoint. Fold the new messages \
below into the previous summary WITHOUT dropping information that is still \
relevant. Keep the same Markdown sections (Goal, Constraints, Progress with \
Done/In Progress/Blocked, Key Decisions, Next Steps, Critical Context).";

const TURN_PREFIX_PROMPT: &str = "\
A conversation turn was interrupted partway. Briefly describe the original \
request and the progress made so far in the messages below, so the agent can \
finish the turn. Be concise and concrete.";

/// Tool names whose calls are treated as file reads by the rollup.
const READ_TOOLS: &[&str] = &["read", "read_file"];
/// Tool names whose calls are treated as file modifications.
const WRITE_TOOLS: &[&str] = &["write", "write_file", "create_file", "edit", "edit_file", "multi_edit"];

// ─── Public API ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("compaction aborted")]
    Aborted,
    #[error("compaction failed: {0}")]
    Failed(String),
}

/// Output of one compaction pass over an in-memory message list.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Combined summary text: history checkpoint, optional interrupted-turn
    /// section, and the file-operations rollup.
    pub summary: String,
    /// Index into the original message list of the first kept message.
    pub first_kept_index: usize,
    pub tokens_before: u64,
    pub details: FileOpsDetails,
}

/// Estimated tokens for the full context.
///
/// Prefers the provider-reported total on the most recent non-aborted
/// assistant message and adds estimates only for what came after it; falls
/// back to pure estimation when no usage has been observed yet.
pub fn estimate_context_tokens(messages: &[Message]) -> u64 {
    let anchor = messages.iter().enumerate().rev().find_map(|(i, m)| match m {
        Message::Assistant(a)
            if a.stop_reason != StopReason::Aborted && a.usage.total_tokens > 0 =>
        {
            Some((i, a.usage.total_tokens))
        }
        _ => None,
    });
    match anchor {
        Some((i, total)) => {
            total + messages[i + 1..].iter().map(Message::estimate_tokens).sum::<u64>()
        }
        None => messages.iter().map(Message::estimate_tokens).sum(),
    }
}

/// Whether the compaction threshold is crossed for this context.
pub fn needs_compaction(messages: &[Message], context_window: u64, cfg: &CompactionConfig) -> bool {
    if !cfg.enabled || context_window == 0 {
        return false;
    }
    estimate_context_tokens(messages) > context_window.saturating_sub(cfg.reserve_tokens)
}

/// The boundary chosen by cut-point selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutPoint {
    /// Index of the first message kept verbatim.
    pub first_kept: usize,
    /// When the cut falls inside a turn (the first kept message is not a
    /// user message), the index of the user message that opened that turn.
    pub turn_prefix_start: Option<usize>,
}

/// Walk from the newest message backward accumulating estimated tokens until
/// at least `keep_recent_tokens` are retained, then pick the nearest valid
/// cut at or after that point.  A tool result is never a cut: it must stay
/// adjacent to the assistant message carrying its tool call.
pub fn select_cut_point(messages: &[Message], keep_recent_tokens: u64) -> Option<CutPoint> {
    if messages.len() < 2 {
        return None;
    }
    let mut acc = 0u64;
    let mut idx = messages.len();
    while idx > 0 && acc < keep_recent_tokens {
        idx -= 1;
        acc += messages[idx].estimate_tokens();
    }
    let mut cut = idx;
    while cut < messages.len() && matches!(messages[cut], Message::ToolResult(_)) {
        cut += 1;
    }
    if cut == 0 || cut >= messages.len() {
        return None;
    }
    let turn_prefix_start = if matches!(messages[cut], Message::User(_)) {
        None
    } else {
        messages[..cut].iter().rposition(|m| matches!(m, Message::User(_)))
    };
    Some(CutPoint { first_kept: cut, turn_prefix_start })
}

/// Run a full compaction pass: pick the cut, generate the history summary
/// (and a turn-prefix summary when the cut splits a turn), roll up file
/// operations, and return the combined result.
///
/// Returns `Ok(None)` when there is nothing worth discarding.  A summary
/// generation failure is fatal to the run; the caller's state is untouched.
pub async fn compact_messages(
    provider: &Arc<dyn ModelProvider>,
    messages: &[Message],
    previous_summary: Option<&str>,
    previous_details: &FileOpsDetails,
    cfg: &CompactionConfig,
    cancel: &CancellationToken,
) -> Result<Option<CompactionResult>, CompactionError> {
    let Some(cut) = select_cut_point(messages, cfg.keep_recent_tokens) else {
        return Ok(None);
    };
    let tokens_before = estimate_context_tokens(messages);
    let discarded = &messages[..cut.first_kept];

    let history_prompt = match previous_summary {
        Some(prev) => format!(
            "{UPDATE_SUMMARY_PROMPT}\n\n## Previous Summary\n\n{prev}\n\n---\n\n{}",
            serialize_history(discarded)
        ),
        None => format!("{SUMMARY_PROMPT}\n\n---\n\n{}", serialize_history(discarded)),
    };
    let mut summary = run_summary_turn(
        provider,
        history_prompt,
        ThinkingLevel::High,
        cfg.reserve_tokens,
        cancel,
    )
    .await?;

    if let Some(turn_start) = cut.turn_prefix_start {
        let prefix = &messages[turn_start..cut.first_kept];
        let prefix_prompt = format!("{TURN_PREFIX_PROMPT}\n\n---\n\n{}", serialize_history(prefix));
        let prefix_summary = run_summary_turn(
            provider,
            prefix_prompt,
            ThinkingLevel::High,
            cfg.reserve_tokens / 2,
            cancel,
        )
        .await?;
        summary.push_str("\n\n## Interrupted Turn\n");
        summary.push_str(&prefix_summary);
    }

    let details = collect_file_ops(discarded, previous_details);
    append_file_ops(&mut summary, &details);

    Ok(Some(CompactionResult {
        summary,
        first_kept_index: cut.first_kept,
        tokens_before,
        details,
    }))
}

// ─── Private helpers ──────────────────────────────────────────────────────────

/// Single tool-free model call collecting the streamed text.
async fn run_summary_turn(
    provider: &Arc<dyn ModelProvider>,
    prompt: String,
    reasoning: ThinkingLevel,
    max_tokens: u64,
    cancel: &CancellationToken,
) -> Result<String, CompactionError> {
    let request = StreamRequest {
        system_prompt: String::new(),
        messages: vec![Message::user(prompt)],
        tools: Vec::new(),
        options: StreamOptions {
            reasoning,
            max_tokens: Some(max_tokens),
            ..Default::default()
        },
    };

    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CompactionError::Aborted),
        opened = provider.stream(request) => {
            opened.map_err(|e| CompactionError::Failed(e.to_string()))?
        }
    };

    let mut text = String::new();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CompactionError::Aborted),
            event = stream.next() => event,
        };
        match event {
            None => break,
            Some(Err(e)) => return Err(CompactionError::Failed(e.to_string())),
            Some(Ok(StreamEvent::TextDelta { delta, .. })) => text.push_str(&delta),
            Some(Ok(StreamEvent::Error { error_message, .. })) => {
                return Err(CompactionError::Failed(error_message));
            }
            Some(Ok(StreamEvent::Done { .. })) => break,
            Some(Ok(_)) => {}
        }
    }
    if text.trim().is_empty() {
        return Err(CompactionError::Failed("summary model returned no text".into()));
    }
    Ok(text)
}

/// Serialise messages into plain role-labelled text for a summary prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| match m {
            Message::User(u) => format!("User: {}", blocks_to_text(&u.content)),
            Message::Assistant(a) => format!("Assistant: {}", blocks_to_text(&a.content)),
            Message::ToolResult(t) => {
                format!("Tool ({}): {}", t.tool_name, blocks_to_text(&t.content))
            }
            Message::Custom(c) => format!("Note ({}): {}", c.tag, c.payload),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn blocks_to_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text, .. } => text.clone(),
            ContentBlock::Thinking { .. } => "[thinking]".to_string(),
            ContentBlock::Image { .. } => "[image]".to_string(),
            ContentBlock::ToolCall(tc) => format!("[tool_call: {}({})]", tc.name, tc.arguments),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Scan discarded messages for file read/write/edit tool calls and merge the
/// findings with the previous compaction's lists (ordered, de-duplicated).
fn collect_file_ops(discarded: &[Message], previous: &FileOpsDetails) -> FileOpsDetails {
    let mut details = previous.clone();
    for message in discarded {
        let Message::Assistant(a) = message else { continue };
        for call in a.tool_calls() {
            let Some(path) = call
                .arguments
                .get("path")
                .or_else(|| call.arguments.get("file_path"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            if READ_TOOLS.contains(&call.name.as_str()) {
                push_unique(&mut details.read_files, path);
            } else if WRITE_TOOLS.contains(&call.name.as_str()) {
                push_unique(&mut details.modified_files, path);
            }
        }
    }
    details
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

fn append_file_ops(summary: &mut String, details: &FileOpsDetails) {
    if details.read_files.is_empty() && details.modified_files.is_empty() {
        return;
    }
    summary.push_str("\n\n## File Operations\n");
    if !details.read_files.is_empty() {
        summary.push_str("Read: ");
        summary.push_str(&details.read_files.join(", "));
        summary.push('\n');
    }
    if !details.modified_files.is_empty() {
        summary.push_str("Modified: ");
        summary.push_str(&details.modified_files.join(", "));
        summary.push('\n');
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
