// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque identifier assigned by the provider (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.  While streaming this is the best-effort parse
    /// of the accumulated deltas; after `tool_call_end` it is final.
    pub arguments: Value,
    /// Provider signature attached to the block, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// One ordered block inside a message.
///
/// User content carries `Text`/`Image` blocks, assistant content carries
/// `Text`/`Thinking`/`ToolCall` blocks, tool results carry `Text`/`Image`
/// blocks.  The variants are shared so the reassembler and the session log
/// can treat content uniformly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(default)]
        redacted: bool,
    },
    Image {
        /// Base64-encoded bytes, kept opaque by the core.
        data: String,
        mime_type: String,
    },
    ToolCall(ToolCall),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into(), signature: None }
    }

    pub fn thinking(thinking: impl Into<String>) -> Self {
        Self::Thinking { thinking: thinking.into(), signature: None, redacted: false }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image { data: data.into(), mime_type: mime_type.into() }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCall(ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
            signature: None,
        })
    }

    pub fn as_tool_call(&self) -> Option<&ToolCall> {
        match self {
            Self::ToolCall(tc) => Some(tc),
            _ => None,
        }
    }

    /// Whether the block carries any content worth persisting.  Used by the
    /// abort path to decide if a partial assistant message is committed.
    pub fn is_non_empty(&self) -> bool {
        match self {
            Self::Text { text, .. } => !text.trim().is_empty(),
            Self::Thinking { thinking, .. } => !thinking.trim().is_empty(),
            Self::Image { data, .. } => !data.is_empty(),
            Self::ToolCall(tc) => !tc.name.is_empty(),
        }
    }

    /// Estimated token contribution of this block: ceil(chars / 4) for text,
    /// a flat 1 200 tokens for images.
    pub fn estimate_tokens(&self) -> u64 {
        match self {
            Self::Text { text, .. } => chars_to_tokens(text.len()),
            Self::Thinking { thinking, .. } => chars_to_tokens(thinking.len()),
            Self::Image { .. } => 1_200,
            Self::ToolCall(tc) => {
                chars_to_tokens(tc.name.len() + tc.arguments.to_string().len())
            }
        }
    }
}

fn chars_to_tokens(chars: usize) -> u64 {
    (chars as u64).div_ceil(4)
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    Stop,
    MaxTokens,
    ToolUse,
    Error,
    Aborted,
}

/// Token usage reported by the provider for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Tokens served from the provider's prompt cache (read hit).
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// Tokens written into the provider's prompt cache.
    #[serde(default)]
    pub cache_write_tokens: u64,
    /// Total context tokens the provider billed for the request.
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    /// Ordered text/image blocks.
    pub content: Vec<ContentBlock>,
    /// Unix millis.
    pub timestamp: i64,
}

impl UserMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    /// Ordered text/thinking/tool-call blocks.
    pub content: Vec<ContentBlock>,
    /// Wire API family the reply was produced with (e.g. "messages").
    pub api: String,
    pub provider: String,
    pub model: String,
    pub stop_reason: StopReason,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: i64,
}

impl AssistantMessage {
    /// Empty message carrying only model metadata; the reassembler grows it.
    pub fn empty(provider: impl Into<String>, api: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: Vec::new(),
            api: api.into(),
            provider: provider.into(),
            model: model.into(),
            stop_reason: StopReason::Stop,
            usage: Usage::default(),
            error_message: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Tool-call blocks in declaration order.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content.iter().filter_map(ContentBlock::as_tool_call).collect()
    }

    /// True when at least one block passes the non-empty test of the abort
    /// commit rule.
    pub fn has_committable_content(&self) -> bool {
        self.content.iter().any(ContentBlock::is_non_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    /// Matches the `id` of a tool-call block in a preceding assistant message.
    pub tool_call_id: String,
    pub tool_name: String,
    /// Ordered text/image blocks shown to the LLM.
    pub content: Vec<ContentBlock>,
    /// Structured host-only metadata; never shown to the model.
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub is_error: bool,
    pub timestamp: i64,
}

impl ToolResultMessage {
    pub fn text(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: vec![ContentBlock::text(text)],
            details: Value::Null,
            is_error,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Application-defined entry, invisible to the LLM unless the host's
/// message converter maps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMessage {
    pub tag: String,
    pub payload: Value,
    pub timestamp: i64,
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
    Custom(CustomMessage),
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserMessage::text(text))
    }

    pub fn custom(tag: impl Into<String>, payload: Value) -> Self {
        Self::Custom(CustomMessage {
            tag: tag.into(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Assistant(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            Self::User(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResultMessage> {
        match self {
            Self::ToolResult(m) => Some(m),
            _ => None,
        }
    }

    /// Plain text of the message when it consists of exactly one text block.
    pub fn as_text(&self) -> Option<&str> {
        let content = match self {
            Self::User(m) => &m.content,
            Self::Assistant(m) => &m.content,
            Self::ToolResult(m) => &m.content,
            Self::Custom(_) => return None,
        };
        match content.as_slice() {
            [ContentBlock::Text { text, .. }] => Some(text),
            _ => None,
        }
    }

    /// Estimated token footprint used by the compaction engine: per-block
    /// ceil(chars / 4), images a flat 1 200.
    pub fn estimate_tokens(&self) -> u64 {
        match self {
            Self::User(m) => m.content.iter().map(ContentBlock::estimate_tokens).sum(),
            Self::Assistant(m) => m.content.iter().map(ContentBlock::estimate_tokens).sum(),
            Self::ToolResult(m) => m.content.iter().map(ContentBlock::estimate_tokens).sum(),
            Self::Custom(m) => chars_to_tokens(m.payload.to_string().len()),
        }
    }
}

// ─── Model descriptor & tool schema ───────────────────────────────────────────

/// Static description of a model, filled in by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub provider: String,
    /// Wire API family (isolated to the provider adapter; the core treats it
    /// as an opaque label).
    pub api: String,
    pub context_window: u64,
    pub max_output_tokens: u64,
    /// Whether the model supports reasoning/thinking output.
    #[serde(default)]
    pub reasoning: bool,
    /// Whether the model accepts the `xhigh` thinking level.
    #[serde(default)]
    pub supports_xhigh: bool,
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_single_text_block() {
        let m = Message::user("hello");
        assert_eq!(m.as_text(), Some("hello"));
        assert!(m.as_user().is_some());
    }

    #[test]
    fn assistant_empty_has_no_content() {
        let a = AssistantMessage::empty("mock", "messages", "mock-model");
        assert!(a.content.is_empty());
        assert_eq!(a.stop_reason, StopReason::Stop);
        assert!(!a.has_committable_content());
    }

    #[test]
    fn tool_calls_returned_in_declaration_order() {
        let mut a = AssistantMessage::empty("p", "a", "m");
        a.content.push(ContentBlock::text("thinking out loud"));
        a.content.push(ContentBlock::tool_call("tc1", "read", json!({"path": "x"})));
        a.content.push(ContentBlock::tool_call("tc2", "bash", json!({"command": "ls"})));
        let calls = a.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "tc1");
        assert_eq!(calls[1].id, "tc2");
    }

    #[test]
    fn as_text_none_for_multi_block_content() {
        let m = Message::User(UserMessage {
            content: vec![ContentBlock::text("a"), ContentBlock::text("b")],
            timestamp: 0,
        });
        assert!(m.as_text().is_none());
    }

    #[test]
    fn as_text_none_for_custom() {
        let m = Message::custom("note", json!({"k": 1}));
        assert!(m.as_text().is_none());
    }

    // ── Non-empty test (abort commit rule) ────────────────────────────────────

    #[test]
    fn whitespace_only_text_is_empty() {
        assert!(!ContentBlock::text("  \n ").is_non_empty());
    }

    #[test]
    fn named_tool_call_is_non_empty() {
        assert!(ContentBlock::tool_call("id", "echo", json!({})).is_non_empty());
    }

    #[test]
    fn committable_content_requires_one_non_empty_block() {
        let mut a = AssistantMessage::empty("p", "a", "m");
        a.content.push(ContentBlock::text("   "));
        assert!(!a.has_committable_content());
        a.content.push(ContentBlock::thinking("hm"));
        assert!(a.has_committable_content());
    }

    // ── Token estimation ──────────────────────────────────────────────────────

    #[test]
    fn estimate_rounds_up_char_count() {
        // 9 chars → ceil(9/4) = 3
        assert_eq!(ContentBlock::text("123456789").estimate_tokens(), 3);
    }

    #[test]
    fn estimate_image_is_flat_1200() {
        assert_eq!(ContentBlock::image("QUJD", "image/png").estimate_tokens(), 1_200);
    }

    #[test]
    fn estimate_message_sums_blocks() {
        let m = Message::User(UserMessage {
            content: vec![
                ContentBlock::text("12345678"),          // 2
                ContentBlock::image("zz", "image/png"),  // 1200
            ],
            timestamp: 0,
        });
        assert_eq!(m.estimate_tokens(), 1_202);
    }

    // ── Serialisation round-trips ─────────────────────────────────────────────

    #[test]
    fn message_round_trips_through_json() {
        let original = Message::user("payload");
        let json = serde_json::to_string(&original).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn role_tag_spellings() {
        let json = serde_json::to_string(&Message::user("x")).unwrap();
        assert!(json.contains(r#""role":"user""#), "got: {json}");
        let tr = Message::ToolResult(ToolResultMessage::text("id", "echo", "out", false));
        let json = serde_json::to_string(&tr).unwrap();
        assert!(json.contains(r#""role":"tool_result""#), "got: {json}");
    }

    #[test]
    fn tool_call_block_round_trips() {
        let b = ContentBlock::tool_call("tc1", "grep", json!({"pattern": "fn "}));
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains(r#""type":"tool_call""#), "got: {json}");
        let back: ContentBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn thinking_block_defaults_redacted_false() {
        let json = r#"{"type":"thinking","thinking":"hmm"}"#;
        let b: ContentBlock = serde_json::from_str(json).unwrap();
        match b {
            ContentBlock::Thinking { redacted, .. } => assert!(!redacted),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn stop_reason_serialises_snake_case() {
        assert_eq!(serde_json::to_string(&StopReason::ToolUse).unwrap(), r#""tool_use""#);
        assert_eq!(serde_json::to_string(&StopReason::MaxTokens).unwrap(), r#""max_tokens""#);
    }
}
