// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming event reassembly: provider deltas in, a growing assistant
//! message out.
//!
//! The partial message's `content` array is dense — slot *i* is created by a
//! `*_start` event before slot *i + 1* exists — slot types never change
//! after creation, and signatures attach only at `*_end`.  Violations are
//! protocol errors.  Every emitted event carries a cloned snapshot of the
//! partial message, so consumers never alias the loop's live state.

use std::collections::HashMap;

use freja_model::{
    parse_streaming_json, AssistantMessage, ContentBlock, ModelError, StreamEvent, ToolCall,
};

/// Typed events produced while reassembling one assistant message.
#[derive(Debug, Clone)]
pub enum AssemblyEvent {
    Start { partial: AssistantMessage },
    TextStart { content_index: usize, partial: AssistantMessage },
    TextDelta { content_index: usize, delta: String, partial: AssistantMessage },
    TextEnd { content_index: usize, partial: AssistantMessage },
    ThinkingStart { content_index: usize, partial: AssistantMessage },
    ThinkingDelta { content_index: usize, delta: String, partial: AssistantMessage },
    ThinkingEnd { content_index: usize, partial: AssistantMessage },
    ToolCallStart { content_index: usize, partial: AssistantMessage },
    ToolCallDelta { content_index: usize, partial: AssistantMessage },
    ToolCallEnd { content_index: usize, partial: AssistantMessage },
    /// Terminal: stop reason and usage are final.
    Done { message: AssistantMessage },
    /// Terminal: the provider reported an in-stream failure.
    Error { message: AssistantMessage },
}

/// Translates the provider's low-level delta stream into [`AssemblyEvent`]s
/// while maintaining the partial assistant message.
pub struct MessageAssembler {
    message: AssistantMessage,
    /// Raw JSON buffers for tool-call slots still streaming.
    partial_json: HashMap<usize, String>,
    started: bool,
    closed: bool,
}

impl MessageAssembler {
    pub fn new(provider: &str, api: &str, model: &str) -> Self {
        Self {
            message: AssistantMessage::empty(provider, api, model),
            partial_json: HashMap::new(),
            started: false,
            closed: false,
        }
    }

    /// Whether the provider has acknowledged the request (`Start` seen).
    pub fn started(&self) -> bool {
        self.started
    }

    /// The partial message, if streaming has begun.
    pub fn partial(&self) -> Option<&AssistantMessage> {
        self.started.then_some(&self.message)
    }

    /// Consume the assembler, yielding the partial message when one exists.
    pub fn into_partial(self) -> Option<AssistantMessage> {
        self.started.then_some(self.message)
    }

    /// Apply one provider event.
    pub fn apply(&mut self, event: StreamEvent) -> Result<AssemblyEvent, ModelError> {
        if self.closed {
            return Err(ModelError::Protocol("event after terminal stream event".into()));
        }
        if !self.started && !matches!(event, StreamEvent::Start) {
            return Err(ModelError::Protocol(format!(
                "stream event before start: {event:?}"
            )));
        }
        match event {
            StreamEvent::Start => {
                if self.started {
                    return Err(ModelError::Protocol("duplicate start event".into()));
                }
                self.started = true;
                Ok(AssemblyEvent::Start { partial: self.message.clone() })
            }

            StreamEvent::TextStart { content_index } => {
                self.open_slot(content_index, ContentBlock::text(""))?;
                Ok(AssemblyEvent::TextStart { content_index, partial: self.message.clone() })
            }
            StreamEvent::TextDelta { content_index, delta } => {
                match self.slot_mut(content_index)? {
                    ContentBlock::Text { text, .. } => text.push_str(&delta),
                    other => return Err(type_mismatch(content_index, "text", other)),
                }
                Ok(AssemblyEvent::TextDelta {
                    content_index,
                    delta,
                    partial: self.message.clone(),
                })
            }
            StreamEvent::TextEnd { content_index, signature } => {
                match self.slot_mut(content_index)? {
                    ContentBlock::Text { signature: slot, .. } => *slot = signature,
                    other => return Err(type_mismatch(content_index, "text", other)),
                }
                Ok(AssemblyEvent::TextEnd { content_index, partial: self.message.clone() })
            }

            StreamEvent::ThinkingStart { content_index } => {
                self.open_slot(content_index, ContentBlock::thinking(""))?;
                Ok(AssemblyEvent::ThinkingStart { content_index, partial: self.message.clone() })
            }
            StreamEvent::ThinkingDelta { content_index, delta } => {
                match self.slot_mut(content_index)? {
                    ContentBlock::Thinking { thinking, .. } => thinking.push_str(&delta),
                    other => return Err(type_mismatch(content_index, "thinking", other)),
                }
                Ok(AssemblyEvent::ThinkingDelta {
                    content_index,
                    delta,
                    partial: self.message.clone(),
                })
            }
            StreamEvent::ThinkingEnd { content_index, signature } => {
                match self.slot_mut(content_index)? {
                    ContentBlock::Thinking { signature: slot, .. } => *slot = signature,
                    other => return Err(type_mismatch(content_index, "thinking", other)),
                }
                Ok(AssemblyEvent::ThinkingEnd { content_index, partial: self.message.clone() })
            }

            StreamEvent::ToolCallStart { content_index, id, name } => {
                self.open_slot(
                    content_index,
                    ContentBlock::ToolCall(ToolCall {
                        id,
                        name,
                        arguments: serde_json::Value::Object(Default::default()),
                        signature: None,
                    }),
                )?;
                self.partial_json.insert(content_index, String::new());
                Ok(AssemblyEvent::ToolCallStart { content_index, partial: self.message.clone() })
            }
            StreamEvent::ToolCallDelta { content_index, delta } => {
                let buffer = self
                    .partial_json
                    .get_mut(&content_index)
                    .ok_or_else(|| {
                        ModelError::Protocol(format!(
                            "tool-call delta for unopened slot {content_index}"
                        ))
                    })?;
                buffer.push_str(&delta);
                let arguments = parse_streaming_json(buffer);
                match self.slot_mut(content_index)? {
                    ContentBlock::ToolCall(tc) => tc.arguments = arguments,
                    other => return Err(type_mismatch(content_index, "tool_call", other)),
                }
                Ok(AssemblyEvent::ToolCallDelta { content_index, partial: self.message.clone() })
            }
            StreamEvent::ToolCallEnd { content_index } => {
                let buffer = self.partial_json.remove(&content_index).ok_or_else(|| {
                    ModelError::Protocol(format!("tool-call end for unopened slot {content_index}"))
                })?;
                let arguments = parse_streaming_json(&buffer);
                match self.slot_mut(content_index)? {
                    ContentBlock::ToolCall(tc) => tc.arguments = arguments,
                    other => return Err(type_mismatch(content_index, "tool_call", other)),
                }
                Ok(AssemblyEvent::ToolCallEnd { content_index, partial: self.message.clone() })
            }

            StreamEvent::Done { reason, usage } => {
                self.closed = true;
                self.message.stop_reason = reason;
                self.message.usage = usage;
                Ok(AssemblyEvent::Done { message: self.message.clone() })
            }
            StreamEvent::Error { reason, error_message, usage } => {
                self.closed = true;
                self.message.stop_reason = reason;
                self.message.error_message = Some(error_message);
                self.message.usage = usage;
                Ok(AssemblyEvent::Error { message: self.message.clone() })
            }
        }
    }

    /// Create slot `index`, enforcing the dense-array invariant.
    fn open_slot(&mut self, index: usize, block: ContentBlock) -> Result<(), ModelError> {
        if index != self.message.content.len() {
            return Err(ModelError::Protocol(format!(
                "content slot {index} opened out of order (next expected {})",
                self.message.content.len()
            )));
        }
        self.message.content.push(block);
        Ok(())
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut ContentBlock, ModelError> {
        let len = self.message.content.len();
        self.message
            .content
            .get_mut(index)
            .ok_or_else(|| ModelError::Protocol(format!("content slot {index} missing (len {len})")))
    }
}

fn type_mismatch(index: usize, expected: &str, got: &ContentBlock) -> ModelError {
    let got = match got {
        ContentBlock::Text { .. } => "text",
        ContentBlock::Thinking { .. } => "thinking",
        ContentBlock::Image { .. } => "image",
        ContentBlock::ToolCall(_) => "tool_call",
    };
    ModelError::Protocol(format!("content slot {index} is {got}, expected {expected}"))
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use freja_model::{StopReason, Usage};
    use serde_json::json;

    use super::*;

    fn assembler() -> MessageAssembler {
        MessageAssembler::new("mock", "mock-api", "mock-model")
    }

    fn apply_all(a: &mut MessageAssembler, events: Vec<StreamEvent>) -> AssemblyEvent {
        let mut last = None;
        for ev in events {
            last = Some(a.apply(ev).unwrap());
        }
        last.unwrap()
    }

    // ── Text assembly ─────────────────────────────────────────────────────────

    #[test]
    fn text_deltas_accumulate_in_slot() {
        let mut a = assembler();
        let last = apply_all(
            &mut a,
            vec![
                StreamEvent::Start,
                StreamEvent::TextStart { content_index: 0 },
                StreamEvent::TextDelta { content_index: 0, delta: "hel".into() },
                StreamEvent::TextDelta { content_index: 0, delta: "lo".into() },
                StreamEvent::TextEnd { content_index: 0, signature: Some("sig".into()) },
            ],
        );
        match last {
            AssemblyEvent::TextEnd { partial, .. } => match &partial.content[0] {
                ContentBlock::Text { text, signature } => {
                    assert_eq!(text, "hello");
                    assert_eq!(signature.as_deref(), Some("sig"));
                }
                other => panic!("wrong block: {other:?}"),
            },
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn signature_attaches_only_at_end() {
        let mut a = assembler();
        a.apply(StreamEvent::Start).unwrap();
        a.apply(StreamEvent::TextStart { content_index: 0 }).unwrap();
        a.apply(StreamEvent::TextDelta { content_index: 0, delta: "x".into() }).unwrap();
        match &a.partial().unwrap().content[0] {
            ContentBlock::Text { signature, .. } => assert!(signature.is_none()),
            other => panic!("wrong block: {other:?}"),
        }
    }

    // ── Thinking assembly ─────────────────────────────────────────────────────

    #[test]
    fn thinking_slot_grows_independently() {
        let mut a = assembler();
        let last = apply_all(
            &mut a,
            vec![
                StreamEvent::Start,
                StreamEvent::ThinkingStart { content_index: 0 },
                StreamEvent::ThinkingDelta { content_index: 0, delta: "because".into() },
                StreamEvent::ThinkingEnd { content_index: 0, signature: None },
                StreamEvent::TextStart { content_index: 1 },
                StreamEvent::TextDelta { content_index: 1, delta: "answer".into() },
            ],
        );
        match last {
            AssemblyEvent::TextDelta { partial, .. } => {
                assert_eq!(partial.content.len(), 2);
                assert!(matches!(partial.content[0], ContentBlock::Thinking { .. }));
                assert!(matches!(partial.content[1], ContentBlock::Text { .. }));
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    // ── Tool-call assembly ────────────────────────────────────────────────────

    #[test]
    fn tool_call_arguments_reparse_after_each_delta() {
        let mut a = assembler();
        a.apply(StreamEvent::Start).unwrap();
        a.apply(StreamEvent::ToolCallStart {
            content_index: 0,
            id: "tc1".into(),
            name: "calc".into(),
        })
        .unwrap();

        a.apply(StreamEvent::ToolCallDelta { content_index: 0, delta: r#"{"a":1,"#.into() })
            .unwrap();
        assert_eq!(tool_args(&a), json!({"a": 1}));

        a.apply(StreamEvent::ToolCallDelta { content_index: 0, delta: r#""b":"hel"#.into() })
            .unwrap();
        assert_eq!(tool_args(&a), json!({"a": 1, "b": "hel"}));

        a.apply(StreamEvent::ToolCallDelta { content_index: 0, delta: r#"lo"}"#.into() })
            .unwrap();
        assert_eq!(tool_args(&a), json!({"a": 1, "b": "hello"}));

        a.apply(StreamEvent::ToolCallEnd { content_index: 0 }).unwrap();
        assert_eq!(tool_args(&a), json!({"a": 1, "b": "hello"}));
    }

    fn tool_args(a: &MessageAssembler) -> serde_json::Value {
        match &a.partial().unwrap().content[0] {
            ContentBlock::ToolCall(tc) => tc.arguments.clone(),
            other => panic!("wrong block: {other:?}"),
        }
    }

    #[test]
    fn unparsable_arguments_never_error() {
        let mut a = assembler();
        a.apply(StreamEvent::Start).unwrap();
        a.apply(StreamEvent::ToolCallStart { content_index: 0, id: "t".into(), name: "n".into() })
            .unwrap();
        a.apply(StreamEvent::ToolCallDelta { content_index: 0, delta: "}{not json".into() })
            .unwrap();
        assert_eq!(tool_args(&a), json!({}));
    }

    // ── Terminal events ───────────────────────────────────────────────────────

    #[test]
    fn done_sets_stop_reason_and_usage() {
        let mut a = assembler();
        a.apply(StreamEvent::Start).unwrap();
        let done = a
            .apply(StreamEvent::Done {
                reason: StopReason::ToolUse,
                usage: Usage { input_tokens: 7, output_tokens: 3, ..Default::default() },
            })
            .unwrap();
        match done {
            AssemblyEvent::Done { message } => {
                assert_eq!(message.stop_reason, StopReason::ToolUse);
                assert_eq!(message.usage.input_tokens, 7);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn error_event_records_message_and_reason() {
        let mut a = assembler();
        a.apply(StreamEvent::Start).unwrap();
        let ev = a
            .apply(StreamEvent::Error {
                reason: StopReason::Aborted,
                error_message: "cancelled upstream".into(),
                usage: Usage::default(),
            })
            .unwrap();
        match ev {
            AssemblyEvent::Error { message } => {
                assert_eq!(message.stop_reason, StopReason::Aborted);
                assert_eq!(message.error_message.as_deref(), Some("cancelled upstream"));
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn events_after_terminal_are_protocol_errors() {
        let mut a = assembler();
        a.apply(StreamEvent::Start).unwrap();
        a.apply(StreamEvent::Done { reason: StopReason::Stop, usage: Usage::default() }).unwrap();
        let err = a.apply(StreamEvent::TextStart { content_index: 0 }).unwrap_err();
        assert!(matches!(err, ModelError::Protocol(_)));
    }

    // ── Dense-slot invariants ─────────────────────────────────────────────────

    #[test]
    fn slots_must_open_densely() {
        let mut a = assembler();
        a.apply(StreamEvent::Start).unwrap();
        let err = a.apply(StreamEvent::TextStart { content_index: 1 }).unwrap_err();
        assert!(matches!(err, ModelError::Protocol(_)));
    }

    #[test]
    fn slot_types_never_change() {
        let mut a = assembler();
        a.apply(StreamEvent::Start).unwrap();
        a.apply(StreamEvent::TextStart { content_index: 0 }).unwrap();
        let err = a
            .apply(StreamEvent::ThinkingDelta { content_index: 0, delta: "x".into() })
            .unwrap_err();
        assert!(matches!(err, ModelError::Protocol(_)));
    }

    #[test]
    fn delta_for_missing_slot_is_protocol_error() {
        let mut a = assembler();
        a.apply(StreamEvent::Start).unwrap();
        let err = a
            .apply(StreamEvent::TextDelta { content_index: 0, delta: "x".into() })
            .unwrap_err();
        assert!(matches!(err, ModelError::Protocol(_)));
    }

    #[test]
    fn content_event_before_start_is_protocol_error() {
        let mut a = assembler();
        let err = a.apply(StreamEvent::TextStart { content_index: 0 }).unwrap_err();
        assert!(matches!(err, ModelError::Protocol(_)));
    }

    #[test]
    fn into_partial_none_before_start() {
        assert!(assembler().into_partial().is_none());
        let mut a = assembler();
        a.apply(StreamEvent::Start).unwrap();
        assert!(a.into_partial().is_some());
    }
}
