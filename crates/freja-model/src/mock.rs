// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    EventStream, Message, Model, ModelError, ModelProvider, StopReason, StreamEvent,
    StreamRequest, Usage,
};

fn mock_model() -> Model {
    Model {
        id: "scripted-mock-model".into(),
        provider: "mock".into(),
        api: "mock-api".into(),
        context_window: 128_000,
        max_output_tokens: 8_192,
        reasoning: true,
        supports_xhigh: false,
    }
}

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as a streamed assistant reply.
pub struct MockProvider {
    model: Model,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self { model: mock_model() }
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn api(&self) -> &str {
        "mock-api"
    }
    fn model(&self) -> &Model {
        &self.model
    }

    async fn stream(&self, request: StreamRequest) -> Result<EventStream, ModelError> {
        let reply = request
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::User(_) => m.as_text(),
                _ => None,
            })
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<Result<StreamEvent, ModelError>> = vec![
            Ok(StreamEvent::Start),
            Ok(StreamEvent::TextStart { content_index: 0 }),
            Ok(StreamEvent::TextDelta { content_index: 0, delta: format!("MOCK: {reply}") }),
            Ok(StreamEvent::TextEnd { content_index: 0, signature: None }),
            Ok(StreamEvent::Done {
                reason: StopReason::Stop,
                usage: Usage { input_tokens: 10, output_tokens: 10, ..Default::default() },
            }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock provider.  Each `stream` call pops the next script
/// from the front of the queue, letting tests specify exact event sequences
/// — including tool calls and mid-stream errors — without network access.
pub struct ScriptedMockProvider {
    scripts: Mutex<Vec<Vec<StreamEvent>>>,
    /// Errors returned by `stream()` itself, consumed before any script.
    /// Used to exercise the transport-retry path.
    failures: Mutex<Vec<ModelError>>,
    model: Model,
    /// The last request seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<StreamRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from an ordered list of per-call event scripts.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            failures: Mutex::new(Vec::new()),
            model: mock_model(),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Queue errors that `stream()` returns before serving any script.
    pub fn with_failures(self, failures: Vec<ModelError>) -> Self {
        *self.failures.lock().unwrap() = failures;
        self
    }

    pub fn with_context_window(mut self, context_window: u64) -> Self {
        self.model.context_window = context_window;
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// Script emitting one text block and a normal stop.
    pub fn text_script(text: impl Into<String>) -> Vec<StreamEvent> {
        vec![
            StreamEvent::Start,
            StreamEvent::TextStart { content_index: 0 },
            StreamEvent::TextDelta { content_index: 0, delta: text.into() },
            StreamEvent::TextEnd { content_index: 0, signature: None },
            StreamEvent::Done {
                reason: StopReason::Stop,
                usage: Usage { input_tokens: 5, output_tokens: 5, ..Default::default() },
            },
        ]
    }

    /// Script emitting optional leading text, then one tool call whose JSON
    /// arguments arrive as a single delta, ending with a `tool_use` stop.
    pub fn tool_call_script(
        text: Option<&str>,
        id: impl Into<String>,
        name: impl Into<String>,
        args_json: impl Into<String>,
    ) -> Vec<StreamEvent> {
        let mut events = vec![StreamEvent::Start];
        let mut index = 0usize;
        if let Some(t) = text {
            events.push(StreamEvent::TextStart { content_index: index });
            events.push(StreamEvent::TextDelta { content_index: index, delta: t.to_string() });
            events.push(StreamEvent::TextEnd { content_index: index, signature: None });
            index += 1;
        }
        events.push(StreamEvent::ToolCallStart {
            content_index: index,
            id: id.into(),
            name: name.into(),
        });
        events.push(StreamEvent::ToolCallDelta { content_index: index, delta: args_json.into() });
        events.push(StreamEvent::ToolCallEnd { content_index: index });
        events.push(StreamEvent::Done {
            reason: StopReason::ToolUse,
            usage: Usage { input_tokens: 5, output_tokens: 5, ..Default::default() },
        });
        events
    }

    /// Script emitting several tool calls in consecutive slots.
    pub fn multi_tool_script(calls: &[(&str, &str, &str)]) -> Vec<StreamEvent> {
        let mut events = vec![StreamEvent::Start];
        for (i, (id, name, args)) in calls.iter().enumerate() {
            events.push(StreamEvent::ToolCallStart {
                content_index: i,
                id: (*id).to_string(),
                name: (*name).to_string(),
            });
            events.push(StreamEvent::ToolCallDelta {
                content_index: i,
                delta: (*args).to_string(),
            });
            events.push(StreamEvent::ToolCallEnd { content_index: i });
        }
        events.push(StreamEvent::Done {
            reason: StopReason::ToolUse,
            usage: Usage::default(),
        });
        events
    }
}

#[async_trait]
impl ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn api(&self) -> &str {
        "mock-api"
    }
    fn model(&self) -> &Model {
        &self.model
    }

    async fn stream(&self, request: StreamRequest) -> Result<EventStream, ModelError> {
        *self.last_request.lock().unwrap() = Some(request);
        {
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                tracing::debug!("scripted mock exhausted; serving fallback reply");
                Self::text_script("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<Result<StreamEvent, ModelError>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn request_with(text: &str) -> StreamRequest {
        StreamRequest {
            messages: vec![Message::user(text)],
            ..Default::default()
        }
    }

    async fn drain(mut s: EventStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(ev) = s.next().await {
            events.push(ev.unwrap());
        }
        events
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockProvider::default();
        let events = drain(p.stream(request_with("hi")).await.unwrap()).await;
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::TextDelta { delta, .. } if delta.contains("MOCK: hi")
        )));
    }

    #[tokio::test]
    async fn mock_ends_with_done() {
        let p = MockProvider::default();
        let events = drain(p.stream(request_with("x")).await.unwrap()).await;
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn scripted_pops_scripts_in_order() {
        let p = ScriptedMockProvider::new(vec![
            ScriptedMockProvider::text_script("first"),
            ScriptedMockProvider::text_script("second"),
        ]);
        let a = drain(p.stream(request_with("1")).await.unwrap()).await;
        let b = drain(p.stream(request_with("2")).await.unwrap()).await;
        assert!(a.iter().any(|e| matches!(e, StreamEvent::TextDelta { delta, .. } if delta == "first")));
        assert!(b.iter().any(|e| matches!(e, StreamEvent::TextDelta { delta, .. } if delta == "second")));
    }

    #[tokio::test]
    async fn scripted_fallback_when_scripts_exhausted() {
        let p = ScriptedMockProvider::new(vec![]);
        let events = drain(p.stream(request_with("x")).await.unwrap()).await;
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::TextDelta { delta, .. } if delta.contains("no more scripts")
        )));
    }

    #[tokio::test]
    async fn scripted_failures_consumed_before_scripts() {
        let p = ScriptedMockProvider::new(vec![ScriptedMockProvider::text_script("after")])
            .with_failures(vec![ModelError::transport("boom")]);
        let err = p.stream(request_with("x")).await.err().unwrap();
        assert!(err.is_retriable());
        let events = drain(p.stream(request_with("x")).await.unwrap()).await;
        assert!(events.iter().any(|e| matches!(e, StreamEvent::TextDelta { delta, .. } if delta == "after")));
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let p = ScriptedMockProvider::new(vec![]);
        let _ = p.stream(request_with("inspect me")).await.unwrap();
        let req = p.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].as_text(), Some("inspect me"));
    }

    #[tokio::test]
    async fn tool_call_script_ends_with_tool_use() {
        let script = ScriptedMockProvider::tool_call_script(
            Some("ok"),
            "tc1",
            "echo",
            r#"{"text":"hi"}"#,
        );
        assert!(matches!(
            script.last(),
            Some(StreamEvent::Done { reason: StopReason::ToolUse, .. })
        ));
        assert!(script.iter().any(|e| matches!(
            e,
            StreamEvent::ToolCallStart { name, .. } if name == "echo"
        )));
    }
}
