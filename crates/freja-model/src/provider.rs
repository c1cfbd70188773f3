// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use freja_config::ThinkingLevel;

use crate::{Message, Model, ModelError, StopReason, ToolSchema, Usage};

/// The normalized event alphabet every provider adapter must emit.
///
/// Providers translate their wire format (SSE chunks, websocket frames, …)
/// into this alphabet; the core never sees vendor-specific payloads.  Each
/// content-bearing event names its target slot via `content_index`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The provider accepted the request and a reply is forming.
    Start,
    TextStart { content_index: usize },
    TextDelta { content_index: usize, delta: String },
    TextEnd { content_index: usize, signature: Option<String> },
    ThinkingStart { content_index: usize },
    ThinkingDelta { content_index: usize, delta: String },
    ThinkingEnd { content_index: usize, signature: Option<String> },
    ToolCallStart { content_index: usize, id: String, name: String },
    /// A fragment of the tool call's JSON arguments.
    ToolCallDelta { content_index: usize, delta: String },
    ToolCallEnd { content_index: usize },
    /// Terminal: the reply completed.
    Done { reason: StopReason, usage: Usage },
    /// Terminal: the reply failed or was aborted server-side.
    Error { reason: StopReason, error_message: String, usage: Usage },
}

/// How long the provider should retain prompt-cache entries for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheRetention {
    #[default]
    None,
    Short,
    Long,
}

/// Preferred wire transport, for providers that offer more than one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    Sse,
    WebSocket,
    #[default]
    Auto,
}

/// Hook invoked with the raw request body just before it is sent.
pub type PayloadHook = Arc<dyn Fn(&Value) + Send + Sync>;

/// Per-request options, all optional.
#[derive(Clone, Default)]
pub struct StreamOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u64>,
    /// Resolved immediately before the request; short-lived OAuth tokens are
    /// re-resolved every turn by the agent loop.
    pub api_key: Option<String>,
    pub cache_retention: CacheRetention,
    pub session_id: Option<String>,
    pub transport: TransportKind,
    pub headers: Option<HashMap<String, String>>,
    pub max_retry_delay_ms: Option<u64>,
    /// Requested reasoning effort.
    pub reasoning: ThinkingLevel,
    /// Explicit per-level token budgets, overriding provider defaults.
    pub thinking_budgets: Option<HashMap<ThinkingLevel, u64>>,
    pub metadata: Option<Value>,
    pub on_payload: Option<PayloadHook>,
}

impl std::fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptions")
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("cache_retention", &self.cache_retention)
            .field("session_id", &self.session_id)
            .field("transport", &self.transport)
            .field("headers", &self.headers)
            .field("max_retry_delay_ms", &self.max_retry_delay_ms)
            .field("reasoning", &self.reasoning)
            .field("thinking_budgets", &self.thinking_budgets)
            .field("metadata", &self.metadata)
            .field("on_payload", &self.on_payload.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// One completion request: the LLM-shaped context plus options.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub system_prompt: String,
    /// Already converted by the caller's message converter.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub options: StreamOptions,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ModelError>> + Send>>;

/// A streaming LLM back-end.
///
/// Implementations own the wire protocol; the core only consumes the
/// normalized [`StreamEvent`] alphabet.  `stream` must observe request-level
/// cancellation by ending the stream when the caller drops it.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id for status display (e.g. "anthropic").
    fn name(&self) -> &str;

    /// Wire API family label (e.g. "messages").
    fn api(&self) -> &str;

    /// Static descriptor of the model being driven.
    fn model(&self) -> &Model;

    /// Open a streaming completion.
    async fn stream(&self, request: StreamRequest) -> Result<EventStream, ModelError>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
