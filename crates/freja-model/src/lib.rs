// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod error;
mod mock;
mod partial_json;
mod provider;
mod types;

pub use error::ModelError;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use partial_json::parse_streaming_json;
pub use provider::{
    CacheRetention, EventStream, ModelProvider, PayloadHook, StreamEvent, StreamOptions,
    StreamRequest, TransportKind,
};
pub use types::{
    AssistantMessage, ContentBlock, CustomMessage, Message, Model, StopReason, ToolCall,
    ToolResultMessage, ToolSchema, Usage, UserMessage,
};
