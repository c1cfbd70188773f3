// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use freja_model::ContentBlock;

/// The result of executing a tool.
///
/// `content` is what the LLM sees on the next turn (text and image blocks);
/// `details` is structured metadata for the host — a file's resolved path,
/// truncation info — and is never shown to the model.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    pub details: Value,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Incremental progress reported by a running tool.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolUpdate {
    pub content: Vec<ContentBlock>,
    pub details: Value,
}

/// Callback a tool uses to stream progress while it runs.
pub type ToolUpdateFn = Arc<dyn Fn(ToolUpdate) + Send + Sync>;

/// Trait every tool must implement.
///
/// `execute` runs under the agent run's cancellation token; implementations
/// must observe it at every I/O boundary.  Errors are returned, not panicked
/// — the executor captures them into an error tool result and the run
/// continues.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable identifier the model calls the tool by.
    fn name(&self) -> &str;

    /// Human label for UIs.
    fn label(&self) -> &str {
        self.name()
    }

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    async fn execute(
        &self,
        call_id: &str,
        args: Value,
        cancel: CancellationToken,
        on_update: Option<ToolUpdateFn>,
    ) -> anyhow::Result<ToolResult>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct MinimalTool;

    #[async_trait]
    impl Tool for MinimalTool {
        fn name(&self) -> &str {
            "minimal"
        }
        fn description(&self) -> &str {
            "a minimal tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            _call_id: &str,
            _args: Value,
            _cancel: CancellationToken,
            _on_update: Option<ToolUpdateFn>,
        ) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::text("ok"))
        }
    }

    #[test]
    fn label_defaults_to_name() {
        assert_eq!(MinimalTool.label(), "minimal");
    }

    #[test]
    fn tool_result_text_builds_single_block() {
        let r = ToolResult::text("hello");
        assert_eq!(r.content.len(), 1);
        assert_eq!(r.details, Value::Null);
    }

    #[test]
    fn with_details_attaches_payload() {
        let r = ToolResult::text("x").with_details(json!({"path": "/tmp/a"}));
        assert_eq!(r.details["path"], "/tmp/a");
    }
}
