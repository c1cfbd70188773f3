// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use freja_model::{ToolCall, ToolResultMessage};

use crate::{Tool, ToolExecutionEvent, ToolRegistry, ToolUpdate, ToolUpdateFn};

/// Sink the executor reports progress through.
pub type ToolEventFn = Arc<dyn Fn(ToolExecutionEvent) + Send + Sync>;

/// Binds tool calls from the model to registered tools and runs them under
/// the run's cancellation token with streamed progress.
///
/// Calls within one assistant message are executed strictly sequentially by
/// the agent loop; the executor itself handles exactly one call at a time.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute one tool call to completion.
    ///
    /// Always produces a [`ToolResultMessage`]: validation failures, unknown
    /// tools, thrown errors and cancellation all become error results so the
    /// conversation invariant (every call gets exactly one result) holds.
    pub async fn execute_call(
        &self,
        call: &ToolCall,
        cancel: CancellationToken,
        emit: ToolEventFn,
    ) -> ToolResultMessage {
        emit(ToolExecutionEvent::Start {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        });

        let result = self.run_tool(call, cancel, &emit).await;
        let is_error = result.is_error;
        emit(ToolExecutionEvent::End {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result: result.clone(),
            is_error,
        });
        result
    }

    async fn run_tool(
        &self,
        call: &ToolCall,
        cancel: CancellationToken,
        emit: &ToolEventFn,
    ) -> ToolResultMessage {
        let Some(tool) = self.registry.get(&call.name) else {
            return error_result(call, format!("Unknown tool: {}", call.name));
        };

        if let Some(reason) = validate_args(&tool.parameters_schema(), &call.arguments) {
            return error_result(call, format!("Invalid arguments: {reason}"));
        }

        let on_update = update_forwarder(call, emit.clone());
        let executed = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow::anyhow!("Tool execution aborted")),
            result = tool.execute(&call.id, call.arguments.clone(), cancel.clone(), Some(on_update)) => result,
        };

        match executed {
            Ok(result) => ToolResultMessage {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: result.content,
                details: result.details,
                is_error: false,
                timestamp: Utc::now().timestamp_millis(),
            },
            Err(e) => error_result(call, e.to_string()),
        }
    }
}

/// Wrap the event sink into the `ToolUpdateFn` handed to the tool.
fn update_forwarder(call: &ToolCall, emit: ToolEventFn) -> ToolUpdateFn {
    let id = call.id.clone();
    let name = call.name.clone();
    Arc::new(move |update: ToolUpdate| {
        emit(ToolExecutionEvent::Update {
            tool_call_id: id.clone(),
            tool_name: name.clone(),
            content: update.content,
            details: update.details,
        });
    })
}

/// Validate `args` against the tool's parameter schema.
/// Returns `Some(reason)` on failure, `None` when the arguments are valid.
/// A tool that declares a malformed schema is logged and not validated.
fn validate_args(schema: &Value, args: &Value) -> Option<String> {
    match jsonschema::validator_for(schema) {
        Ok(validator) => validator.validate(args).err().map(|e| e.to_string()),
        Err(e) => {
            warn!(error = %e, "tool declares an invalid parameters schema; skipping validation");
            None
        }
    }
}

fn error_result(call: &ToolCall, message: String) -> ToolResultMessage {
    ToolResultMessage::text(&call.id, &call.name, message, true)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{Tool, ToolResult};

    /// Echo tool with a real parameters schema.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes the given text"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"],
            })
        }
        async fn execute(
            &self,
            _call_id: &str,
            args: Value,
            _cancel: CancellationToken,
            on_update: Option<ToolUpdateFn>,
        ) -> anyhow::Result<ToolResult> {
            let text = args["text"].as_str().unwrap_or_default().to_string();
            if let Some(update) = on_update {
                update(ToolUpdate {
                    content: vec![freja_model::ContentBlock::text("working")],
                    details: Value::Null,
                });
            }
            Ok(ToolResult::text(text).with_details(json!({"echoed": true})))
        }
    }

    /// Tool that fails with a plain error.
    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "always fails"
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
            anyhow::bail!("disk on fire")
        }
    }

    /// Tool that blocks until cancelled.
    struct HangingTool;

    #[async_trait]
    impl Tool for HangingTool {
        fn name(&self) -> &str {
            "hang"
        }
        fn description(&self) -> &str {
            "never returns on its own"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            _call_id: &str,
            _args: Value,
            cancel: CancellationToken,
            _on_update: Option<ToolUpdateFn>,
        ) -> anyhow::Result<ToolResult> {
            cancel.cancelled().await;
            anyhow::bail!("cancelled")
        }
    }

    fn executor_with(tools: Vec<Box<dyn FnOnce(&mut ToolRegistry)>>) -> ToolExecutor {
        let mut reg = ToolRegistry::new();
        for add in tools {
            add(&mut reg);
        }
        ToolExecutor::new(Arc::new(reg))
    }

    fn collecting_emit() -> (ToolEventFn, Arc<Mutex<Vec<ToolExecutionEvent>>>) {
        let events: Arc<Mutex<Vec<ToolExecutionEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let emit: ToolEventFn = Arc::new(move |e| sink.lock().unwrap().push(e));
        (emit, events)
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall { id: id.into(), name: name.into(), arguments: args, signature: None }
    }

    // ── Success path ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn valid_call_returns_result_and_events() {
        let ex = executor_with(vec![Box::new(|r| r.register(EchoTool))]);
        let (emit, events) = collecting_emit();
        let result = ex
            .execute_call(
                &call("tc1", "echo", json!({"text": "hi"})),
                CancellationToken::new(),
                emit,
            )
            .await;

        assert!(!result.is_error);
        assert_eq!(result.tool_call_id, "tc1");
        assert_eq!(result.content.len(), 1);
        assert_eq!(result.details["echoed"], true);

        let events = events.lock().unwrap();
        assert!(matches!(events.first(), Some(ToolExecutionEvent::Start { .. })));
        assert!(events.iter().any(|e| matches!(e, ToolExecutionEvent::Update { .. })));
        assert!(matches!(events.last(), Some(ToolExecutionEvent::End { is_error: false, .. })));
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_required_arg_is_invalid() {
        let ex = executor_with(vec![Box::new(|r| r.register(EchoTool))]);
        let (emit, events) = collecting_emit();
        let result = ex
            .execute_call(&call("tc1", "echo", json!({})), CancellationToken::new(), emit)
            .await;

        assert!(result.is_error);
        let text = result.content[0].clone();
        match text {
            freja_model::ContentBlock::Text { text, .. } => {
                assert!(text.starts_with("Invalid arguments:"), "got: {text}");
            }
            other => panic!("wrong block: {other:?}"),
        }
        // Start and End still bracket the failure.
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events.last(), Some(ToolExecutionEvent::End { is_error: true, .. })));
    }

    #[tokio::test]
    async fn wrong_arg_type_is_invalid() {
        let ex = executor_with(vec![Box::new(|r| r.register(EchoTool))]);
        let (emit, _) = collecting_emit();
        let result = ex
            .execute_call(
                &call("tc1", "echo", json!({"text": 42})),
                CancellationToken::new(),
                emit,
            )
            .await;
        assert!(result.is_error);
    }

    // ── Unknown tool ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_produces_error_result() {
        let ex = executor_with(vec![]);
        let (emit, _) = collecting_emit();
        let result = ex
            .execute_call(&call("tc9", "missing", json!({})), CancellationToken::new(), emit)
            .await;
        assert!(result.is_error);
        assert_eq!(result.tool_name, "missing");
    }

    // ── Tool errors ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn thrown_error_captured_into_result() {
        let ex = executor_with(vec![Box::new(|r| r.register(FailingTool))]);
        let (emit, events) = collecting_emit();
        let result = ex
            .execute_call(&call("tc2", "fail", json!({})), CancellationToken::new(), emit)
            .await;
        assert!(result.is_error);
        match &result.content[0] {
            freja_model::ContentBlock::Text { text, .. } => assert!(text.contains("disk on fire")),
            other => panic!("wrong block: {other:?}"),
        }
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(ToolExecutionEvent::End { is_error: true, .. })
        ));
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancellation_yields_error_result_quickly() {
        let ex = executor_with(vec![Box::new(|r| r.register(HangingTool))]);
        let (emit, _) = collecting_emit();
        let cancel = CancellationToken::new();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c2.cancel();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            ex.execute_call(&call("tc3", "hang", json!({})), cancel, emit),
        )
        .await
        .expect("executor must unblock after cancellation");
        assert!(result.is_error);
    }
}
