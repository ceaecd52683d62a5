// In-memory implementations for examples and testing
//
// These keep all data in memory: event collectors, a scripted LLM provider
// with a call log, and tools with call counting. Integration tests and
// examples wire executions entirely from this module.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use skillrun_contracts::{ExecutionEvent, ToolError, ToolParameter};

use crate::error::{ExecutionError, Result};
use crate::llm::{LlmMessage, LlmRequest, LlmResponse};
use crate::tools::{Tool, ToolContext, ToolOutput};
use crate::traits::{EventEmitter, LlmProvider};

// ============================================================================
// CollectingEmitter - Collects events in memory
// ============================================================================

/// Event emitter that collects everything for later inspection.
#[derive(Debug, Default)]
pub struct CollectingEmitter {
    events: Arc<RwLock<Vec<ExecutionEvent>>>,
}

impl CollectingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<ExecutionEvent> {
        self.events.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl EventEmitter for CollectingEmitter {
    async fn emit(&self, event: ExecutionEvent) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}

// ============================================================================
// NoOpEmitter - Discards all events
// ============================================================================

/// Event emitter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEmitter;

impl NoOpEmitter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventEmitter for NoOpEmitter {
    async fn emit(&self, _event: ExecutionEvent) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// ScriptedLlmProvider - Returns predefined responses
// ============================================================================

/// One scripted response.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub text: String,
    pub tokens_used: u32,
    pub cost_usd: f64,
    /// Simulated latency before the response lands
    pub delay: Option<Duration>,
}

impl ScriptedResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens_used: 10,
            cost_usd: 0.0001,
            delay: None,
        }
    }

    /// A response in action form: `Action: <tool>` / `Action Input: <json>`.
    pub fn action(tool: &str, arguments: Value) -> Self {
        Self::text(format!(
            "Thought: using {tool}.\nAction: {tool}\nAction Input: {arguments}"
        ))
    }

    /// A terminal `Final Answer:` response.
    pub fn final_answer(answer: impl AsRef<str>) -> Self {
        Self::text(format!("Final Answer: {}", answer.as_ref()))
    }

    pub fn with_usage(mut self, tokens: u32, cost_usd: f64) -> Self {
        self.tokens_used = tokens;
        self.cost_usd = cost_usd;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Mock LLM provider that returns scripted responses in order and logs
/// every request.
#[derive(Debug, Default)]
pub struct ScriptedLlmProvider {
    responses: RwLock<Vec<ScriptedResponse>>,
    next: AtomicU32,
    call_log: RwLock<Vec<Vec<LlmMessage>>>,
}

impl ScriptedLlmProvider {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: RwLock::new(responses),
            next: AtomicU32::new(0),
            call_log: RwLock::new(Vec::new()),
        }
    }

    pub async fn push(&self, response: ScriptedResponse) {
        self.responses.write().await.push(response);
    }

    /// Number of completed calls.
    pub fn calls(&self) -> u32 {
        self.next.load(Ordering::SeqCst)
    }

    /// Message lists from every call, in order.
    pub async fn call_log(&self) -> Vec<Vec<LlmMessage>> {
        self.call_log.read().await.clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlmProvider {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.call_log.write().await.push(request.messages);

        let index = self.next.fetch_add(1, Ordering::SeqCst) as usize;
        let scripted = {
            let responses = self.responses.read().await;
            responses
                .get(index)
                .cloned()
                .ok_or_else(|| ExecutionError::llm("no scripted response left"))?
        };

        if let Some(delay) = scripted.delay {
            tokio::select! {
                _ = request.cancel.cancelled() => return Err(ExecutionError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Ok(LlmResponse {
            text: scripted.text,
            tokens_used: scripted.tokens_used,
            cost_usd: scripted.cost_usd,
            model: Some(request.model),
        })
    }
}

// ============================================================================
// Test tools
// ============================================================================

/// Tool that returns a fixed output and counts its calls.
pub struct StaticTool {
    name: String,
    parameters: Vec<ToolParameter>,
    output: ToolOutput,
    calls: AtomicU32,
}

impl StaticTool {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            output: ToolOutput::ok(value),
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_output(mut self, output: ToolOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<ToolParameter>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Returns a fixed result (test tool)."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        self.parameters.clone()
    }

    async fn execute(&self, _arguments: Value, _ctx: &ToolContext) -> ToolOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.output.clone()
    }
}

/// Tool that echoes its arguments back.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo back the provided arguments (test tool)."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        Vec::new()
    }

    async fn execute(&self, arguments: Value, _ctx: &ToolContext) -> ToolOutput {
        ToolOutput::ok(json!({ "echoed": arguments }))
    }
}

/// Tool that fails with transient errors a set number of times, then
/// succeeds.
pub struct FlakyTool {
    failures_before_success: u32,
    value: Value,
    calls: AtomicU32,
}

impl FlakyTool {
    pub fn new(failures_before_success: u32, value: Value) -> Self {
        Self {
            failures_before_success,
            value,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Fails transiently before succeeding (test tool)."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        Vec::new()
    }

    async fn execute(&self, _arguments: Value, _ctx: &ToolContext) -> ToolOutput {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            ToolOutput::err(ToolError::transient(format!(
                "transient failure on attempt {}",
                call + 1
            )))
        } else {
            ToolOutput::ok(self.value.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use skillrun_contracts::TaskState;
    use uuid::Uuid;

    fn tool_ctx() -> ToolContext {
        ToolContext {
            execution: ExecutionContext::root(Uuid::now_v7(), "s", "t"),
            skill_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_collecting_emitter() {
        let emitter = CollectingEmitter::new();
        emitter
            .emit(ExecutionEvent::status(Uuid::now_v7(), TaskState::Working))
            .await
            .unwrap();
        assert_eq!(emitter.count().await, 1);
    }

    #[tokio::test]
    async fn test_scripted_llm_in_order() {
        let llm = ScriptedLlmProvider::new(vec![
            ScriptedResponse::text("first"),
            ScriptedResponse::final_answer("second"),
        ]);

        let request = LlmRequest {
            messages: vec![LlmMessage::user("hello")],
            model: "test".to_string(),
            temperature: 0.0,
            cancel: Default::default(),
        };

        let r1 = llm.complete(request.clone()).await.unwrap();
        assert_eq!(r1.text, "first");
        let r2 = llm.complete(request.clone()).await.unwrap();
        assert!(r2.text.starts_with("Final Answer:"));
        assert!(llm.complete(request).await.is_err());
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_flaky_tool_recovers() {
        let tool = FlakyTool::new(2, json!(42));
        assert!(!tool.execute(json!({}), &tool_ctx()).await.is_success());
        assert!(!tool.execute(json!({}), &tool_ctx()).await.is_success());
        let output = tool.execute(json!({}), &tool_ctx()).await;
        assert!(output.is_success());
        assert_eq!(output.value.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_static_tool_counts_calls() {
        let tool = StaticTool::new("write", json!({"ok": true}));
        assert_eq!(tool.calls(), 0);
        tool.execute(json!({}), &tool_ctx()).await;
        assert_eq!(tool.calls(), 1);
    }
}
