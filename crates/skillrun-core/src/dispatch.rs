// Tool dispatch - scope enforcement, validation, retry, recording
//
// The dispatcher executes one tool call on behalf of the driver. Order
// matters: skill-scope check, argument validation, record the call, execute
// with retry, record the result. Denials and validation failures never
// invoke the tool, but they still land on the chain as a call/result pair
// so the record reflects the attempt.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use skillrun_contracts::{
    ErrorKind, ExecutionEvent, ToolError, ToolResult, Visibility,
};

use crate::error::{ExecutionError, Result};
use crate::skill::{Skill, ToolPattern};
use crate::tools::{ToolChunk, ToolContext, ToolOutput, ToolRegistry};
use crate::traits::{ChainRecorder, EventEmitter};

/// Retry backoff: exponential from 250 ms, capped at 4 s, with jitter.
pub const BACKOFF_BASE: Duration = Duration::from_millis(250);
pub const BACKOFF_CAP: Duration = Duration::from_secs(4);

/// Default number of items kept in a truncatable result field.
pub const DEFAULT_MAX_TRUNCATED_ITEMS: usize = 10;

// ============================================================================
// Skill scope stack
// ============================================================================

#[derive(Debug, Clone)]
struct ScopeFrame {
    skill_name: String,
    patterns: Vec<ToolPattern>,
}

/// LIFO of active skills. The top frame defines the current allowed-tools
/// set. Pushing returns an RAII guard so every exit path - success, error,
/// cancel, panic unwind - pops the frame.
#[derive(Debug, Default)]
pub struct SkillScopeStack {
    frames: Mutex<Vec<ScopeFrame>>,
}

impl SkillScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate a skill; the frame pops when the guard drops.
    pub fn push(self: &Arc<Self>, skill: &Skill) -> ScopeGuard {
        self.frames
            .lock()
            .expect("scope stack lock poisoned")
            .push(ScopeFrame {
                skill_name: skill.name().to_string(),
                patterns: skill.allowed_tools().to_vec(),
            });
        ScopeGuard {
            stack: Arc::clone(self),
        }
    }

    /// Whether the top of the stack permits this call.
    pub fn permits(&self, tool_name: &str, arguments: &Value) -> bool {
        let frames = self.frames.lock().expect("scope stack lock poisoned");
        match frames.last() {
            Some(frame) => frame
                .patterns
                .iter()
                .any(|p| p.permits(tool_name, arguments)),
            None => false,
        }
    }

    /// Name of the currently active skill.
    pub fn current_skill(&self) -> Option<String> {
        self.frames
            .lock()
            .expect("scope stack lock poisoned")
            .last()
            .map(|f| f.skill_name.clone())
    }

    pub fn depth(&self) -> usize {
        self.frames.lock().expect("scope stack lock poisoned").len()
    }

    fn pop(&self) {
        self.frames.lock().expect("scope stack lock poisoned").pop();
    }
}

/// RAII guard that pops its scope frame on drop.
pub struct ScopeGuard {
    stack: Arc<SkillScopeStack>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.stack.pop();
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// One tool invocation as the driver hands it over.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool: String,
    pub arguments: Value,
    pub max_retries: u32,
    /// The iteration deadline; per-attempt timeouts are clamped to it
    pub deadline: Instant,
}

/// Executes tool calls with scope enforcement, validation, and retry.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    scope: Arc<SkillScopeStack>,
    emitter: Arc<dyn EventEmitter>,
    max_truncated_items: usize,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        scope: Arc<SkillScopeStack>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            registry,
            scope,
            emitter,
            max_truncated_items: DEFAULT_MAX_TRUNCATED_ITEMS,
        }
    }

    pub fn with_max_truncated_items(mut self, max_items: usize) -> Self {
        self.max_truncated_items = max_items;
        self
    }

    pub fn scope(&self) -> &Arc<SkillScopeStack> {
        &self.scope
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute one tool call. On failure the error is also recorded on the
    /// chain as the call's result, so the returned `Err` is for the
    /// driver's control flow, not the only record of what happened.
    pub async fn dispatch(
        &self,
        invocation: ToolInvocation,
        ctx: &ToolContext,
        recorder: &dyn ChainRecorder,
    ) -> Result<ToolResult> {
        let tool_name = invocation.tool.as_str();

        // Scope check happens before the registry lookup: a denied tool is
        // denied whether or not it exists.
        if !self.scope.permits(tool_name, &invocation.arguments) {
            let message = format!(
                "tool '{}' is not permitted by skill '{}'",
                tool_name,
                self.scope.current_skill().unwrap_or_default()
            );
            self.record_rejection(
                tool_name,
                &invocation.arguments,
                ToolError::not_permitted(&message),
                recorder,
            )
            .await?;
            return Err(ExecutionError::ToolNotPermitted(message));
        }

        let Some(tool) = self.registry.get(tool_name).cloned() else {
            let message = format!("unknown tool '{tool_name}'");
            self.record_rejection(
                tool_name,
                &invocation.arguments,
                ToolError::invalid_arguments(&message),
                recorder,
            )
            .await?;
            return Err(ExecutionError::ArgumentValidation {
                tool: tool_name.to_string(),
                message,
            });
        };

        let arguments = coerce_arguments(invocation.arguments, &tool.parameters());
        if let Err(message) = validate_arguments(&arguments, &tool.parameters()) {
            self.record_rejection(
                tool_name,
                &arguments,
                ToolError::invalid_arguments(&message),
                recorder,
            )
            .await?;
            return Err(ExecutionError::ArgumentValidation {
                tool: tool_name.to_string(),
                message,
            });
        }

        let correlation_id = recorder.record_call(tool_name, &arguments).await?;
        self.emitter
            .emit(
                ExecutionEvent::message(
                    ctx.task_id(),
                    Visibility::Detail,
                    format!("tool '{tool_name}' started"),
                )
                .with_tenant(ctx.tenant_id().map(String::from)),
            )
            .await?;

        // Streaming tools surface chunks as events and skip the retry loop.
        if let Some(stream) = tool
            .execute_streaming(arguments.clone(), ctx)
            .await
        {
            let output = self.consume_stream(stream, ctx).await;
            return self
                .finish(tool_name, &correlation_id, output, 1, ctx, recorder)
                .await;
        }

        let mut attempts = 0;
        let output = loop {
            attempts += 1;

            let attempt_budget = invocation
                .deadline
                .saturating_duration_since(Instant::now())
                .min(tool.timeout());
            if attempt_budget.is_zero() {
                break ToolOutput::err(ToolError::transient(
                    "no iteration budget left for tool execution",
                ));
            }

            let outcome = tokio::select! {
                _ = ctx.cancel().cancelled() => {
                    self.record_result_only(
                        tool_name,
                        &correlation_id,
                        ToolOutput::err(ToolError::fatal(ErrorKind::Canceled, "execution canceled")),
                        attempts,
                        recorder,
                    )
                    .await?;
                    return Err(ExecutionError::Canceled);
                }
                result = tokio::time::timeout(attempt_budget, tool.execute(arguments.clone(), ctx)) => result,
            };

            let output = match outcome {
                Ok(output) => output,
                Err(_elapsed) => ToolOutput::err(ToolError::transient(format!(
                    "tool '{}' timed out after {:?}",
                    tool_name, attempt_budget
                ))),
            };

            if output.is_success() {
                break output;
            }

            let retryable = output
                .error
                .as_ref()
                .map(|e| e.retryable)
                .unwrap_or(false);
            if !retryable || attempts >= invocation.max_retries {
                break output;
            }

            let delay = backoff_delay(attempts);
            debug!(
                tool = tool_name,
                attempt = attempts,
                max = invocation.max_retries,
                delay_ms = delay.as_millis() as u64,
                "retrying tool after transient failure"
            );
            self.emitter
                .emit(
                    ExecutionEvent::message(
                        ctx.task_id(),
                        Visibility::Detail,
                        format!(
                            "tool '{}' attempt {}/{} failed; retrying",
                            tool_name, attempts, invocation.max_retries
                        ),
                    )
                    .with_tenant(ctx.tenant_id().map(String::from)),
                )
                .await?;
            tokio::time::sleep(delay).await;
        };

        self.finish(tool_name, &correlation_id, output, attempts, ctx, recorder)
            .await
    }

    async fn finish(
        &self,
        tool_name: &str,
        correlation_id: &str,
        mut output: ToolOutput,
        attempts: u32,
        ctx: &ToolContext,
        recorder: &dyn ChainRecorder,
    ) -> Result<ToolResult> {
        if output.is_success() && !output.truncatable_fields.is_empty() {
            if let Some(value) = output.value.as_mut() {
                truncate_fields(value, &output.truncatable_fields, self.max_truncated_items);
            }
        }

        let success = output.is_success();
        let result = self
            .record_result_only(tool_name, correlation_id, output, attempts, recorder)
            .await?;

        self.emitter
            .emit(
                ExecutionEvent::message(
                    ctx.task_id(),
                    Visibility::Detail,
                    format!(
                        "tool '{}' {} after {} attempt(s)",
                        tool_name,
                        if success { "completed" } else { "failed" },
                        attempts
                    ),
                )
                .with_tenant(ctx.tenant_id().map(String::from)),
            )
            .await?;

        if success {
            Ok(result)
        } else {
            let error = result.error.clone().expect("failed result carries error");
            warn!(tool = tool_name, attempts, error = %error, "tool failed");
            Err(ExecutionError::RetriesExhausted {
                tool: tool_name.to_string(),
                attempts,
                message: error.message,
            })
        }
    }

    async fn record_result_only(
        &self,
        tool_name: &str,
        correlation_id: &str,
        output: ToolOutput,
        attempts: u32,
        recorder: &dyn ChainRecorder,
    ) -> Result<ToolResult> {
        let mut result = match (output.value, output.error) {
            (_, Some(error)) => ToolResult::failed(correlation_id, error),
            (value, None) => ToolResult {
                tool_call_id: correlation_id.to_string(),
                success: true,
                value,
                error: None,
                tokens_used: None,
                cost_usd: None,
                truncatable_fields: Vec::new(),
                partial_value: None,
                attempt_count: 1,
            },
        };
        result.tokens_used = output.tokens_used;
        result.cost_usd = output.cost_usd;
        result.truncatable_fields = output.truncatable_fields;
        result.partial_value = output.partial_value;
        result.attempt_count = attempts;

        recorder
            .record_result(correlation_id, tool_name, &result)
            .await?;
        Ok(result)
    }

    /// Record a call/result pair for a rejection that never ran the tool.
    async fn record_rejection(
        &self,
        tool_name: &str,
        arguments: &Value,
        error: ToolError,
        recorder: &dyn ChainRecorder,
    ) -> Result<()> {
        let correlation_id = recorder.record_call(tool_name, arguments).await?;
        let result = ToolResult::failed(&correlation_id, error);
        recorder
            .record_result(&correlation_id, tool_name, &result)
            .await
    }

    async fn consume_stream(
        &self,
        mut stream: crate::tools::ToolStream,
        ctx: &ToolContext,
    ) -> ToolOutput {
        while let Some(chunk) = stream.next().await {
            match chunk {
                ToolChunk::Chunk(text) => {
                    let _ = self
                        .emitter
                        .emit(
                            ExecutionEvent::message(ctx.task_id(), Visibility::Detail, text)
                                .with_tenant(ctx.tenant_id().map(String::from)),
                        )
                        .await;
                }
                ToolChunk::Done(output) => return output,
            }
        }
        ToolOutput::err(ToolError::transient("tool stream ended without a result"))
    }
}

/// Exponential backoff with jitter for the given 1-based attempt number.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let exp = BACKOFF_BASE.saturating_mul(1 << exponent).min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(exp.as_secs_f64() * jitter).min(BACKOFF_CAP)
}

/// If the LLM supplied a bare string and the tool declares exactly one
/// required string parameter, wrap the string into an object.
fn coerce_arguments(
    arguments: Value,
    parameters: &[skillrun_contracts::ToolParameter],
) -> Value {
    if let Value::String(s) = &arguments {
        let required: Vec<_> = parameters.iter().filter(|p| p.required).collect();
        if required.len() == 1 && required[0].kind == skillrun_contracts::ParamKind::String {
            let mut map = serde_json::Map::new();
            map.insert(required[0].name.clone(), Value::String(s.clone()));
            return Value::Object(map);
        }
    }
    arguments
}

fn validate_arguments(
    arguments: &Value,
    parameters: &[skillrun_contracts::ToolParameter],
) -> std::result::Result<(), String> {
    if parameters.is_empty() {
        return Ok(());
    }
    let Some(map) = arguments.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    for param in parameters {
        match map.get(&param.name) {
            Some(value) => param.validate(value)?,
            None if param.required => {
                return Err(format!("missing required parameter '{}'", param.name));
            }
            None => {}
        }
    }
    Ok(())
}

/// Trim truncatable array fields to `max_items`, adding a
/// `<field>_truncation_note`. Summary metadata alongside the field is left
/// untouched.
fn truncate_fields(value: &mut Value, fields: &[String], max_items: usize) {
    for field in fields {
        let Some(total) = value.get(field).and_then(|f| f.as_array()).map(|a| a.len()) else {
            continue;
        };
        if total <= max_items {
            continue;
        }
        if let Some(array) = value.get_mut(field).and_then(|f| f.as_array_mut()) {
            array.truncate(max_items);
        }
        if let Some(map) = value.as_object_mut() {
            map.insert(
                format!("{field}_truncation_note"),
                json!(format!("Showing {max_items} of {total} items")),
            );
        }
    }
}
