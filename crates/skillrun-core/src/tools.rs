// Tool abstraction for the execution core
//
// Tools are defined via the `Tool` trait and registered with a
// `ToolRegistry` the dispatcher looks up by name. A tool reports success or
// a structured error; retryability lives on the error, and the dispatcher
// decides what to do with it.

use std::collections::HashMap;
use std::path::{Component, Path};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use skillrun_contracts::{ParamKind, ToolError, ToolParameter};

use crate::context::ExecutionContext;

/// Context handed to every tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The owning execution; sub-agent tools derive child contexts from it
    pub execution: ExecutionContext,
    /// Directory of the active skill; the `read` tool is rooted here
    pub skill_dir: std::path::PathBuf,
}

impl ToolContext {
    pub fn task_id(&self) -> Uuid {
        self.execution.task_id
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.execution.tenant_id.as_deref()
    }

    pub fn cancel(&self) -> &CancellationToken {
        &self.execution.cancel
    }
}

/// What a tool returns, before the dispatcher attaches correlation data.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub value: Option<Value>,
    pub error: Option<ToolError>,
    pub tokens_used: Option<u32>,
    pub cost_usd: Option<f64>,
    /// Value fields the dispatcher may trim before recording
    pub truncatable_fields: Vec<String>,
    /// Salvageable fragment kept if the execution ends without an answer
    pub partial_value: Option<String>,
}

impl ToolOutput {
    pub fn ok(value: Value) -> Self {
        Self {
            value: Some(value),
            error: None,
            tokens_used: None,
            cost_usd: None,
            truncatable_fields: Vec::new(),
            partial_value: None,
        }
    }

    pub fn err(error: ToolError) -> Self {
        Self {
            value: None,
            error: Some(error),
            tokens_used: None,
            cost_usd: None,
            truncatable_fields: Vec::new(),
            partial_value: None,
        }
    }

    pub fn with_usage(mut self, tokens: u32, cost_usd: f64) -> Self {
        self.tokens_used = Some(tokens);
        self.cost_usd = Some(cost_usd);
        self
    }

    pub fn with_truncatable(mut self, fields: Vec<String>) -> Self {
        self.truncatable_fields = fields;
        self
    }

    pub fn with_partial(mut self, partial: impl Into<String>) -> Self {
        self.partial_value = Some(partial.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Incremental output from a streaming tool.
pub enum ToolChunk {
    /// Progress text, surfaced as DETAIL events, never as chain steps
    Chunk(String),
    /// Final output; ends the stream
    Done(ToolOutput),
}

pub type ToolStream = Pin<Box<dyn Stream<Item = ToolChunk> + Send>>;

/// Trait for implementing tools invocable by the LLM.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name, used by the LLM and for registry lookup.
    fn name(&self) -> &str;

    /// Description provided to the LLM.
    fn description(&self) -> &str;

    /// Declared parameter schema, validated by the dispatcher before
    /// execution.
    fn parameters(&self) -> Vec<ToolParameter>;

    /// Per-attempt timeout; the dispatcher clamps it to the remaining
    /// iteration budget.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Execute the tool. Arguments have already passed schema validation.
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> ToolOutput;

    /// Streaming variant for tools that produce incremental output. Tools
    /// that support it return a stream ending in `ToolChunk::Done`.
    async fn execute_streaming(&self, _arguments: Value, _ctx: &ToolContext) -> Option<ToolStream> {
        None
    }
}

/// Registry of tools, looked up by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// One prompt line per tool: name, description, parameter summary.
    pub fn describe_for_prompt(&self) -> String {
        let mut lines = Vec::new();
        for name in self.tool_names() {
            let tool = &self.tools[name];
            let params: Vec<String> = tool
                .parameters()
                .iter()
                .map(|p| {
                    if p.required {
                        format!("{} ({:?})", p.name, p.kind)
                    } else {
                        format!("[{}] ({:?})", p.name, p.kind)
                    }
                })
                .collect();
            lines.push(format!(
                "- {}: {} Arguments: {}",
                name,
                tool.description(),
                if params.is_empty() {
                    "none".to_string()
                } else {
                    params.join(", ")
                }
            ));
        }
        lines.join("\n")
    }

    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

/// Builder for fluent tool registration.
pub struct ToolRegistryBuilder {
    registry: ToolRegistry,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self {
            registry: ToolRegistry::new(),
        }
    }

    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.registry.register(tool);
        self
    }

    pub fn tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.registry.register_arc(tool);
        self
    }

    pub fn build(self) -> ToolRegistry {
        self.registry
    }
}

impl Default for ToolRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Built-in: read - supporting-file loader
// ============================================================================

/// Reads a supporting file from the active skill's directory.
///
/// This is the progressive-disclosure counterpart of the preprocessor's
/// file inventory: files listed in the system prompt enter context only
/// when the LLM asks for them here. Paths are relative to the skill
/// directory; traversal outside it is rejected.
pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a supporting file from the skill directory."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![ToolParameter::required("path", ParamKind::String)
            .with_description("Path relative to the skill directory")]
    }

    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> ToolOutput {
        let Some(path) = arguments.get("path").and_then(|v| v.as_str()) else {
            return ToolOutput::err(ToolError::invalid_arguments("missing 'path'"));
        };

        if !is_safe_relative(Path::new(path)) {
            return ToolOutput::err(ToolError::fatal(
                skillrun_contracts::ErrorKind::ToolNotPermitted,
                format!("path '{path}' escapes the skill directory"),
            ));
        }

        let full = ctx.skill_dir.join(path);
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => {
                let lines = content.lines().count();
                ToolOutput::ok(json!({
                    "path": path,
                    "content": content,
                    "lines": lines,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ToolOutput::err(
                ToolError::fatal(
                    skillrun_contracts::ErrorKind::ArgumentValidationError,
                    format!("file '{path}' does not exist"),
                ),
            ),
            Err(e) => ToolOutput::err(ToolError::transient(format!("cannot read '{path}': {e}"))),
        }
    }
}

fn is_safe_relative(path: &Path) -> bool {
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillrun_contracts::ErrorKind;

    fn ctx(dir: &Path) -> ToolContext {
        ToolContext {
            execution: ExecutionContext::root(Uuid::now_v7(), "s", "test-skill"),
            skill_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_read_tool_loads_relative_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.md"), "line one\nline two\n").unwrap();

        let output = ReadTool
            .execute(json!({"path": "notes.md"}), &ctx(dir.path()))
            .await;
        assert!(output.is_success());
        let value = output.value.unwrap();
        assert_eq!(value["lines"], 2);
        assert!(value["content"].as_str().unwrap().contains("line one"));
    }

    #[tokio::test]
    async fn test_read_tool_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();

        for path in ["../secrets.txt", "/etc/passwd"] {
            let output = ReadTool
                .execute(json!({"path": path}), &ctx(dir.path()))
                .await;
            let error = output.error.expect("traversal must fail");
            assert_eq!(error.kind, ErrorKind::ToolNotPermitted);
        }
    }

    #[tokio::test]
    async fn test_read_tool_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let output = ReadTool
            .execute(json!({"path": "nope.md"}), &ctx(dir.path()))
            .await;
        let error = output.error.unwrap();
        assert!(!error.retryable);
    }

    #[test]
    fn test_registry_lookup_and_describe() {
        let registry = ToolRegistry::builder().tool(ReadTool).build();
        assert!(registry.has("read"));
        assert_eq!(registry.len(), 1);

        let prompt = registry.describe_for_prompt();
        assert!(prompt.contains("- read:"));
        assert!(prompt.contains("path (String)"));
    }
}
