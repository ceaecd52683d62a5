// Reasoning chain - append-only step log with aggregate metrics
//
// One chain per execution, single logical writer. A mutex guards appends
// because the dispatcher writes through the ChainRecorder seam from the
// same execution; steps are never mutated once added.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use skillrun_contracts::{ToolResult, Visibility};

use crate::error::{ExecutionError, Result};
use crate::traits::ChainRecorder;

/// Kind of a reasoning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Thinking,
    ToolCall,
    ToolResult,
    Synthesis,
}

/// Type-keyed payload of a reasoning step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepPayload {
    Thinking {
        text: String,
    },
    ToolCall {
        tool: String,
        arguments: Value,
    },
    ToolResult {
        tool: String,
        result: ToolResult,
    },
    Synthesis {
        answer: String,
        /// Step numbers the answer draws on
        sources: Vec<u64>,
    },
}

impl StepPayload {
    pub fn step_type(&self) -> StepType {
        match self {
            StepPayload::Thinking { .. } => StepType::Thinking,
            StepPayload::ToolCall { .. } => StepType::ToolCall,
            StepPayload::ToolResult { .. } => StepType::ToolResult,
            StepPayload::Synthesis { .. } => StepType::Synthesis,
        }
    }
}

/// One immutable record in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// Dense, monotonic, starting at 1
    pub step_number: u64,
    #[serde(flatten)]
    pub payload: StepPayload,
    pub timestamp: DateTime<Utc>,
    pub visibility: Visibility,
    pub tokens_used: u32,
    pub cost_usd: f64,
    /// Links TOOL_RESULT steps to their TOOL_CALL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ReasoningStep {
    pub fn step_type(&self) -> StepType {
        self.payload.step_type()
    }
}

/// Aggregate metrics over a chain.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChainMetrics {
    pub total_steps: u64,
    pub llm_calls: u64,
    pub tool_calls: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub duration_ms: u64,
}

/// Read-only view of a chain at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct ChainView {
    pub chain_id: Uuid,
    pub task_id: Uuid,
    pub steps: Vec<ReasoningStep>,
    pub metrics: ChainMetrics,
}

impl ChainView {
    /// Steps at or below the given visibility level.
    pub fn steps_at(&self, level: Visibility) -> impl Iterator<Item = &ReasoningStep> {
        self.steps.iter().filter(move |s| s.visibility <= level)
    }
}

struct ChainInner {
    steps: Vec<ReasoningStep>,
    metrics: ChainMetrics,
    started_at: DateTime<Utc>,
}

/// Append-only reasoning chain owned by exactly one execution.
pub struct ReasoningChain {
    chain_id: Uuid,
    task_id: Uuid,
    inner: Mutex<ChainInner>,
}

impl ReasoningChain {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            chain_id: Uuid::now_v7(),
            task_id,
            inner: Mutex::new(ChainInner {
                steps: Vec::new(),
                metrics: ChainMetrics::default(),
                started_at: Utc::now(),
            }),
        }
    }

    pub fn chain_id(&self) -> Uuid {
        self.chain_id
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Record a THINKING step from an LLM response.
    pub fn add_thinking(&self, text: impl Into<String>, tokens: u32, cost_usd: f64) -> Result<u64> {
        self.append(
            StepPayload::Thinking { text: text.into() },
            Visibility::Full,
            tokens,
            cost_usd,
            None,
        )
    }

    /// Record a TOOL_CALL step; returns the generated correlation id.
    pub fn add_tool_call(&self, tool: &str, arguments: &Value) -> Result<String> {
        let correlation_id = Uuid::now_v7().to_string();
        self.append(
            StepPayload::ToolCall {
                tool: tool.to_string(),
                arguments: arguments.clone(),
            },
            Visibility::Detail,
            0,
            0.0,
            Some(correlation_id.clone()),
        )?;
        Ok(correlation_id)
    }

    /// Record a TOOL_RESULT step. The correlation id must reference an
    /// earlier TOOL_CALL and must not already have a result.
    pub fn add_tool_result(
        &self,
        correlation_id: &str,
        tool: &str,
        result: &ToolResult,
    ) -> Result<u64> {
        {
            let inner = self.inner.lock().expect("chain lock poisoned");
            let call_exists = inner.steps.iter().any(|s| {
                matches!(s.payload, StepPayload::ToolCall { .. })
                    && s.correlation_id.as_deref() == Some(correlation_id)
            });
            if !call_exists {
                return Err(ExecutionError::chain(format!(
                    "tool result references unknown correlation id {correlation_id}"
                )));
            }
            let already_resolved = inner.steps.iter().any(|s| {
                matches!(s.payload, StepPayload::ToolResult { .. })
                    && s.correlation_id.as_deref() == Some(correlation_id)
            });
            if already_resolved {
                return Err(ExecutionError::chain(format!(
                    "correlation id {correlation_id} already has a result"
                )));
            }
        }

        self.append(
            StepPayload::ToolResult {
                tool: tool.to_string(),
                result: result.clone(),
            },
            Visibility::Detail,
            result.tokens_used.unwrap_or(0),
            result.cost_usd.unwrap_or(0.0),
            Some(correlation_id.to_string()),
        )
    }

    /// Record the terminal SYNTHESIS step.
    pub fn add_synthesis(&self, answer: impl Into<String>, sources: Vec<u64>) -> Result<u64> {
        self.append(
            StepPayload::Synthesis {
                answer: answer.into(),
                sources,
            },
            Visibility::Summary,
            0,
            0.0,
            None,
        )
    }

    fn append(
        &self,
        payload: StepPayload,
        visibility: Visibility,
        tokens: u32,
        cost_usd: f64,
        correlation_id: Option<String>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().expect("chain lock poisoned");
        let step_number = inner.steps.len() as u64 + 1;

        match payload.step_type() {
            StepType::Thinking => inner.metrics.llm_calls += 1,
            StepType::ToolCall => inner.metrics.tool_calls += 1,
            _ => {}
        }
        inner.metrics.total_steps += 1;
        inner.metrics.total_tokens += u64::from(tokens);
        inner.metrics.total_cost_usd += cost_usd;

        let now = Utc::now();
        inner.metrics.duration_ms =
            (now - inner.started_at).num_milliseconds().max(0) as u64;

        inner.steps.push(ReasoningStep {
            step_number,
            payload,
            timestamp: now,
            visibility,
            tokens_used: tokens,
            cost_usd,
            correlation_id,
        });

        Ok(step_number)
    }

    /// The TOOL_CALL step for a correlation id, if recorded.
    pub fn last_tool_call(&self, correlation_id: &str) -> Option<ReasoningStep> {
        let inner = self.inner.lock().expect("chain lock poisoned");
        inner
            .steps
            .iter()
            .rev()
            .find(|s| {
                matches!(s.payload, StepPayload::ToolCall { .. })
                    && s.correlation_id.as_deref() == Some(correlation_id)
            })
            .cloned()
    }

    /// Read-only snapshot for metrics and reporting.
    pub fn snapshot(&self) -> ChainView {
        let inner = self.inner.lock().expect("chain lock poisoned");
        ChainView {
            chain_id: self.chain_id,
            task_id: self.task_id,
            steps: inner.steps.clone(),
            metrics: inner.metrics,
        }
    }

    pub fn metrics(&self) -> ChainMetrics {
        self.inner.lock().expect("chain lock poisoned").metrics
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("chain lock poisoned").steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChainRecorder for ReasoningChain {
    async fn record_call(&self, tool: &str, arguments: &Value) -> Result<String> {
        self.add_tool_call(tool, arguments)
    }

    async fn record_result(
        &self,
        correlation_id: &str,
        tool: &str,
        result: &ToolResult,
    ) -> Result<()> {
        self.add_tool_result(correlation_id, tool, result)?;
        Ok(())
    }
}
