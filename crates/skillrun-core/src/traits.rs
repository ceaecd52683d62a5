// Core traits for pluggable backends
//
// These seams keep the engine independent of its collaborators:
// - EventEmitter: where events go (bus, channel, memory, nothing)
// - LlmProvider: who answers reasoning calls
// - ChainRecorder: where tool calls/results are recorded (the dispatcher
//   never sees a concrete chain type)
// - SkillLoader: who resolves skill names

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use skillrun_contracts::{ExecutionEvent, ToolResult};

use crate::error::Result;
use crate::llm::{LlmRequest, LlmResponse};
use crate::skill::Skill;

// ============================================================================
// EventEmitter - For streaming events during execution
// ============================================================================

/// Trait for emitting events during execution.
///
/// Implementations can forward to the visibility-filtered bus, collect in
/// memory for tests, or discard.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    /// Emit a single event
    async fn emit(&self, event: ExecutionEvent) -> Result<()>;

    /// Emit multiple events
    async fn emit_batch(&self, events: Vec<ExecutionEvent>) -> Result<()> {
        for event in events {
            self.emit(event).await?;
        }
        Ok(())
    }
}

// ============================================================================
// LlmProvider - For reasoning calls
// ============================================================================

/// Trait for LLM providers.
///
/// Implementations handle provider-specific transport; the core only needs
/// a completed response with usage accounting.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse>;
}

// ============================================================================
// ChainRecorder - Recording seam between dispatcher and chain
// ============================================================================

/// Minimal recording interface the dispatcher writes through.
///
/// `ReasoningChain` implements this; the dispatcher stays independent of the
/// chain type.
#[async_trait]
pub trait ChainRecorder: Send + Sync {
    /// Record a tool call; returns the correlation id for its result.
    async fn record_call(&self, tool: &str, arguments: &Value) -> Result<String>;

    /// Record the final result for a previously recorded call.
    async fn record_result(&self, correlation_id: &str, tool: &str, result: &ToolResult)
        -> Result<()>;
}

// ============================================================================
// SkillLoader - Skill name resolution
// ============================================================================

/// Trait for resolving skills by name.
///
/// The in-memory `SkillRegistry` implements this; production loaders can
/// back it with file discovery or remote catalogs.
#[async_trait]
pub trait SkillLoader: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<Arc<Skill>>>;
}

#[async_trait]
impl SkillLoader for crate::skill::SkillRegistry {
    async fn load(&self, name: &str) -> Result<Option<Arc<Skill>>> {
        Ok(self.resolve(name))
    }
}
