// Skill Execution Core
//
// This crate drives an LLM-based agent through a bounded Reason-Act-Observe
// loop to satisfy a user request using declarative skills and a closed tool
// set.
//
// Key design decisions:
// - Uses traits (EventEmitter, LlmProvider, ChainRecorder, SkillLoader) for
//   pluggable backends
// - The dispatcher records through the ChainRecorder seam and never sees a
//   concrete chain type
// - Tool errors are observations first; they terminate an execution only
//   for security denials, disabled error recovery, or budget exhaustion
// - Cancellation is cooperative and hierarchical via CancellationToken
// - Events carry visibility levels; the bus filters per subscriber

pub mod bus;
pub mod chain;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod document;
pub mod driver;
pub mod error;
pub mod llm;
pub mod orchestrate;
pub mod preprocess;
pub mod react;
pub mod skill;
pub mod state;
pub mod tools;
pub mod traits;

// In-memory implementations for examples and testing
pub mod memory;

// Re-exports for convenience
pub use bus::{EventBus, EventStream, TenantScopedEmitter};
pub use chain::{ChainMetrics, ChainView, ReasoningChain, ReasoningStep, StepPayload, StepType};
pub use config::{resolve_config, ConfigOverride, ExecutionConfig, PlatformConfig};
pub use context::ExecutionContext;
pub use dispatch::{ScopeGuard, SkillScopeStack, ToolDispatcher, ToolInvocation};
pub use document::{parse_duration, parse_skill_document, serialize_frontmatter, SkillDocument};
pub use driver::ReActDriver;
pub use error::{ExecutionError, Result};
pub use llm::{LlmMessage, LlmRequest, LlmResponse, LlmRole};
pub use orchestrate::{ExecuteRequest, ExecutionReport, Orchestrator, SubAgentTool};
pub use preprocess::{
    substitute_variables, LoadedContext, PreprocessOptions, Preprocessor, SubstitutionResult,
    VariableContext,
};
pub use react::{parse_response, ParsedAction, ParsedResponse};
pub use skill::{
    load_skill_from_dir, ExecutionMode, FileReference, Skill, SkillMetadata, SkillRegistry,
    SourceLayer, ToolPattern,
};
pub use state::{ExecutionState, Observation};
pub use tools::{ReadTool, Tool, ToolContext, ToolOutput, ToolRegistry, ToolRegistryBuilder};
pub use traits::{ChainRecorder, EventEmitter, LlmProvider, SkillLoader};

// Re-export the contracts this crate speaks
pub use skillrun_contracts::{
    ErrorKind, ExecutionEvent, ExecutionOutcome, MessagePart, ParamConstraints, ParamKind,
    TaskState, ToolCall, ToolError, ToolParameter, ToolResult, Visibility,
};
