// Error types for the execution core

use thiserror::Error;

use skillrun_contracts::ErrorKind;

/// Result type alias for execution core operations
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Errors that can occur while executing a skill
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The loader could not resolve the skill name
    #[error("skill not found: {0}")]
    SkillNotFound(String),

    /// A dynamic-injection command was rejected
    #[error("command injection denied: {0}")]
    CommandInjectionDenied(String),

    /// The active skill scope forbids this tool
    #[error("tool not permitted: {0}")]
    ToolNotPermitted(String),

    /// Tool arguments violated the declared schema
    #[error("invalid arguments for '{tool}': {message}")]
    ArgumentValidation { tool: String, message: String },

    /// Final tool failure after the retry budget was spent
    #[error("retries exhausted for '{tool}' after {attempts} attempts: {message}")]
    RetriesExhausted {
        tool: String,
        attempts: u32,
        message: String,
    },

    /// The LLM call exceeded the per-iteration deadline
    #[error("iteration {0} timed out")]
    IterationTimeout(u32),

    /// The loop ended without a final answer
    #[error("iteration limit ({0}) exhausted")]
    IterationLimitExhausted(u32),

    /// Sub-agent depth exceeded the configured maximum
    #[error("recursion limit exceeded: depth {depth} > max {max_depth}")]
    RecursionLimitExceeded { depth: u32, max_depth: u32 },

    /// Cooperative cancellation was received
    #[error("execution canceled")]
    Canceled,

    /// LLM provider error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Event emission error
    #[error("event emission error: {0}")]
    EventEmission(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Skill document parsing or validation error
    #[error("skill document error: {0}")]
    Document(String),

    /// Reasoning chain invariant violation
    #[error("reasoning chain error: {0}")]
    Chain(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ExecutionError {
    /// Create an LLM error
    pub fn llm(msg: impl Into<String>) -> Self {
        ExecutionError::Llm(msg.into())
    }

    /// Create an event emission error
    pub fn event(msg: impl Into<String>) -> Self {
        ExecutionError::EventEmission(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ExecutionError::Configuration(msg.into())
    }

    /// Create a skill document error
    pub fn document(msg: impl Into<String>) -> Self {
        ExecutionError::Document(msg.into())
    }

    /// Create a reasoning chain error
    pub fn chain(msg: impl Into<String>) -> Self {
        ExecutionError::Chain(msg.into())
    }

    /// The taxonomy kind this error maps to, if it has one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ExecutionError::SkillNotFound(_) => Some(ErrorKind::SkillNotFound),
            ExecutionError::CommandInjectionDenied(_) => Some(ErrorKind::CommandInjectionDenied),
            ExecutionError::ToolNotPermitted(_) => Some(ErrorKind::ToolNotPermitted),
            ExecutionError::ArgumentValidation { .. } => Some(ErrorKind::ArgumentValidationError),
            ExecutionError::RetriesExhausted { .. } => Some(ErrorKind::RetriesExhausted),
            ExecutionError::IterationTimeout(_) => Some(ErrorKind::IterationTimeout),
            ExecutionError::IterationLimitExhausted(_) => {
                Some(ErrorKind::IterationLimitExhausted)
            }
            ExecutionError::RecursionLimitExceeded { .. } => {
                Some(ErrorKind::RecursionLimitExceeded)
            }
            ExecutionError::Canceled => Some(ErrorKind::Canceled),
            _ => None,
        }
    }
}
