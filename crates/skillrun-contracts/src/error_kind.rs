// Error taxonomy shared between ErrorEvent.kind and tool error records

use serde::{Deserialize, Serialize};

/// Closed set of error kinds produced by the execution core.
///
/// These appear in `ErrorEvent.kind`, in `ToolError.kind`, and in the
/// reasoning chain's recorded failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The loader could not resolve the skill name
    SkillNotFound,
    /// A dynamic-injection command was rejected by allowed-tools or the
    /// metacharacter policy
    CommandInjectionDenied,
    /// The active skill scope forbids this tool
    ToolNotPermitted,
    /// Tool arguments violated the declared parameter schema
    ArgumentValidationError,
    /// Retryable tool failure (timeout, transient I/O, rate limit)
    ToolTransientError,
    /// Final tool failure after the retry budget was spent
    RetriesExhausted,
    /// The LLM call exceeded the per-iteration deadline
    IterationTimeout,
    /// The loop ended without a final answer
    IterationLimitExhausted,
    /// Sub-agent depth exceeded the configured maximum
    RecursionLimitExceeded,
    /// Cooperative cancellation was received
    Canceled,
}

impl ErrorKind {
    /// Whether the dispatcher may retry a tool failure of this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ToolTransientError)
    }

    /// Stable snake_case name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SkillNotFound => "skill_not_found",
            ErrorKind::CommandInjectionDenied => "command_injection_denied",
            ErrorKind::ToolNotPermitted => "tool_not_permitted",
            ErrorKind::ArgumentValidationError => "argument_validation_error",
            ErrorKind::ToolTransientError => "tool_transient_error",
            ErrorKind::RetriesExhausted => "retries_exhausted",
            ErrorKind::IterationTimeout => "iteration_timeout",
            ErrorKind::IterationLimitExhausted => "iteration_limit_exhausted",
            ErrorKind::RecursionLimitExceeded => "recursion_limit_exceeded",
            ErrorKind::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
