// Terminal outcomes of a skill execution

use serde::{Deserialize, Serialize};

use crate::error_kind::ErrorKind;
use crate::events::TaskState;

/// User-visible outcome of one execution.
///
/// `PartialSuccess` means the loop ended without a final answer but salvaged
/// partial results from completed iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        answer: String,
    },
    PartialSuccess {
        partials: Vec<String>,
        reason: ErrorKind,
    },
    Failure {
        reason: ErrorKind,
        message: String,
    },
    Canceled {
        partials: Vec<String>,
    },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// The terminal task state this outcome maps to.
    pub fn final_state(&self) -> TaskState {
        match self {
            ExecutionOutcome::Success { .. } => TaskState::Completed,
            ExecutionOutcome::PartialSuccess { .. } | ExecutionOutcome::Failure { .. } => {
                TaskState::Failed
            }
            ExecutionOutcome::Canceled { .. } => TaskState::Canceled,
        }
    }

    /// The final answer, if one was produced.
    pub fn answer(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Success { answer } => Some(answer),
            _ => None,
        }
    }

    /// Salvaged partial results, if any.
    pub fn partials(&self) -> &[String] {
        match self {
            ExecutionOutcome::PartialSuccess { partials, .. }
            | ExecutionOutcome::Canceled { partials } => partials,
            _ => &[],
        }
    }
}
