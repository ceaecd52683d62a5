// Execution context - task lineage, recursion depth, cancellation
//
// A child context derives its cancellation token from the parent, so
// canceling a parent cancels every descendant sub-agent.

use std::path::PathBuf;

use uuid::Uuid;

use tokio_util::sync::CancellationToken;

use crate::error::{ExecutionError, Result};

/// Default maximum sub-agent depth.
pub const DEFAULT_MAX_DEPTH: u32 = 2;

/// Per-execution context threaded through the driver, dispatcher, and tools.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: Uuid,
    pub session_id: String,
    pub tenant_id: Option<String>,
    /// 0 for the root execution
    pub depth: u32,
    pub max_depth: u32,
    pub parent_task_id: Option<Uuid>,
    pub root_task_id: Uuid,
    /// Ordered names of ancestor skills, ending with this execution's skill
    pub skill_chain: Vec<String>,
    /// The root execution's resolved iteration budget, used to derive child
    /// budgets by halving per depth level
    pub base_iterations: u32,
    /// Working directory, exposed to skill bodies as `${WORKSPACE}`
    pub workspace: PathBuf,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    /// Create a root context (depth 0).
    pub fn root(task_id: Uuid, session_id: impl Into<String>, skill_name: impl Into<String>) -> Self {
        Self {
            task_id,
            session_id: session_id.into(),
            tenant_id: None,
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            parent_task_id: None,
            root_task_id: task_id,
            skill_chain: vec![skill_name.into()],
            base_iterations: 0,
            workspace: std::env::current_dir().unwrap_or_default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Derive a child context for a sub-agent execution.
    ///
    /// Fails with `RecursionLimitExceeded` before any work happens if the
    /// child would exceed `max_depth`.
    pub fn create_child(&self, task_id: Uuid, skill_name: impl Into<String>) -> Result<Self> {
        let depth = self.depth + 1;
        if depth > self.max_depth {
            return Err(ExecutionError::RecursionLimitExceeded {
                depth,
                max_depth: self.max_depth,
            });
        }

        let mut skill_chain = self.skill_chain.clone();
        skill_chain.push(skill_name.into());

        Ok(Self {
            task_id,
            session_id: self.session_id.clone(),
            tenant_id: self.tenant_id.clone(),
            depth,
            max_depth: self.max_depth,
            parent_task_id: Some(self.task_id),
            root_task_id: self.root_task_id,
            skill_chain,
            base_iterations: self.base_iterations,
            workspace: self.workspace.clone(),
            cancel: self.cancel.child_token(),
        })
    }

    /// Iteration budget for an execution at this depth: the root budget
    /// halved per level, floored at 3.
    pub fn iteration_budget(&self) -> u32 {
        if self.depth == 0 {
            return self.base_iterations;
        }
        let halved = (f64::from(self.base_iterations) * 0.5_f64.powi(self.depth as i32)).floor();
        (halved as u32).max(3)
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
