// Orchestrator - entry point for executing a skill by name
//
// Resolves the skill, merges configuration, routes on execution mode, and
// wires the preprocessor, dispatcher, and driver together. Sub-agent
// delegation re-enters the orchestrator through the `sub_agent` tool with a
// child context and a halved iteration budget.
//
// Registries are injected; the orchestrator holds no global state. One
// process usually builds one orchestrator and shares it via Arc.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use skillrun_contracts::{
    ErrorKind, ExecutionEvent, ExecutionOutcome, ParamKind, TaskState, ToolError, ToolParameter,
    Visibility,
};

use crate::bus::{EventBus, EventStream};
use crate::chain::{ChainView, ReasoningChain};
use crate::config::{resolve_config, ConfigOverride, PlatformConfig};
use crate::context::ExecutionContext;
use crate::dispatch::{SkillScopeStack, ToolDispatcher};
use crate::driver::ReActDriver;
use crate::error::{ExecutionError, Result};
use crate::llm::{LlmMessage, LlmRequest};
use crate::preprocess::{Preprocessor, VariableContext};
use crate::skill::{ExecutionMode, Skill};
use crate::tools::{ReadTool, Tool, ToolContext, ToolOutput, ToolRegistry};
use crate::traits::{EventEmitter, LlmProvider, SkillLoader};

/// A request to execute a skill.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub skill_name: String,
    pub user_request: String,
    pub task_id: Uuid,
    pub session_id: String,
    pub tenant_id: Option<String>,
    pub mode_override: Option<ExecutionMode>,
    pub config_override: ConfigOverride,
    pub workspace: PathBuf,
    pub custom_vars: HashMap<String, String>,
    pub cancel: Option<CancellationToken>,
}

impl ExecuteRequest {
    pub fn new(skill_name: impl Into<String>, user_request: impl Into<String>) -> Self {
        Self {
            skill_name: skill_name.into(),
            user_request: user_request.into(),
            task_id: Uuid::now_v7(),
            session_id: Uuid::now_v7().to_string(),
            tenant_id: None,
            mode_override: None,
            config_override: ConfigOverride::default(),
            workspace: std::env::current_dir().unwrap_or_default(),
            custom_vars: HashMap::new(),
            cancel: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode_override = Some(mode);
        self
    }

    pub fn with_overrides(mut self, overrides: ConfigOverride) -> Self {
        self.config_override = overrides;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_custom_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.custom_vars = vars;
        self
    }
}

/// Outcome plus the chain snapshot for one finished execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub task_id: Uuid,
    pub outcome: ExecutionOutcome,
    pub chain: ChainView,
}

/// Wires skills, tools, the LLM provider, and the event bus together.
pub struct Orchestrator {
    loader: Arc<dyn SkillLoader>,
    registry: Arc<ToolRegistry>,
    llm: Arc<dyn LlmProvider>,
    platform: PlatformConfig,
    bus: Arc<EventBus>,
    preprocessor: Preprocessor,
}

impl Orchestrator {
    /// Build an orchestrator. The built-in `read` and `sub_agent` tools are
    /// registered on top of the caller's tools.
    pub fn new(
        loader: Arc<dyn SkillLoader>,
        llm: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        platform: PlatformConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Orchestrator>| {
            let mut registry = tools;
            registry.register(ReadTool);
            registry.register(SubAgentTool {
                orchestrator: weak.clone(),
            });

            Self {
                loader,
                registry: Arc::new(registry),
                llm,
                platform,
                bus: Arc::new(EventBus::default()),
                preprocessor: Preprocessor::default(),
            }
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute a skill and stream its events. The execution runs in the
    /// background; consumers read until the task's DoneEvent.
    pub async fn execute(self: &Arc<Self>, request: ExecuteRequest) -> EventStream {
        let stream = self
            .bus
            .subscribe(Visibility::Full, Some(request.task_id))
            .await;
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run(request).await {
                warn!(error = %e, "execution ended with an internal error");
            }
        });
        stream
    }

    /// Execute a skill and wait for its report.
    pub async fn run(&self, request: ExecuteRequest) -> Result<ExecutionReport> {
        let task_id = request.task_id;
        let tenant = request.tenant_id.clone();

        let Some(skill) = self.loader.load(&request.skill_name).await? else {
            warn!(skill = %request.skill_name, "skill not found");
            self.bus
                .emit(
                    ExecutionEvent::error(
                        task_id,
                        ErrorKind::SkillNotFound,
                        format!("skill '{}' was not found", request.skill_name),
                        false,
                    )
                    .with_hint("check the skill name and registered layers")
                    .with_tenant(tenant.clone()),
                )
                .await?;
            self.bus
                .emit(ExecutionEvent::done(task_id, TaskState::Failed).with_tenant(tenant))
                .await?;
            return Ok(ExecutionReport {
                task_id,
                outcome: ExecutionOutcome::Failure {
                    reason: ErrorKind::SkillNotFound,
                    message: format!("skill '{}' was not found", request.skill_name),
                },
                chain: ReasoningChain::new(task_id).snapshot(),
            });
        };

        let context = ExecutionContext::root(task_id, request.session_id, skill.name())
            .with_tenant(request.tenant_id)
            .with_workspace(request.workspace)
            .with_cancel(request.cancel.unwrap_or_default());

        self.run_with_context(
            skill,
            &request.user_request,
            context,
            request.mode_override,
            &request.config_override,
            &request.custom_vars,
        )
        .await
    }

    async fn run_with_context(
        &self,
        skill: Arc<Skill>,
        user_request: &str,
        mut context: ExecutionContext,
        mode_override: Option<ExecutionMode>,
        overrides: &ConfigOverride,
        custom_vars: &HashMap<String, String>,
    ) -> Result<ExecutionReport> {
        let task_id = context.task_id;
        let mut config = resolve_config(overrides, skill.metadata(), &self.platform);
        if context.depth == 0 {
            context.base_iterations = config.max_iterations;
        } else {
            // Sub-agents inherit a reduced budget
            config.max_iterations = context.iteration_budget();
        }

        let chain = ReasoningChain::new(task_id);
        let mode = mode_override.unwrap_or_else(|| skill.execution_mode());

        let vars = VariableContext::new(
            user_request,
            context.session_id.clone(),
            skill.directory(),
            context.workspace.clone(),
        )
        .with_custom(custom_vars.clone());

        let loaded = match self
            .preprocessor
            .preprocess(&skill, &vars, context.tenant_id.as_deref())
            .await
        {
            Ok(loaded) => loaded,
            Err(e @ ExecutionError::CommandInjectionDenied(_)) => {
                return self.fail_before_loop(task_id, &context, &chain, e).await;
            }
            Err(other) => return Err(other),
        };

        let outcome = match mode {
            ExecutionMode::Simple => {
                self.run_simple(&loaded.content, &config, &context, &chain)
                    .await?
            }
            ExecutionMode::Autonomous => {
                let scope = Arc::new(SkillScopeStack::new());
                let dispatcher = Arc::new(ToolDispatcher::new(
                    Arc::clone(&self.registry),
                    scope,
                    self.emitter(),
                ));
                let driver = ReActDriver::new(Arc::clone(&self.llm), dispatcher, self.emitter());
                driver
                    .run(&skill, &loaded, user_request, &config, &context, &chain)
                    .await?
            }
        };

        Ok(ExecutionReport {
            task_id,
            outcome,
            chain: chain.snapshot(),
        })
    }

    /// Simple mode: one LLM call on the preprocessed body, wrapped as a
    /// trivial chain with one THINKING and one SYNTHESIS.
    async fn run_simple(
        &self,
        prompt: &str,
        config: &crate::config::ExecutionConfig,
        context: &ExecutionContext,
        chain: &ReasoningChain,
    ) -> Result<ExecutionOutcome> {
        let task_id = context.task_id;
        let tenant = context.tenant_id.clone();

        self.bus
            .emit(
                ExecutionEvent::status(task_id, TaskState::Working).with_tenant(tenant.clone()),
            )
            .await?;

        let request = LlmRequest {
            messages: vec![LlmMessage::user(prompt.to_string())],
            model: config.model.clone(),
            temperature: config.temperature,
            cancel: context.cancel.clone(),
        };

        let response = tokio::select! {
            _ = context.cancel.cancelled() => {
                let outcome = ExecutionOutcome::Canceled { partials: vec![] };
                self.finish(task_id, &tenant, &outcome).await?;
                return Ok(outcome);
            }
            _ = tokio::time::sleep(config.timeout_per_iteration) => {
                let outcome = ExecutionOutcome::Failure {
                    reason: ErrorKind::IterationTimeout,
                    message: "LLM call exceeded the iteration deadline".to_string(),
                };
                self.finish(task_id, &tenant, &outcome).await?;
                return Ok(outcome);
            }
            result = self.llm.complete(request) => result?,
        };

        let thinking_step = chain.add_thinking(&response.text, response.tokens_used, response.cost_usd)?;
        chain.add_synthesis(&response.text, vec![thinking_step])?;

        self.bus
            .emit(
                ExecutionEvent::message(task_id, Visibility::Summary, response.text.clone())
                    .with_tenant(tenant.clone()),
            )
            .await?;

        let outcome = ExecutionOutcome::Success {
            answer: response.text,
        };
        self.finish(task_id, &tenant, &outcome).await?;
        Ok(outcome)
    }

    async fn finish(
        &self,
        task_id: Uuid,
        tenant: &Option<String>,
        outcome: &ExecutionOutcome,
    ) -> Result<()> {
        let state = outcome.final_state();
        self.bus
            .emit(ExecutionEvent::status(task_id, state).with_tenant(tenant.clone()))
            .await?;
        self.bus
            .emit(ExecutionEvent::done(task_id, state).with_tenant(tenant.clone()))
            .await
    }

    /// Terminal event sequence for errors raised before the loop started.
    async fn fail_before_loop(
        &self,
        task_id: Uuid,
        context: &ExecutionContext,
        chain: &ReasoningChain,
        error: ExecutionError,
    ) -> Result<ExecutionReport> {
        let kind = error.kind().unwrap_or(ErrorKind::CommandInjectionDenied);
        let tenant = context.tenant_id.clone();
        warn!(task_id = %task_id, error = %error, "execution failed before the loop");

        self.bus
            .emit(
                ExecutionEvent::error(task_id, kind, error.to_string(), false)
                    .with_tenant(tenant.clone()),
            )
            .await?;
        self.bus
            .emit(ExecutionEvent::status(task_id, TaskState::Failed).with_tenant(tenant.clone()))
            .await?;
        self.bus
            .emit(ExecutionEvent::done(task_id, TaskState::Failed).with_tenant(tenant))
            .await?;

        Ok(ExecutionReport {
            task_id,
            outcome: ExecutionOutcome::Failure {
                reason: kind,
                message: error.to_string(),
            },
            chain: chain.snapshot(),
        })
    }

    fn emitter(&self) -> Arc<dyn EventEmitter> {
        Arc::clone(&self.bus) as Arc<dyn EventEmitter>
    }
}

// ============================================================================
// Sub-agent tool
// ============================================================================

/// Delegates a request to another skill as a child execution.
///
/// The child keeps its own chain and metrics; the parent sees one summary
/// value when the child finishes. Depth limits are enforced before any
/// child work starts.
pub struct SubAgentTool {
    orchestrator: Weak<Orchestrator>,
}

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        "sub_agent"
    }

    fn description(&self) -> &str {
        "Delegate a request to another skill as a sub-agent and return its result."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::required("skill", ParamKind::String)
                .with_description("Name of the skill to delegate to"),
            ToolParameter::required("request", ParamKind::String)
                .with_description("The request for the sub-agent"),
        ]
    }

    fn timeout(&self) -> std::time::Duration {
        // Child executions run whole loops of their own
        std::time::Duration::from_secs(300)
    }

    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> ToolOutput {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return ToolOutput::err(ToolError::transient("orchestrator is shutting down"));
        };
        let skill_name = arguments
            .get("skill")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let request = arguments
            .get("request")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let child_task = Uuid::now_v7();
        let child_context = match ctx.execution.create_child(child_task, &skill_name) {
            Ok(child) => child,
            Err(e @ ExecutionError::RecursionLimitExceeded { .. }) => {
                return ToolOutput::err(ToolError::fatal(
                    ErrorKind::RecursionLimitExceeded,
                    e.to_string(),
                ));
            }
            Err(e) => return ToolOutput::err(ToolError::transient(e.to_string())),
        };

        let skill = match orchestrator.loader.load(&skill_name).await {
            Ok(Some(skill)) => skill,
            Ok(None) => {
                return ToolOutput::err(ToolError::fatal(
                    ErrorKind::SkillNotFound,
                    format!("skill '{skill_name}' was not found"),
                ));
            }
            Err(e) => return ToolOutput::err(ToolError::transient(e.to_string())),
        };

        info!(
            parent = %ctx.execution.task_id,
            child = %child_task,
            skill = %skill_name,
            depth = child_context.depth,
            "spawning sub-agent"
        );

        let report = match orchestrator
            .run_with_context(
                skill,
                &request,
                child_context,
                None,
                &ConfigOverride::default(),
                &HashMap::new(),
            )
            .await
        {
            Ok(report) => report,
            Err(ExecutionError::Canceled) => {
                return ToolOutput::err(ToolError::fatal(ErrorKind::Canceled, "sub-agent canceled"));
            }
            Err(e) => return ToolOutput::err(ToolError::transient(e.to_string())),
        };

        // Child metrics stay with the child chain; only a summary crosses
        // the boundary.
        let summary = match &report.outcome {
            ExecutionOutcome::Success { answer } => json!({
                "skill": skill_name,
                "task_id": report.task_id,
                "outcome": "success",
                "answer": answer,
            }),
            ExecutionOutcome::PartialSuccess { partials, reason } => json!({
                "skill": skill_name,
                "task_id": report.task_id,
                "outcome": "partial_success",
                "partials": partials,
                "reason": reason,
            }),
            ExecutionOutcome::Failure { reason, message } => json!({
                "skill": skill_name,
                "task_id": report.task_id,
                "outcome": "failure",
                "reason": reason,
                "message": message,
            }),
            ExecutionOutcome::Canceled { partials } => json!({
                "skill": skill_name,
                "task_id": report.task_id,
                "outcome": "canceled",
                "partials": partials,
            }),
        };

        let mut output = ToolOutput::ok(summary);
        if let ExecutionOutcome::Success { answer } = &report.outcome {
            output = output.with_partial(answer.clone());
        }
        output
    }
}
