// ReAct driver - the reason/act/observe loop
//
// Loop shape: push the skill scope, emit WORKING, then iterate under the
// configured budget. Each iteration calls the LLM under a deadline, records
// a THINKING step, parses the ReAct grammar, dispatches actions in order,
// and feeds observations back into the conversation. Tool errors become
// observations first; they only terminate the execution when error
// recovery is off or the budget runs out, at which point partial results
// are salvaged.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};

use skillrun_contracts::{
    ErrorKind, ExecutionEvent, ExecutionOutcome, ToolResult, Visibility,
};

use crate::chain::ReasoningChain;
use crate::config::ExecutionConfig;
use crate::context::ExecutionContext;
use crate::dispatch::{ToolDispatcher, ToolInvocation};
use crate::error::{ExecutionError, Result};
use crate::llm::{LlmMessage, LlmRequest};
use crate::preprocess::LoadedContext;
use crate::react::{self, ParsedResponse};
use crate::skill::Skill;
use crate::state::ExecutionState;
use crate::tools::ToolContext;
use crate::traits::{EventEmitter, LlmProvider};

/// Step ids cited by a synthesis step.
const SYNTHESIS_SOURCE_WINDOW: u64 = 5;
/// Cap on a single observation fed back to the conversation.
const OBSERVATION_CHAR_LIMIT: usize = 4096;

/// Drives one skill execution through the ReAct loop.
pub struct ReActDriver {
    llm: Arc<dyn LlmProvider>,
    dispatcher: Arc<ToolDispatcher>,
    emitter: Arc<dyn EventEmitter>,
}

impl ReActDriver {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        dispatcher: Arc<ToolDispatcher>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            llm,
            dispatcher,
            emitter,
        }
    }

    /// Run the loop to completion. The returned outcome covers every
    /// terminal shape; `Err` is reserved for infrastructure failures.
    pub async fn run(
        &self,
        skill: &Skill,
        loaded: &LoadedContext,
        request: &str,
        config: &ExecutionConfig,
        ctx: &ExecutionContext,
        chain: &ReasoningChain,
    ) -> Result<ExecutionOutcome> {
        let task_id = ctx.task_id;
        info!(
            task_id = %task_id,
            skill = %skill.name(),
            depth = ctx.depth,
            max_iterations = config.max_iterations,
            "starting execution"
        );

        let mut state = ExecutionState::new();
        let scope_guard = self.dispatcher.scope().push(skill);

        self.emit(
            ExecutionEvent::status(task_id, skillrun_contracts::TaskState::Working),
            ctx,
        )
        .await?;

        let tool_ctx = ToolContext {
            execution: ctx.clone(),
            skill_dir: skill.directory().to_path_buf(),
        };

        let mut conversation = vec![
            LlmMessage::system(build_system_prompt(skill, loaded, &self.dispatcher)),
            LlmMessage::user(request.to_string()),
        ];

        let mut final_answer: Option<String> = None;
        let mut outcome: Option<ExecutionOutcome> = None;

        'iterations: while state.iteration() < config.max_iterations {
            if ctx.cancel.is_cancelled() {
                outcome = Some(canceled_outcome(&mut state));
                break;
            }

            if let Some(limit) = config.max_cost_usd {
                let spent = chain.metrics().total_cost_usd;
                if spent >= limit {
                    warn!(task_id = %task_id, spent, limit, "cost budget exhausted");
                    self.emit(
                        ExecutionEvent::message(
                            task_id,
                            Visibility::Detail,
                            format!("cost budget exhausted (${spent:.4} of ${limit:.4})"),
                        ),
                        ctx,
                    )
                    .await?;
                    break;
                }
            }

            let iteration = state.iteration() + 1;
            let deadline = Instant::now() + config.timeout_per_iteration;

            self.emit(
                ExecutionEvent::message(
                    task_id,
                    Visibility::Detail,
                    format!("Iteration {iteration} starting"),
                ),
                ctx,
            )
            .await?;

            // Reason
            let llm_request = LlmRequest {
                messages: conversation.clone(),
                model: config.model.clone(),
                temperature: config.temperature,
                cancel: ctx.cancel.clone(),
            };

            let response = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    outcome = Some(canceled_outcome(&mut state));
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    // The in-flight call is dropped; the iteration is spent.
                    state.record_error();
                    self.emit(
                        ExecutionEvent::error(
                            task_id,
                            ErrorKind::IterationTimeout,
                            format!("iteration {iteration} exceeded its deadline"),
                            config.error_recovery,
                        )
                        .with_visibility(Visibility::Detail),
                        ctx,
                    )
                    .await?;
                    if !config.error_recovery {
                        outcome = Some(ExecutionOutcome::Failure {
                            reason: ErrorKind::IterationTimeout,
                            message: format!("iteration {iteration} exceeded its deadline"),
                        });
                        break;
                    }
                    state.advance_iteration();
                    continue;
                }
                result = self.llm.complete(llm_request) => {
                    match result {
                        Ok(response) => response,
                        Err(e) => {
                            state.record_error();
                            warn!(task_id = %task_id, error = %e, "LLM call failed");
                            if !config.error_recovery {
                                outcome = Some(ExecutionOutcome::Failure {
                                    reason: ErrorKind::IterationTimeout,
                                    message: format!("LLM call failed: {e}"),
                                });
                                break;
                            }
                            state.advance_iteration();
                            continue;
                        }
                    }
                }
            };

            chain.add_thinking(&response.text, response.tokens_used, response.cost_usd)?;

            match react::parse_response(&response.text) {
                ParsedResponse::Final { answer } => {
                    let sources = recent_step_ids(chain, SYNTHESIS_SOURCE_WINDOW);
                    chain.add_synthesis(&answer, sources)?;
                    self.emit(
                        ExecutionEvent::message(task_id, Visibility::Summary, answer.clone()),
                        ctx,
                    )
                    .await?;
                    final_answer = Some(answer.clone());
                    state.advance_iteration();
                    if config.early_termination {
                        outcome = Some(ExecutionOutcome::Success { answer });
                        break;
                    }
                    // Deterministic-harness mode: keep issuing prompts until
                    // the budget runs out; the latest answer wins.
                    conversation.push(LlmMessage::assistant(response.text));
                    continue;
                }
                ParsedResponse::Unparseable => {
                    conversation.push(LlmMessage::assistant(response.text));
                    conversation.push(LlmMessage::user(react::FORMAT_NUDGE.to_string()));
                }
                ParsedResponse::Actions { actions, .. } => {
                    conversation.push(LlmMessage::assistant(response.text));

                    // Act: sequential, in action order
                    for action in actions {
                        let invocation = ToolInvocation {
                            tool: action.tool.clone(),
                            arguments: action.arguments.clone(),
                            max_retries: config.max_retries_per_tool,
                            deadline,
                        };

                        let observation = match self
                            .dispatcher
                            .dispatch(invocation, &tool_ctx, chain)
                            .await
                        {
                            Ok(result) => {
                                if let Some(partial) = &result.partial_value {
                                    state.add_partial_result(partial.clone());
                                }
                                if action.tool == "read" {
                                    if let Some(path) =
                                        action.arguments.get("path").and_then(|v| v.as_str())
                                    {
                                        state.mark_file_loaded(path);
                                    }
                                }
                                let text = serialize_observation(&result);
                                state.record_observation(
                                    &action.tool,
                                    &result.tool_call_id,
                                    true,
                                    &text,
                                );
                                text
                            }
                            Err(
                                e @ (ExecutionError::ToolNotPermitted(_)
                                | ExecutionError::ArgumentValidation { .. }),
                            ) => {
                                state.record_error();
                                if let Some(kind) = e.kind() {
                                    state.record_failed_approach(&action.tool, kind);
                                }
                                let text = format!("Error: {e}");
                                state.record_observation(&action.tool, "", false, &text);
                                text
                            }
                            Err(ExecutionError::RetriesExhausted {
                                tool,
                                attempts,
                                message,
                            }) => {
                                state.record_error();
                                state.record_failed_approach(&tool, ErrorKind::RetriesExhausted);
                                let text = format!(
                                    "Error: retries exhausted for '{tool}' after {attempts} attempts: {message}"
                                );
                                state.record_observation(&tool, "", false, &text);

                                if !config.error_recovery {
                                    self.emit(
                                        ExecutionEvent::error(
                                            task_id,
                                            ErrorKind::RetriesExhausted,
                                            text.clone(),
                                            false,
                                        ),
                                        ctx,
                                    )
                                    .await?;
                                    outcome = Some(ExecutionOutcome::Failure {
                                        reason: ErrorKind::RetriesExhausted,
                                        message,
                                    });
                                    break 'iterations;
                                }
                                text
                            }
                            Err(ExecutionError::Canceled) => {
                                outcome = Some(canceled_outcome(&mut state));
                                break 'iterations;
                            }
                            Err(other) => return Err(other),
                        };

                        conversation.push(LlmMessage::user(format!("Observation: {observation}")));
                    }
                }
            }

            state.advance_iteration();
        }

        let outcome = outcome.unwrap_or_else(|| {
            if let Some(answer) = final_answer {
                ExecutionOutcome::Success { answer }
            } else if ctx.cancel.is_cancelled() {
                canceled_outcome(&mut state)
            } else if !state.partial_results().is_empty() {
                ExecutionOutcome::PartialSuccess {
                    partials: state.take_partial_results(),
                    reason: ErrorKind::IterationLimitExhausted,
                }
            } else {
                ExecutionOutcome::Failure {
                    reason: ErrorKind::IterationLimitExhausted,
                    message: format!(
                        "no final answer after {} iteration(s)",
                        state.iteration()
                    ),
                }
            }
        });

        // Pop the skill scope before the terminal events
        drop(scope_guard);

        let final_state = outcome.final_state();
        let status = match &outcome {
            ExecutionOutcome::PartialSuccess { reason, .. }
            | ExecutionOutcome::Failure { reason, .. } => {
                ExecutionEvent::status_with_message(task_id, final_state, reason.as_str())
            }
            _ => ExecutionEvent::status(task_id, final_state),
        };
        self.emit(status, ctx).await?;
        self.emit(ExecutionEvent::done(task_id, final_state), ctx).await?;

        info!(
            task_id = %task_id,
            iterations = state.iteration(),
            errors = state.error_count(),
            state = ?final_state,
            "execution finished"
        );

        Ok(outcome)
    }

    async fn emit(&self, event: ExecutionEvent, ctx: &ExecutionContext) -> Result<()> {
        self.emitter
            .emit(event.with_tenant(ctx.tenant_id.clone()))
            .await
    }
}

fn canceled_outcome(state: &mut ExecutionState) -> ExecutionOutcome {
    ExecutionOutcome::Canceled {
        partials: state.take_partial_results(),
    }
}

fn recent_step_ids(chain: &ReasoningChain, window: u64) -> Vec<u64> {
    let len = chain.len() as u64;
    let first = len.saturating_sub(window) + 1;
    (first..=len).collect()
}

/// Render a recorded tool result as an observation string. The dispatcher
/// has already applied field truncation; this only bounds overall size.
fn serialize_observation(result: &ToolResult) -> String {
    let mut text = match &result.value {
        Some(value) => serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()),
        None => "null".to_string(),
    };
    if text.len() > OBSERVATION_CHAR_LIMIT {
        let mut cut = OBSERVATION_CHAR_LIMIT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("... [truncated]");
    }
    text
}

/// Build the initial system prompt: the preprocessed body, the ReAct
/// protocol, the allowed tools, and the supporting-file inventory.
fn build_system_prompt(
    skill: &Skill,
    loaded: &LoadedContext,
    dispatcher: &ToolDispatcher,
) -> String {
    let mut prompt = String::with_capacity(loaded.content.len() + 1024);
    prompt.push_str(&loaded.content);

    prompt.push_str("\n\n## Protocol\n");
    prompt.push_str(
        "Work step by step. To use a tool, respond with:\n\
         Thought: <your reasoning>\n\
         Action: <tool name>\n\
         Action Input: <JSON arguments>\n\
         You will receive an Observation. When you are done, respond with:\n\
         Final Answer: <your answer>\n",
    );

    let registry = dispatcher.registry();
    let allowed: Vec<&str> = skill
        .allowed_tools()
        .iter()
        .map(|p| p.tool())
        .filter(|name| registry.has(name))
        .collect();
    if !allowed.is_empty() {
        prompt.push_str("\n## Available tools\n");
        for line in registry.describe_for_prompt().lines() {
            if allowed
                .iter()
                .any(|name| line.starts_with(&format!("- {name}:")))
            {
                prompt.push_str(line);
                prompt.push('\n');
            }
        }
    }

    if !loaded.available_files.is_empty() {
        prompt.push_str(
            "\n## Supporting files\nThese files are available via the `read` tool; \
             load one only when you need it:\n",
        );
        for reference in loaded.available_files.values() {
            match &reference.description {
                Some(desc) => {
                    prompt.push_str(&format!("- {}: {}\n", reference.path, desc));
                }
                None => prompt.push_str(&format!("- {}\n", reference.path)),
            }
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialize_observation_bounds_length() {
        let big = "x".repeat(OBSERVATION_CHAR_LIMIT * 2);
        let result = ToolResult::ok("c1", json!({ "blob": big }));
        let text = serialize_observation(&result);
        assert!(text.len() <= OBSERVATION_CHAR_LIMIT + 20);
        assert!(text.ends_with("... [truncated]"));
    }

    #[test]
    fn test_recent_step_ids_window() {
        let chain = ReasoningChain::new(uuid::Uuid::now_v7());
        for i in 0..7 {
            chain.add_thinking(format!("t{i}"), 0, 0.0).unwrap();
        }
        assert_eq!(recent_step_ids(&chain, 5), vec![3, 4, 5, 6, 7]);

        let short = ReasoningChain::new(uuid::Uuid::now_v7());
        short.add_thinking("only", 0, 0.0).unwrap();
        assert_eq!(recent_step_ids(&short, 5), vec![1]);
    }
}
