// End-to-end tests for the execution core
//
// These wire an Orchestrator entirely from in-memory components: a layered
// skill registry, scripted LLM responses, and counting mock tools.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use skillrun_core::memory::{FlakyTool, ScriptedLlmProvider, ScriptedResponse, StaticTool};
use skillrun_core::{
    ErrorKind, ExecuteRequest, ExecutionMode, ExecutionOutcome, Orchestrator, ParamKind,
    PlatformConfig, Skill, SkillDocument, SkillMetadata, SkillRegistry, SourceLayer, StepPayload,
    StepType, Tool, ToolContext, ToolOutput, ToolParameter, ToolRegistry,
};

// ============================================================================
// Fixtures
// ============================================================================

fn make_skill(name: &str, body: &str, configure: impl FnOnce(&mut SkillMetadata)) -> Skill {
    let mut metadata = SkillMetadata::new(name, format!("test skill {name}"));
    configure(&mut metadata);
    Skill::new(
        SkillDocument {
            metadata,
            body: body.to_string(),
        },
        std::env::temp_dir(),
        SourceLayer::Project,
    )
    .expect("valid test skill")
}

fn orchestrator_with(
    skills: Vec<Skill>,
    responses: Vec<ScriptedResponse>,
    tools: ToolRegistry,
) -> (Arc<Orchestrator>, Arc<ScriptedLlmProvider>) {
    let registry = SkillRegistry::new();
    for skill in skills {
        registry.register(skill);
    }
    let llm = Arc::new(ScriptedLlmProvider::new(responses));
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        llm.clone(),
        tools,
        PlatformConfig::default(),
    );
    (orchestrator, llm)
}

/// Tool that returns a fresh partial value on every call.
struct PartialTool {
    calls: AtomicU32,
}

impl PartialTool {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Tool for PartialTool {
    fn name(&self) -> &str {
        "collect"
    }

    fn description(&self) -> &str {
        "Collects one item per call (test tool)."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        Vec::new()
    }

    async fn execute(&self, _arguments: Value, _ctx: &ToolContext) -> ToolOutput {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        ToolOutput::ok(json!({ "collected": n })).with_partial(format!("p{n}"))
    }
}

// ============================================================================
// Scenario 1: simple-mode echo
// ============================================================================

#[tokio::test]
async fn simple_mode_is_one_call_with_trivial_chain() {
    let skill = make_skill("echo", "Please repeat: $ARGUMENTS", |m| {
        m.execution_mode = Some(ExecutionMode::Simple);
    });
    let (orchestrator, llm) = orchestrator_with(
        vec![skill],
        vec![ScriptedResponse::text("hello")],
        ToolRegistry::new(),
    );

    let report = orchestrator
        .run(ExecuteRequest::new("echo", "hello"))
        .await
        .unwrap();

    assert_eq!(report.outcome.answer(), Some("hello"));
    assert_eq!(llm.calls(), 1);

    let types: Vec<StepType> = report.chain.steps.iter().map(|s| s.step_type()).collect();
    assert_eq!(types, vec![StepType::Thinking, StepType::Synthesis]);
    assert_eq!(report.chain.metrics.tool_calls, 0);

    // The preprocessed body reached the LLM with the request substituted
    let log = llm.call_log().await;
    assert!(log[0][0].content.contains("Please repeat: hello"));
}

// ============================================================================
// Scenario 2: tool dispatch with truncation
// ============================================================================

#[tokio::test]
async fn truncatable_fields_are_trimmed_with_a_note() {
    let matches: Vec<Value> = (0..1000).map(|i| json!(format!("file{i}.py"))).collect();
    let glob = StaticTool::new("glob", json!({}))
        .with_output(
            ToolOutput::ok(json!({
                "matches": matches,
                "match_count": 1000,
                "pattern": "*.py",
            }))
            .with_truncatable(vec!["matches".to_string()]),
        )
        .with_parameters(vec![ToolParameter::required("pattern", ParamKind::String)]);

    let skill = make_skill("finder", "Find files matching the request.", |m| {
        m.allowed_tools = vec!["glob".to_string()];
    });

    let mut tools = ToolRegistry::new();
    tools.register(glob);

    let (orchestrator, _llm) = orchestrator_with(
        vec![skill],
        vec![
            ScriptedResponse::action("glob", json!({"pattern": "*.py"})),
            ScriptedResponse::final_answer("There are 1000 Python files."),
        ],
        tools,
    );

    let report = orchestrator
        .run(ExecuteRequest::new("finder", "find *.py"))
        .await
        .unwrap();

    assert!(report.outcome.is_success());

    let types: Vec<StepType> = report.chain.steps.iter().map(|s| s.step_type()).collect();
    assert_eq!(
        types,
        vec![
            StepType::Thinking,
            StepType::ToolCall,
            StepType::ToolResult,
            StepType::Thinking,
            StepType::Synthesis,
        ]
    );

    let StepPayload::ToolResult { result, .. } = &report.chain.steps[2].payload else {
        panic!("step 3 must be a tool result");
    };
    let value = result.value.as_ref().unwrap();
    assert_eq!(value["matches"].as_array().unwrap().len(), 10);
    assert_eq!(value["match_count"], 1000);
    assert_eq!(value["matches_truncation_note"], "Showing 10 of 1000 items");
}

// ============================================================================
// Scenario 3: retry then success
// ============================================================================

#[tokio::test]
async fn transient_failures_retry_inside_one_chain_record() {
    let flaky = Arc::new(FlakyTool::new(2, json!(42)));
    let mut tools = ToolRegistry::new();
    tools.register_arc(flaky.clone());

    let skill = make_skill("sturdy", "Use the flaky tool.", |m| {
        m.allowed_tools = vec!["flaky".to_string()];
        m.max_retries_per_tool = Some(3);
    });

    let (orchestrator, _llm) = orchestrator_with(
        vec![skill],
        vec![
            ScriptedResponse::action("flaky", json!({})),
            ScriptedResponse::final_answer("42"),
        ],
        tools,
    );

    let report = orchestrator
        .run(ExecuteRequest::new("sturdy", "get the number"))
        .await
        .unwrap();

    assert!(report.outcome.is_success());
    assert_eq!(flaky.calls(), 3);

    // Dispatcher-internal attempts are not separate chain steps
    let calls = report
        .chain
        .steps
        .iter()
        .filter(|s| s.step_type() == StepType::ToolCall)
        .count();
    let results: Vec<_> = report
        .chain
        .steps
        .iter()
        .filter_map(|s| match &s.payload {
            StepPayload::ToolResult { result, .. } => Some(result),
            _ => None,
        })
        .collect();
    assert_eq!(calls, 1);
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert_eq!(results[0].value.as_ref().unwrap(), &json!(42));
    assert_eq!(results[0].attempt_count, 3);
}

// ============================================================================
// Scenario 4: allowed-tools enforcement
// ============================================================================

#[tokio::test]
async fn scope_denial_is_observed_and_tool_never_runs() {
    let write = Arc::new(StaticTool::new("write", json!({"ok": true})));
    let mut tools = ToolRegistry::new();
    tools.register_arc(write.clone());

    let skill = make_skill("read-only", "Never write anything.", |m| {
        m.allowed_tools = vec!["read".to_string()];
    });

    let (orchestrator, _llm) = orchestrator_with(
        vec![skill],
        vec![
            ScriptedResponse::action("write", json!({"path": "x.md", "content": "y"})),
            ScriptedResponse::final_answer("I could not write, so I stopped."),
        ],
        tools,
    );

    let report = orchestrator
        .run(ExecuteRequest::new("read-only", "write something"))
        .await
        .unwrap();

    // The loop continued to a final answer
    assert!(report.outcome.is_success());
    // No filesystem mutation: the mock was never invoked
    assert_eq!(write.calls(), 0);

    let denial = report
        .chain
        .steps
        .iter()
        .find_map(|s| match &s.payload {
            StepPayload::ToolResult { result, .. } if !result.success => Some(result),
            _ => None,
        })
        .expect("chain records the denial");
    assert_eq!(denial.error_kind(), Some(ErrorKind::ToolNotPermitted));
}

// ============================================================================
// Scenario 5: sub-agent depth limit
// ============================================================================

#[tokio::test]
async fn grandchild_spawn_fails_and_ancestors_continue() {
    let delegating_body = "Delegate when asked.";
    let parent = make_skill("parent", delegating_body, |m| {
        m.allowed_tools = vec!["sub_agent".to_string()];
    });
    let skill_a = make_skill("skill-a", delegating_body, |m| {
        m.allowed_tools = vec!["sub_agent".to_string()];
    });
    let skill_b = make_skill("skill-b", delegating_body, |m| {
        m.allowed_tools = vec!["sub_agent".to_string()];
    });
    let skill_c = make_skill("skill-c", "Never reached.", |m| {
        m.allowed_tools = vec!["sub_agent".to_string()];
    });

    // Depth-first call order: parent, A, B, B again (after the depth
    // error), A again, parent again.
    let (orchestrator, llm) = orchestrator_with(
        vec![parent, skill_a, skill_b, skill_c],
        vec![
            ScriptedResponse::action("sub_agent", json!({"skill": "skill-a", "request": "go"})),
            ScriptedResponse::action("sub_agent", json!({"skill": "skill-b", "request": "go"})),
            ScriptedResponse::action("sub_agent", json!({"skill": "skill-c", "request": "go"})),
            ScriptedResponse::final_answer("b-done"),
            ScriptedResponse::final_answer("a-done"),
            ScriptedResponse::final_answer("parent-done"),
        ],
        ToolRegistry::new(),
    );

    let report = orchestrator
        .run(ExecuteRequest::new("parent", "delegate twice"))
        .await
        .unwrap();

    assert_eq!(report.outcome.answer(), Some("parent-done"));
    assert_eq!(llm.calls(), 6);

    // The parent's own chain holds exactly one sub-agent call, resolved
    // with the child's summary; the grandchild failure stayed in B's chain.
    let results: Vec<_> = report
        .chain
        .steps
        .iter()
        .filter_map(|s| match &s.payload {
            StepPayload::ToolResult { result, .. } => Some(result),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    let summary = results[0].value.as_ref().unwrap();
    assert_eq!(summary["outcome"], "success");
    assert_eq!(summary["answer"], "a-done");
}

// ============================================================================
// Scenario 6: iteration budget exhaustion with partials
// ============================================================================

#[tokio::test]
async fn exhausted_budget_salvages_partial_results() {
    let mut tools = ToolRegistry::new();
    tools.register(PartialTool::new());

    let skill = make_skill("collector", "Collect items forever.", |m| {
        m.allowed_tools = vec!["collect".to_string()];
        m.max_iterations = Some(3);
    });

    let (orchestrator, _llm) = orchestrator_with(
        vec![skill],
        vec![
            ScriptedResponse::action("collect", json!({})),
            ScriptedResponse::action("collect", json!({})),
            ScriptedResponse::action("collect", json!({})),
        ],
        tools,
    );

    let report = orchestrator
        .run(ExecuteRequest::new("collector", "collect everything"))
        .await
        .unwrap();

    match &report.outcome {
        ExecutionOutcome::PartialSuccess { partials, reason } => {
            assert_eq!(partials, &["p1", "p2", "p3"]);
            assert_eq!(*reason, ErrorKind::IterationLimitExhausted);
        }
        other => panic!("expected partial success, got {other:?}"),
    }
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[tokio::test]
async fn immediate_final_answer_succeeds_in_one_iteration() {
    let skill = make_skill("quick", "Answer immediately.", |m| {
        m.max_iterations = Some(1);
    });

    let (orchestrator, llm) = orchestrator_with(
        vec![skill],
        vec![ScriptedResponse::final_answer("done")],
        ToolRegistry::new(),
    );

    let report = orchestrator
        .run(ExecuteRequest::new("quick", "hurry"))
        .await
        .unwrap();

    assert_eq!(report.outcome.answer(), Some("done"));
    assert_eq!(llm.calls(), 1);

    let types: Vec<StepType> = report.chain.steps.iter().map(|s| s.step_type()).collect();
    assert_eq!(types, vec![StepType::Thinking, StepType::Synthesis]);
}

#[tokio::test]
async fn iteration_timeout_spends_the_iteration() {
    let skill = make_skill("slow", "Take your time.", |m| {
        m.max_iterations = Some(1);
        m.timeout_per_iteration = Some(std::time::Duration::from_secs(1));
    });

    let (orchestrator, _llm) = orchestrator_with(
        vec![skill],
        vec![ScriptedResponse::final_answer("too late")
            .with_delay(std::time::Duration::from_secs(5))],
        ToolRegistry::new(),
    );

    let report = orchestrator
        .run(ExecuteRequest::new("slow", "think hard"))
        .await
        .unwrap();

    match &report.outcome {
        ExecutionOutcome::Failure { reason, .. } => {
            assert_eq!(*reason, ErrorKind::IterationLimitExhausted);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_returns_canceled_outcome() {
    let skill = make_skill("cancelable", "Work until canceled.", |m| {
        m.max_iterations = Some(10);
    });

    let (orchestrator, _llm) = orchestrator_with(
        vec![skill],
        vec![ScriptedResponse::final_answer("never delivered")
            .with_delay(std::time::Duration::from_secs(30))],
        ToolRegistry::new(),
    );

    let cancel = CancellationToken::new();
    let request = ExecuteRequest::new("cancelable", "run").with_cancel(cancel.clone());

    let handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(request).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    cancel.cancel();

    let report = handle.await.unwrap().unwrap();
    assert!(matches!(report.outcome, ExecutionOutcome::Canceled { .. }));
}

#[tokio::test]
async fn unknown_skill_fails_with_error_and_done_events() {
    let (orchestrator, _llm) =
        orchestrator_with(vec![], vec![], ToolRegistry::new());

    let request = ExecuteRequest::new("missing", "anything");
    let task_id = request.task_id;
    let mut events = orchestrator.execute(request).await;

    let first = events.next().await.unwrap();
    match &first {
        skillrun_core::ExecutionEvent::Error { kind, .. } => {
            assert_eq!(*kind, ErrorKind::SkillNotFound);
        }
        other => panic!("expected error event, got {other:?}"),
    }
    assert_eq!(first.task_id(), task_id);

    let second = events.next().await.unwrap();
    assert!(second.is_done());
}

#[tokio::test]
async fn event_stream_brackets_execution_with_status_and_done() {
    let skill = make_skill("quick", "Answer immediately.", |m| {
        m.max_iterations = Some(1);
    });
    let (orchestrator, _llm) = orchestrator_with(
        vec![skill],
        vec![ScriptedResponse::final_answer("done")],
        ToolRegistry::new(),
    );

    let mut events = orchestrator
        .execute(ExecuteRequest::new("quick", "hurry"))
        .await;

    let mut collected = Vec::new();
    while let Some(event) = events.next().await {
        let done = event.is_done();
        collected.push(event);
        if done {
            break;
        }
    }

    assert!(matches!(
        collected.first(),
        Some(skillrun_core::ExecutionEvent::Status { .. })
    ));
    assert!(collected.last().unwrap().is_done());
}

// ============================================================================
// Chain invariants over a real execution
// ============================================================================

#[tokio::test]
async fn chain_invariants_hold_after_execution() {
    let matches: Vec<Value> = (0..20).map(|i| json!(i)).collect();
    let glob = StaticTool::new("glob", json!({}))
        .with_output(
            ToolOutput::ok(json!({"matches": matches, "match_count": 20}))
                .with_truncatable(vec!["matches".to_string()]),
        )
        .with_parameters(vec![ToolParameter::required("pattern", ParamKind::String)]);
    let mut tools = ToolRegistry::new();
    tools.register(glob);

    let skill = make_skill("finder", "Find things.", |m| {
        m.allowed_tools = vec!["glob".to_string()];
    });

    let (orchestrator, _llm) = orchestrator_with(
        vec![skill],
        vec![
            ScriptedResponse::action("glob", json!({"pattern": "*"})),
            ScriptedResponse::action("glob", json!({"pattern": "*.rs"})),
            ScriptedResponse::final_answer("done"),
        ],
        tools,
    );

    let report = orchestrator
        .run(ExecuteRequest::new("finder", "look around"))
        .await
        .unwrap();

    // Dense, strictly increasing step numbers
    for (i, step) in report.chain.steps.iter().enumerate() {
        assert_eq!(step.step_number, i as u64 + 1);
    }

    // Every TOOL_RESULT pairs with exactly one earlier TOOL_CALL
    for (index, step) in report.chain.steps.iter().enumerate() {
        if step.step_type() != StepType::ToolResult {
            continue;
        }
        let correlation = step.correlation_id.as_deref().expect("result correlation");
        let earlier_calls = report.chain.steps[..index]
            .iter()
            .filter(|s| {
                s.step_type() == StepType::ToolCall
                    && s.correlation_id.as_deref() == Some(correlation)
            })
            .count();
        assert_eq!(earlier_calls, 1);
    }

    // Metrics equal the pointwise sums
    let tokens: u64 = report
        .chain
        .steps
        .iter()
        .map(|s| u64::from(s.tokens_used))
        .sum();
    assert_eq!(report.chain.metrics.total_tokens, tokens);
}
