// Minimal end-to-end wiring: an in-memory skill registry, a scripted LLM,
// and the orchestrator streaming events for one execution.
//
// Run with: cargo run --example skill_echo

use std::sync::Arc;

use futures::StreamExt;

use skillrun_core::memory::{ScriptedLlmProvider, ScriptedResponse};
use skillrun_core::{
    ExecuteRequest, ExecutionMode, Orchestrator, PlatformConfig, Skill, SkillDocument,
    SkillMetadata, SkillRegistry, ToolRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("skillrun_core=debug")
        .init();

    // A simple-mode skill: one LLM call on the preprocessed body
    let mut metadata = SkillMetadata::new("echo", "Repeats the request back");
    metadata.execution_mode = Some(ExecutionMode::Simple);
    let skill = Skill::new(
        SkillDocument {
            metadata,
            body: "Please repeat: $ARGUMENTS".to_string(),
        },
        std::env::temp_dir(),
        skillrun_core::SourceLayer::Project,
    )?;

    let registry = SkillRegistry::new();
    registry.register(skill);

    let llm = Arc::new(ScriptedLlmProvider::new(vec![ScriptedResponse::text(
        "hello, hello",
    )]));

    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        llm,
        ToolRegistry::new(),
        PlatformConfig::default(),
    );

    let mut events = orchestrator
        .execute(ExecuteRequest::new("echo", "hello"))
        .await;

    while let Some(event) = events.next().await {
        let done = event.is_done();
        println!("{}", serde_json::to_string(&event)?);
        if done {
            break;
        }
    }

    Ok(())
}
