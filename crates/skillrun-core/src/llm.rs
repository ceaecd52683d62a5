// Provider-agnostic LLM call types
//
// The core never speaks a provider wire protocol; it hands an LlmRequest to
// whatever implements the LlmProvider trait and consumes the response text
// plus usage accounting.

use tokio_util::sync::CancellationToken;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

/// One message in the conversation sent to the provider.
#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::Assistant,
            content: content.into(),
        }
    }
}

/// A single LLM call.
///
/// `cancel` is the execution's cancellation propagator; providers must honor
/// it at their next safe point. The driver additionally enforces the
/// per-iteration deadline around the call.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<LlmMessage>,
    pub model: String,
    pub temperature: f32,
    pub cancel: CancellationToken,
}

/// Response from an LLM call.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    pub tokens_used: u32,
    pub cost_usd: f64,
    pub model: Option<String>,
}

impl LlmResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, tokens: u32, cost_usd: f64) -> Self {
        self.tokens_used = tokens;
        self.cost_usd = cost_usd;
        self
    }
}
