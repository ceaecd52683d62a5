// Tool call, result, and parameter schema types
//
// Design decision: tools are identified by name (string); the core looks
// them up in a registry. Results carry optional usage accounting and a list
// of truncatable field names the dispatcher may trim before recording.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error_kind::ErrorKind;

/// A tool invocation requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id linking this call to its result
    pub id: String,
    /// Tool name to execute
    pub name: String,
    /// Arguments as JSON
    pub arguments: Value,
}

/// Structured tool failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ToolError {
    /// A transient failure the dispatcher may retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ToolTransientError,
            message: message.into(),
            retryable: true,
        }
    }

    /// A fatal failure; no retry.
    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn not_permitted(message: impl Into<String>) -> Self {
        Self::fatal(ErrorKind::ToolNotPermitted, message)
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::fatal(ErrorKind::ArgumentValidationError, message)
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of one dispatched tool call.
///
/// Dispatcher-internal retry attempts are not separate records; the final
/// result carries `attempt_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Correlation id of the originating call
    pub tool_call_id: String,
    pub success: bool,
    /// Result payload on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Failure details on error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    /// Names of value fields the dispatcher may trim before recording
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truncatable_fields: Vec<String>,
    /// Salvageable fragment preserved when the execution ends early
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_value: Option<String>,
    /// Number of attempts the dispatcher made (1 = first try succeeded)
    #[serde(default = "default_attempt_count")]
    pub attempt_count: u32,
}

fn default_attempt_count() -> u32 {
    1
}

impl ToolResult {
    /// Create a successful result.
    pub fn ok(tool_call_id: impl Into<String>, value: Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: true,
            value: Some(value),
            error: None,
            tokens_used: None,
            cost_usd: None,
            truncatable_fields: Vec::new(),
            partial_value: None,
            attempt_count: 1,
        }
    }

    /// Create a failed result.
    pub fn failed(tool_call_id: impl Into<String>, error: ToolError) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: false,
            value: None,
            error: Some(error),
            tokens_used: None,
            cost_usd: None,
            truncatable_fields: Vec::new(),
            partial_value: None,
            attempt_count: 1,
        }
    }

    pub fn with_usage(mut self, tokens: u32, cost_usd: f64) -> Self {
        self.tokens_used = Some(tokens);
        self.cost_usd = Some(cost_usd);
        self
    }

    pub fn with_partial(mut self, partial: impl Into<String>) -> Self {
        self.partial_value = Some(partial.into());
        self
    }

    pub fn with_truncatable(mut self, fields: Vec<String>) -> Self {
        self.truncatable_fields = fields;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempt_count = attempts;
        self
    }

    /// The error kind, if this result is a failure.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Parameter kind for tool schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Float,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    /// Whether a JSON value matches this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Float => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
        }
    }
}

/// Constraints on a single tool parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub one_of: Vec<String>,
}

/// Declared parameter in a tool schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub constraints: ParamConstraints,
}

impl ToolParameter {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            description: String::new(),
            constraints: ParamConstraints::default(),
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            description: String::new(),
            constraints: ParamConstraints::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_constraints(mut self, constraints: ParamConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Validate one supplied value against this parameter's declaration.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        if !self.kind.accepts(value) {
            return Err(format!(
                "parameter '{}' expects {:?}, got {}",
                self.name,
                self.kind,
                json_type_name(value)
            ));
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.constraints.min {
                if n < min {
                    return Err(format!("parameter '{}' below minimum {}", self.name, min));
                }
            }
            if let Some(max) = self.constraints.max {
                if n > max {
                    return Err(format!("parameter '{}' above maximum {}", self.name, max));
                }
            }
        }

        if let Some(s) = value.as_str() {
            if let Some(max_len) = self.constraints.max_length {
                if s.len() > max_len {
                    return Err(format!(
                        "parameter '{}' exceeds max length {}",
                        self.name, max_len
                    ));
                }
            }
            if !self.constraints.one_of.is_empty()
                && !self.constraints.one_of.iter().any(|v| v == s)
            {
                return Err(format!(
                    "parameter '{}' must be one of {:?}",
                    self.name, self.constraints.one_of
                ));
            }
        }

        Ok(())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
