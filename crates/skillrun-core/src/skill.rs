// Skill model - parsed skill document plus execution configuration
//
// A Skill is immutable once constructed. The loader parses the on-disk
// document (see document.rs); the core only reads from the model.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{self, SkillDocument};
use crate::error::{ExecutionError, Result};

/// Where a skill was defined. Higher-precedence layers shadow lower ones
/// when the same name is registered in several layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLayer {
    Project,
    Personal,
    Enterprise,
    Platform,
}

impl SourceLayer {
    /// Precedence rank; larger wins. Enterprise policy shadows project
    /// skills, which shadow personal ones; platform built-ins lose to all.
    pub fn precedence(&self) -> u8 {
        match self {
            SourceLayer::Enterprise => 3,
            SourceLayer::Project => 2,
            SourceLayer::Personal => 1,
            SourceLayer::Platform => 0,
        }
    }
}

/// How the skill is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Full ReAct loop with tool dispatch
    #[default]
    Autonomous,
    /// A single LLM call on the preprocessed body; iteration config ignored
    Simple,
}

/// A supporting file referenced from the skill body.
///
/// Files are inventoried at preprocessing time and loaded only when the LLM
/// requests them via the `read` tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    /// Path relative to the skill directory
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_lines: Option<u32>,
}

impl FileReference {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            description: None,
            estimated_lines: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// An allowed-tools pattern: either an exact tool name (`read`) or a name
/// with an argument prefix filter (`bash(git:*)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPattern {
    raw: String,
    tool: String,
    arg_prefix: Option<String>,
}

impl ToolPattern {
    /// Parse a pattern string. Accepted forms: `name`, `name(prefix:*)`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ExecutionError::document("empty allowed-tools pattern"));
        }

        if let Some(open) = raw.find('(') {
            let close = raw
                .rfind(')')
                .filter(|c| *c > open)
                .ok_or_else(|| {
                    ExecutionError::document(format!("unclosed tool pattern '{raw}'"))
                })?;
            let tool = raw[..open].trim();
            let filter = raw[open + 1..close].trim();
            let prefix = filter.strip_suffix(":*").ok_or_else(|| {
                ExecutionError::document(format!(
                    "unsupported argument filter '{filter}' in '{raw}'; only 'prefix:*' is supported"
                ))
            })?;
            if tool.is_empty() || prefix.is_empty() {
                return Err(ExecutionError::document(format!(
                    "malformed tool pattern '{raw}'"
                )));
            }
            Ok(Self {
                raw: raw.to_string(),
                tool: tool.to_string(),
                arg_prefix: Some(prefix.to_string()),
            })
        } else {
            Ok(Self {
                raw: raw.to_string(),
                tool: raw.to_string(),
                arg_prefix: None,
            })
        }
    }

    /// The tool name this pattern applies to.
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// The original pattern text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether this pattern permits a call to `tool_name` with `arguments`.
    ///
    /// For prefixed patterns the first whitespace token of the tool's
    /// `command` argument (or of a bare string argument) must start with
    /// the prefix.
    pub fn permits(&self, tool_name: &str, arguments: &Value) -> bool {
        if self.tool != tool_name {
            return false;
        }
        match &self.arg_prefix {
            None => true,
            Some(prefix) => first_token(arguments)
                .map(|token| token.starts_with(prefix.as_str()))
                .unwrap_or(false),
        }
    }

    /// Whether this pattern permits a raw command string (used by the
    /// preprocessor's dynamic-injection gate, which has no JSON arguments).
    pub fn permits_command(&self, tool_name: &str, command: &str) -> bool {
        if self.tool != tool_name {
            return false;
        }
        match &self.arg_prefix {
            None => true,
            Some(prefix) => command
                .split_whitespace()
                .next()
                .map(|token| token.starts_with(prefix.as_str()))
                .unwrap_or(false),
        }
    }
}

/// The first whitespace token of the argument payload: the `command` field
/// of an object, or the value itself when it is a bare string.
fn first_token(arguments: &Value) -> Option<&str> {
    let text = match arguments {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("command")?.as_str()?,
        _ => return None,
    };
    text.split_whitespace().next()
}

/// Validated skill metadata from the document frontmatter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillMetadata {
    /// Unique name within a layer: lower-kebab, at most 64 chars
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries_per_tool: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_per_iteration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_termination: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl SkillMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version: None,
            execution_mode: None,
            max_iterations: None,
            max_retries_per_tool: None,
            timeout_per_iteration: None,
            model: None,
            temperature: None,
            allowed_tools: Vec::new(),
            early_termination: None,
            priority: None,
        }
    }

    /// Validate identity and configuration ranges.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > 64 {
            return Err(ExecutionError::document(
                "skill name must be 1-64 characters",
            ));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ExecutionError::document(
                "skill name must contain only lowercase letters, digits, and hyphens",
            ));
        }
        if self.description.is_empty() {
            return Err(ExecutionError::document("skill description is required"));
        }
        if let Some(n) = self.max_iterations {
            if !(1..=100).contains(&n) {
                return Err(ExecutionError::document("max-iterations must be in 1..=100"));
            }
        }
        if let Some(n) = self.max_retries_per_tool {
            if !(1..=10).contains(&n) {
                return Err(ExecutionError::document(
                    "max-retries-per-tool must be in 1..=10",
                ));
            }
        }
        if let Some(t) = self.timeout_per_iteration {
            let ms = t.as_millis();
            if !(1_000..=300_000).contains(&ms) {
                return Err(ExecutionError::document(
                    "timeout-per-iteration must be between 1s and 300s",
                ));
            }
        }
        if let Some(temp) = self.temperature {
            if !(0.0..=2.0).contains(&temp) {
                return Err(ExecutionError::document("temperature must be in 0.0..=2.0"));
            }
        }
        for pattern in &self.allowed_tools {
            ToolPattern::parse(pattern)?;
        }
        Ok(())
    }
}

/// An immutable, validated skill: metadata, body, supporting files, and the
/// directory it was loaded from.
#[derive(Debug, Clone)]
pub struct Skill {
    metadata: SkillMetadata,
    layer: SourceLayer,
    body: String,
    directory: PathBuf,
    supporting_files: Vec<FileReference>,
    allowed_tools: Vec<ToolPattern>,
}

impl Skill {
    /// Construct a skill from a parsed document.
    pub fn new(doc: SkillDocument, directory: impl Into<PathBuf>, layer: SourceLayer) -> Result<Self> {
        doc.metadata.validate()?;
        let allowed_tools = doc
            .metadata
            .allowed_tools
            .iter()
            .map(|p| ToolPattern::parse(p))
            .collect::<Result<Vec<_>>>()?;
        let supporting_files = document::extract_file_references(&doc.body);

        Ok(Self {
            metadata: doc.metadata,
            layer,
            body: doc.body,
            directory: directory.into(),
            supporting_files,
            allowed_tools,
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn layer(&self) -> SourceLayer {
        self.layer
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn metadata(&self) -> &SkillMetadata {
        &self.metadata
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn supporting_files(&self) -> &[FileReference] {
        &self.supporting_files
    }

    pub fn allowed_tools(&self) -> &[ToolPattern] {
        &self.allowed_tools
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.metadata.execution_mode.unwrap_or_default()
    }

    /// Whether the active allowed-tools set permits this call.
    pub fn permits(&self, tool_name: &str, arguments: &Value) -> bool {
        self.allowed_tools
            .iter()
            .any(|p| p.permits(tool_name, arguments))
    }
}

/// Load a skill from a directory containing a `SKILL.md` document.
pub async fn load_skill_from_dir(dir: impl AsRef<Path>, layer: SourceLayer) -> Result<Skill> {
    let dir = dir.as_ref();
    let doc_path = dir.join("SKILL.md");
    let text = tokio::fs::read_to_string(&doc_path).await.map_err(|e| {
        ExecutionError::document(format!("cannot read {}: {e}", doc_path.display()))
    })?;
    let doc = document::parse_skill_document(&text)?;
    Skill::new(doc, dir, layer)
}

/// In-memory layered skill registry.
///
/// Resolution picks, among all skills registered under a name, the one from
/// the highest-precedence layer; ties break on the skill's `priority`, then
/// registration order.
#[derive(Default)]
pub struct SkillRegistry {
    skills: RwLock<HashMap<String, Vec<Arc<Skill>>>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, skill: Skill) {
        self.register_arc(Arc::new(skill));
    }

    pub fn register_arc(&self, skill: Arc<Skill>) {
        self.skills
            .write()
            .expect("skill registry lock poisoned")
            .entry(skill.name().to_string())
            .or_default()
            .push(skill);
    }

    /// Resolve a skill by name, honoring layer precedence and priority.
    pub fn resolve(&self, name: &str) -> Option<Arc<Skill>> {
        let skills = self.skills.read().expect("skill registry lock poisoned");
        let candidates = skills.get(name)?;
        candidates
            .iter()
            .enumerate()
            .max_by_key(|(index, s)| {
                (
                    s.layer().precedence(),
                    s.metadata().priority.unwrap_or(0),
                    // Later registrations win exact ties
                    *index,
                )
            })
            .map(|(_, s)| s.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.skills
            .read()
            .expect("skill registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.skills
            .read()
            .expect("skill registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(name: &str) -> SkillDocument {
        SkillDocument {
            metadata: SkillMetadata::new(name, "a test skill"),
            body: "Do the thing.".to_string(),
        }
    }

    #[test]
    fn test_tool_pattern_exact() {
        let pattern = ToolPattern::parse("read").unwrap();
        assert!(pattern.permits("read", &json!({"path": "x.md"})));
        assert!(!pattern.permits("write", &json!({})));
    }

    #[test]
    fn test_tool_pattern_arg_prefix() {
        let pattern = ToolPattern::parse("bash(git:*)").unwrap();
        assert!(pattern.permits("bash", &json!({"command": "git status"})));
        assert!(pattern.permits("bash", &json!("git log --oneline")));
        assert!(!pattern.permits("bash", &json!({"command": "rm -rf /"})));
        assert!(!pattern.permits("sh", &json!({"command": "git status"})));
    }

    #[test]
    fn test_tool_pattern_permits_command() {
        let pattern = ToolPattern::parse("bash(git:*)").unwrap();
        assert!(pattern.permits_command("bash", "git rev-parse HEAD"));
        assert!(!pattern.permits_command("bash", "cargo build"));
    }

    #[test]
    fn test_tool_pattern_rejects_malformed() {
        assert!(ToolPattern::parse("bash(git:*").is_err());
        assert!(ToolPattern::parse("bash(regex:.+)").is_err());
        assert!(ToolPattern::parse("").is_err());
    }

    #[test]
    fn test_metadata_validation() {
        let mut meta = SkillMetadata::new("my-skill", "desc");
        assert!(meta.validate().is_ok());

        meta.name = "Bad Name".to_string();
        assert!(meta.validate().is_err());

        meta.name = "ok".to_string();
        meta.max_iterations = Some(0);
        assert!(meta.validate().is_err());

        meta.max_iterations = Some(5);
        meta.temperature = Some(3.0);
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_registry_layer_precedence() {
        let registry = SkillRegistry::new();
        registry.register(Skill::new(doc("deploy"), "/tmp/a", SourceLayer::Personal).unwrap());
        registry.register(Skill::new(doc("deploy"), "/tmp/b", SourceLayer::Project).unwrap());
        registry.register(Skill::new(doc("deploy"), "/tmp/c", SourceLayer::Platform).unwrap());

        let resolved = registry.resolve("deploy").unwrap();
        assert_eq!(resolved.layer(), SourceLayer::Project);
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn test_registry_priority_breaks_ties() {
        let mut low = doc("fmt");
        low.metadata.priority = Some(1);
        let mut high = doc("fmt");
        high.metadata.priority = Some(9);

        let registry = SkillRegistry::new();
        registry.register(Skill::new(high, "/tmp/high", SourceLayer::Project).unwrap());
        registry.register(Skill::new(low, "/tmp/low", SourceLayer::Project).unwrap());

        let resolved = registry.resolve("fmt").unwrap();
        assert_eq!(resolved.metadata().priority, Some(9));
    }
}
