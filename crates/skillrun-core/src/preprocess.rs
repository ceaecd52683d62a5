// Skill body preprocessing
//
// Pipeline: variable substitution -> dynamic command injection ->
// supporting-file inventory. Deterministic and single-pass; the output
// LoadedContext becomes the LLM's initial system prompt. Supporting files
// are listed, never loaded - they enter context only when the LLM requests
// them through the `read` tool (progressive disclosure).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ExecutionError, Result};
use crate::skill::{FileReference, Skill};

/// Wall-clock bound for one injected command.
pub const INJECTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Captured stdout bound for one injected command.
pub const INJECTION_OUTPUT_LIMIT: usize = 256 * 1024;

/// Tracing target for dynamic-injection audit records.
pub const AUDIT_TARGET: &str = "skillrun::audit";

// ============================================================================
// Variable substitution
// ============================================================================

/// Values available to `${...}` and `$NAME` forms in a skill body.
#[derive(Debug, Clone)]
pub struct VariableContext {
    pub arguments: String,
    pub session_id: String,
    pub skill_dir: PathBuf,
    pub workspace: PathBuf,
    pub user: String,
    /// Execution date, `YYYY-MM-DD`
    pub date: String,
    pub custom: HashMap<String, String>,
}

impl VariableContext {
    pub fn new(
        arguments: impl Into<String>,
        session_id: impl Into<String>,
        skill_dir: impl Into<PathBuf>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            arguments: arguments.into(),
            session_id: session_id.into(),
            skill_dir: skill_dir.into(),
            workspace: workspace.into(),
            user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            date: Utc::now().format("%Y-%m-%d").to_string(),
            custom: HashMap::new(),
        }
    }

    pub fn with_custom(mut self, custom: HashMap<String, String>) -> Self {
        self.custom = custom;
        self
    }

    fn resolve(&self, name: &str) -> Option<String> {
        match name {
            "ARGUMENTS" => Some(self.arguments.clone()),
            "CLAUDE_SESSION_ID" | "SESSION_ID" => Some(self.session_id.clone()),
            "SKILL_DIR" => Some(self.skill_dir.display().to_string()),
            "WORKSPACE" => Some(self.workspace.display().to_string()),
            "USER" => Some(self.user.clone()),
            "DATE" => Some(self.date.clone()),
            other => self.custom.get(other).cloned(),
        }
    }
}

/// Outcome of variable substitution. Undefined variables are left literal
/// and reported here rather than raised.
#[derive(Debug, Clone)]
pub struct SubstitutionResult {
    pub text: String,
    pub undefined_vars: Vec<String>,
    /// Whether `$ARGUMENTS` (either form) appeared in the body
    pub arguments_present: bool,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Single-pass, left-to-right substitution. `${NAME}` takes precedence over
/// `$NAME` when both could match at a position.
pub fn substitute_variables(body: &str, vars: &VariableContext) -> SubstitutionResult {
    let mut out = String::with_capacity(body.len());
    let mut undefined: Vec<String> = Vec::new();
    let mut arguments_present = false;

    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            let ch_len = utf8_len(bytes[i]);
            out.push_str(&body[i..i + ch_len]);
            i += ch_len;
            continue;
        }

        // Braced form first
        if bytes.get(i + 1) == Some(&b'{') {
            if let Some(close) = body[i + 2..].find('}') {
                let name = &body[i + 2..i + 2 + close];
                if !name.is_empty()
                    && name.chars().next().map(is_ident_start).unwrap_or(false)
                    && name.chars().all(is_ident_char)
                {
                    substitute_one(
                        name,
                        true,
                        vars,
                        &mut out,
                        &mut undefined,
                        &mut arguments_present,
                    );
                    i += 2 + close + 1;
                    continue;
                }
            }
            out.push('$');
            i += 1;
            continue;
        }

        // Bare form
        let rest = &body[i + 1..];
        let name_len = rest
            .char_indices()
            .take_while(|(idx, c)| {
                if *idx == 0 {
                    is_ident_start(*c)
                } else {
                    is_ident_char(*c)
                }
            })
            .count();
        if name_len == 0 {
            out.push('$');
            i += 1;
            continue;
        }
        let name: String = rest.chars().take(name_len).collect();
        substitute_one(
            &name,
            false,
            vars,
            &mut out,
            &mut undefined,
            &mut arguments_present,
        );
        i += 1 + name.len();
    }

    SubstitutionResult {
        text: out,
        undefined_vars: undefined,
        arguments_present,
    }
}

fn substitute_one(
    name: &str,
    braced: bool,
    vars: &VariableContext,
    out: &mut String,
    undefined: &mut Vec<String>,
    arguments_present: &mut bool,
) {
    match vars.resolve(name) {
        Some(value) => {
            if name == "ARGUMENTS" {
                *arguments_present = true;
            }
            out.push_str(&value);
        }
        None => {
            if !undefined.iter().any(|n| n == name) {
                undefined.push(name.to_string());
            }
            // Left literally in its original form
            if braced {
                out.push_str("${");
                out.push_str(name);
                out.push('}');
            } else {
                out.push('$');
                out.push_str(name);
            }
        }
    }
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

// ============================================================================
// Path normalization
// ============================================================================

/// Replace absolute skill-directory paths with `${SKILL_DIR}` before a body
/// is stored. Applies only to text the core writes; execution-time variable
/// substitution reverses it.
pub fn normalize_skill_paths(text: &str, skill_dir: &Path) -> String {
    let dir = skill_dir.display().to_string();
    if dir.is_empty() || dir == "/" {
        return text.to_string();
    }
    text.replace(&dir, "${SKILL_DIR}")
}

// ============================================================================
// Dynamic command injection
// ============================================================================

/// One injection attempt, for auditing and tests.
#[derive(Debug, Clone)]
pub struct InjectionRecord {
    pub command: String,
    pub allowed: bool,
    pub exit_code: Option<i32>,
}

/// Result of running the injection stage over a body.
#[derive(Debug, Clone)]
pub struct InjectionOutcome {
    pub text: String,
    pub records: Vec<InjectionRecord>,
}

fn injection_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"!`([^`]+)`").unwrap())
}

/// Shell constructs that disqualify a command outright.
fn rejected_metachar(command: &str) -> Option<&'static str> {
    const SEQUENCES: [(&str, &str); 7] = [
        (";", ";"),
        ("&&", "&&"),
        ("||", "||"),
        ("|", "|"),
        (">", ">"),
        ("<", "<"),
        ("$(", "$("),
    ];
    for (needle, name) in SEQUENCES {
        if command.contains(needle) {
            return Some(name);
        }
    }
    if command.contains('\n') {
        return Some("newline");
    }
    None
}

/// Executes !`cmd` fragments in a skill body.
///
/// A command must match an allowed-tools pattern under the `bash(...)`
/// scope. Denials are security errors: the placeholder is replaced and the
/// whole preprocessing fails with `CommandInjectionDenied`. Ordinary
/// execution failures substitute an inline marker and processing continues.
pub struct CommandInjector<'a> {
    skill: &'a Skill,
    tenant_id: Option<&'a str>,
}

impl<'a> CommandInjector<'a> {
    pub fn new(skill: &'a Skill, tenant_id: Option<&'a str>) -> Self {
        Self { skill, tenant_id }
    }

    pub async fn inject(&self, text: &str) -> Result<InjectionOutcome> {
        let pattern = injection_pattern();
        let mut out = String::with_capacity(text.len());
        let mut records = Vec::new();
        let mut first_denied: Option<String> = None;
        let mut last_end = 0;

        for caps in pattern.captures_iter(text) {
            let whole = caps.get(0).unwrap();
            let command = caps[1].trim().to_string();
            out.push_str(&text[last_end..whole.start()]);
            last_end = whole.end();

            if let Some(metachar) = rejected_metachar(&command) {
                out.push_str(&format!(
                    "[command rejected: shell metacharacter '{metachar}' is not permitted]"
                ));
                self.audit(&command, false, None);
                records.push(InjectionRecord {
                    command: command.clone(),
                    allowed: false,
                    exit_code: None,
                });
                first_denied.get_or_insert(command);
                continue;
            }

            let permitted = self
                .skill
                .allowed_tools()
                .iter()
                .any(|p| p.permits_command("bash", &command));
            if !permitted {
                out.push_str("[command rejected: not permitted by allowed-tools]");
                self.audit(&command, false, None);
                records.push(InjectionRecord {
                    command: command.clone(),
                    allowed: false,
                    exit_code: None,
                });
                first_denied.get_or_insert(command);
                continue;
            }

            let (replacement, exit_code) = self.run_command(&command).await;
            self.audit(&command, true, exit_code);
            records.push(InjectionRecord {
                command,
                allowed: true,
                exit_code,
            });
            out.push_str(&replacement);
        }
        out.push_str(&text[last_end..]);

        if let Some(command) = first_denied {
            return Err(ExecutionError::CommandInjectionDenied(command));
        }

        Ok(InjectionOutcome { text: out, records })
    }

    async fn run_command(&self, command: &str) -> (String, Option<i32>) {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.skill.directory())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(INJECTION_TIMEOUT, child).await {
            Err(_) => {
                return (
                    format!(
                        "[command failed: timed out after {}s]",
                        INJECTION_TIMEOUT.as_secs()
                    ),
                    None,
                );
            }
            Ok(Err(e)) => return (format!("[command failed: {e}]"), None),
            Ok(Ok(output)) => output,
        };

        let exit_code = output.status.code();
        if !output.status.success() {
            return (
                format!(
                    "[command failed: exit status {}]",
                    exit_code.unwrap_or(-1)
                ),
                exit_code,
            );
        }

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.len() > INJECTION_OUTPUT_LIMIT {
            let mut cut = INJECTION_OUTPUT_LIMIT;
            while !stdout.is_char_boundary(cut) {
                cut -= 1;
            }
            stdout.truncate(cut);
            stdout.push_str("\n[output truncated at 256 KiB]");
        }
        (stdout.trim_end().to_string(), exit_code)
    }

    fn audit(&self, command: &str, allowed: bool, exit_code: Option<i32>) {
        info!(
            target: AUDIT_TARGET,
            skill_name = %self.skill.name(),
            tenant_id = self.tenant_id.unwrap_or("-"),
            command = %command,
            allowed,
            exit_code = exit_code.unwrap_or(-1),
            "dynamic command injection"
        );
    }
}

// ============================================================================
// Preprocessor
// ============================================================================

/// Preprocessor behavior knobs.
#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    /// Append a `## Request` trailer when the body never mentions
    /// `$ARGUMENTS`
    pub append_request_section: bool,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            append_request_section: true,
        }
    }
}

/// Preprocessed skill body plus the supporting-file inventory.
#[derive(Debug, Clone)]
pub struct LoadedContext {
    pub content: String,
    pub line_count: usize,
    /// name -> reference; files are loaded later via the `read` tool
    pub available_files: BTreeMap<String, FileReference>,
    pub undefined_vars: Vec<String>,
}

/// Transforms a raw skill body into the initial system prompt material.
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    options: PreprocessOptions,
}

impl Preprocessor {
    pub fn new(options: PreprocessOptions) -> Self {
        Self { options }
    }

    pub async fn preprocess(
        &self,
        skill: &Skill,
        vars: &VariableContext,
        tenant_id: Option<&str>,
    ) -> Result<LoadedContext> {
        let substituted = substitute_variables(skill.body(), vars);
        if !substituted.undefined_vars.is_empty() {
            debug!(
                skill = %skill.name(),
                undefined = ?substituted.undefined_vars,
                "unresolved variables left literal"
            );
        }

        let mut content = substituted.text;
        if !substituted.arguments_present && self.options.append_request_section {
            content.push_str("\n\n## Request\n");
            content.push_str(&vars.arguments);
        }

        let injector = CommandInjector::new(skill, tenant_id);
        let injected = injector.inject(&content).await?;

        let available_files = skill
            .supporting_files()
            .iter()
            .map(|r| (r.path.clone(), r.clone()))
            .collect();

        Ok(LoadedContext {
            line_count: injected.text.lines().count(),
            content: injected.text,
            available_files,
            undefined_vars: substituted.undefined_vars,
        })
    }
}
