// Skill document parsing
//
// On-disk format: UTF-8 text, YAML frontmatter bounded by `---` lines,
// followed by a Markdown body. Frontmatter keys are kebab-case. The body may
// contain `${...}`, `$NAME`, and !`cmd` forms handled by the preprocessor.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ExecutionError, Result};
use crate::skill::{ExecutionMode, FileReference, SkillMetadata};

/// Non-blank body lines above this count log an advisory warning.
pub const BODY_LINE_LIMIT: usize = 500;

/// A parsed skill document: validated metadata plus the raw Markdown body.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillDocument {
    pub metadata: SkillMetadata,
    pub body: String,
}

/// Frontmatter as it appears on disk. Kept separate from `SkillMetadata` so
/// the wire format (kebab keys, duration strings) stays isolated from the
/// runtime model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFrontmatter {
    name: String,
    description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(rename = "execution-mode", default, skip_serializing_if = "Option::is_none")]
    execution_mode: Option<ExecutionMode>,
    #[serde(rename = "max-iterations", default, skip_serializing_if = "Option::is_none")]
    max_iterations: Option<u32>,
    #[serde(
        rename = "max-retries-per-tool",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    max_retries_per_tool: Option<u32>,
    #[serde(
        rename = "timeout-per-iteration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    timeout_per_iteration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "allowed-tools", default, skip_serializing_if = "Vec::is_empty")]
    allowed_tools: Vec<String>,
    #[serde(
        rename = "early-termination",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    early_termination: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<i32>,
}

/// Parse a skill document from its on-disk text.
pub fn parse_skill_document(text: &str) -> Result<SkillDocument> {
    let (front, body) = split_frontmatter(text)?;

    let raw: RawFrontmatter = serde_yaml::from_str(front)
        .map_err(|e| ExecutionError::document(format!("invalid frontmatter: {e}")))?;

    let timeout_per_iteration = raw
        .timeout_per_iteration
        .as_deref()
        .map(parse_duration)
        .transpose()?;

    let metadata = SkillMetadata {
        name: raw.name,
        description: raw.description,
        version: raw.version,
        execution_mode: raw.execution_mode,
        max_iterations: raw.max_iterations,
        max_retries_per_tool: raw.max_retries_per_tool,
        timeout_per_iteration,
        model: raw.model,
        temperature: raw.temperature,
        allowed_tools: raw.allowed_tools,
        early_termination: raw.early_termination,
        priority: raw.priority,
    };
    metadata.validate()?;

    let non_blank = body.lines().filter(|l| !l.trim().is_empty()).count();
    if non_blank > BODY_LINE_LIMIT {
        warn!(
            skill = %metadata.name,
            lines = non_blank,
            limit = BODY_LINE_LIMIT,
            "skill body exceeds the recommended line limit"
        );
    }

    Ok(SkillDocument {
        metadata,
        body: body.to_string(),
    })
}

/// Serialize metadata back to frontmatter text (used by authoring helpers
/// and the round-trip tests). Durations serialize in milliseconds.
pub fn serialize_frontmatter(metadata: &SkillMetadata) -> Result<String> {
    let raw = RawFrontmatter {
        name: metadata.name.clone(),
        description: metadata.description.clone(),
        version: metadata.version.clone(),
        execution_mode: metadata.execution_mode,
        max_iterations: metadata.max_iterations,
        max_retries_per_tool: metadata.max_retries_per_tool,
        timeout_per_iteration: metadata
            .timeout_per_iteration
            .map(|d| format!("{}ms", d.as_millis())),
        model: metadata.model.clone(),
        temperature: metadata.temperature,
        allowed_tools: metadata.allowed_tools.clone(),
        early_termination: metadata.early_termination,
        priority: metadata.priority,
    };
    serde_yaml::to_string(&raw)
        .map_err(|e| ExecutionError::document(format!("cannot serialize frontmatter: {e}")))
}

fn split_frontmatter(text: &str) -> Result<(&str, &str)> {
    let rest = text
        .strip_prefix("---")
        .ok_or_else(|| ExecutionError::document("missing frontmatter opening '---'"))?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n")).ok_or_else(|| {
        ExecutionError::document("frontmatter opening '---' must be its own line")
    })?;

    for (offset, line) in line_offsets(rest) {
        if line.trim_end() == "---" {
            let front = &rest[..offset];
            let body_start = offset + line.len();
            let body = rest[body_start..].trim_start_matches(['\r', '\n']);
            return Ok((front, body));
        }
    }
    Err(ExecutionError::document("missing frontmatter closing '---'"))
}

/// Iterate `(byte_offset, line_including_newline)` pairs.
fn line_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n').map(move |line| {
        let pair = (offset, line);
        offset += line.len();
        pair
    })
}

/// Parse a duration string `<number><unit>` with unit in {ms, s, m}.
/// Fractional values are permitted for seconds and minutes.
pub fn parse_duration(s: &str) -> Result<Duration> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"^(\d+(?:\.\d+)?)(ms|s|m)$").unwrap());

    let caps = re.captures(s.trim()).ok_or_else(|| {
        ExecutionError::document(format!("invalid duration '{s}'; expected <n>ms|s|m"))
    })?;
    let number: f64 = caps[1]
        .parse()
        .map_err(|_| ExecutionError::document(format!("invalid duration number in '{s}'")))?;

    let millis = match &caps[2] {
        "ms" => {
            if caps[1].contains('.') {
                return Err(ExecutionError::document(format!(
                    "fractional milliseconds are not supported in '{s}'"
                )));
            }
            number
        }
        "s" => number * 1_000.0,
        "m" => number * 60_000.0,
        _ => unreachable!(),
    };
    Ok(Duration::from_millis(millis.round() as u64))
}

struct ReferencePatterns {
    bullet: Regex,
    bold: Regex,
    imperative: Regex,
    inline: Regex,
    estimated_lines: Regex,
}

fn reference_patterns() -> &'static ReferencePatterns {
    static PATTERNS: OnceLock<ReferencePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ReferencePatterns {
        bullet: Regex::new(r"^\s*[-*]\s+\*{0,2}`?([A-Za-z0-9_\-./]+\.md)`?\*{0,2}\s*:\s*(\S.*)$")
            .unwrap(),
        bold: Regex::new(r"\*\*([A-Za-z0-9_\-./]+\.md)\*\*").unwrap(),
        imperative: Regex::new(r"\b(?:Read|Check|See)\s+`?([A-Za-z0-9_\-./]+\.[A-Za-z0-9]+)`?")
            .unwrap(),
        inline: Regex::new(r"[A-Za-z0-9_\-][A-Za-z0-9_\-./]*\.md").unwrap(),
        estimated_lines: Regex::new(r"[(~]\s*(\d+)\s+lines\)?").unwrap(),
    })
}

/// Extract supporting-file references from a skill body.
///
/// Recognized forms, in order of specificity per line:
/// - bullet items `- <name>.md: <desc>`
/// - bold `**<name>.md**`
/// - imperative `Read|Check|See <path>`
/// - inline `<name>.md` mentions
///
/// Duplicates keep their first position; a later match may fill in a missing
/// description.
pub fn extract_file_references(body: &str) -> Vec<FileReference> {
    let patterns = reference_patterns();
    let mut references: Vec<FileReference> = Vec::new();

    let mut push = |path: &str, description: Option<String>| {
        if let Some(existing) = references.iter_mut().find(|r| r.path == path) {
            if existing.description.is_none() {
                if let Some(desc) = description {
                    existing.estimated_lines = estimate_lines(&desc);
                    existing.description = Some(desc);
                }
            }
            return;
        }
        let estimated = description.as_deref().and_then(estimate_lines);
        references.push(FileReference {
            path: path.to_string(),
            estimated_lines: estimated,
            description,
        });
    };

    for line in body.lines() {
        if let Some(caps) = patterns.bullet.captures(line) {
            push(&caps[1], Some(caps[2].trim().to_string()));
            continue;
        }
        for caps in patterns.bold.captures_iter(line) {
            push(&caps[1], None);
        }
        for caps in patterns.imperative.captures_iter(line) {
            push(&caps[1], None);
        }
        for m in patterns.inline.find_iter(line) {
            push(m.as_str(), None);
        }
    }

    references
}

fn estimate_lines(description: &str) -> Option<u32> {
    reference_patterns()
        .estimated_lines
        .captures(description)
        .and_then(|caps| caps[1].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"---
name: release-notes
description: Draft release notes from the changelog
execution-mode: autonomous
max-iterations: 8
max-retries-per-tool: 2
timeout-per-iteration: 45s
temperature: 0.3
allowed-tools:
  - read
  - bash(git:*)
priority: 5
---
# Release notes

Check CHANGELOG.md first, then read **style-guide.md**.

- template.md: the output template (~40 lines)
"#;

    #[test]
    fn test_parse_document() {
        let doc = parse_skill_document(DOC).unwrap();
        assert_eq!(doc.metadata.name, "release-notes");
        assert_eq!(doc.metadata.max_iterations, Some(8));
        assert_eq!(
            doc.metadata.timeout_per_iteration,
            Some(Duration::from_secs(45))
        );
        assert_eq!(doc.metadata.allowed_tools.len(), 2);
        assert!(doc.body.starts_with("# Release notes"));
    }

    #[test]
    fn test_frontmatter_round_trip() {
        let doc = parse_skill_document(DOC).unwrap();
        let serialized = serialize_frontmatter(&doc.metadata).unwrap();
        let rebuilt = format!("---\n{serialized}---\n{}", doc.body);
        let reparsed = parse_skill_document(&rebuilt).unwrap();
        assert_eq!(reparsed.metadata, doc.metadata);
    }

    #[test]
    fn test_missing_frontmatter_rejected() {
        assert!(parse_skill_document("# just a body\n").is_err());
        assert!(parse_skill_document("---\nname: x\ndescription: y\n").is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let text = "---\nname: a\ndescription: b\nbogus-key: 1\n---\nbody\n";
        assert!(parse_skill_document(text).is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("2.5s").unwrap(), Duration::from_millis(2500));
        assert_eq!(parse_duration("1.5m").unwrap(), Duration::from_millis(90_000));
        assert!(parse_duration("2.5ms").is_err());
        assert!(parse_duration("10h").is_err());
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn test_extract_references_all_forms() {
        let body = "\
Check CHANGELOG.md before starting.

- template.md: the output template (~40 lines)
- data/fixtures.md: sample inputs

See scripts/collect.py for gathering stats, then read **style-guide.md**.
An inline mention of appendix.md closes things out.
";
        let refs = extract_file_references(body);
        let paths: Vec<&str> = refs.iter().map(|r| r.path.as_str()).collect();

        assert_eq!(
            paths,
            vec![
                "CHANGELOG.md",
                "template.md",
                "data/fixtures.md",
                "scripts/collect.py",
                "style-guide.md",
                "appendix.md",
            ]
        );

        let template = refs.iter().find(|r| r.path == "template.md").unwrap();
        assert_eq!(template.description.as_deref(), Some("the output template (~40 lines)"));
        assert_eq!(template.estimated_lines, Some(40));
    }

    #[test]
    fn test_extract_references_dedup_keeps_first_position() {
        let body = "See notes.md early.\n\n- notes.md: described later\n";
        let refs = extract_file_references(body);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].path, "notes.md");
        // The later bullet fills in the description
        assert_eq!(refs[0].description.as_deref(), Some("described later"));
    }
}
