// ReAct grammar parsing
//
// The driver expects LLM output to be either terminal:
//
//   Final Answer: <text...>
//
// or one or more action blocks:
//
//   Thought: <optional reasoning>
//   Action: <tool>
//   Action Input: <json>
//
// Whichever marker appears first decides the response kind. Anything else
// is treated as a thinking-only step and earns a format nudge on the next
// turn.

use serde_json::Value;

/// Nudge appended to the conversation after an unparseable response.
pub const FORMAT_NUDGE: &str = "Your previous response was not in the expected format; \
please issue an Action or Final Answer.";

const FINAL_MARKER: &str = "Final Answer:";
const ACTION_MARKER: &str = "Action:";
const INPUT_MARKER: &str = "Action Input:";
const THOUGHT_MARKER: &str = "Thought:";

/// One action requested by the LLM.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAction {
    pub tool: String,
    pub arguments: Value,
}

/// Outcome of parsing one LLM response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    /// Terminal: the loop ends with this answer
    Final { answer: String },
    /// Non-terminal: dispatch these actions in order
    Actions {
        thought: Option<String>,
        actions: Vec<ParsedAction>,
    },
    /// Neither marker found; treat as a thinking step
    Unparseable,
}

impl ParsedResponse {
    pub fn is_final(&self) -> bool {
        matches!(self, ParsedResponse::Final { .. })
    }
}

/// Parse an LLM response against the ReAct grammar.
pub fn parse_response(text: &str) -> ParsedResponse {
    let lines: Vec<&str> = text.lines().collect();

    // The first marker in line order decides terminal vs action.
    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix(FINAL_MARKER) {
            let mut answer = rest.trim().to_string();
            for tail in &lines[index + 1..] {
                answer.push('\n');
                answer.push_str(tail);
            }
            return ParsedResponse::Final {
                answer: answer.trim().to_string(),
            };
        }
        if trimmed.starts_with(ACTION_MARKER) {
            return parse_actions(&lines, index);
        }
    }

    ParsedResponse::Unparseable
}

fn parse_actions(lines: &[&str], first_action: usize) -> ParsedResponse {
    let thought = extract_thought(&lines[..first_action]);

    let mut actions = Vec::new();
    let mut cursor = first_action;

    while cursor < lines.len() {
        let trimmed = lines[cursor].trim_start();
        let Some(tool_rest) = trimmed.strip_prefix(ACTION_MARKER) else {
            cursor += 1;
            continue;
        };
        let tool = tool_rest.trim().to_string();
        cursor += 1;

        let (arguments, next) = parse_action_input(lines, cursor);
        cursor = next;

        if tool.is_empty() {
            continue;
        }
        actions.push(ParsedAction { tool, arguments });
    }

    if actions.is_empty() {
        return ParsedResponse::Unparseable;
    }
    ParsedResponse::Actions { thought, actions }
}

/// Parse the `Action Input:` block following an action line. The JSON may
/// span lines; it ends at the next marker or end of text. Returns the
/// arguments and the index of the line parsing stopped at.
fn parse_action_input(lines: &[&str], mut cursor: usize) -> (Value, usize) {
    // Skip blank lines between the action and its input
    while cursor < lines.len() && lines[cursor].trim().is_empty() {
        cursor += 1;
    }

    let Some(line) = lines.get(cursor) else {
        return (Value::Object(Default::default()), cursor);
    };
    let trimmed = line.trim_start();
    let Some(rest) = trimmed.strip_prefix(INPUT_MARKER) else {
        // Missing input block: dispatch with empty arguments
        return (Value::Object(Default::default()), cursor);
    };

    let mut raw = rest.trim().to_string();
    cursor += 1;
    while cursor < lines.len() {
        let next = lines[cursor].trim_start();
        if next.starts_with(ACTION_MARKER)
            || next.starts_with(FINAL_MARKER)
            || next.starts_with(THOUGHT_MARKER)
        {
            break;
        }
        raw.push('\n');
        raw.push_str(lines[cursor]);
        cursor += 1;
    }

    let raw = raw.trim();
    let arguments = serde_json::from_str(raw)
        .unwrap_or_else(|_| Value::String(raw.to_string()));
    (arguments, cursor)
}

fn extract_thought(lines: &[&str]) -> Option<String> {
    let mut collected = Vec::new();
    for line in lines {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix(THOUGHT_MARKER) {
            collected.push(rest.trim());
        } else if !trimmed.is_empty() && !collected.is_empty() {
            collected.push(trimmed);
        }
    }
    if collected.is_empty() {
        let text = lines.join("\n");
        let text = text.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    } else {
        Some(collected.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_final_answer() {
        let parsed = parse_response("Thought: done here.\nFinal Answer: 42 files match.");
        assert_eq!(
            parsed,
            ParsedResponse::Final {
                answer: "42 files match.".to_string()
            }
        );
    }

    #[test]
    fn test_final_answer_spans_lines() {
        let parsed = parse_response("Final Answer: summary below\n- a\n- b");
        match parsed {
            ParsedResponse::Final { answer } => {
                assert!(answer.starts_with("summary below"));
                assert!(answer.contains("- b"));
            }
            other => panic!("expected final, got {other:?}"),
        }
    }

    #[test]
    fn test_single_action() {
        let parsed = parse_response(
            "Thought: need the file list.\nAction: glob\nAction Input: {\"pattern\": \"*.py\"}",
        );
        match parsed {
            ParsedResponse::Actions { thought, actions } => {
                assert_eq!(thought.as_deref(), Some("need the file list."));
                assert_eq!(actions.len(), 1);
                assert_eq!(actions[0].tool, "glob");
                assert_eq!(actions[0].arguments, json!({"pattern": "*.py"}));
            }
            other => panic!("expected actions, got {other:?}"),
        }
    }

    #[test]
    fn test_multiple_actions_in_order() {
        let parsed = parse_response(
            "Action: read\nAction Input: {\"path\": \"a.md\"}\nAction: read\nAction Input: {\"path\": \"b.md\"}",
        );
        match parsed {
            ParsedResponse::Actions { actions, .. } => {
                assert_eq!(actions.len(), 2);
                assert_eq!(actions[0].arguments["path"], "a.md");
                assert_eq!(actions[1].arguments["path"], "b.md");
            }
            other => panic!("expected actions, got {other:?}"),
        }
    }

    #[test]
    fn test_multiline_json_input() {
        let parsed = parse_response(
            "Action: write\nAction Input: {\n  \"path\": \"out.md\",\n  \"content\": \"hi\"\n}",
        );
        match parsed {
            ParsedResponse::Actions { actions, .. } => {
                assert_eq!(actions[0].arguments["content"], "hi");
            }
            other => panic!("expected actions, got {other:?}"),
        }
    }

    #[test]
    fn test_first_marker_wins() {
        // A final answer before any action terminates the loop.
        let parsed = parse_response("Final Answer: done\nAction: glob\nAction Input: {}");
        assert!(parsed.is_final());
    }

    #[test]
    fn test_unparseable() {
        assert_eq!(
            parse_response("I am not sure what to do next."),
            ParsedResponse::Unparseable
        );
        assert_eq!(parse_response(""), ParsedResponse::Unparseable);
    }

    #[test]
    fn test_non_json_input_wrapped_as_string() {
        let parsed = parse_response("Action: bash\nAction Input: git status");
        match parsed {
            ParsedResponse::Actions { actions, .. } => {
                assert_eq!(actions[0].arguments, json!("git status"));
            }
            other => panic!("expected actions, got {other:?}"),
        }
    }
}
