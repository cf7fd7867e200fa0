//! Turn events as seen by a rendering layer
//!
//! Translates the CLI's raw [`StreamEvent`]s into the small set of things a
//! chat front end shows: streamed text, tool activity lines and the final
//! outcome.

use std::collections::HashMap;

use serde_json::Value;

use crate::types::{BlockDelta, ContentBlock, PartialEvent, StreamEvent, TurnResult};

/// Maximum length of the target shown in a tool activity line
const ACTIVITY_TARGET_MAX: usize = 80;

/// Something a front end renders for one turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A fresh CLI process reported in
    SessionReady { model: Option<String> },
    /// Streamed assistant text
    TextDelta(String),
    /// The assistant started (or clarified) a tool call
    ToolActivity { tool_name: String, summary: String },
    /// The turn ended with a `result`
    Completed(TurnSummary),
    /// The turn ended without a `result` (process died or was replaced)
    Abandoned,
}

/// Final figures of a completed turn
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnSummary {
    pub is_error: bool,
    pub num_turns: u32,
    /// Running session cost reported by the CLI
    pub cost_usd: f64,
    pub duration_ms: u64,
    /// Final result text, or the streamed text when the CLI sent none
    pub text: Option<String>,
}

impl TurnSummary {
    fn from_result(result: &TurnResult, streamed: &str) -> Self {
        let text = result
            .result
            .clone()
            .or_else(|| (!streamed.is_empty()).then(|| streamed.to_string()));
        Self {
            is_error: result.is_error,
            num_turns: result.num_turns,
            cost_usd: result.total_cost_usd,
            duration_ms: result.duration_ms,
            text,
        }
    }

    /// One-line footer for the turn
    pub fn describe(&self) -> String {
        if self.is_error {
            return match &self.text {
                Some(text) if !text.is_empty() => format!("Error: {text}"),
                _ => "Error: the turn ended with an error".to_string(),
            };
        }
        let plural = if self.num_turns == 1 { "" } else { "s" };
        format!(
            "Completed in {} turn{plural} (${:.4})",
            self.num_turns, self.cost_usd
        )
    }
}

/// Activity line for a tool call, e.g. `Reading src/main.rs`
pub fn describe_tool_use(tool_name: &str, input: Option<&Value>) -> String {
    let field = |key: &str| {
        input
            .and_then(|i| i.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| truncate_string(s, ACTIVITY_TARGET_MAX))
    };

    let described = match tool_name {
        "Read" => field("file_path").map(|p| format!("Reading {p}")),
        "Glob" | "Grep" => field("pattern").map(|p| format!("Searching for {p}")),
        "Bash" => field("command").map(|c| format!("Running {c}")),
        "Write" => field("file_path").map(|p| format!("Writing {p}")),
        "Edit" => field("file_path").map(|p| format!("Editing {p}")),
        _ => None,
    };
    described.unwrap_or_else(|| format!("Using {tool_name}"))
}

/// Truncate to at most `max_len` characters, adding "..." if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[derive(Debug)]
struct ToolBlock {
    name: String,
    json: String,
    refined: bool,
}

/// Per-turn translation state
#[derive(Debug, Default)]
pub(crate) struct TurnTranslator {
    tool_blocks: HashMap<usize, ToolBlock>,
    text: String,
    saw_partial: bool,
}

impl TurnTranslator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn translate(&mut self, event: &StreamEvent) -> Vec<TurnEvent> {
        match event {
            StreamEvent::System(system) if system.is_init() => vec![TurnEvent::SessionReady {
                model: system.model.clone(),
            }],
            StreamEvent::Partial(partial) => {
                self.saw_partial = true;
                self.translate_partial(&partial.event)
            }
            // Full messages repeat what the partial events already streamed
            StreamEvent::Assistant(message) if !self.saw_partial => message
                .message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } if !text.is_empty() => {
                        self.text.push_str(text);
                        Some(TurnEvent::TextDelta(text.clone()))
                    }
                    ContentBlock::ToolUse { name, input, .. } => Some(TurnEvent::ToolActivity {
                        tool_name: name.clone(),
                        summary: describe_tool_use(name, Some(input)),
                    }),
                    _ => None,
                })
                .collect(),
            StreamEvent::Result(result) => {
                vec![TurnEvent::Completed(TurnSummary::from_result(result, &self.text))]
            }
            _ => Vec::new(),
        }
    }

    fn translate_partial(&mut self, event: &PartialEvent) -> Vec<TurnEvent> {
        match event {
            PartialEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse { name, .. },
            } => {
                self.tool_blocks.insert(
                    *index,
                    ToolBlock {
                        name: name.clone(),
                        json: String::new(),
                        refined: false,
                    },
                );
                vec![TurnEvent::ToolActivity {
                    tool_name: name.clone(),
                    summary: describe_tool_use(name, None),
                }]
            }
            PartialEvent::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
                ..
            } => {
                self.text.push_str(text);
                vec![TurnEvent::TextDelta(text.clone())]
            }
            PartialEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::InputJsonDelta { partial_json },
            } => {
                let Some(block) = self.tool_blocks.get_mut(index) else {
                    return Vec::new();
                };
                block.json.push_str(partial_json);
                if block.refined {
                    return Vec::new();
                }
                // Input is streamed in fragments; it is only usable once it parses.
                match serde_json::from_str::<Value>(&block.json) {
                    Ok(input) if input.is_object() => {
                        block.refined = true;
                        vec![TurnEvent::ToolActivity {
                            tool_name: block.name.clone(),
                            summary: describe_tool_use(&block.name, Some(&input)),
                        }]
                    }
                    _ => Vec::new(),
                }
            }
            PartialEvent::ContentBlockStop { index } => {
                self.tool_blocks.remove(index);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parse(line: Value) -> StreamEvent {
        StreamEvent::parse_line(&line.to_string()).unwrap().unwrap()
    }

    #[test]
    fn test_describe_tool_use() {
        let cases = [
            ("Read", json!({"file_path": "/src/auth.ts"}), "Reading /src/auth.ts"),
            ("Glob", json!({"pattern": "**/*.ts"}), "Searching for **/*.ts"),
            ("Grep", json!({"pattern": "TODO"}), "Searching for TODO"),
            ("Bash", json!({"command": "npm test"}), "Running npm test"),
            ("Write", json!({"file_path": "/src/new.ts"}), "Writing /src/new.ts"),
            ("Edit", json!({"file_path": "/src/fix.ts"}), "Editing /src/fix.ts"),
            ("Read", json!({}), "Using Read"),
            ("WebFetch", json!({"url": "https://example.com"}), "Using WebFetch"),
        ];
        for (tool, input, expected) in cases {
            assert_eq!(describe_tool_use(tool, Some(&input)), expected);
        }
        assert_eq!(describe_tool_use("Bash", None), "Using Bash");
    }

    #[test]
    fn test_long_targets_are_truncated() {
        let command = "x".repeat(200);
        let summary = describe_tool_use("Bash", Some(&json!({ "command": command })));
        assert_eq!(summary.len(), "Running ".len() + ACTIVITY_TARGET_MAX);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn test_summary_describe() {
        let ok = TurnSummary {
            num_turns: 3,
            cost_usd: 0.0123,
            ..Default::default()
        };
        assert_eq!(ok.describe(), "Completed in 3 turns ($0.0123)");

        let single = TurnSummary {
            num_turns: 1,
            ..Default::default()
        };
        assert_eq!(single.describe(), "Completed in 1 turn ($0.0000)");

        let failed = TurnSummary {
            is_error: true,
            text: Some("rate limited".into()),
            ..Default::default()
        };
        assert_eq!(failed.describe(), "Error: rate limited");
    }

    #[test]
    fn test_tool_activity_is_refined_once_input_parses() {
        let mut translator = TurnTranslator::new();
        let start = parse(json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_start",
                "index": 1,
                "content_block": {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {}}
            }
        }));
        assert_eq!(translator.translate(&start), vec![TurnEvent::ToolActivity {
            tool_name: "Read".into(),
            summary: "Using Read".into(),
        }]);

        let fragment = |json: &str| {
            parse(json!({
                "type": "stream_event",
                "event": {
                    "type": "content_block_delta",
                    "index": 1,
                    "delta": {"type": "input_json_delta", "partial_json": json}
                }
            }))
        };
        assert!(translator.translate(&fragment(r#"{"file_pa"#)).is_empty());
        assert_eq!(translator.translate(&fragment(r#"th": "/a.rs"}"#)), vec![
            TurnEvent::ToolActivity {
                tool_name: "Read".into(),
                summary: "Reading /a.rs".into(),
            }
        ]);
    }

    #[test]
    fn test_completed_falls_back_to_streamed_text() {
        let mut translator = TurnTranslator::new();
        let delta = parse(json!({
            "type": "stream_event",
            "event": {"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hello"}}
        }));
        assert_eq!(translator.translate(&delta), vec![TurnEvent::TextDelta("Hello".into())]);

        // Partial events were seen, so the full message is not repeated
        let assistant = parse(json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "Hello"}]}
        }));
        assert!(translator.translate(&assistant).is_empty());

        let result = parse(json!({
            "type": "result", "subtype": "success", "is_error": false,
            "num_turns": 1, "total_cost_usd": 0.5
        }));
        let events = translator.translate(&result);
        let [TurnEvent::Completed(summary)] = events.as_slice() else {
            panic!("expected a completion, got {events:?}");
        };
        assert_eq!(summary.text.as_deref(), Some("Hello"));
        assert_eq!(summary.num_turns, 1);
    }

    #[test]
    fn test_assistant_messages_without_partials() {
        let mut translator = TurnTranslator::new();
        let assistant = parse(json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Looking"},
                {"type": "tool_use", "id": "t1", "name": "Grep", "input": {"pattern": "fn main"}}
            ]}
        }));
        assert_eq!(translator.translate(&assistant), vec![
            TurnEvent::TextDelta("Looking".into()),
            TurnEvent::ToolActivity {
                tool_name: "Grep".into(),
                summary: "Searching for fn main".into(),
            },
        ]);
    }
}
