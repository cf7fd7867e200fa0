//! Stream-json event protocol spoken by the Claude CLI
//!
//! The CLI is started with `--output-format stream-json`, so every stdout
//! line is one JSON object discriminated by its `type` field. Only the fields
//! the bridge acts on are modelled; everything else is tolerated and ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{BridgeError, Result};

/// One line of CLI output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// `system` events; `subtype == "init"` starts a process generation
    System(SystemMessage),
    /// A complete assistant message
    Assistant(AssistantMessage),
    /// Tool results echoed back by the CLI
    User(UserEcho),
    /// Partial message events (`--include-partial-messages`)
    #[serde(rename = "stream_event")]
    Partial(PartialMessage),
    /// End of one logical turn
    Result(TurnResult),
    /// Any other event type the CLI may add
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    /// Parse one stdout line
    ///
    /// Blank lines yield `Ok(None)`. Anything that is not a recognisable
    /// event object yields [`BridgeError::MalformedEvent`].
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| BridgeError::MalformedEvent(format!("{e}: {}", truncate(trimmed, 200))))
    }

    /// The `system/init` payload, if this is one
    pub fn as_system_init(&self) -> Option<&SystemMessage> {
        match self {
            StreamEvent::System(system) if system.is_init() => Some(system),
            _ => None,
        }
    }

    /// The turn result, if this event ends a turn
    pub fn as_result(&self) -> Option<&TurnResult> {
        match self {
            StreamEvent::Result(result) => Some(result),
            _ => None,
        }
    }

    /// The inner partial-message event, if any
    pub fn as_partial(&self) -> Option<&PartialEvent> {
        match self {
            StreamEvent::Partial(partial) => Some(&partial.event),
            _ => None,
        }
    }

    /// Whether this event marks the end of a turn
    pub fn is_result(&self) -> bool {
        matches!(self, StreamEvent::Result(_))
    }
}

/// Payload of `type: "system"`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemMessage {
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl SystemMessage {
    pub fn is_init(&self) -> bool {
        self.subtype == "init"
    }
}

/// Payload of `type: "assistant"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub message: AssistantBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssistantBody {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Payload of `type: "user"` (tool results)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEcho {
    #[serde(default)]
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A content block inside an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

/// Payload of `type: "stream_event"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialMessage {
    pub event: PartialEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Raw Anthropic streaming event forwarded by the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartialEvent {
    MessageStart {
        #[serde(default)]
        message: Value,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        delta: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

/// Incremental content for a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Other,
}

/// Payload of `type: "result"`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TurnResult {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub num_turns: u32,
    /// Running total for the whole CLI session, not a per-turn delta
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Token counts reported for one turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Build the stdin record for one user message
///
/// Matches `--input-format stream-json`; the returned line is newline
/// terminated.
pub fn user_message_line(text: &str) -> String {
    let record = serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": text }],
        },
    });
    let mut line = record.to_string();
    line.push('\n');
    line
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_system_init() {
        let line = r#"{"type":"system","subtype":"init","session_id":"abc","model":"claude-sonnet","tools":["Read","Bash"],"cwd":"/tmp","mcp_servers":[]}"#;
        let event = StreamEvent::parse_line(line).unwrap().unwrap();
        let init = event.as_system_init().expect("init event");
        assert_eq!(init.session_id.as_deref(), Some("abc"));
        assert_eq!(init.model.as_deref(), Some("claude-sonnet"));
        assert_eq!(init.tools, vec!["Read".to_string(), "Bash".to_string()]);
    }

    #[test]
    fn test_non_init_system_is_not_init() {
        let event = StreamEvent::parse_line(r#"{"type":"system","subtype":"compact_boundary"}"#)
            .unwrap()
            .unwrap();
        assert!(event.as_system_init().is_none());
    }

    #[test]
    fn test_parse_result() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"num_turns":2,"total_cost_usd":0.0125,"duration_ms":1500,"result":"done","usage":{"input_tokens":120,"output_tokens":45,"cache_read_input_tokens":10}}"#;
        let event = StreamEvent::parse_line(line).unwrap().unwrap();
        assert!(event.is_result());
        let result = event.as_result().unwrap();
        assert!(!result.is_error);
        assert_eq!(result.num_turns, 2);
        assert_eq!(result.usage.input_tokens, 120);
        assert_eq!(result.usage.output_tokens, 45);
        assert_eq!(result.usage.cache_read_input_tokens, Some(10));
        assert_eq!(result.usage.total(), 165);
        assert!((result.total_cost_usd - 0.0125).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_partial_events() {
        let start = r#"{"type":"stream_event","session_id":"s","event":{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"Bash","input":{}}}}"#;
        let event = StreamEvent::parse_line(start).unwrap().unwrap();
        match event.as_partial() {
            Some(PartialEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse { name, .. },
            }) => {
                assert_eq!(*index, 1);
                assert_eq!(name, "Bash");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let delta = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}}"#;
        let event = StreamEvent::parse_line(delta).unwrap().unwrap();
        assert_eq!(
            event.as_partial(),
            Some(&PartialEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::TextDelta { text: "Hi".into() },
            })
        );

        let signature = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"x"}}}"#;
        let event = StreamEvent::parse_line(signature).unwrap().unwrap();
        assert!(matches!(
            event.as_partial(),
            Some(PartialEvent::ContentBlockDelta {
                delta: BlockDelta::Other,
                ..
            })
        ));
    }

    #[test]
    fn test_parse_assistant_message() {
        let line = r#"{"type":"assistant","message":{"id":"m1","model":"claude","content":[{"type":"text","text":"hello"},{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"/a"}},{"type":"redacted_thinking","data":"x"}]}}"#;
        let event = StreamEvent::parse_line(line).unwrap().unwrap();
        let StreamEvent::Assistant(message) = event else {
            panic!("expected assistant event");
        };
        assert_eq!(message.message.content.len(), 3);
        assert_eq!(
            message.message.content[0],
            ContentBlock::Text {
                text: "hello".into()
            }
        );
        assert_eq!(message.message.content[2], ContentBlock::Other);
    }

    #[test]
    fn test_unknown_type_is_kept() {
        let event = StreamEvent::parse_line(r#"{"type":"rate_limit","retry":3}"#)
            .unwrap()
            .unwrap();
        assert_eq!(event, StreamEvent::Unknown);
    }

    #[test]
    fn test_blank_and_malformed_lines() {
        assert!(StreamEvent::parse_line("   ").unwrap().is_none());
        assert!(matches!(
            StreamEvent::parse_line("not json at all"),
            Err(BridgeError::MalformedEvent(_))
        ));
        assert!(matches!(
            StreamEvent::parse_line("[1,2,3]"),
            Err(BridgeError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_user_message_line() {
        let line = user_message_line("hello \"world\"");
        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "user",
                "message": {
                    "role": "user",
                    "content": [{"type": "text", "text": "hello \"world\""}]
                }
            })
        );
    }
}
