//! Classification of agent stdout lines into bus events.

use foreman_core::ndjson::{self, ContentBlock, Message};
use serde_json::json;

use crate::bus::EventPayload;

/// A classified stdout line.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub events: Vec<EventPayload>,
    /// Set when the line was the terminal result of a turn.
    pub result: Option<TurnResult>,
}

/// Terminal result of one agent turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    pub success: bool,
    pub text: Option<String>,
}

/// Classify one stdout line.
///
/// Lines that are not protocol JSON are kept as assistant text so nothing the
/// agent prints is dropped.
pub fn classify_line(line: &str) -> Classified {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Classified {
            events: Vec::new(),
            result: None,
        };
    }
    match ndjson::parse_line(trimmed) {
        Ok(message) => classify_message(&message),
        Err(_) => Classified {
            events: vec![EventPayload::AssistantText {
                text: trimmed.to_string(),
            }],
            result: None,
        },
    }
}

/// Classify a parsed protocol message.
pub fn classify_message(message: &Message) -> Classified {
    let mut events = Vec::new();
    let mut result = None;

    match message {
        Message::SystemInit(init) => events.push(EventPayload::Status {
            state: "agent_ready".to_string(),
            detail: (!init.model.is_empty()).then(|| init.model.clone()),
        }),
        Message::Assistant(assistant) => {
            let text = assistant.text();
            if !text.is_empty() {
                events.push(EventPayload::AssistantText { text });
            }
            for block in &assistant.content {
                if let ContentBlock::ToolUse { id, name, input } = block {
                    events.push(EventPayload::ToolActivity {
                        tool: name.clone(),
                        detail: json!({ "id": id, "input": input }),
                    });
                }
            }
        }
        Message::User(user) => {
            for tool_result in &user.content {
                events.push(EventPayload::ToolActivity {
                    tool: "tool_result".to_string(),
                    detail: json!({
                        "tool_use_id": tool_result.tool_use_id,
                        "is_error": tool_result.is_error,
                    }),
                });
            }
        }
        Message::Result(session_result) => {
            let turn = TurnResult {
                success: session_result.succeeded(),
                text: session_result.result.clone(),
            };
            events.push(EventPayload::Result {
                success: turn.success,
                text: turn.text.clone(),
            });
            result = Some(turn);
        }
        Message::Unknown { .. } => {}
    }

    Classified { events, result }
}
