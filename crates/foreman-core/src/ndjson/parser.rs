//! NDJSON parser for the agent protocol.
//!
//! Implements tolerant reader pattern: unknown fields ignored, unknown types
//! passed through as [`Message::Unknown`].

use serde_json::Value;

use super::types::{
    AssistantMessage, ContentBlock, Message, ResultSubtype, SessionResult, StopReason, SystemInit,
    ToolResult, UserMessage,
};
use crate::error::{Error, Result};

/// Parse a single NDJSON line from an agent's stdout.
pub fn parse_line(line: &str) -> Result<Message> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into a canonical message.
pub fn parse_value(raw: &Value) -> Result<Message> {
    let msg_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing 'type' field".into()))?;

    let message = match msg_type {
        "system" => parse_system(raw),
        "assistant" => parse_assistant(raw),
        "user" => parse_user(raw),
        "result" => parse_result(raw),
        _ => Message::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        },
    };
    Ok(message)
}

fn str_field(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn parse_system(raw: &Value) -> Message {
    Message::SystemInit(SystemInit {
        session_id: str_field(raw, "session_id"),
        model: str_field(raw, "model"),
    })
}

fn parse_assistant(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);

    Message::Assistant(AssistantMessage {
        content: parse_content_blocks(msg.get("content")),
        stop_reason: parse_stop_reason(msg.get("stop_reason")),
    })
}

fn parse_content_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    // Plain string content is a single text block.
    if let Some(text) = content.and_then(Value::as_str) {
        return vec![ContentBlock::Text {
            text: text.to_string(),
        }];
    }
    let Some(arr) = content.and_then(Value::as_array) else {
        return Vec::new();
    };

    arr.iter()
        .filter_map(|block| {
            let block_type = block.get("type")?.as_str()?;
            match block_type {
                "text" => {
                    let text = block.get("text")?.as_str()?.to_string();
                    Some(ContentBlock::Text { text })
                }
                "tool_use" => {
                    let id = block.get("id")?.as_str()?.to_string();
                    let name = block.get("name")?.as_str()?.to_string();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    Some(ContentBlock::ToolUse { id, name, input })
                }
                _ => None,
            }
        })
        .collect()
}

fn parse_stop_reason(val: Option<&Value>) -> StopReason {
    match val.and_then(Value::as_str) {
        Some("end_turn") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(other) => StopReason::Unknown(other.to_string()),
    }
}

fn parse_user(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);
    let content = msg
        .get("content")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|block| {
                    if block.get("type")?.as_str()? != "tool_result" {
                        return None;
                    }
                    Some(ToolResult {
                        tool_use_id: block.get("tool_use_id")?.as_str()?.to_string(),
                        content: str_field(block, "content"),
                        is_error: block
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Message::User(UserMessage { content })
}

fn parse_result(raw: &Value) -> Message {
    let subtype = match raw.get("subtype").and_then(Value::as_str) {
        Some("success") | None => ResultSubtype::Success,
        Some(other) if other.starts_with("error") => ResultSubtype::Error,
        Some(other) => ResultSubtype::Unknown(other.to_string()),
    };

    Message::Result(SessionResult {
        subtype,
        is_error: raw
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        result: raw.get("result").and_then(Value::as_str).map(String::from),
        session_id: str_field(raw, "session_id"),
        duration_ms: raw.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
        cost_usd: raw.get("total_cost_usd").and_then(Value::as_f64),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parse_system_init() {
        let json = r#"{"type":"system","subtype":"init","session_id":"abc123","model":"m","cwd":"/home/user","tools":[]}"#;
        let msg = parse_line(json).unwrap();
        assert_eq!(
            msg,
            Message::SystemInit(SystemInit {
                session_id: "abc123".into(),
                model: "m".into(),
            })
        );
    }

    #[test]
    fn parse_assistant_text_and_tool_use() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Planning"},{"type":"tool_use","id":"t1","name":"Read","input":{"path":"a.rs"}}],"stop_reason":"tool_use"}}"#;
        let Message::Assistant(msg) = parse_line(json).unwrap() else {
            panic!("expected assistant");
        };
        assert_eq!(msg.text(), "Planning");
        assert_eq!(msg.stop_reason, StopReason::ToolUse);
        assert!(matches!(&msg.content[1], ContentBlock::ToolUse { name, .. } if name == "Read"));
    }

    #[test]
    fn parse_result_variants() {
        let ok = parse_line(r#"{"type":"result","subtype":"success","result":"done"}"#).unwrap();
        let Message::Result(ok) = ok else {
            panic!("expected result");
        };
        assert!(ok.succeeded());
        assert_eq!(ok.result.as_deref(), Some("done"));

        let failed =
            parse_line(r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#).unwrap();
        let Message::Result(failed) = failed else {
            panic!("expected result");
        };
        assert_eq!(failed.subtype, ResultSubtype::Error);
        assert!(!failed.succeeded());

        let flagged =
            parse_line(r#"{"type":"result","subtype":"success","is_error":true}"#).unwrap();
        let Message::Result(flagged) = flagged else {
            panic!("expected result");
        };
        assert!(!flagged.succeeded());
    }

    #[test]
    fn parse_user_tool_results() {
        let json = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"},{"type":"text","text":"skip"}]}}"#;
        let Message::User(msg) = parse_line(json).unwrap() else {
            panic!("expected user");
        };
        assert_eq!(msg.content.len(), 1);
        assert_eq!(msg.content[0].tool_use_id, "t1");
    }

    #[test]
    fn tolerant_reader_ignores_unknown_fields() {
        let json = r#"{"type":"system","session_id":"x","model":"m","unknown":"ignored"}"#;
        assert!(parse_line(json).is_ok());
    }

    #[test]
    fn unknown_type_returns_unknown_message() {
        let json = r#"{"type":"future_type","data":"something"}"#;
        let msg = parse_line(json).unwrap();
        assert!(matches!(msg, Message::Unknown { .. }));
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(matches!(parse_line(r#"{"a":1}"#), Err(Error::NdjsonParse(_))));
        assert!(matches!(parse_line("not json"), Err(Error::Json(_))));
    }
}
