//! Message types for the agent NDJSON protocol.

use serde_json::Value;

/// Canonical message types read from an agent's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SystemInit(SystemInit),
    Assistant(AssistantMessage),
    User(UserMessage),
    Result(SessionResult),
    Unknown { msg_type: String, payload: Value },
}

/// System initialization message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInit {
    pub session_id: String,
    pub model: String,
}

/// Complete assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

impl AssistantMessage {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ToolUse { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Content block in assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

/// Reason the assistant stopped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    Unknown(String),
}

/// User message (tool results echo).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub content: Vec<ToolResult>,
}

/// Tool execution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Terminal result of one agent turn.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub subtype: ResultSubtype,
    pub is_error: bool,
    /// Final text the agent reported, if any.
    pub result: Option<String>,
    pub session_id: String,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
}

impl SessionResult {
    /// Whether the turn finished successfully.
    pub fn succeeded(&self) -> bool {
        self.subtype == ResultSubtype::Success && !self.is_error
    }
}

/// Result subtype.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultSubtype {
    #[default]
    Success,
    Error,
    Unknown(String),
}
