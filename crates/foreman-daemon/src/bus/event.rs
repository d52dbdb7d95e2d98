//! Stream bus channel identities and event types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::Sender;

/// A bus channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelId {
    /// Lifecycle and output of one pipeline run.
    Run(String),
    /// Messages and session output of one thread.
    Thread(String),
    /// Aggregate of every other channel.
    Feed,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(id) => write!(f, "run:{id}"),
            Self::Thread(id) => write!(f, "thread:{id}"),
            Self::Feed => f.write_str("feed"),
        }
    }
}

impl FromStr for ChannelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "feed" {
            return Ok(Self::Feed);
        }
        match s.split_once(':') {
            Some(("run", id)) if !id.is_empty() => Ok(Self::Run(id.to_string())),
            Some(("thread", id)) if !id.is_empty() => Ok(Self::Thread(id.to_string())),
            _ => Err(format!("invalid channel: {s}")),
        }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventPayload {
    /// Assistant prose from an agent.
    AssistantText { text: String },
    /// The agent invoked a tool or received its result.
    ToolActivity {
        tool: String,
        #[serde(default)]
        detail: Value,
    },
    /// Terminal result line of an agent turn.
    Result {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Pipeline or scheduler lifecycle change.
    Status {
        state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// A message appended to a thread.
    Message {
        sequence: i64,
        sender: Sender,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        content: String,
    },
    SessionStarted { agent_id: String },
    SessionEnded { agent_id: String, outcome: String },
    /// Last event of a channel.
    Close { reason: String },
}

impl EventPayload {
    /// Wire name of the variant, used as the SSE event name.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AssistantText { .. } => "assistant_text",
            Self::ToolActivity { .. } => "tool_activity",
            Self::Result { .. } => "result",
            Self::Status { .. } => "status",
            Self::Message { .. } => "message",
            Self::SessionStarted { .. } => "session_started",
            Self::SessionEnded { .. } => "session_ended",
            Self::Close { .. } => "close",
        }
    }
}

/// An event to publish, before the bus assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub session_id: Option<String>,
    pub thread_id: Option<String>,
    pub payload: EventPayload,
}

impl NewEvent {
    pub const fn new(payload: EventPayload) -> Self {
        Self {
            session_id: None,
            thread_id: None,
            payload,
        }
    }

    #[must_use]
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

/// A published event. `id` is monotonic within `channel`, starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub id: u64,
    pub channel: String,
    /// Channel the event was first published on (differs on the feed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl BusEvent {
    pub const fn is_close(&self) -> bool {
        matches!(self.payload, EventPayload::Close { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_parse_and_display() {
        for raw in ["run:r1", "thread:t-9", "feed"] {
            let id: ChannelId = raw.parse().unwrap();
            assert_eq!(id.to_string(), raw);
        }
        assert!("run:".parse::<ChannelId>().is_err());
        assert!("session:x".parse::<ChannelId>().is_err());
    }

    #[test]
    fn event_serializes_flat_with_type_tag() {
        let event = BusEvent {
            id: 3,
            channel: "run:r1".into(),
            origin: None,
            timestamp_ms: 0,
            session_id: Some("s1".into()),
            thread_id: None,
            payload: EventPayload::Close {
                reason: "passing".into(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "close");
        assert_eq!(value["reason"], "passing");
        assert_eq!(value["id"], 3);
        assert_eq!(value["sessionId"], "s1");
        assert!(value.get("threadId").is_none());
        assert!(event.is_close());
    }
}
