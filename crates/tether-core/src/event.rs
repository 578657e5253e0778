use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known bus event types.
pub mod event_type {
    pub const SESSION_START: &str = "session_start";
    pub const SESSION_END: &str = "session_end";
    pub const RUN_STARTED: &str = "run_started";
    pub const RUN_COMPLETED: &str = "run_completed";
    pub const TOOL_EXECUTED: &str = "tool_executed";
    pub const APPROVAL_REQUESTED: &str = "approval_requested";
    pub const APPROVAL_DECIDED: &str = "approval_decided";
    pub const MCP_TOOLS_CHANGED: &str = "mcp_tools_changed";
    pub const PRE_COMPACT: &str = "pre_compact";
    pub const CONTEXT_COMPACTED: &str = "context_compacted";
}

/// A point in a session's event history, for resumable streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub channel: String,
    pub seq: i64,
}

impl Bookmark {
    pub fn new(channel: impl Into<String>, seq: i64) -> Self {
        Self {
            channel: channel.into(),
            seq,
        }
    }
}

/// An event flowing through the bus and the durable event store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<Bookmark>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            session_id: session_id.into(),
            request_id: String::new(),
            timestamp: Utc::now(),
            bookmark: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_bookmark(mut self, bookmark: Bookmark) -> Self {
        self.bookmark = Some(bookmark);
        self
    }

    /// Identity used by the bus de-dup window. Events without a bookmark
    /// have no stable identity and are never de-duplicated.
    pub fn dedup_key(&self) -> Option<String> {
        self.bookmark
            .as_ref()
            .map(|b| format!("{}:{}", b.channel, b.seq))
    }
}
