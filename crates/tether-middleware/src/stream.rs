use std::time::Duration;

use serde::Serialize;

use tether_core::WireError;

/// Keep-alive cadence on the stream channel.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Protocol-compatible stream events, emitted on the bounded channel the
/// caller holds. Each serializes as the SSE `data` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    AgentStart {
        session_id: String,
        request_id: String,
    },
    IterationStart {
        iteration: u32,
    },
    MessageStart {
        iteration: u32,
    },
    ContentBlockStart {
        index: usize,
    },
    ContentBlockDelta {
        index: usize,
        text: String,
    },
    ContentBlockStop {
        index: usize,
    },
    ToolExecutionStart {
        tool_call_id: String,
        name: String,
    },
    ToolExecutionStop {
        tool_call_id: String,
        success: bool,
    },
    IterationStop {
        iteration: u32,
    },
    MessageStop {
        iteration: u32,
    },
    AgentStop {
        stop_reason: String,
    },
    Ping {},
    Error {
        error: WireError,
    },
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::AgentStart { .. } => "agent_start",
            StreamEvent::IterationStart { .. } => "iteration_start",
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::ToolExecutionStart { .. } => "tool_execution_start",
            StreamEvent::ToolExecutionStop { .. } => "tool_execution_stop",
            StreamEvent::IterationStop { .. } => "iteration_stop",
            StreamEvent::MessageStop { .. } => "message_stop",
            StreamEvent::AgentStop { .. } => "agent_stop",
            StreamEvent::Ping {} => "ping",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Render the event as one SSE frame.
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.event_type(), data)
    }
}
