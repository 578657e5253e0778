use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Capability markers used by the sandbox to decide which policies apply.
pub mod capability {
    /// Tool reads or writes filesystem paths (arguments named `path`,
    /// `paths`, `file_path`, `dir`).
    pub const FILESYSTEM: &str = "filesystem";
    /// Tool opens network connections (arguments named `host`, `url`).
    pub const NETWORK: &str = "network";
    /// Tool hands a string to a shell (arguments named `command`).
    pub const COMMAND: &str = "command";
}

/// Plain-data description of a tool, as advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A request from the model to call a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within one model turn.
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, Value>,
}

/// The result of executing a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    /// Bounded output text; truncation is flagged in `metadata`.
    pub output: String,
    /// Optional structured data returned alongside the text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            output: output.into(),
            data: None,
            success: true,
            duration_ms: 0,
            metadata: Default::default(),
        }
    }

    pub fn error(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(tool_call_id, output)
        }
    }
}

/// Per-invocation context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub request_id: String,
    pub call_id: String,
    /// Cancellation signal derived from the caller's run context.
    pub cancel: CancellationToken,
    /// Per-call deadline the executor enforces; tools may also honor it.
    pub timeout: Option<Duration>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            request_id: String::new(),
            call_id: call_id.into(),
            cancel: CancellationToken::new(),
            timeout: None,
        }
    }
}

/// Trait implemented by every executable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the parameters object.
    fn schema(&self) -> Value;

    /// Sandbox capability markers; empty means no sandbox policy applies.
    fn capabilities(&self) -> Vec<String> {
        vec![]
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        params: serde_json::Map<String, Value>,
    ) -> crate::Result<ToolResult>;

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.schema(),
            capabilities: self.capabilities(),
        }
    }
}

/// Incremental output callback for streaming tools.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Optional streaming variant. The aggregate result must equal the
/// (truncation-capped) concatenation of the observed chunks.
#[async_trait]
pub trait StreamingTool: Tool {
    async fn execute_streaming(
        &self,
        ctx: &ToolContext,
        params: serde_json::Map<String, Value>,
        on_chunk: ChunkSink<'_>,
    ) -> crate::Result<ToolResult>;
}
