use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tether_core::{Message, Result, ToolDescriptor};

/// A request to a language model.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Model name, e.g. "tether-large" (provider-specific part).
    pub model: String,
    /// Conversation history.
    pub messages: Vec<Message>,
    /// Tools advertised to the model.
    pub tools: Vec<ToolDescriptor>,
    /// System prompt, separate from messages.
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Default for ModelRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            messages: Vec::new(),
            tools: Vec::new(),
            system: None,
            max_tokens: 4096,
            temperature: None,
            metadata: Default::default(),
        }
    }
}

/// A complete (non-streaming) model response.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub message: Message,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

impl ModelResponse {
    /// True when the model is finished and emitted no tool calls.
    pub fn done(&self) -> bool {
        self.message.tool_calls.is_empty() && self.stop_reason != StopReason::ToolUse
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
    Error,
}

/// A chunk of a streaming response.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Content text delta.
    TextDelta(String),
    /// A tool call was decided.
    ToolCall(tether_core::ToolCall),
    /// Usage stats, sent at end of stream.
    Usage(Usage),
    /// Stream is done.
    Done(StopReason),
    /// An error occurred mid-stream.
    Error(String),
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens + self.cache_tokens
    }

    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_tokens += other.cache_tokens;
    }
}

/// Trait implemented by every model backend.
#[async_trait]
pub trait Model: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Send a non-streaming request.
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse>;

    /// Send a streaming request. Returns a receiver for chunks; the stream
    /// terminates with `Done` (or `Error`).
    async fn complete_stream(
        &self,
        request: &ModelRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>>;
}

/// Resolves model names to instances.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn model(&self, name: &str) -> Result<std::sync::Arc<dyn Model>>;
}
