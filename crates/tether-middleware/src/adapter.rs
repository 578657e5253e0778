use async_trait::async_trait;
use tokio::sync::mpsc;

use tether_core::Result;
use tether_llm::StopReason;

use crate::stream::StreamEvent;
use crate::{Middleware, StageState};

/// Flag the loop sets in [`StageState::values`] when it already forwarded
/// chunk-level deltas for the current iteration; the adapter then skips
/// re-emitting the whole assistant message as one delta.
pub const DELTAS_STREAMED_KEY: &str = "stream.deltas_streamed";

/// Synthesized middleware translating stage transitions into the protocol
/// event sequence on a bounded channel. Registered at the outermost layer so
/// `agent_start` precedes and `agent_stop` follows every user middleware.
pub struct StreamAdapter {
    tx: mpsc::Sender<StreamEvent>,
}

impl StreamAdapter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Handle for pushing chunk-level deltas, pings, and iteration bounds
    /// from the loop itself.
    pub fn sender(&self) -> mpsc::Sender<StreamEvent> {
        self.tx.clone()
    }

    async fn emit(&self, event: StreamEvent) {
        // A gone receiver just means the caller stopped listening.
        let _ = self.tx.send(event).await;
    }
}

#[async_trait]
impl Middleware for StreamAdapter {
    fn name(&self) -> &str {
        "stream-adapter"
    }

    fn priority(&self) -> i32 {
        1000
    }

    async fn before_agent(&self, state: &mut StageState) -> Result<()> {
        self.emit(StreamEvent::AgentStart {
            session_id: state.session_id.clone(),
            request_id: state.request_id.clone(),
        })
        .await;
        Ok(())
    }

    async fn before_model(&self, state: &mut StageState) -> Result<()> {
        self.emit(StreamEvent::IterationStart {
            iteration: state.iteration,
        })
        .await;
        self.emit(StreamEvent::MessageStart {
            iteration: state.iteration,
        })
        .await;
        Ok(())
    }

    async fn after_model(&self, state: &mut StageState) -> Result<()> {
        let streamed = state
            .value(DELTAS_STREAMED_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !streamed {
            // Non-streaming model: still bracket the whole assistant message.
            let text = state
                .model_response
                .as_ref()
                .map(|r| r.message.text_content())
                .unwrap_or_default();
            self.emit(StreamEvent::ContentBlockStart { index: 0 }).await;
            if !text.is_empty() {
                self.emit(StreamEvent::ContentBlockDelta { index: 0, text })
                    .await;
            }
            self.emit(StreamEvent::ContentBlockStop { index: 0 }).await;
        }
        self.emit(StreamEvent::MessageStop {
            iteration: state.iteration,
        })
        .await;
        Ok(())
    }

    async fn before_tool(&self, state: &mut StageState) -> Result<()> {
        if let Some(call) = &state.tool_call {
            self.emit(StreamEvent::ToolExecutionStart {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
            })
            .await;
        }
        Ok(())
    }

    async fn after_tool(&self, state: &mut StageState) -> Result<()> {
        if let Some(result) = &state.tool_result {
            self.emit(StreamEvent::ToolExecutionStop {
                tool_call_id: result.tool_call_id.clone(),
                success: result.success,
            })
            .await;
        }
        Ok(())
    }

    async fn after_agent(&self, state: &mut StageState) -> Result<()> {
        let stop_reason = state
            .model_response
            .as_ref()
            .map(|r| match r.stop_reason {
                StopReason::EndTurn => "end_turn",
                StopReason::MaxTokens => "max_tokens",
                StopReason::ToolUse => "tool_use",
                StopReason::StopSequence => "stop_sequence",
                StopReason::Error => "error",
            })
            .unwrap_or("end_turn");
        self.emit(StreamEvent::AgentStop {
            stop_reason: stop_reason.to_string(),
        })
        .await;
        Ok(())
    }
}
