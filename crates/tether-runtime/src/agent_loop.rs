use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_core::{Message, Result, TetherError, ToolCall, ToolDescriptor, ToolResult};
use tether_llm::{Model, ModelRequest, ModelResponse, StopReason, StreamChunk, Usage};
use tether_middleware::{Chain, Stage, StageState, StreamEvent, DELTAS_STREAMED_KEY};

use crate::executor::{RunScope, ToolExecutor};

/// Per-run scratch state. Lifetime = one `run`/`run_stream` call.
#[derive(Debug)]
pub struct RunContext {
    pub iteration: u32,
    pub started_at: Instant,
    pub values: serde_json::Map<String, serde_json::Value>,
    pub tool_results: Vec<ToolResult>,
    pub last_output: String,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            iteration: 0,
            started_at: Instant::now(),
            values: Default::default(),
            tool_results: Vec::new(),
            last_output: String::new(),
        }
    }
}

/// What the loop hands back to the runtime.
pub struct LoopOutcome {
    pub response: ModelResponse,
    pub iterations: u32,
    pub usage: Usage,
    pub tool_calls: Vec<ToolCall>,
}

/// One bounded model -> tool-call -> result cycle.
///
/// State machine: Idle -> Thinking -> (ToolDispatching -> Thinking)* ->
/// Done | Error | Cancelled. Tool calls run sequentially in the model's
/// emission order; cancellation is honored at the iteration boundary and
/// inside every model and tool await.
pub struct AgentLoop<'a> {
    pub chain: &'a Chain,
    pub model: Arc<dyn Model>,
    pub model_name: String,
    pub executor: &'a ToolExecutor,
    pub scope: &'a RunScope,
    pub tools: Vec<ToolDescriptor>,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub max_iterations: u32,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    /// When set, model output is streamed chunk-by-chunk onto this channel.
    pub stream: Option<mpsc::Sender<StreamEvent>>,
}

impl AgentLoop<'_> {
    pub async fn run(
        mut self,
        state: &mut StageState,
        run_ctx: &mut RunContext,
    ) -> Result<LoopOutcome> {
        self.chain.run_stage(Stage::BeforeAgent, state).await?;
        let result = self.run_inner(state, run_ctx).await;
        // AfterAgent runs on success and on error recovery alike, so every
        // BeforeAgent has its matching AfterAgent.
        let after = self.chain.run_stage(Stage::AfterAgent, state).await;
        match (result, after) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), after) => {
                if let Err(after_err) = after {
                    warn!(error = %after_err, "after-agent stage failed during error recovery");
                }
                Err(e)
            }
        }
    }

    async fn run_inner(
        &mut self,
        state: &mut StageState,
        run_ctx: &mut RunContext,
    ) -> Result<LoopOutcome> {
        let deadline = Instant::now() + self.timeout;
        let mut usage = Usage::default();
        let mut invoked: Vec<ToolCall> = Vec::new();
        let mut iteration: u32 = 0;

        loop {
            // Safe checkpoint: between iterations.
            if self.cancel.is_cancelled() {
                return Err(TetherError::Cancelled("run cancelled".into()));
            }
            if Instant::now() >= deadline {
                return Err(TetherError::Timeout(format!(
                    "run exceeded {:?}",
                    self.timeout
                )));
            }
            iteration += 1;
            if iteration > self.max_iterations {
                return Err(TetherError::IterationBudget {
                    max: self.max_iterations,
                });
            }
            state.iteration = iteration;
            run_ctx.iteration = iteration;
            state.set_value(DELTAS_STREAMED_KEY, serde_json::Value::Bool(false));

            let request = ModelRequest {
                model: self.model_name.clone(),
                messages: self.scope.session.messages(),
                tools: self.tools.clone(),
                system: self.system.clone(),
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                metadata: Default::default(),
            };
            state.model_request = Some(request);
            self.chain.run_stage(Stage::BeforeModel, state).await?;
            let request = state.model_request.take().ok_or_else(|| {
                TetherError::Middleware {
                    name: "chain".into(),
                    reason: "model request dropped by middleware".into(),
                }
            })?;

            let response = self.call_model(&request, state).await?;
            usage.merge(&response.usage);
            state.model_response = Some(response);
            self.chain.run_stage(Stage::AfterModel, state).await?;
            let response = state
                .model_response
                .clone()
                .ok_or_else(|| TetherError::Middleware {
                    name: "chain".into(),
                    reason: "model response dropped by middleware".into(),
                })?;

            self.scope.session.append(response.message.clone())?;
            run_ctx.last_output = response.message.text_content();

            if response.done() {
                debug!(iterations = iteration, "loop complete");
                self.emit(StreamEvent::IterationStop { iteration }).await;
                return Ok(LoopOutcome {
                    response,
                    iterations: iteration,
                    usage,
                    tool_calls: invoked,
                });
            }

            // Dispatch sequentially, preserving the model's emission order:
            // later tool results may depend on earlier ones.
            for call in response.message.tool_calls.clone() {
                state.tool_call = Some(call.clone());
                self.chain.run_stage(Stage::BeforeTool, state).await?;
                let call = state.tool_call.clone().unwrap_or(call);
                invoked.push(call.clone());

                let result = match self.executor.execute(self.scope, &call).await {
                    Ok(result) => result,
                    // Tool failures feed back to the model; they do not
                    // abort the loop.
                    Err(e) => ToolResult::error(call.id.clone(), e.to_string()),
                };
                self.scope.session.append(Message::tool_result(
                    result.tool_call_id.clone(),
                    result.output.clone(),
                    !result.success,
                ))?;
                run_ctx.tool_results.push(result.clone());
                state.tool_result = Some(result);
                self.chain.run_stage(Stage::AfterTool, state).await?;
            }
            self.emit(StreamEvent::IterationStop { iteration }).await;
        }
    }

    async fn call_model(
        &self,
        request: &ModelRequest,
        state: &mut StageState,
    ) -> Result<ModelResponse> {
        let Some(tx) = self.stream.clone() else {
            return tokio::select! {
                result = self.model.complete(request) => result,
                _ = self.cancel.cancelled() => Err(TetherError::Cancelled("model call cancelled".into())),
            };
        };

        let mut rx = tokio::select! {
            result = self.model.complete_stream(request) => result?,
            _ = self.cancel.cancelled() => {
                return Err(TetherError::Cancelled("model call cancelled".into()))
            }
        };

        let mut text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut usage = Usage::default();
        let mut stop_reason = StopReason::EndTurn;
        let mut block_open = false;

        loop {
            let chunk = tokio::select! {
                chunk = rx.recv() => chunk,
                _ = self.cancel.cancelled() => {
                    return Err(TetherError::Cancelled("model stream cancelled".into()))
                }
            };
            match chunk {
                None => break,
                Some(StreamChunk::TextDelta(delta)) => {
                    if !block_open {
                        let _ = tx.send(StreamEvent::ContentBlockStart { index: 0 }).await;
                        block_open = true;
                    }
                    text.push_str(&delta);
                    let _ = tx
                        .send(StreamEvent::ContentBlockDelta {
                            index: 0,
                            text: delta,
                        })
                        .await;
                }
                Some(StreamChunk::ToolCall(tc)) => tool_calls.push(tc),
                Some(StreamChunk::Usage(u)) => usage.merge(&u),
                Some(StreamChunk::Done(reason)) => stop_reason = reason,
                Some(StreamChunk::Error(e)) => {
                    return Err(TetherError::UpstreamUnavailable(e));
                }
            }
        }
        if block_open {
            let _ = tx.send(StreamEvent::ContentBlockStop { index: 0 }).await;
            state.set_value(DELTAS_STREAMED_KEY, serde_json::Value::Bool(true));
        }

        let mut message = Message::assistant(text);
        if message.text_content().is_empty() {
            message.content.clear();
        }
        message.tool_calls = tool_calls;
        if !message.tool_calls.is_empty() && stop_reason == StopReason::EndTurn {
            stop_reason = StopReason::ToolUse;
        }
        Ok(ModelResponse {
            message,
            usage,
            stop_reason,
        })
    }

    async fn emit(&self, event: StreamEvent) {
        if let Some(tx) = &self.stream {
            let _ = tx.send(event).await;
        }
    }
}
