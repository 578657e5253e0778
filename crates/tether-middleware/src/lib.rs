//! # tether-middleware
//!
//! Onion-model interception around the agent loop. Six stages —
//! before/after each of agent, model, and tool — run over a mutable
//! [`StageState`]; an error from any hook short-circuits the stage and
//! aborts the outer loop. Higher priority means outer layer: before-stages
//! execute high-to-low, after-stages low-to-high.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use tracing::warn;

use tether_core::{Result, TetherError, ToolCall, ToolResult};
use tether_llm::{ModelRequest, ModelResponse};

pub mod adapter;
pub mod stream;

pub use adapter::{StreamAdapter, DELTAS_STREAMED_KEY};
pub use stream::{StreamEvent, PING_INTERVAL};

/// The six interception points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    BeforeAgent,
    BeforeModel,
    AfterModel,
    BeforeTool,
    AfterTool,
    AfterAgent,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::BeforeAgent => "before_agent",
            Stage::BeforeModel => "before_model",
            Stage::AfterModel => "after_model",
            Stage::BeforeTool => "before_tool",
            Stage::AfterTool => "after_tool",
            Stage::AfterAgent => "after_agent",
        }
    }
}

/// Mutable bundle threaded through middleware hooks during one loop
/// iteration. Hooks may rewrite the model input, tool arguments, and the
/// free values map.
#[derive(Debug, Default)]
pub struct StageState {
    pub session_id: String,
    pub request_id: String,
    pub iteration: u32,
    pub model_request: Option<ModelRequest>,
    pub model_response: Option<ModelResponse>,
    pub tool_call: Option<ToolCall>,
    pub tool_result: Option<ToolResult>,
    pub values: serde_json::Map<String, serde_json::Value>,
}

impl StageState {
    pub fn for_run(session_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    pub fn set_value(&mut self, key: &str, value: serde_json::Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }
}

/// A middleware intercepts loop stages. Absent hooks are no-ops.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Higher priority = outer layer.
    fn priority(&self) -> i32 {
        0
    }

    async fn before_agent(&self, _state: &mut StageState) -> Result<()> {
        Ok(())
    }

    async fn before_model(&self, _state: &mut StageState) -> Result<()> {
        Ok(())
    }

    async fn after_model(&self, _state: &mut StageState) -> Result<()> {
        Ok(())
    }

    async fn before_tool(&self, _state: &mut StageState) -> Result<()> {
        Ok(())
    }

    async fn after_tool(&self, _state: &mut StageState) -> Result<()> {
        Ok(())
    }

    async fn after_agent(&self, _state: &mut StageState) -> Result<()> {
        Ok(())
    }

    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Priority-ordered middleware chain.
pub struct Chain {
    /// Ascending priority order.
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    stage_timeout: Option<Duration>,
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl Chain {
    pub fn new() -> Self {
        Self {
            middlewares: RwLock::new(Vec::new()),
            stage_timeout: None,
        }
    }

    /// Abort any single hook invocation that runs longer than `timeout`.
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    /// Register a middleware, keeping stable priority order.
    pub fn push(&self, mw: Arc<dyn Middleware>) {
        let mut list = self.middlewares.write();
        list.push(mw);
        list.sort_by_key(|m| m.priority());
    }

    /// Remove a middleware by name; true if one was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut list = self.middlewares.write();
        let before = list.len();
        list.retain(|m| m.name() != name);
        list.len() != before
    }

    /// Execution order for before-stages (outer first).
    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .rev()
            .map(|m| m.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.middlewares.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.read().is_empty()
    }

    /// Run every middleware's hook for `stage` in onion order. The first
    /// error short-circuits the rest and propagates.
    pub async fn run_stage(&self, stage: Stage, state: &mut StageState) -> Result<()> {
        let snapshot = self.snapshot();
        let outer_first = matches!(
            stage,
            Stage::BeforeAgent | Stage::BeforeModel | Stage::BeforeTool
        );
        if outer_first {
            for mw in snapshot.iter().rev() {
                self.invoke(mw, stage, state).await?;
            }
        } else {
            for mw in snapshot.iter() {
                self.invoke(mw, stage, state).await?;
            }
        }
        Ok(())
    }

    /// Process-lifecycle start: outer layers first.
    pub async fn start(&self) -> Result<()> {
        for mw in self.snapshot().iter().rev() {
            mw.on_start().await?;
        }
        Ok(())
    }

    /// Process-lifecycle stop: outer layers last.
    pub async fn stop(&self) -> Result<()> {
        for mw in self.snapshot().iter() {
            mw.on_stop().await?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares.read().clone()
    }

    async fn invoke(
        &self,
        mw: &Arc<dyn Middleware>,
        stage: Stage,
        state: &mut StageState,
    ) -> Result<()> {
        let fut = dispatch(mw, stage, state);
        // Panicking hooks convert to errors; they must not leak partial locks.
        let guarded = std::panic::AssertUnwindSafe(fut).catch_unwind();
        let outcome = match self.stage_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(TetherError::Timeout(format!(
                        "middleware {} stage {} exceeded {limit:?}",
                        mw.name(),
                        stage.as_str()
                    )))
                }
            },
            None => guarded.await,
        };
        match outcome {
            Ok(result) => result,
            Err(_panic) => {
                warn!(middleware = mw.name(), stage = stage.as_str(), "middleware panicked");
                Err(TetherError::Middleware {
                    name: mw.name().to_string(),
                    reason: format!("panicked in {}", stage.as_str()),
                })
            }
        }
    }
}

async fn dispatch(
    mw: &Arc<dyn Middleware>,
    stage: Stage,
    state: &mut StageState,
) -> Result<()> {
    match stage {
        Stage::BeforeAgent => mw.before_agent(state).await,
        Stage::BeforeModel => mw.before_model(state).await,
        Stage::AfterModel => mw.after_model(state).await,
        Stage::BeforeTool => mw.before_tool(state).await,
        Stage::AfterTool => mw.after_tool(state).await,
        Stage::AfterAgent => mw.after_agent(state).await,
    }
}
