//! # tether-runtime
//!
//! The execution kernel: the public [`Runtime`] entry point, the bounded
//! agent loop, the tool executor with sandboxing and human-in-the-loop
//! approval, the tool registry with MCP session merge, and the context
//! compactor.

pub mod agent_loop;
pub mod compactor;
pub mod executor;
pub mod registry;
pub mod runtime;
pub mod trace;
pub mod validate;

pub use agent_loop::{AgentLoop, LoopOutcome, RunContext};
pub use compactor::Compactor;
pub use executor::{ExecutorConfig, RunScope, ToolExecutor};
pub use registry::{McpSession, ToolEntry, ToolRegistry, MCP_PREFIX};
pub use runtime::{exit_code, RunHandle, RunRequest, RunResult, Runtime, RuntimeBuilder};
pub use trace::ToolOutputLog;
pub use validate::validate_args;
