use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the entire Tether runtime.
#[derive(Error, Debug)]
pub enum TetherError {
    // ── Request validation ─────────────────────────────────────
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("invalid arguments for tool {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    // ── Lookup failures ────────────────────────────────────────
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("approval record not found: {0}")]
    ApprovalNotFound(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    // ── Policy ─────────────────────────────────────────────────
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("tool use denied: {tool}: {reason}")]
    ToolUseDenied { tool: String, reason: String },

    #[error("tool use requires approval: {tool}")]
    ToolUseRequiresApproval { tool: String },

    #[error("blocking hook error: {hook}: {stderr}")]
    HookBlocked { hook: String, stderr: String },

    // ── Limits ─────────────────────────────────────────────────
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("iteration budget exceeded: {max} iterations")]
    IterationBudget { max: u32 },

    #[error("checkpoint exceeds maximum payload size: {size} bytes > {max}")]
    CheckpointTooLarge { size: usize, max: usize },

    // ── Session / storage ──────────────────────────────────────
    #[error("session closed")]
    SessionClosed,

    #[error("wal integrity error: {0}")]
    Integrity(String),

    #[error("middleware error: {name}: {reason}")]
    Middleware { name: String, reason: String },

    #[error("tool execution failed: {tool}: {reason}")]
    ToolExecution { tool: String, reason: String },

    // ── Upstream collaborators ─────────────────────────────────
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    // ── Config ─────────────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TetherError {
    /// Stable wire code for the structured user-visible error.
    pub fn code(&self) -> &'static str {
        use TetherError::*;
        match self {
            InvalidRequest(_) | InvalidSessionId(_) | InvalidArguments { .. } => "invalid_request",
            ToolNotFound(_) | CheckpointNotFound(_) | ApprovalNotFound(_) | ModelNotFound(_) => {
                "not_found"
            }
            PermissionDenied(_) | ToolUseDenied { .. } | HookBlocked { .. } => "permission_denied",
            ToolUseRequiresApproval { .. } => "requires_approval",
            Timeout(_) => "timeout",
            Cancelled(_) => "cancelled",
            IterationBudget { .. } | CheckpointTooLarge { .. } => "resource_exhausted",
            Integrity(_) => "integrity",
            UpstreamUnavailable(_) => "upstream_unavailable",
            SessionClosed | Middleware { .. } | ToolExecution { .. } | Config(_) | Io(_)
            | Serialization(_) | Other(_) => "internal",
        }
    }

    /// Convert into the structured `{code, message, details}` form surfaced
    /// to callers and emitted as a terminal `error` stream event.
    pub fn to_wire(&self) -> WireError {
        WireError {
            code: self.code().to_string(),
            message: self.to_string(),
            details: None,
        }
    }
}

/// Structured user-visible failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

pub type Result<T> = std::result::Result<T, TetherError>;
