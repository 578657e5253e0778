use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_approval::{Decision, Queue};
use tether_core::event::event_type;
use tether_core::{
    Event, EventBus, Result, StreamingTool, TetherError, Tool, ToolCall, ToolContext, ToolResult,
};
use tether_hooks::{HookDecision, HookEvent, HookExecutor, HookPayload};
use tether_sandbox::Sandbox;
use tether_session::FileSession;

use crate::registry::{ToolEntry, ToolRegistry};
use crate::trace::ToolOutputLog;
use crate::validate::validate_args;

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Output cap in characters; longer output is truncated and flagged.
    pub max_output_chars: usize,
    pub tool_timeout: Duration,
    /// How long a gated call waits before the queue records a timeout.
    pub approval_wait: Duration,
    /// Tools whose effective policy always requires prompting.
    pub approval_required: HashSet<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_output_chars: 30_000,
            tool_timeout: Duration::from_secs(120),
            approval_wait: Duration::from_secs(120),
            approval_required: HashSet::new(),
        }
    }
}

/// Per-run execution scope handed to the executor by the loop.
pub struct RunScope {
    pub session: Arc<FileSession>,
    pub request_id: String,
    pub cancel: CancellationToken,
    /// Request-level tool whitelist; `None` allows every registered tool.
    pub allowed_tools: Option<HashSet<String>>,
}

/// Resolves, validates, sandboxes, gates, invokes, and records tool calls.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    sandbox: Arc<Sandbox>,
    approvals: Arc<Queue>,
    hooks: Arc<HookExecutor>,
    trace: Arc<ToolOutputLog>,
    bus: EventBus,
    config: ExecutorConfig,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        sandbox: Arc<Sandbox>,
        approvals: Arc<Queue>,
        hooks: Arc<HookExecutor>,
        trace: Arc<ToolOutputLog>,
        bus: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            sandbox,
            approvals,
            hooks,
            trace,
            bus,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute one tool call through the full policy pipeline.
    pub async fn execute(&self, scope: &RunScope, call: &ToolCall) -> Result<ToolResult> {
        let started = Instant::now();
        match self.execute_inner(scope, call, started).await {
            Ok(result) => {
                self.record_trace(scope, call, Some(&result), None, started);
                let payload = HookPayload {
                    session_id: scope.session.id().to_string(),
                    tool_name: Some(call.name.clone()),
                    tool_input: Some(call.arguments.clone()),
                    tool_response: Some(json!({
                        "output": result.output.clone(),
                        "success": result.success,
                    })),
                    ..Default::default()
                };
                if let Err(e) = self.hooks.fire(HookEvent::PostToolUse, &payload).await {
                    warn!(tool = %call.name, error = %e, "post-tool hook error");
                }
                self.publish_tool_event(scope, call, result.success);
                Ok(result)
            }
            Err(e) => {
                self.record_trace(scope, call, None, Some(&e), started);
                let payload = HookPayload {
                    session_id: scope.session.id().to_string(),
                    tool_name: Some(call.name.clone()),
                    tool_input: Some(call.arguments.clone()),
                    tool_response: Some(json!({ "error": e.to_string() })),
                    ..Default::default()
                };
                if let Err(hook_err) = self
                    .hooks
                    .fire(HookEvent::PostToolUseFailure, &payload)
                    .await
                {
                    warn!(tool = %call.name, error = %hook_err, "post-tool-failure hook error");
                }
                self.publish_tool_event(scope, call, false);
                Err(e)
            }
        }
    }

    /// Execute calls sequentially in emission order, converting errors into
    /// error results so later calls still run.
    pub async fn execute_all(&self, scope: &RunScope, calls: &[ToolCall]) -> Vec<ToolResult> {
        let mut out = Vec::with_capacity(calls.len());
        for call in calls {
            let result = match self.execute(scope, call).await {
                Ok(result) => result,
                Err(e) => ToolResult::error(call.id.clone(), e.to_string()),
            };
            out.push(result);
        }
        out
    }

    async fn execute_inner(
        &self,
        scope: &RunScope,
        call: &ToolCall,
        started: Instant,
    ) -> Result<ToolResult> {
        // 1. Request-level whitelist, then registry lookup. MCP-prefixed
        // names route through the adapter the registry installed.
        if let Some(allowed) = &scope.allowed_tools {
            if !allowed.contains(&call.name) {
                return Err(TetherError::PermissionDenied(format!(
                    "tool {} not in the request whitelist",
                    call.name
                )));
            }
        }
        let entry = self
            .registry
            .lookup(&call.name)
            .ok_or_else(|| TetherError::ToolNotFound(call.name.clone()))?;

        // 2. Coercion + schema validation; no side effects on failure.
        let schema = entry.schema();
        let mut args = call.arguments.clone();
        validate_args(&call.name, &schema, &mut args)?;

        // 3. PreToolUse hook: may rewrite the arguments or decide the call.
        let payload = HookPayload {
            session_id: scope.session.id().to_string(),
            tool_name: Some(call.name.clone()),
            tool_input: Some(args.clone()),
            ..Default::default()
        };
        let outcome = self.hooks.fire(HookEvent::PreToolUse, &payload).await?;
        if let Some(updated) = outcome.updated_input {
            args = updated;
            validate_args(&call.name, &schema, &mut args)?;
        }
        let mut force_ask = false;
        match outcome.decision {
            Some(HookDecision::Deny) => {
                return Err(TetherError::ToolUseDenied {
                    tool: call.name.clone(),
                    reason: "denied by hook".into(),
                })
            }
            Some(HookDecision::Ask) => force_ask = true,
            _ => {}
        }

        // 4. Sandbox policies keyed by the tool's declared capabilities.
        self.sandbox.check_tool_call(&entry.capabilities(), &args)?;

        // 5. Approval gate.
        let required = force_ask || self.config.approval_required.contains(&call.name);
        if required {
            self.gate(scope, call, &args, force_ask).await?;
        }

        // 6. Invoke under the per-call timeout and the run's cancel signal.
        let ctx = ToolContext {
            session_id: scope.session.id().to_string(),
            request_id: scope.request_id.clone(),
            call_id: call.id.clone(),
            cancel: scope.cancel.child_token(),
            timeout: Some(self.config.tool_timeout),
        };
        let mut result = self.invoke(&entry, &ctx, args, scope).await?;

        // 7. Bounded output.
        let (output, truncated) = truncate_chars(&result.output, self.config.max_output_chars);
        if truncated {
            result
                .metadata
                .insert("truncated".into(), Value::Bool(true));
            result.metadata.insert(
                "original_chars".into(),
                Value::from(result.output.chars().count()),
            );
            result.output = output;
        }
        result.tool_call_id = call.id.clone();
        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    async fn gate(
        &self,
        scope: &RunScope,
        call: &ToolCall,
        args: &serde_json::Map<String, Value>,
        force_ask: bool,
    ) -> Result<()> {
        let session_id = scope.session.id();
        let (record, auto) = if force_ask {
            (self.approvals.request_forced(session_id, &call.name, args)?, false)
        } else {
            self.approvals.request(session_id, &call.name, args)?
        };
        if auto {
            debug!(tool = %call.name, id = %record.id, "auto-approved via whitelist");
            scope.session.append_approval(record)?;
            return Ok(());
        }

        self.bus.publish(
            Event::new(event_type::APPROVAL_REQUESTED, session_id)
                .with_payload(json!({ "id": record.id.clone(), "tool": call.name.clone() })),
        );
        info!(tool = %call.name, id = %record.id, "tool call awaiting approval");
        let decided = self.approvals.wait(&record.id, self.config.approval_wait).await?;
        scope.session.append_approval(decided.clone())?;
        self.bus.publish(
            Event::new(event_type::APPROVAL_DECIDED, session_id)
                .with_payload(json!({ "id": decided.id.clone(), "decision": decided.decision })),
        );
        match decided.decision {
            Decision::Approved => Ok(()),
            Decision::Rejected => Err(TetherError::ToolUseDenied {
                tool: call.name.clone(),
                reason: format!("rejected by reviewer: {}", decided.comment),
            }),
            Decision::Timeout => Err(TetherError::Timeout(format!(
                "approval for {} timed out",
                call.name
            ))),
            Decision::Pending => Err(TetherError::ToolUseRequiresApproval {
                tool: call.name.clone(),
            }),
        }
    }

    async fn invoke(
        &self,
        entry: &ToolEntry,
        ctx: &ToolContext,
        args: serde_json::Map<String, Value>,
        scope: &RunScope,
    ) -> Result<ToolResult> {
        let timeout = self.config.tool_timeout;
        match entry {
            ToolEntry::Plain(tool) => {
                tokio::select! {
                    result = tool.execute(ctx, args) => result,
                    _ = scope.cancel.cancelled() => Err(TetherError::Cancelled(format!(
                        "tool {} cancelled", tool.name()
                    ))),
                    _ = tokio::time::sleep(timeout) => Err(TetherError::Timeout(format!(
                        "tool {} exceeded {timeout:?}", tool.name()
                    ))),
                }
            }
            ToolEntry::Streaming(tool) => {
                // The cap applies across chunks; the aggregate output is the
                // truncated concatenation of everything observed.
                let cap = self.config.max_output_chars;
                let mut buf = String::new();
                let mut budget = cap;
                let mut sink = |chunk: &str| {
                    if budget == 0 {
                        return;
                    }
                    let take: String = chunk.chars().take(budget).collect();
                    budget -= take.chars().count();
                    buf.push_str(&take);
                };
                let invocation = tool.execute_streaming(ctx, args, &mut sink);
                let result = tokio::select! {
                    result = invocation => result,
                    _ = scope.cancel.cancelled() => Err(TetherError::Cancelled(
                        "streaming tool cancelled".into()
                    )),
                    _ = tokio::time::sleep(timeout) => Err(TetherError::Timeout(format!(
                        "streaming tool exceeded {timeout:?}"
                    ))),
                };
                let mut result = result?;
                result.output = buf;
                Ok(result)
            }
        }
    }

    fn record_trace(
        &self,
        scope: &RunScope,
        call: &ToolCall,
        result: Option<&ToolResult>,
        error: Option<&TetherError>,
        started: Instant,
    ) {
        let entry = json!({
            "session_id": scope.session.id(),
            "request_id": scope.request_id.clone(),
            "call": call,
            "result": result,
            "error": error.map(|e| e.to_string()),
            "duration_ms": started.elapsed().as_millis() as u64,
        });
        if let Err(e) = self.trace.record(scope.session.id(), &entry) {
            warn!(error = %e, "tool trace write failed");
        }
    }

    fn publish_tool_event(&self, scope: &RunScope, call: &ToolCall, success: bool) {
        self.bus.publish(
            Event::new(event_type::TOOL_EXECUTED, scope.session.id()).with_payload(json!({
                "tool": call.name.clone(),
                "call_id": call.id.clone(),
                "success": success,
            })),
        );
    }
}

fn truncate_chars(s: &str, max: usize) -> (String, bool) {
    let count = s.chars().count();
    if count <= max {
        (s.to_string(), false)
    } else {
        (s.chars().take(max).collect(), true)
    }
}
