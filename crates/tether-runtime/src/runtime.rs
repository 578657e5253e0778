use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tether_approval::{GcConfig, Queue, RecordLog, Whitelist};
use tether_config::TetherConfig;
use tether_core::event::event_type;
use tether_core::{
    validate_session_id, BusConfig, ContentBlock, Event, EventBus, Message, Result, Role,
    StreamingTool, TetherError, Tool, ToolCall,
};
use tether_hooks::{HookDecision, HookEvent, HookExecutor, HookPayload, ShellHook};
use tether_llm::{ModelProvider, ProviderPool, StopReason, Usage};
use tether_middleware::{
    Chain, Middleware, StreamAdapter, StreamEvent, PING_INTERVAL,
};
use tether_sandbox::{ResourceCaps, Sandbox, SandboxPolicy, SandboxSnapshot};
use tether_session::SessionManager;
use tether_wal::WalOptions;

use crate::agent_loop::{AgentLoop, RunContext};
use crate::compactor::Compactor;
use crate::executor::{ExecutorConfig, RunScope, ToolExecutor};
use crate::registry::{McpSession, ToolRegistry};
use crate::trace::ToolOutputLog;

/// One request into the runtime.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub prompt: String,
    pub content: Vec<ContentBlock>,
    /// Generated when absent.
    pub session_id: Option<String>,
    pub request_id: Option<String>,
    /// Logical model tier override; unmapped tiers are used verbatim.
    pub model_tier: Option<String>,
    /// Restricts this run to the named tools.
    pub allowed_tools: Option<Vec<String>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl RunRequest {
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            prompt: text.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.model_tier = Some(tier.into());
        self
    }
}

/// Final outcome of a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub session_id: String,
    pub request_id: String,
    /// Final assistant text.
    pub output: String,
    pub stop_reason: StopReason,
    pub usage: Usage,
    /// Tool calls invoked, in dispatch order.
    pub tool_calls: Vec<ToolCall>,
    pub iterations: u32,
    pub sandbox: SandboxSnapshot,
}

/// Handle on a streaming run.
pub struct RunHandle {
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<Result<RunResult>>,
}

impl RunHandle {
    /// Cancel the background work; it stops at the next safe checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Await the terminal status.
    pub async fn wait(self) -> Result<RunResult> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(TetherError::Cancelled("run task aborted".into())),
            Err(e) => Err(TetherError::Other(anyhow::anyhow!("run task panicked: {e}"))),
        }
    }
}

/// The public entry point: wires sandbox, tools, models, middleware, hooks,
/// approvals, sessions, compaction, and the event bus into one value.
/// Cloning is cheap; clones share the same runtime state.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: TetherConfig,
    project_root: PathBuf,
    sandbox: Arc<Sandbox>,
    registry: Arc<ToolRegistry>,
    pool: Arc<ProviderPool>,
    middlewares: Vec<Arc<dyn Middleware>>,
    hooks: Arc<HookExecutor>,
    approvals: Arc<Queue>,
    approval_log: Arc<RecordLog>,
    sessions: Arc<SessionManager>,
    executor: Arc<ToolExecutor>,
    compactor: Compactor,
    bus: EventBus,
    closed: AtomicBool,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    pub fn approvals(&self) -> &Arc<Queue> {
        &self.inner.approvals
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    /// Approval record-log housekeeping metrics.
    pub fn approval_gc_status(&self) -> tether_approval::GcStatus {
        self.inner.approval_log.gc_status()
    }

    pub fn project_root(&self) -> &PathBuf {
        &self.inner.project_root
    }

    /// Re-synchronize an MCP session's tools (e.g. after a tools-changed
    /// notification) and announce the change on the bus.
    pub async fn sync_mcp_tools(&self, session: Arc<dyn McpSession>) -> Result<Vec<String>> {
        let server = session.name().to_string();
        let names = self.inner.registry.sync_mcp(session).await?;
        self.inner.bus.publish(
            Event::new(event_type::MCP_TOOLS_CHANGED, "").with_payload(json!({
                "server": server,
                "tools": names.clone(),
            })),
        );
        Ok(names)
    }

    /// Run a request to completion.
    pub async fn run(&self, request: RunRequest) -> Result<RunResult> {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Run a request under an external cancellation signal.
    pub async fn run_with_cancel(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunResult> {
        self.run_internal(request, cancel, None).await
    }

    /// Start a streaming run. The event channel is returned immediately;
    /// the work continues on a background task that closes the channel when
    /// done. A terminal `error` event precedes close on failure.
    pub fn run_stream(
        &self,
        request: RunRequest,
    ) -> Result<(mpsc::Receiver<StreamEvent>, RunHandle)> {
        self.ensure_open()?;
        validate_request(&request)?;

        let (adapter, rx) = StreamAdapter::new(256);
        let sender = adapter.sender();
        let cancel = CancellationToken::new();
        let runtime = self.clone();
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            let ping_tx = sender.clone();
            let ping_cancel = task_cancel.clone();
            let ping = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PING_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if ping_tx.send(StreamEvent::Ping {}).await.is_err() {
                                break;
                            }
                        }
                        _ = ping_cancel.cancelled() => break,
                    }
                }
            });

            let result = runtime
                .run_internal(request, task_cancel.clone(), Some((adapter, sender.clone())))
                .await;
            ping.abort();
            if let Err(e) = &result {
                let _ = sender
                    .send(StreamEvent::Error { error: e.to_wire() })
                    .await;
            }
            result
        });
        Ok((rx, RunHandle { cancel, join }))
    }

    async fn run_internal(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
        stream: Option<(StreamAdapter, mpsc::Sender<StreamEvent>)>,
    ) -> Result<RunResult> {
        let inner = &self.inner;
        self.ensure_open()?;
        validate_request(&request)?;

        let session_id = match &request.session_id {
            Some(id) => {
                validate_session_id(id)?;
                id.clone()
            }
            None => format!("sess-{}", uuid::Uuid::new_v4()),
        };
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Model availability is a hard blocker, checked up front.
        let model_name = match &request.model_tier {
            Some(tier) => inner
                .pool
                .tier_name(tier)
                .map(|s| s.to_string())
                .unwrap_or_else(|| tier.clone()),
            None => inner.config.agent.model.clone(),
        };
        let model = inner.pool.model(&model_name).await?;

        let (session, first_seen) = inner.sessions.open(&session_id)?;
        if first_seen {
            let payload = HookPayload {
                session_id: session_id.clone(),
                ..Default::default()
            };
            if let Err(e) = inner.hooks.fire(HookEvent::SessionStart, &payload).await {
                warn!(error = %e, "session-start hook error");
            }
            inner
                .bus
                .publish(Event::new(event_type::SESSION_START, &session_id));
        }

        let prompt_payload = HookPayload {
            session_id: session_id.clone(),
            prompt: Some(request.prompt.clone()),
            ..Default::default()
        };
        let outcome = inner
            .hooks
            .fire(HookEvent::UserPromptSubmit, &prompt_payload)
            .await?;
        if outcome.decision == Some(HookDecision::Deny) {
            return Err(TetherError::PermissionDenied(
                "prompt rejected by hook".into(),
            ));
        }

        // Concurrent runs against the same session serialize here.
        let run_lock = inner.sessions.run_lock(&session_id);
        let _guard = run_lock.lock().await;

        let mut user_message = if request.content.is_empty() {
            Message::user(request.prompt.clone())
        } else {
            let mut msg = Message::text(Role::User, "");
            msg.content = request.content.clone();
            msg
        };
        user_message.metadata = request.metadata.clone();
        session.append(user_message)?;

        inner.bus.publish(
            Event::new(event_type::RUN_STARTED, &session_id)
                .with_payload(json!({ "request_id": request_id.clone() })),
        );

        // Per-run chain: user middlewares plus, for streaming, the adapter.
        let chain = Chain::new();
        for mw in &inner.middlewares {
            chain.push(Arc::clone(mw));
        }
        let stream_sender = match stream {
            Some((adapter, sender)) => {
                chain.push(Arc::new(adapter));
                Some(sender)
            }
            None => None,
        };

        let scope = RunScope {
            session: Arc::clone(&session),
            request_id: request_id.clone(),
            cancel: cancel.clone(),
            allowed_tools: request
                .allowed_tools
                .as_ref()
                .map(|names| names.iter().cloned().collect::<HashSet<String>>()),
        };
        let mut state =
            tether_middleware::StageState::for_run(session_id.clone(), request_id.clone());
        let mut run_ctx = RunContext::default();

        let agent_loop = AgentLoop {
            chain: &chain,
            model,
            model_name,
            executor: &inner.executor,
            scope: &scope,
            tools: inner.registry.descriptors(),
            system: None,
            max_tokens: inner.config.agent.max_tokens,
            temperature: inner.config.agent.temperature,
            max_iterations: inner.config.agent.max_iterations,
            timeout: Duration::from_secs(inner.config.agent.request_timeout_secs),
            cancel: cancel.clone(),
            stream: stream_sender,
        };
        let outcome = agent_loop.run(&mut state, &mut run_ctx).await;

        match outcome {
            Ok(outcome) => {
                if let Err(e) = self
                    .inner
                    .compactor
                    .maybe_compact(&session, &inner.hooks, &inner.bus)
                    .await
                {
                    warn!(session = %session_id, error = %e, "compaction check failed");
                }
                inner.bus.publish(
                    Event::new(event_type::RUN_COMPLETED, &session_id).with_payload(json!({
                        "request_id": request_id.clone(),
                        "iterations": outcome.iterations,
                    })),
                );
                info!(
                    session = %session_id,
                    request = %request_id,
                    iterations = outcome.iterations,
                    "run complete"
                );
                Ok(RunResult {
                    session_id,
                    request_id,
                    output: outcome.response.message.text_content(),
                    stop_reason: outcome.response.stop_reason,
                    usage: outcome.usage,
                    tool_calls: outcome.tool_calls,
                    iterations: outcome.iterations,
                    sandbox: inner.sandbox.snapshot(),
                })
            }
            Err(e) => {
                inner.bus.publish(
                    Event::new(event_type::RUN_COMPLETED, &session_id).with_payload(json!({
                        "request_id": request_id.clone(),
                        "error": e.to_wire(),
                    })),
                );
                Err(e)
            }
        }
    }

    /// Close one session, firing its SessionEnd hook.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let payload = HookPayload {
            session_id: session_id.to_string(),
            ..Default::default()
        };
        if let Err(e) = self.inner.hooks.fire(HookEvent::SessionEnd, &payload).await {
            warn!(error = %e, "session-end hook error");
        }
        self.inner
            .bus
            .publish(Event::new(event_type::SESSION_END, session_id));
        self.inner.sessions.close(session_id)
    }

    /// Shut the runtime down: SessionEnd for every live session, close the
    /// stores, stop middlewares, drain the bus.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for id in self.inner.sessions.live_ids() {
            let payload = HookPayload {
                session_id: id.clone(),
                ..Default::default()
            };
            if let Err(e) = self.inner.hooks.fire(HookEvent::SessionEnd, &payload).await {
                warn!(session = %id, error = %e, "session-end hook error");
            }
            self.inner
                .bus
                .publish(Event::new(event_type::SESSION_END, &id));
        }
        self.inner.sessions.close_all()?;
        self.inner.approvals.close()?;
        for mw in self.inner.middlewares.iter() {
            if let Err(e) = mw.on_stop().await {
                warn!(middleware = mw.name(), error = %e, "on-stop error");
            }
        }
        self.inner.bus.close().await;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TetherError::InvalidRequest("runtime is closed".into()));
        }
        Ok(())
    }
}

fn validate_request(request: &RunRequest) -> Result<()> {
    if request.prompt.trim().is_empty() && request.content.is_empty() {
        return Err(TetherError::InvalidRequest(
            "prompt and content are both empty".into(),
        ));
    }
    if let Some(id) = &request.session_id {
        validate_session_id(id)?;
    }
    Ok(())
}

/// Process exit code for CLI callers: 0 success, 2 blocking hook error,
/// 1 anything else.
pub fn exit_code(error: Option<&TetherError>) -> i32 {
    match error {
        None => 0,
        Some(TetherError::HookBlocked { .. }) => 2,
        Some(_) => 1,
    }
}

/// Assembles a [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: Option<TetherConfig>,
    provider: Option<Arc<dyn ModelProvider>>,
    tools: Vec<Arc<dyn Tool>>,
    streaming_tools: Vec<Arc<dyn StreamingTool>>,
    middlewares: Vec<Arc<dyn Middleware>>,
    shell_hooks: Vec<ShellHook>,
    mcp_sessions: Vec<Arc<dyn McpSession>>,
    tiers: HashMap<String, String>,
    approval_required: HashSet<String>,
    bus: Option<EventBus>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: TetherConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn streaming_tool(mut self, tool: Arc<dyn StreamingTool>) -> Self {
        self.streaming_tools.push(tool);
        self
    }

    pub fn middleware(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(mw);
        self
    }

    pub fn shell_hook(mut self, hook: ShellHook) -> Self {
        self.shell_hooks.push(hook);
        self
    }

    pub fn mcp_session(mut self, session: Arc<dyn McpSession>) -> Self {
        self.mcp_sessions.push(session);
        self
    }

    /// Map a logical tier name to a concrete model.
    pub fn tier(mut self, tier: impl Into<String>, model: impl Into<String>) -> Self {
        self.tiers.insert(tier.into(), model.into());
        self
    }

    /// Gate a tool behind the approval queue.
    pub fn require_approval(mut self, tool: impl Into<String>) -> Self {
        self.approval_required.insert(tool.into());
        self
    }

    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub async fn build(self) -> Result<Runtime> {
        let config = self.config.unwrap_or_default();
        let provider = self
            .provider
            .ok_or_else(|| TetherError::Config("a model provider is required".into()))?;

        let project_root = match config.project.root.clone() {
            Some(root) => root,
            None => std::env::current_dir()?,
        };

        let sandbox_root = config
            .sandbox
            .root
            .clone()
            .unwrap_or_else(|| project_root.clone());
        let sandbox = Arc::new(Sandbox::new(SandboxPolicy {
            root: sandbox_root,
            allow_paths: config.sandbox.allow_paths.clone(),
            allowed_hosts: config.sandbox.allowed_hosts.clone(),
            command_denylist: config.sandbox.command_denylist.clone(),
            cli_mode: config.sandbox.cli_mode,
            caps: ResourceCaps {
                cpu_percent: config.sandbox.cpu_percent_cap,
                memory_bytes: config.sandbox.memory_bytes_cap,
                disk_bytes: config.sandbox.disk_bytes_cap,
            },
        })?);

        let session_root = config
            .session
            .root
            .clone()
            .unwrap_or_else(|| project_root.join(".tether").join("sessions"));
        let sessions = Arc::new(SessionManager::with_max_sessions(
            session_root,
            WalOptions::default(),
            config.session.max_sessions.max(1),
        ));

        let approval_dir = config
            .approval
            .dir
            .clone()
            .unwrap_or_else(|| project_root.join(".tether").join("approvals"));
        let approval_log = Arc::new(RecordLog::open(approval_dir, WalOptions::default())?);
        RecordLog::configure_gc(&approval_log, GcConfig {
            interval: (config.approval.gc_interval_secs > 0)
                .then(|| Duration::from_secs(config.approval.gc_interval_secs)),
            retention_days: config.approval.retention_days,
            retention_count: config.approval.retention_count,
            retention_bytes: config.approval.retention_bytes,
            callback: None,
        });
        let approvals = Arc::new(Queue::new(
            Arc::clone(&approval_log) as Arc<dyn tether_approval::Store>,
            Arc::new(Whitelist::new()),
        ));

        let bus = self.bus.unwrap_or_else(|| {
            EventBus::new(BusConfig {
                subscriber_capacity: config.events.subscriber_capacity,
                subscriber_timeout: Some(Duration::from_secs(
                    config.events.subscriber_timeout_secs,
                )),
                dedup_window: config.events.dedup_window,
                ..Default::default()
            })
        });

        let trace = Arc::new(ToolOutputLog::new(&project_root));
        let mut hooks = HookExecutor::new(&project_root);
        hooks.register(self.shell_hooks);
        let hooks = Arc::new(hooks);

        let registry = Arc::new(ToolRegistry::new());
        for tool in self.tools {
            registry.register(tool);
        }
        for tool in self.streaming_tools {
            registry.register_streaming(tool);
        }
        for session in self.mcp_sessions {
            registry.sync_mcp(session).await?;
        }

        let mut pool = ProviderPool::new(provider);
        for (tier, model) in self.tiers {
            pool = pool.with_tier(tier, model);
        }
        let pool = Arc::new(pool);

        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&sandbox),
            Arc::clone(&approvals),
            Arc::clone(&hooks),
            Arc::clone(&trace),
            bus.clone(),
            ExecutorConfig {
                max_output_chars: config.agent.max_tool_output_chars,
                tool_timeout: Duration::from_secs(config.agent.tool_timeout_secs),
                approval_wait: Duration::from_secs(config.approval.wait_timeout_secs),
                approval_required: self.approval_required,
            },
        ));

        let mut compaction = config.compaction.clone();
        if compaction.rollout_dir.is_none() {
            compaction.rollout_dir = Some(trace.rollout_dir());
        }
        let summarizer = config
            .agent
            .summarizer_model
            .clone()
            .unwrap_or_else(|| config.agent.model.clone());
        let compactor = Compactor::new(
            compaction,
            Arc::clone(&pool),
            summarizer,
            config.agent.fallback_model.clone(),
        );

        // Kept in ascending priority order; process-lifecycle start runs
        // outer layers (high priority) first, stop runs them last.
        let mut middlewares = self.middlewares;
        middlewares.sort_by_key(|m| m.priority());
        for mw in middlewares.iter().rev() {
            mw.on_start().await?;
        }

        info!(root = %project_root.display(), tools = registry.len(), "runtime ready");
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                config,
                project_root,
                sandbox,
                registry,
                pool,
                middlewares,
                hooks,
                approvals,
                approval_log,
                sessions,
                executor,
                compactor,
                bus,
                closed: AtomicBool::new(false),
            }),
        })
    }
}
