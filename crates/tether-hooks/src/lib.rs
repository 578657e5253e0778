//! # tether-hooks
//!
//! Declarative shell hooks: subprocesses forked on lifecycle events, fed a
//! JSON payload on stdin, whose exit code and stdout JSON steer control flow
//! at the call site. Orthogonal to in-process middleware; shell hooks run
//! inside the corresponding middleware stage.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use tether_core::{Result, TetherError};

/// Lifecycle events a hook can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    PreCompact,
    SessionEnd,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::SessionStart => "SessionStart",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::PostToolUseFailure => "PostToolUseFailure",
            HookEvent::PreCompact => "PreCompact",
            HookEvent::SessionEnd => "SessionEnd",
        }
    }
}

/// Tool-name selector. An empty or `*` pattern matches every tool; anything
/// else is an anchored regex.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    pattern: Option<Regex>,
}

impl Selector {
    pub fn new(pattern: &str) -> Result<Self> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Self { pattern: None });
        }
        let anchored = format!("^(?:{trimmed})$");
        let regex = Regex::new(&anchored)
            .map_err(|e| TetherError::Config(format!("bad hook selector {trimmed:?}: {e}")))?;
        Ok(Self {
            pattern: Some(regex),
        })
    }

    pub fn matches(&self, tool_name: Option<&str>) -> bool {
        match (&self.pattern, tool_name) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(re), Some(name)) => re.is_match(name),
        }
    }
}

/// One declarative hook entry.
#[derive(Debug, Clone)]
pub struct ShellHook {
    pub event: HookEvent,
    /// Run via `sh -c`.
    pub command: String,
    pub selector: Selector,
    /// Overrides the executor's default timeout.
    pub timeout: Option<Duration>,
    pub env: HashMap<String, String>,
    pub name: String,
}

/// JSON payload written to a hook's stdin.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HookPayload {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A control-flow decision carried back from a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookDecision {
    Allow,
    Deny,
    Ask,
}

// Stdout shape hooks may emit on exit 0.
#[derive(Debug, Default, Deserialize)]
struct HookStdout {
    #[serde(default)]
    decision: Option<HookDecision>,
    #[serde(default, rename = "hookSpecificOutput")]
    hook_specific_output: Option<HookSpecificOutput>,
}

#[derive(Debug, Default, Deserialize)]
struct HookSpecificOutput {
    #[serde(default, rename = "permissionDecision")]
    permission_decision: Option<HookDecision>,
    #[serde(default, rename = "updatedInput")]
    updated_input: Option<serde_json::Map<String, Value>>,
}

/// Aggregated outcome of firing the hooks for one event.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    /// Strongest decision seen: deny > ask > allow.
    pub decision: Option<HookDecision>,
    /// Last `updatedInput` emitted, if any.
    pub updated_input: Option<serde_json::Map<String, Value>>,
    /// Hooks that ran.
    pub fired: usize,
}

impl HookOutcome {
    fn absorb_decision(&mut self, decision: HookDecision) {
        self.decision = Some(match (self.decision, decision) {
            (Some(HookDecision::Deny), _) | (_, HookDecision::Deny) => HookDecision::Deny,
            (Some(HookDecision::Ask), _) | (_, HookDecision::Ask) => HookDecision::Ask,
            _ => HookDecision::Allow,
        });
    }
}

/// Runs registered hooks for lifecycle events, in registration order.
pub struct HookExecutor {
    hooks: Vec<ShellHook>,
    default_timeout: Duration,
    work_dir: PathBuf,
}

impl HookExecutor {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            hooks: Vec::new(),
            default_timeout: Duration::from_secs(30),
            work_dir: work_dir.into(),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn register(&mut self, hooks: impl IntoIterator<Item = ShellHook>) {
        self.hooks.extend(hooks);
    }

    pub fn hooks_for(&self, event: HookEvent) -> usize {
        self.hooks.iter().filter(|h| h.event == event).count()
    }

    /// Fire every hook registered for `event` whose selector matches.
    ///
    /// Exit 0 with JSON stdout contributes a decision and/or updated input.
    /// Exit 2 is a blocking error: it short-circuits remaining hooks and
    /// surfaces as [`TetherError::HookBlocked`]. Other non-zero exits are
    /// logged and ignored.
    pub async fn fire(&self, event: HookEvent, payload: &HookPayload) -> Result<HookOutcome> {
        let mut outcome = HookOutcome::default();
        let stdin_json = {
            let mut value = serde_json::to_value(payload)?;
            if let Value::Object(map) = &mut value {
                map.insert(
                    "hook_event_name".to_string(),
                    Value::String(event.as_str().to_string()),
                );
            }
            serde_json::to_vec(&value)?
        };

        for hook in self.hooks.iter().filter(|h| h.event == event) {
            if !hook.selector.matches(payload.tool_name.as_deref()) {
                continue;
            }
            outcome.fired += 1;
            let timeout = hook.timeout.unwrap_or(self.default_timeout);
            match self.run_one(hook, &stdin_json, timeout).await? {
                RunOutcome::Success(stdout) => {
                    if let Ok(parsed) = serde_json::from_slice::<HookStdout>(&stdout) {
                        let mut decision = parsed.decision;
                        if let Some(specific) = parsed.hook_specific_output {
                            if let Some(perm) = specific.permission_decision {
                                decision = Some(perm);
                            }
                            if let Some(updated) = specific.updated_input {
                                outcome.updated_input = Some(updated);
                            }
                        }
                        if let Some(decision) = decision {
                            outcome.absorb_decision(decision);
                            if decision == HookDecision::Deny {
                                debug!(hook = %hook.name, "hook denied, short-circuiting");
                                return Ok(outcome);
                            }
                        }
                    }
                }
                RunOutcome::NonBlockingFailure => {}
            }
        }
        Ok(outcome)
    }

    async fn run_one(
        &self,
        hook: &ShellHook,
        stdin_json: &[u8],
        timeout: Duration,
    ) -> Result<RunOutcome> {
        debug!(hook = %hook.name, event = hook.event.as_str(), "firing shell hook");
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&hook.command)
            .current_dir(&self.work_dir)
            .envs(&hook.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(stdin_json).await;
            drop(stdin);
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(hook = %hook.name, ?timeout, "hook timed out, killed");
                return Ok(RunOutcome::NonBlockingFailure);
            }
        };

        match output.status.code() {
            Some(0) => Ok(RunOutcome::Success(output.stdout)),
            Some(2) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!(hook = %hook.name, %stderr, "hook raised blocking error");
                Err(TetherError::HookBlocked {
                    hook: hook.name.clone(),
                    stderr,
                })
            }
            code => {
                warn!(hook = %hook.name, ?code, "hook failed (non-blocking)");
                Ok(RunOutcome::NonBlockingFailure)
            }
        }
    }
}

enum RunOutcome {
    Success(Vec<u8>),
    NonBlockingFailure,
}
