use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub project: ProjectConfig,
    pub agent: AgentConfig,
    pub sandbox: SandboxConfig,
    pub approval: ApprovalConfig,
    pub session: SessionConfig,
    pub compaction: CompactionConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project root; falls back to the current directory.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: String,
    pub fallback_model: Option<String>,
    /// Model used for history summarization; defaults to `model`.
    pub summarizer_model: Option<String>,
    pub max_iterations: u32,
    pub request_timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub tool_timeout_secs: u64,
    pub max_tool_output_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "tether-large".to_string(),
            fallback_model: None,
            summarizer_model: None,
            max_iterations: 20,
            request_timeout_secs: 300,
            max_tokens: 4096,
            temperature: None,
            tool_timeout_secs: 120,
            max_tool_output_chars: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Sandbox root; defaults to the project root.
    pub root: Option<PathBuf>,
    pub allow_paths: Vec<PathBuf>,
    pub allowed_hosts: Vec<String>,
    pub command_denylist: Vec<String>,
    pub cli_mode: bool,
    pub cpu_percent_cap: Option<f64>,
    pub memory_bytes_cap: Option<u64>,
    pub disk_bytes_cap: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Record log directory; defaults to `<project-root>/.tether/approvals`.
    pub dir: Option<PathBuf>,
    pub wait_timeout_secs: u64,
    pub retention_days: u32,
    pub retention_count: usize,
    pub retention_bytes: u64,
    /// Zero disables the periodic GC task.
    pub gc_interval_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            dir: None,
            wait_timeout_secs: 120,
            retention_days: 7,
            retention_count: 1000,
            retention_bytes: 0,
            gc_interval_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session root; defaults to `<project-root>/.tether/sessions`.
    pub root: Option<PathBuf>,
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            root: None,
            max_sessions: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Token budget the estimate is compared against.
    pub budget_tokens: usize,
    /// Compaction triggers at `estimate / budget >= threshold`.
    pub threshold: f64,
    /// Trailing messages always preserved verbatim.
    pub preserve_count: usize,
    /// Leading non-system messages preserved after the system head.
    pub initial_count: usize,
    /// Token allowance for preserving long middle user messages.
    pub user_text_tokens: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Offline audit artifacts land here when set.
    pub rollout_dir: Option<PathBuf>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            budget_tokens: 120_000,
            threshold: 0.8,
            preserve_count: 4,
            initial_count: 0,
            user_text_tokens: 0,
            max_retries: 2,
            retry_delay_ms: 500,
            rollout_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub subscriber_capacity: usize,
    pub subscriber_timeout_secs: u64,
    /// LRU de-dup window; zero disables.
    pub dedup_window: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            subscriber_timeout_secs: 5,
            dedup_window: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl TetherConfig {
    /// Validate the configuration. Returns warnings for questionable values;
    /// errors for unusable ones.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();
        if self.agent.model.trim().is_empty() {
            return Err("agent.model must not be empty".into());
        }
        if self.agent.max_iterations == 0 {
            return Err("agent.max_iterations must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.compaction.threshold) {
            return Err(format!(
                "compaction.threshold {} out of range [0, 1]",
                self.compaction.threshold
            ));
        }
        if self.agent.max_tool_output_chars == 0 {
            warnings.push("agent.max_tool_output_chars is 0; tool output will be dropped".into());
        }
        if self.compaction.enabled && self.compaction.budget_tokens == 0 {
            warnings.push("compaction.budget_tokens is 0; compaction will never trigger".into());
        }
        if self.session.max_sessions == 0 {
            warnings.push("session.max_sessions is 0; treated as 1".into());
        }
        Ok(warnings)
    }
}
