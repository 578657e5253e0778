//! # tether-sandbox
//!
//! Three orthogonal policies consulted on every tool invocation: a rooted
//! filesystem allow-list with symlink resolution, a network host allow-list,
//! and a command denylist. Per-invocation resource caps ride along.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use tether_core::tool::capability;
use tether_core::{Result, TetherError};

mod command;
mod net;
mod path;

pub use command::DEFAULT_DENYLIST;

/// Per-invocation resource ceilings; `None` disables a cap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceCaps {
    pub cpu_percent: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
}

/// Usage a tool declares for an invocation.
#[derive(Debug, Clone, Default)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

/// Declarative sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// Relative tool paths are joined against this root; resolved paths must
    /// stay under it or under an allow-path entry.
    pub root: PathBuf,
    #[serde(default)]
    pub allow_paths: Vec<PathBuf>,
    /// Case-insensitive exact host or dotted-suffix matches. No wildcards.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Extra denylist tokens on top of the built-in set.
    #[serde(default)]
    pub command_denylist: Vec<String>,
    /// Relaxes shell meta-character screening for interactive CLI callers.
    #[serde(default)]
    pub cli_mode: bool,
    #[serde(default)]
    pub caps: ResourceCaps,
}

impl SandboxPolicy {
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            allow_paths: Vec::new(),
            allowed_hosts: Vec::new(),
            command_denylist: Vec::new(),
            cli_mode: false,
            caps: ResourceCaps::default(),
        }
    }
}

/// Serializable view of the active policy, reported with run results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSnapshot {
    pub root: PathBuf,
    pub allow_paths: Vec<PathBuf>,
    pub allowed_hosts: Vec<String>,
    pub cli_mode: bool,
    pub caps: ResourceCaps,
}

/// Compiled sandbox enforcing a [`SandboxPolicy`].
pub struct Sandbox {
    policy: SandboxPolicy,
    deny_tokens: Vec<String>,
    deny_patterns: Vec<Regex>,
}

impl Sandbox {
    pub fn new(policy: SandboxPolicy) -> Result<Self> {
        let deny_tokens = command::build_denylist(&policy.command_denylist);
        let deny_patterns = command::build_patterns()?;
        Ok(Self {
            policy,
            deny_tokens,
            deny_patterns,
        })
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn snapshot(&self) -> SandboxSnapshot {
        SandboxSnapshot {
            root: self.policy.root.clone(),
            allow_paths: self.policy.allow_paths.clone(),
            allowed_hosts: self.policy.allowed_hosts.clone(),
            cli_mode: self.policy.cli_mode,
            caps: self.policy.caps.clone(),
        }
    }

    /// Resolve a path argument (symlinks dereferenced, relative paths joined
    /// to the sandbox root) and reject it if it escapes the allow-list.
    pub fn check_path(&self, raw: &str) -> Result<PathBuf> {
        let joined = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            self.policy.root.join(raw)
        };
        let resolved = path::resolve(&joined)?;
        let root = path::resolve(&self.policy.root).unwrap_or_else(|_| self.policy.root.clone());
        if resolved.starts_with(&root) {
            return Ok(resolved);
        }
        for allow in &self.policy.allow_paths {
            let allow = path::resolve(allow).unwrap_or_else(|_| allow.clone());
            if resolved.starts_with(&allow) {
                return Ok(resolved);
            }
        }
        warn!(path = %resolved.display(), "path escapes sandbox");
        Err(TetherError::PermissionDenied(format!(
            "path escapes sandbox: {}",
            resolved.display()
        )))
    }

    /// Reject hosts not covered by the allow-list.
    pub fn check_host(&self, host: &str) -> Result<()> {
        if net::host_allowed(host, &self.policy.allowed_hosts) {
            Ok(())
        } else {
            Err(TetherError::PermissionDenied(format!(
                "host not allowed: {host}"
            )))
        }
    }

    /// Screen a raw shell command against the denylist.
    pub fn check_command(&self, cmd: &str) -> Result<()> {
        command::screen(
            cmd,
            &self.deny_tokens,
            &self.deny_patterns,
            self.policy.cli_mode,
        )
    }

    /// Reject the invocation if declared usage would exceed the caps.
    pub fn check_usage(&self, usage: &ResourceUsage) -> Result<()> {
        if let Some(cap) = self.policy.caps.cpu_percent {
            if usage.cpu_percent > cap {
                return Err(TetherError::PermissionDenied(format!(
                    "cpu usage {:.1}% exceeds cap {:.1}%",
                    usage.cpu_percent, cap
                )));
            }
        }
        if let Some(cap) = self.policy.caps.memory_bytes {
            if usage.memory_bytes > cap {
                return Err(TetherError::PermissionDenied(format!(
                    "memory usage {} exceeds cap {}",
                    usage.memory_bytes, cap
                )));
            }
        }
        if let Some(cap) = self.policy.caps.disk_bytes {
            if usage.disk_bytes > cap {
                return Err(TetherError::PermissionDenied(format!(
                    "disk usage {} exceeds cap {}",
                    usage.disk_bytes, cap
                )));
            }
        }
        Ok(())
    }

    /// Apply every relevant policy to a tool call's arguments based on the
    /// tool's declared capabilities.
    pub fn check_tool_call(
        &self,
        capabilities: &[String],
        params: &serde_json::Map<String, Value>,
    ) -> Result<()> {
        for cap in capabilities {
            match cap.as_str() {
                capability::FILESYSTEM => {
                    for raw in collect_strings(params, &["path", "file_path", "dir", "paths"]) {
                        self.check_path(&raw)?;
                    }
                }
                capability::NETWORK => {
                    for raw in collect_strings(params, &["host"]) {
                        self.check_host(&raw)?;
                    }
                    for raw in collect_strings(params, &["url"]) {
                        if let Some(host) = net::host_of_url(&raw) {
                            self.check_host(&host)?;
                        }
                    }
                }
                capability::COMMAND => {
                    for raw in collect_strings(params, &["command"]) {
                        self.check_command(&raw)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn collect_strings(params: &serde_json::Map<String, Value>, keys: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    for key in keys {
        match params.get(*key) {
            Some(Value::String(s)) => out.push(s.clone()),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Value::String(s) = item {
                        out.push(s.clone());
                    }
                }
            }
            _ => {}
        }
    }
    out
}
