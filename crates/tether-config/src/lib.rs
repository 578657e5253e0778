//! # tether-config
//!
//! TOML configuration schema and loader. The loader resolves an explicit
//! path, the `TETHER_CONFIG` env var, or `~/.tether/tether.toml`, applies
//! kernel-recognized env overrides (`AGENTSDK_PROJECT_ROOT`,
//! `AGENTSDK_MAX_SESSIONS`), and validates before handing the config out.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    AgentConfig, ApprovalConfig, CompactionConfig, EventsConfig, LoggingConfig, ProjectConfig,
    SandboxConfig, SessionConfig, TetherConfig,
};
