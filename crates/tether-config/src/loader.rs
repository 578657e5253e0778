use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use tether_core::{Result, TetherError};

use crate::schema::TetherConfig;

/// Loads the Tether configuration from disk with env overrides.
pub struct ConfigLoader {
    config: Arc<RwLock<TetherConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > `TETHER_CONFIG` env >
    /// `~/.tether/tether.toml`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("TETHER_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tether")
            .join("tether.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<TetherConfig>(&raw).map_err(|e| {
                TetherError::Config(format!("failed to parse {}: {e}", config_path.display()))
            })?
        } else {
            TetherConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{w}");
                }
            }
            Err(e) => return Err(TetherError::Config(e)),
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> TetherConfig {
        self.config.read().clone()
    }

    /// Shared handle for subscription.
    pub fn shared(&self) -> Arc<RwLock<TetherConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply environment overrides; the config file takes priority for
    /// values it sets explicitly, env fills kernel-recognized knobs.
    fn apply_env_overrides(mut config: TetherConfig) -> TetherConfig {
        if config.project.root.is_none() {
            if let Ok(v) = std::env::var("AGENTSDK_PROJECT_ROOT") {
                if !v.trim().is_empty() {
                    config.project.root = Some(PathBuf::from(v));
                }
            }
        }
        if let Ok(v) = std::env::var("AGENTSDK_MAX_SESSIONS") {
            if let Ok(n) = v.trim().parse::<usize>() {
                if n > 0 {
                    config.session.max_sessions = n;
                }
            }
        }
        if let Ok(v) = std::env::var("TETHER_AGENT_MODEL") {
            if !v.trim().is_empty() {
                config.agent.model = v;
            }
        }
        if let Ok(v) = std::env::var("TETHER_LOG_LEVEL") {
            if !v.trim().is_empty() {
                config.logging.level = v;
            }
        }
        config
    }

    /// Reload from disk.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(TetherError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = toml::from_str::<TetherConfig>(&raw).map_err(|e| {
            TetherError::Config(format!(
                "failed to parse {}: {e}",
                self.config_path.display()
            ))
        })?;
        let new_config = Self::apply_env_overrides(new_config);
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }
}
