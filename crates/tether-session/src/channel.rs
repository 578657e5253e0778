use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_core::{Result, TetherError};
use tether_wal::Position;

/// The three physical WAL streams a session writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Progress,
    Control,
    Monitor,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Progress, Channel::Control, Channel::Monitor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Progress => "progress",
            Channel::Control => "control",
            Channel::Monitor => "monitor",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest acknowledged WAL position per channel. `-1` means no entry yet.
pub type Cursors = HashMap<Channel, Position>;

/// Serialized checkpoint payloads are bounded to 1 MiB.
pub const MAX_CHECKPOINT_BYTES: usize = 1 << 20;

/// A named snapshot of the transcript at a specific WAL position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    /// JSON-serialized message snapshot.
    pub state: String,
    #[serde(default)]
    pub cursors: Cursors,
}

impl Checkpoint {
    /// Size of the serialized state payload in bytes.
    pub fn size(&self) -> usize {
        self.state.len()
    }
}

/// Validate and normalize a checkpoint name: lowercase alphanumerics + dash.
pub fn normalize_checkpoint_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(TetherError::InvalidRequest(
            "checkpoint name is empty".into(),
        ));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(TetherError::InvalidRequest(format!(
            "invalid checkpoint name {trimmed:?}: lowercase alphanumerics and dashes only"
        )));
    }
    Ok(trimmed.to_string())
}
