use std::io::Write;
use std::path::PathBuf;

use tether_core::{sanitize_session_id, Result};

/// Per-session tool invocation log under `<project-root>/.trace/`, one JSON
/// line per invocation.
pub struct ToolOutputLog {
    dir: PathBuf,
}

impl ToolOutputLog {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            dir: project_root.into().join(".trace"),
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn record(&self, session_id: &str, entry: &serde_json::Value) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(format!("log-{}.jsonl", sanitize_session_id(session_id)));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }

    /// Directory for compaction rollout artifacts.
    pub fn rollout_dir(&self) -> PathBuf {
        self.dir.join("rollout")
    }
}
