use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tether_core::Result;

/// Lifecycle state of a tool approval. Transitions are one-way:
/// `pending` moves to exactly one terminal state and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl Decision {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Decision::Pending)
    }
}

/// A single approval decision, kept for auditing and crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Random 64-bit hex token.
    pub id: String,
    pub session_id: String,
    pub tool: String,
    /// Tool params captured verbatim at request time.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
    pub decision: Decision,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    /// True when the decision came from a whitelist hit, not a reviewer.
    #[serde(default)]
    pub auto: bool,
}

/// Constrains audit log queries.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub session_id: Option<String>,
    pub tool: Option<String>,
    pub decision: Option<Decision>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Filter {
    pub fn matches(&self, rec: &ApprovalRecord) -> bool {
        if let Some(sid) = &self.session_id {
            if &rec.session_id != sid {
                return false;
            }
        }
        if let Some(tool) = &self.tool {
            if &rec.tool != tool {
                return false;
            }
        }
        if let Some(decision) = self.decision {
            if rec.decision != decision {
                return false;
            }
        }
        if let Some(since) = self.since {
            if rec.requested_at < since {
                return false;
            }
        }
        true
    }
}

/// Persists approval records and supports queries.
pub trait Store: Send + Sync {
    /// Write the latest version of the record.
    fn append(&self, rec: &ApprovalRecord) -> Result<()>;
    /// Latest known version of every record.
    fn all(&self) -> Vec<ApprovalRecord>;
    /// Filtered view, ordered by request time then id.
    fn query(&self, filter: &Filter) -> Vec<ApprovalRecord>;
    fn close(&self) -> Result<()>;
}

/// In-memory store for tests and ephemeral agents.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ApprovalRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn append(&self, rec: &ApprovalRecord) -> Result<()> {
        self.records.write().insert(rec.id.clone(), rec.clone());
        Ok(())
    }

    fn all(&self) -> Vec<ApprovalRecord> {
        self.records.read().values().cloned().collect()
    }

    fn query(&self, filter: &Filter) -> Vec<ApprovalRecord> {
        let mut list: Vec<ApprovalRecord> = self
            .records
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_records(&mut list);
        if filter.limit > 0 && list.len() > filter.limit {
            list.truncate(filter.limit);
        }
        list
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn sort_records(list: &mut [ApprovalRecord]) {
    list.sort_by(|a, b| {
        a.requested_at
            .cmp(&b.requested_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Random 64-bit hex token.
pub fn new_record_id() -> String {
    let bytes: [u8; 8] = rand::random();
    let mut out = String::with_capacity(16);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
