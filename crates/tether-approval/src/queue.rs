use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::info;

use tether_core::{Result, TetherError};

use crate::record::{new_record_id, ApprovalRecord, Decision, Filter, MemoryStore, Store};
use crate::whitelist::Whitelist;

/// Coordinates approval requests, whitelist checks, and persistence.
///
/// State transitions are crash-consistent: every transition is appended to
/// the store before the in-memory index is updated, and `new` replays the
/// store to rebuild the index and re-seed the whitelist from approved
/// records.
pub struct Queue {
    store: Arc<dyn Store>,
    whitelist: Arc<Whitelist>,
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    index: HashMap<String, ApprovalRecord>,
    pending: HashMap<String, ApprovalRecord>,
    waiters: HashMap<String, Vec<oneshot::Sender<ApprovalRecord>>>,
}

impl Queue {
    /// Restore queue state from `store` and seed the whitelist.
    pub fn new(store: Arc<dyn Store>, whitelist: Arc<Whitelist>) -> Self {
        let mut index = HashMap::new();
        let mut pending = HashMap::new();
        for rec in store.all() {
            match rec.decision {
                Decision::Approved => {
                    whitelist.add(&rec.session_id, &rec.tool, &rec.params, rec.requested_at);
                }
                Decision::Pending => {
                    pending.insert(rec.id.clone(), rec.clone());
                }
                _ => {}
            }
            index.insert(rec.id.clone(), rec);
        }
        Self {
            store,
            whitelist,
            inner: Mutex::new(QueueInner {
                index,
                pending,
                waiters: HashMap::new(),
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(Whitelist::new()))
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Enqueue a tool invocation for approval. Whitelist hits come back
    /// immediately as `(record, true)` with a pre-filled approved decision.
    pub fn request(
        &self,
        session_id: &str,
        tool: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(ApprovalRecord, bool)> {
        let session_id = session_id.trim();
        let tool = tool.trim();
        if session_id.is_empty() {
            return Err(TetherError::InvalidRequest(
                "approval: session id required".into(),
            ));
        }
        if tool.is_empty() {
            return Err(TetherError::InvalidRequest(
                "approval: tool name required".into(),
            ));
        }

        let mut inner = self.inner.lock();
        let now = Utc::now();
        if self.whitelist.allowed(session_id, tool, params) {
            let rec = ApprovalRecord {
                id: new_record_id(),
                session_id: session_id.to_string(),
                tool: tool.to_string(),
                params: params.clone(),
                decision: Decision::Approved,
                requested_at: now,
                decided_at: Some(now),
                comment: "whitelisted".into(),
                auto: true,
            };
            self.store.append(&rec)?;
            inner.index.insert(rec.id.clone(), rec.clone());
            return Ok((rec, true));
        }

        let rec = self.enqueue_pending(&mut inner, session_id, tool, params)?;
        Ok((rec, false))
    }

    /// Enqueue a pending record even when the whitelist already covers the
    /// (tool, params) pair — used when a hook answers `ask`, which overrides
    /// the whitelist for that call only.
    pub fn request_forced(
        &self,
        session_id: &str,
        tool: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ApprovalRecord> {
        let mut inner = self.inner.lock();
        self.enqueue_pending(&mut inner, session_id.trim(), tool.trim(), params)
    }

    fn enqueue_pending(
        &self,
        inner: &mut QueueInner,
        session_id: &str,
        tool: &str,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ApprovalRecord> {
        let rec = ApprovalRecord {
            id: new_record_id(),
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            params: params.clone(),
            decision: Decision::Pending,
            requested_at: Utc::now(),
            decided_at: None,
            comment: String::new(),
            auto: false,
        };
        self.store.append(&rec)?;
        inner.index.insert(rec.id.clone(), rec.clone());
        inner.pending.insert(rec.id.clone(), rec.clone());
        info!(id = %rec.id, tool, session = session_id, "approval requested");
        Ok(rec)
    }

    /// Approve a pending request and admit it to the session whitelist.
    pub fn approve(&self, id: &str, comment: &str) -> Result<ApprovalRecord> {
        let rec = self.decide(id, Decision::Approved, comment, "approved")?;
        // Only a genuine pending -> approved transition may whitelist.
        if rec.decision == Decision::Approved {
            self.whitelist.add(
                &rec.session_id,
                &rec.tool,
                &rec.params,
                rec.decided_at.unwrap_or(rec.requested_at),
            );
        }
        Ok(rec)
    }

    /// Record a denial for a pending request.
    pub fn reject(&self, id: &str, comment: &str) -> Result<ApprovalRecord> {
        self.decide(id, Decision::Rejected, comment, "rejected")
    }

    /// Expire a pending request no reviewer answered in time.
    pub fn timeout(&self, id: &str) -> Result<ApprovalRecord> {
        self.decide(id, Decision::Timeout, "", "timeout")
    }

    /// Snapshot of unreviewed requests; empty `session_id` means all sessions.
    pub fn pending(&self, session_id: &str) -> Vec<ApprovalRecord> {
        let inner = self.inner.lock();
        let mut out: Vec<ApprovalRecord> = inner
            .pending
            .values()
            .filter(|r| session_id.is_empty() || r.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        out
    }

    /// Latest known record by id.
    pub fn lookup(&self, id: &str) -> Option<ApprovalRecord> {
        self.inner.lock().index.get(id).cloned()
    }

    /// Filtered audit query against the backing store.
    pub fn query(&self, filter: &Filter) -> Vec<ApprovalRecord> {
        self.store.query(filter)
    }

    /// Block until the record reaches a terminal decision, or convert the
    /// wait into a `timeout` decision after `timeout`.
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<ApprovalRecord> {
        let rx = {
            let mut inner = self.inner.lock();
            match inner.index.get(id) {
                None => return Err(TetherError::ApprovalNotFound(id.to_string())),
                Some(rec) if rec.decision.is_terminal() => return Ok(rec.clone()),
                Some(_) => {}
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(id.to_string()).or_default().push(tx);
            rx
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(rec)) => Ok(rec),
            Ok(Err(_)) => self
                .lookup(id)
                .ok_or_else(|| TetherError::ApprovalNotFound(id.to_string())),
            Err(_) => {
                info!(id, "approval wait timed out");
                match self.timeout(id) {
                    Ok(rec) => Ok(rec),
                    // A reviewer decided at the same instant the wait
                    // expired; hand back the recorded terminal decision.
                    Err(e) => match self.lookup(id) {
                        Some(rec) if rec.decision.is_terminal() => Ok(rec),
                        _ => Err(e),
                    },
                }
            }
        }
    }

    pub fn close(&self) -> Result<()> {
        self.store.close()
    }

    fn decide(
        &self,
        id: &str,
        decision: Decision,
        comment: &str,
        default_comment: &str,
    ) -> Result<ApprovalRecord> {
        let mut inner = self.inner.lock();
        // Only a pending record can transition; terminal decisions are
        // final and a second transition attempt is an error.
        let Some(mut rec) = inner.pending.remove(id) else {
            return Err(TetherError::ApprovalNotFound(format!("{id} not pending")));
        };
        rec.decision = decision;
        rec.decided_at = Some(Utc::now());
        rec.comment = if comment.trim().is_empty() {
            default_comment.to_string()
        } else {
            comment.to_string()
        };
        if let Err(e) = self.store.append(&rec) {
            // Persistence failed: restore pending so the transition can retry.
            inner.pending.insert(id.to_string(), rec);
            return Err(e);
        }
        inner.index.insert(id.to_string(), rec.clone());
        let waiters = inner.waiters.remove(id).unwrap_or_default();
        drop(inner);
        for tx in waiters {
            let _ = tx.send(rec.clone());
        }
        info!(id, decision = ?rec.decision, "approval decided");
        Ok(rec)
    }
}
