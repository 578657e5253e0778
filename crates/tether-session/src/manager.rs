use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as TokioMutex;
use tracing::{info, warn};

use tether_core::{validate_session_id, Result};
use tether_wal::WalOptions;

use crate::file::FileSession;

/// Environment override for the live-session LRU cap.
pub const MAX_SESSIONS_ENV: &str = "AGENTSDK_MAX_SESSIONS";

const DEFAULT_MAX_SESSIONS: usize = 64;

/// Opens and caches durable sessions under one root, bounding the number of
/// live sessions with LRU eviction and handing out per-session run locks so
/// concurrent runs against the same session serialize.
pub struct SessionManager {
    root: PathBuf,
    opts: WalOptions,
    max_sessions: usize,
    inner: Mutex<ManagerInner>,
    run_locks: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

struct ManagerInner {
    sessions: HashMap<String, Arc<FileSession>>,
    /// LRU order, least-recently-used first.
    order: Vec<String>,
    seen: HashSet<String>,
}

impl SessionManager {
    pub fn new(root: impl AsRef<Path>, opts: WalOptions) -> Self {
        let max_sessions = std::env::var(MAX_SESSIONS_ENV)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_SESSIONS);
        Self::with_max_sessions(root, opts, max_sessions)
    }

    pub fn with_max_sessions(
        root: impl AsRef<Path>,
        opts: WalOptions,
        max_sessions: usize,
    ) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            opts,
            max_sessions: max_sessions.max(1),
            inner: Mutex::new(ManagerInner {
                sessions: HashMap::new(),
                order: Vec::new(),
                seen: HashSet::new(),
            }),
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open (or return the cached) session, marking it most recently used.
    /// The second value is true the first time this process sees the id.
    pub fn open(&self, id: &str) -> Result<(Arc<FileSession>, bool)> {
        validate_session_id(id)?;
        let mut inner = self.inner.lock();
        let first_seen = inner.seen.insert(id.to_string());
        if let Some(session) = inner.sessions.get(id).cloned() {
            touch(&mut inner.order, id);
            return Ok((session, first_seen));
        }
        let session = Arc::new(FileSession::open(id, &self.root, self.opts.clone())?);
        inner.sessions.insert(id.to_string(), Arc::clone(&session));
        inner.order.push(id.to_string());
        info!(session = id, "session opened");
        self.evict_locked(&mut inner);
        Ok((session, first_seen))
    }

    /// Close and drop a session from the cache.
    pub fn close(&self, id: &str) -> Result<()> {
        let session = {
            let mut inner = self.inner.lock();
            inner.order.retain(|s| s != id);
            inner.sessions.remove(id)
        };
        if let Some(session) = session {
            session.close()?;
            info!(session = id, "session closed");
        }
        Ok(())
    }

    /// Per-session run lock; hold the guard for the duration of a run to
    /// prevent interleaving runs on the same session.
    pub fn run_lock(&self, id: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self.run_locks.lock();
        Arc::clone(
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(()))),
        )
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn live_ids(&self) -> Vec<String> {
        self.inner.lock().sessions.keys().cloned().collect()
    }

    /// Close every cached session.
    pub fn close_all(&self) -> Result<()> {
        let sessions: Vec<Arc<FileSession>> = {
            let mut inner = self.inner.lock();
            inner.order.clear();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        let mut first_err = None;
        for session in sessions {
            if let Err(e) = session.close() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // Evict least-recently-used sessions over the cap, skipping any session
    // currently holding its run lock.
    fn evict_locked(&self, inner: &mut ManagerInner) {
        while inner.sessions.len() > self.max_sessions {
            let Some(victim) = inner.order.iter().find(|id| {
                self.run_locks
                    .lock()
                    .get(id.as_str())
                    .map(|l| l.try_lock().is_ok())
                    .unwrap_or(true)
            }) else {
                warn!("all live sessions busy, lru cap exceeded");
                return;
            };
            let victim = victim.clone();
            inner.order.retain(|s| s != &victim);
            if let Some(session) = inner.sessions.remove(&victim) {
                if let Err(e) = session.close() {
                    warn!(session = %victim, error = %e, "evicted session close failed");
                }
                info!(session = %victim, "session evicted (lru)");
            }
        }
    }
}

fn touch(order: &mut Vec<String>, id: &str) {
    if let Some(pos) = order.iter().position(|s| s == id) {
        let s = order.remove(pos);
        order.push(s);
    }
}
