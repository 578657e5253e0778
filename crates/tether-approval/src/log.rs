use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use tracing::debug;

use tether_core::{Result, TetherError};
use tether_wal::{frame_size, Position, Wal, WalOptions};

use crate::gc::GcCtl;
use crate::record::{sort_records, ApprovalRecord, Filter, Store};

pub(crate) const WAL_ENTRY_TYPE: &str = "approval";

/// WAL-backed [`Store`]: replays on open to rebuild the latest decision per
/// record, and supports retention GC over the underlying segments.
pub struct RecordLog {
    pub(crate) inner: Mutex<LogInner>,
    pub(crate) gc: Mutex<GcCtl>,
}

pub(crate) struct LogInner {
    pub(crate) wal: Wal,
    pub(crate) records: HashMap<String, ApprovalRecord>,
    pub(crate) positions: HashMap<String, Position>,
    pub(crate) entry_size: HashMap<String, u64>,
    pub(crate) next_position: Position,
    pub(crate) closed: bool,
}

impl RecordLog {
    /// Open (or create) the record log rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, opts: WalOptions) -> Result<Self> {
        let dir = dir.as_ref();
        if dir.as_os_str().is_empty() {
            return Err(TetherError::InvalidRequest(
                "approval log dir is empty".into(),
            ));
        }
        std::fs::create_dir_all(dir)?;
        let wal = Wal::open(dir, opts)?;

        let mut records = HashMap::new();
        let mut positions = HashMap::new();
        let mut entry_size = HashMap::new();
        let mut next_position = wal.next_position();
        wal.replay(|entry| {
            if entry.entry_type != WAL_ENTRY_TYPE {
                return Ok(());
            }
            let rec: ApprovalRecord = serde_json::from_slice(&entry.data)
                .map_err(|e| TetherError::Integrity(format!("decode approval wal: {e}")))?;
            entry_size.insert(
                rec.id.clone(),
                frame_size(WAL_ENTRY_TYPE.len(), entry.data.len()) as u64,
            );
            positions.insert(rec.id.clone(), entry.position);
            if entry.position >= next_position {
                next_position = entry.position + 1;
            }
            records.insert(rec.id.clone(), rec);
            Ok(())
        })?;

        Ok(Self {
            inner: Mutex::new(LogInner {
                wal,
                records,
                positions,
                entry_size,
                next_position,
                closed: false,
            }),
            gc: Mutex::new(GcCtl::default()),
        })
    }
}

impl Store for RecordLog {
    fn append(&self, rec: &ApprovalRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TetherError::SessionClosed);
        }
        let data = serde_json::to_vec(rec)?;
        let pos = inner.wal.append(WAL_ENTRY_TYPE, &data)?;
        inner.wal.sync()?;
        inner
            .entry_size
            .insert(rec.id.clone(), frame_size(WAL_ENTRY_TYPE.len(), data.len()) as u64);
        inner.positions.insert(rec.id.clone(), pos);
        inner.records.insert(rec.id.clone(), rec.clone());
        if pos >= inner.next_position {
            inner.next_position = pos + 1;
        }
        debug!(id = %rec.id, decision = ?rec.decision, position = pos, "approval record persisted");
        Ok(())
    }

    fn all(&self) -> Vec<ApprovalRecord> {
        self.inner.lock().records.values().cloned().collect()
    }

    fn query(&self, filter: &Filter) -> Vec<ApprovalRecord> {
        let inner = self.inner.lock();
        let mut list: Vec<ApprovalRecord> = inner
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        drop(inner);
        sort_records(&mut list);
        if filter.limit > 0 && list.len() > filter.limit {
            list.truncate(filter.limit);
        }
        list
    }

    fn close(&self) -> Result<()> {
        self.stop_auto_gc();
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.wal.close()
    }
}
