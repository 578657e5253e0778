use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_core::{Result, TetherError};
use tether_wal::Position;

use crate::log::RecordLog;

const DEFAULT_RETENTION_DAYS: u32 = 7;
const DEFAULT_RETENTION_COUNT: usize = 1000;

/// Receives GC results asynchronously.
pub type GcCallback = Arc<dyn Fn(GcStats) + Send + Sync>;

/// Retention policy. All active thresholds must be satisfied by the kept
/// suffix; zero disables a threshold.
#[derive(Clone, Default)]
pub struct GcConfig {
    /// Periodic GC interval; `None` disables automation.
    pub interval: Option<Duration>,
    pub retention_days: u32,
    pub retention_count: usize,
    pub retention_bytes: u64,
    pub callback: Option<GcCallback>,
}

impl GcConfig {
    pub fn defaults() -> Self {
        Self {
            interval: None,
            retention_days: DEFAULT_RETENTION_DAYS,
            retention_count: DEFAULT_RETENTION_COUNT,
            retention_bytes: 0,
            callback: None,
        }
    }
}

/// Outcome of one GC run.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub triggered_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub auto: bool,
    pub dropped: usize,
    pub dropped_bytes: u64,
    pub before_count: usize,
    pub after_count: usize,
    pub before_bytes: u64,
    pub after_bytes: u64,
    pub oldest_dropped: Option<DateTime<Utc>>,
    pub oldest_kept: Option<DateTime<Utc>>,
    pub retention_days: u32,
    pub retention_count: usize,
    pub retention_bytes: u64,
}

/// Cumulative housekeeping metrics.
#[derive(Debug, Clone, Default)]
pub struct GcStatus {
    pub runs: u64,
    pub total_dropped: u64,
    pub total_dropped_bytes: u64,
    pub last: Option<GcStats>,
    pub auto_enabled: bool,
}

pub(crate) struct GcCtl {
    pub(crate) cfg: GcConfig,
    runs: u64,
    total_dropped: u64,
    total_dropped_bytes: u64,
    last: Option<GcStats>,
    task: Option<tokio::task::JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

impl Default for GcCtl {
    fn default() -> Self {
        Self {
            cfg: GcConfig::defaults(),
            runs: 0,
            total_dropped: 0,
            total_dropped_bytes: 0,
            last: None,
            task: None,
            cancel: None,
        }
    }
}

struct RecordMeta {
    requested_at: DateTime<Utc>,
    id: String,
    position: Position,
    size: u64,
}

impl RecordLog {
    /// Update the retention policy; starts or stops the auto-GC loop to
    /// match `cfg.interval`.
    pub fn configure_gc(log: &Arc<Self>, cfg: GcConfig) {
        let interval = cfg.interval;
        {
            let mut gc = log.gc.lock();
            gc.cfg = cfg;
        }
        match interval {
            Some(d) => Self::start_auto_gc(log, d),
            None => log.stop_auto_gc(),
        }
    }

    /// Launch a background task that runs GC on the given interval.
    pub fn start_auto_gc(log: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            log.stop_auto_gc();
            return;
        }
        log.stop_auto_gc();
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let task_log = Arc::clone(log);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task_log.run_gc_once(true) {
                            warn!(error = %e, "auto gc run failed");
                        }
                    }
                    _ = child.cancelled() => return,
                }
            }
        });
        let mut gc = log.gc.lock();
        gc.cfg.interval = Some(interval);
        gc.task = Some(task);
        gc.cancel = Some(cancel);
    }

    /// Stop the background GC loop, if running.
    pub fn stop_auto_gc(&self) {
        let (cancel, task) = {
            let mut gc = self.gc.lock();
            gc.cfg.interval = None;
            (gc.cancel.take(), gc.task.take())
        };
        if let Some(c) = cancel {
            c.cancel();
        }
        if let Some(t) = task {
            t.abort();
        }
    }

    /// Run retention immediately with the configured policy.
    pub fn gc(&self) -> Result<GcStats> {
        self.run_gc_once(false)
    }

    /// Cumulative metrics.
    pub fn gc_status(&self) -> GcStatus {
        let gc = self.gc.lock();
        GcStatus {
            runs: gc.runs,
            total_dropped: gc.total_dropped,
            total_dropped_bytes: gc.total_dropped_bytes,
            last: gc.last.clone(),
            auto_enabled: gc.task.is_some(),
        }
    }

    fn run_gc_once(&self, auto: bool) -> Result<GcStats> {
        let cfg = self.gc.lock().cfg.clone();
        let started = std::time::Instant::now();
        let now = Utc::now();
        let mut stats = GcStats {
            triggered_at: Some(now),
            auto,
            retention_days: cfg.retention_days,
            retention_count: cfg.retention_count,
            retention_bytes: cfg.retention_bytes,
            ..Default::default()
        };

        let result = {
            let mut inner = self.inner.lock();
            if inner.closed {
                Err(TetherError::SessionClosed)
            } else {
                let mut entries: Vec<RecordMeta> = inner
                    .records
                    .values()
                    .map(|r| RecordMeta {
                        requested_at: r.requested_at,
                        id: r.id.clone(),
                        position: inner.positions.get(&r.id).copied().unwrap_or(0),
                        size: inner.entry_size.get(&r.id).copied().unwrap_or(0),
                    })
                    .collect();
                entries.sort_by(|a, b| {
                    a.requested_at
                        .cmp(&b.requested_at)
                        .then_with(|| a.id.cmp(&b.id))
                });
                stats.before_count = entries.len();
                stats.before_bytes = entries.iter().map(|e| e.size).sum();

                let keep_start = compute_keep_start(&entries, &cfg, now);
                if keep_start == 0 {
                    stats.after_count = stats.before_count;
                    stats.after_bytes = stats.before_bytes;
                    stats.oldest_kept = entries.first().map(|e| e.requested_at);
                    Ok(())
                } else {
                    let dropped = &entries[..keep_start];
                    stats.dropped = dropped.len();
                    stats.dropped_bytes = dropped.iter().map(|e| e.size).sum();
                    stats.after_count = stats.before_count - stats.dropped;
                    stats.after_bytes = stats.before_bytes - stats.dropped_bytes;
                    stats.oldest_dropped = dropped.last().map(|e| e.requested_at);
                    stats.oldest_kept = entries.get(keep_start).map(|e| e.requested_at);

                    let truncate_pos = entries
                        .get(keep_start)
                        .map(|e| e.position)
                        .unwrap_or(inner.next_position);
                    let outcome = inner.wal.truncate(truncate_pos);
                    if outcome.is_ok() {
                        for meta in dropped {
                            inner.records.remove(&meta.id);
                            inner.positions.remove(&meta.id);
                            inner.entry_size.remove(&meta.id);
                        }
                        debug!(
                            dropped = stats.dropped,
                            truncate_pos, "approval gc trimmed record log"
                        );
                    }
                    outcome
                }
            }
        };

        stats.duration = started.elapsed();
        {
            let mut gc = self.gc.lock();
            gc.runs += 1;
            gc.total_dropped += stats.dropped as u64;
            gc.total_dropped_bytes += stats.dropped_bytes;
            gc.last = Some(stats.clone());
        }
        if let Some(cb) = cfg.callback.clone() {
            let snapshot = stats.clone();
            cb(snapshot);
        }
        result.map(|_| stats)
    }
}

fn compute_keep_start(entries: &[RecordMeta], cfg: &GcConfig, now: DateTime<Utc>) -> usize {
    let mut keep = 0usize;
    if cfg.retention_days > 0 {
        let cutoff = now - chrono::Duration::days(cfg.retention_days as i64);
        let idx = entries.partition_point(|e| e.requested_at < cutoff);
        keep = keep.max(idx);
    }
    if cfg.retention_count > 0 && entries.len() > cfg.retention_count {
        keep = keep.max(entries.len() - cfg.retention_count);
    }
    if cfg.retention_bytes > 0 {
        let total: u64 = entries.iter().map(|e| e.size).sum();
        if total > cfg.retention_bytes {
            let mut prefix = 0u64;
            for (i, entry) in entries.iter().enumerate() {
                if total - prefix <= cfg.retention_bytes {
                    break;
                }
                prefix += entry.size;
                keep = keep.max(i + 1);
            }
        }
    }
    keep.min(entries.len())
}
