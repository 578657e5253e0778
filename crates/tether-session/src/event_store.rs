use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use tether_core::{Bookmark, Event, Result, TetherError};
use tether_wal::WalOptions;

use crate::channel::Channel;
use crate::wal::ChannelWal;

/// Forces the JSONL event store instead of the WAL-backed one.
pub const LEGACY_ENV: &str = "EVENT_STORE_LEGACY";

/// Crash-safe event persistence. WAL-backed by default; falls back to a
/// plain JSONL file when `EVENT_STORE_LEGACY` is set or the WAL cannot be
/// opened. The JSONL path is unbounded by design.
pub struct FileEventStore {
    inner: Mutex<StoreInner>,
}

enum StoreInner {
    Wal {
        wal: ChannelWal,
        last_bookmark: Option<Bookmark>,
        closed: bool,
    },
    Legacy {
        path: PathBuf,
        file: Option<File>,
    },
}

impl FileEventStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() {
            return Err(TetherError::InvalidRequest(
                "event store path is empty".into(),
            ));
        }
        if legacy_mode_enabled() {
            debug!(path = %path.display(), "legacy jsonl event store forced by env");
            return Ok(Self {
                inner: Mutex::new(open_legacy(&path)?),
            });
        }

        let wal_dir = PathBuf::from(format!("{}.wal", path.display()));
        let wal = match ChannelWal::open(&wal_dir, WalOptions::default()) {
            Ok(wal) => wal,
            Err(e) => {
                warn!(error = %e, "event wal unavailable, falling back to jsonl");
                return Ok(Self {
                    inner: Mutex::new(open_legacy(&path)?),
                });
            }
        };

        let mut store = StoreInner::Wal {
            wal,
            last_bookmark: None,
            closed: false,
        };
        bootstrap_legacy(&mut store, &path)?;
        if let StoreInner::Wal {
            wal, last_bookmark, ..
        } = &mut store
        {
            *last_bookmark = max_bookmark(&wal_events(wal)?);
        }
        Ok(Self {
            inner: Mutex::new(store),
        })
    }

    /// Append an event; it must carry a bookmark.
    pub fn append(&self, event: &Event) -> Result<()> {
        let bookmark = event
            .bookmark
            .clone()
            .ok_or_else(|| TetherError::InvalidRequest("event bookmark missing".into()))?;
        let mut inner = self.inner.lock();
        match &mut *inner {
            StoreInner::Wal {
                wal,
                last_bookmark,
                closed,
            } => {
                if *closed {
                    return Err(TetherError::SessionClosed);
                }
                let ch = channel_for_type(&event.event_type);
                let payload = serde_json::to_vec(event)?;
                wal.append(ch, &event.event_type, &payload)?;
                wal.sync(ch)?;
                if last_bookmark
                    .as_ref()
                    .map(|b| bookmark.seq >= b.seq)
                    .unwrap_or(true)
                {
                    *last_bookmark = Some(bookmark);
                }
                Ok(())
            }
            StoreInner::Legacy { file, .. } => {
                let file = file.as_mut().ok_or(TetherError::SessionClosed)?;
                let mut line = serde_json::to_vec(event)?;
                line.push(b'\n');
                file.write_all(&line)?;
                file.sync_data()?;
                Ok(())
            }
        }
    }

    /// Events strictly after `bookmark` (all events when `None`).
    pub fn read_since(&self, bookmark: Option<&Bookmark>) -> Result<Vec<Event>> {
        let events = self.all_events()?;
        Ok(events
            .into_iter()
            .filter(|e| match (bookmark, &e.bookmark) {
                (None, _) => true,
                (_, None) => false,
                (Some(start), Some(b)) => b.seq > start.seq,
            })
            .collect())
    }

    /// Events in the `(start, end]` bookmark range.
    pub fn read_range(
        &self,
        start: Option<&Bookmark>,
        end: Option<&Bookmark>,
    ) -> Result<Vec<Event>> {
        let events = self.all_events()?;
        Ok(events
            .into_iter()
            .filter(|e| {
                let Some(b) = &e.bookmark else { return false };
                if let Some(start) = start {
                    if b.seq <= start.seq {
                        return false;
                    }
                }
                if let Some(end) = end {
                    if b.seq > end.seq {
                        return false;
                    }
                }
                true
            })
            .collect())
    }

    /// Most recent bookmark, if any event was stored.
    pub fn last_bookmark(&self) -> Result<Option<Bookmark>> {
        let inner = self.inner.lock();
        match &*inner {
            StoreInner::Wal { last_bookmark, .. } => Ok(last_bookmark.clone()),
            StoreInner::Legacy { path, .. } => {
                let events = read_legacy_file(path)?;
                Ok(max_bookmark(&events))
            }
        }
    }

    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match &mut *inner {
            StoreInner::Wal { wal, closed, .. } => {
                if !*closed {
                    *closed = true;
                    wal.close()?;
                }
                Ok(())
            }
            StoreInner::Legacy { file, .. } => {
                file.take();
                Ok(())
            }
        }
    }

    fn all_events(&self) -> Result<Vec<Event>> {
        let mut inner = self.inner.lock();
        match &mut *inner {
            StoreInner::Wal { wal, closed, .. } => {
                if *closed {
                    return Err(TetherError::SessionClosed);
                }
                wal_events(wal)
            }
            StoreInner::Legacy { path, .. } => read_legacy_file(path),
        }
    }
}

fn open_legacy(path: &Path) -> Result<StoreInner> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    Ok(StoreInner::Legacy {
        path: path.to_path_buf(),
        file: Some(file),
    })
}

// One-shot migration: seed a brand-new WAL from an existing JSONL file.
fn bootstrap_legacy(store: &mut StoreInner, path: &Path) -> Result<()> {
    let StoreInner::Wal { wal, .. } = store else {
        return Ok(());
    };
    if !path.exists() || !wal.snapshot().is_empty() {
        return Ok(());
    }
    let events = read_legacy_file(path)?;
    for event in events {
        if event.bookmark.is_none() {
            continue;
        }
        let ch = channel_for_type(&event.event_type);
        let payload = serde_json::to_vec(&event)?;
        wal.append(ch, &event.event_type, &payload)?;
        wal.sync(ch)?;
    }
    Ok(())
}

fn wal_events(wal: &ChannelWal) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for ch in Channel::ALL {
        wal.replay(ch, |entry| {
            if let Ok(event) = serde_json::from_slice::<Event>(&entry.data) {
                events.push(event);
            }
            Ok(())
        })?;
    }
    events.sort_by(|a, b| {
        let sa = a.bookmark.as_ref().map(|b| b.seq).unwrap_or(0);
        let sb = b.bookmark.as_ref().map(|b| b.seq).unwrap_or(0);
        sa.cmp(&sb).then_with(|| a.timestamp.cmp(&b.timestamp))
    });
    Ok(events)
}

fn read_legacy_file(path: &Path) -> Result<Vec<Event>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(event) = serde_json::from_str::<Event>(trimmed) {
            events.push(event);
        }
    }
    Ok(events)
}

fn max_bookmark(events: &[Event]) -> Option<Bookmark> {
    events
        .iter()
        .filter_map(|e| e.bookmark.clone())
        .max_by_key(|b| b.seq)
}

fn channel_for_type(event_type: &str) -> Channel {
    if event_type.starts_with("approval") {
        Channel::Monitor
    } else if event_type.starts_with("session") {
        Channel::Control
    } else {
        Channel::Progress
    }
}

fn legacy_mode_enabled() -> bool {
    std::env::var(LEGACY_ENV)
        .map(|v| {
            let v = v.trim();
            v.eq_ignore_ascii_case("1") || v.eq_ignore_ascii_case("true")
        })
        .unwrap_or(false)
}
