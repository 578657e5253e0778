//! # tether-wal
//!
//! A durable, append-only log organized as bounded segments. Entries are
//! CRC-framed; replay after a crash treats a torn or corrupt tail frame as
//! end-of-log and discards everything after it. Positions are dense within a
//! log and stay contiguous across truncation.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, warn};

use tether_core::{Result, TetherError};

pub mod frame;

pub use frame::{frame_size, FRAME_OVERHEAD};

/// Monotonic entry index within one log.
pub type Position = i64;

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".wal";
const OFFSET_FILE: &str = "wal.offset";

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub position: Position,
    pub entry_type: String,
    pub data: Vec<u8>,
}

/// Log tuning knobs.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Roll to a new segment once the active one reaches this many bytes.
    pub segment_size: u64,
    /// Skip the hardware sync in `sync`/`fsync` (tests only; appends are
    /// still flushed to the OS, so in-process visibility is unaffected).
    pub disable_sync: bool,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            segment_size: 4 * 1024 * 1024,
            disable_sync: false,
        }
    }
}

struct SegmentMeta {
    base: Position,
    entries: u64,
    path: PathBuf,
}

struct ActiveSegment {
    base: Position,
    entries: u64,
    size: u64,
    path: PathBuf,
    file: File,
}

struct WalInner {
    dir: PathBuf,
    opts: WalOptions,
    sealed: Vec<SegmentMeta>,
    active: ActiveSegment,
    /// First logical position still in the log.
    base: Position,
    /// Next position to assign.
    next: Position,
    closed: bool,
}

/// A single append-only log rooted at one directory.
pub struct Wal {
    inner: RwLock<WalInner>,
}

impl Wal {
    /// Open (or create) a log in `dir`, recovering from any torn tail.
    pub fn open(dir: impl AsRef<Path>, opts: WalOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let base_floor = read_offset(&dir)?;
        let mut segments = list_segments(&dir)?;
        segments.sort_by_key(|s| s.0);

        let mut sealed: Vec<SegmentMeta> = Vec::new();
        let mut next = base_floor;
        let mut torn_at: Option<usize> = None;
        for (idx, (seg_base, path)) in segments.iter().enumerate() {
            let buf = fs::read(path)?;
            let scan = scan_buffer(&buf);
            if scan.valid_bytes < buf.len() as u64 {
                warn!(path = %path.display(), "torn wal tail, truncating segment");
                let f = OpenOptions::new().write(true).open(path)?;
                f.set_len(scan.valid_bytes)?;
                f.sync_all().ok();
                torn_at = Some(idx);
            }
            sealed.push(SegmentMeta {
                base: *seg_base,
                entries: scan.entries,
                path: path.clone(),
            });
            next = seg_base + scan.entries as Position;
            if torn_at.is_some() {
                break;
            }
        }
        // Everything after a torn segment is unreachable; delete it.
        if let Some(idx) = torn_at {
            for (_, path) in segments.iter().skip(idx + 1) {
                debug!(path = %path.display(), "discarding wal segment after torn tail");
                fs::remove_file(path).ok();
            }
        }

        let base = sealed.first().map(|s| s.base).unwrap_or(next).max(0);
        let base = base.max(base_floor.min(next));

        // The last surviving segment becomes the active writer.
        let active = match sealed.pop() {
            Some(meta) => {
                let file = OpenOptions::new().append(true).open(&meta.path)?;
                let size = file.metadata()?.len();
                ActiveSegment {
                    base: meta.base,
                    entries: meta.entries,
                    size,
                    path: meta.path,
                    file,
                }
            }
            None => create_segment(&dir, next)?,
        };

        Ok(Self {
            inner: RwLock::new(WalInner {
                dir,
                opts,
                sealed,
                active,
                base,
                next,
                closed: false,
            }),
        })
    }

    /// Append an entry; returns its position. Visible to readers immediately,
    /// durable once `sync` returns.
    pub fn append(&self, entry_type: &str, data: &[u8]) -> Result<Position> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(closed_err());
        }
        if inner.active.size >= inner.opts.segment_size && inner.active.entries > 0 {
            roll(&mut inner)?;
        }
        let buf = frame::encode(entry_type, data)?;
        inner.active.file.write_all(&buf)?;
        let pos = inner.next;
        inner.next += 1;
        inner.active.entries += 1;
        inner.active.size += buf.len() as u64;
        Ok(pos)
    }

    /// Flush appended entries to stable storage.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(closed_err());
        }
        if !inner.opts.disable_sync {
            inner.active.file.sync_data()?;
        }
        Ok(())
    }

    /// Escalate to a full hardware fsync.
    pub fn fsync(&self) -> Result<()> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(closed_err());
        }
        if !inner.opts.disable_sync {
            inner.active.file.sync_all()?;
        }
        Ok(())
    }

    /// Invoke `f` for every entry with position >= `from` (and >= the first
    /// retained position), in order. An error from `f` stops the replay and
    /// propagates.
    pub fn read_since<F>(&self, from: Position, mut f: F) -> Result<()>
    where
        F: FnMut(Entry) -> Result<()>,
    {
        let inner = self.inner.read();
        if inner.closed {
            return Err(closed_err());
        }
        let floor = from.max(inner.base);
        let segments: Vec<(Position, u64, PathBuf)> = inner
            .sealed
            .iter()
            .map(|s| (s.base, s.entries, s.path.clone()))
            .chain(std::iter::once((
                inner.active.base,
                inner.active.entries,
                inner.active.path.clone(),
            )))
            .collect();
        drop(inner);

        for (seg_base, entries, path) in segments {
            if seg_base + entries as Position <= floor {
                continue;
            }
            // A racing truncate may have deleted the segment already.
            let buf = match fs::read(&path) {
                Ok(buf) => buf,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let mut offset = 0usize;
            let mut pos = seg_base;
            loop {
                match frame::decode(&buf[offset..]) {
                    frame::FrameRead::Frame(fr) => {
                        if pos >= floor {
                            f(Entry {
                                position: pos,
                                entry_type: fr.entry_type.to_string(),
                                data: fr.data.to_vec(),
                            })?;
                        }
                        offset += fr.consumed;
                        pos += 1;
                    }
                    frame::FrameRead::End => break,
                    frame::FrameRead::Torn => {
                        // A torn in-memory view can only be the unflushed or
                        // crash-damaged tail; stop here.
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Replay every retained entry from the start of the log.
    pub fn replay<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(Entry) -> Result<()>,
    {
        self.read_since(Position::MIN, f)
    }

    /// Drop all entries with position < `before`. Whole segments below the
    /// cut are deleted; the first retained position becomes `before`.
    pub fn truncate(&self, before: Position) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(closed_err());
        }
        let before = before.clamp(inner.base, inner.next);
        if before == inner.base {
            return Ok(());
        }

        let mut kept = Vec::new();
        for seg in inner.sealed.drain(..) {
            if seg.base + seg.entries as Position <= before {
                debug!(path = %seg.path.display(), "deleting wal segment below truncation cut");
                fs::remove_file(&seg.path).ok();
            } else {
                kept.push(seg);
            }
        }
        inner.sealed = kept;

        // If every active entry is below the cut, restart the active segment
        // at the new base so the file does not pin deleted positions.
        if inner.active.base + inner.active.entries as Position <= before {
            fs::remove_file(&inner.active.path).ok();
            inner.active = create_segment(&inner.dir, inner.next)?;
        }

        inner.base = before;
        write_offset(&inner.dir, before)?;
        Ok(())
    }

    /// Force a roll to a new segment.
    pub fn rotate(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(closed_err());
        }
        if inner.active.entries == 0 {
            return Ok(());
        }
        roll(&mut inner)
    }

    /// First retained position.
    pub fn first_position(&self) -> Position {
        self.inner.read().base
    }

    /// Position the next append will receive.
    pub fn next_position(&self) -> Position {
        self.inner.read().next
    }

    /// Flush and release the log.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        if !inner.opts.disable_sync {
            inner.active.file.sync_all().ok();
        }
        inner.closed = true;
        Ok(())
    }
}

fn closed_err() -> TetherError {
    TetherError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "wal is closed",
    ))
}

fn roll(inner: &mut WalInner) -> Result<()> {
    if !inner.opts.disable_sync {
        inner.active.file.sync_all()?;
    }
    let next = inner.next;
    let dir = inner.dir.clone();
    let old = std::mem::replace(&mut inner.active, create_segment(&dir, next)?);
    inner.sealed.push(SegmentMeta {
        base: old.base,
        entries: old.entries,
        path: old.path,
    });
    Ok(())
}

fn create_segment(dir: &Path, base: Position) -> Result<ActiveSegment> {
    let path = dir.join(format!("{SEGMENT_PREFIX}{base:016}{SEGMENT_SUFFIX}"));
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;
    Ok(ActiveSegment {
        base,
        entries: 0,
        size: 0,
        path,
        file,
    })
}

fn list_segments(dir: &Path) -> Result<Vec<(Position, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|r| r.strip_suffix(SEGMENT_SUFFIX))
        {
            if let Ok(base) = rest.parse::<u64>() {
                out.push((base as Position, entry.path()));
            }
        }
    }
    Ok(out)
}

struct ScanOutcome {
    entries: u64,
    valid_bytes: u64,
}

fn scan_buffer(buf: &[u8]) -> ScanOutcome {
    let mut offset = 0usize;
    let mut entries = 0u64;
    loop {
        match frame::decode(&buf[offset..]) {
            frame::FrameRead::Frame(fr) => {
                offset += fr.consumed;
                entries += 1;
            }
            frame::FrameRead::End | frame::FrameRead::Torn => {
                return ScanOutcome {
                    entries,
                    valid_bytes: offset as u64,
                };
            }
        }
    }
}

fn read_offset(dir: &Path) -> Result<Position> {
    let path = dir.join(OFFSET_FILE);
    match fs::read_to_string(&path) {
        Ok(s) => s
            .trim()
            .parse::<Position>()
            .map_err(|_| TetherError::Integrity(format!("bad wal offset file: {s:?}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn write_offset(dir: &Path, base: Position) -> Result<()> {
    let mut f = File::create(dir.join(OFFSET_FILE))?;
    write!(f, "{base}")?;
    f.sync_all().ok();
    Ok(())
}
