use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tether_approval::{ApprovalRecord, Filter as ApprovalFilter};
use tether_core::{sanitize_session_id, validate_session_id, Message, Result, Role, TetherError};
use tether_wal::{Position, WalOptions};

use crate::channel::{
    normalize_checkpoint_name, Channel, Checkpoint, Cursors, MAX_CHECKPOINT_BYTES,
};
use crate::wal::ChannelWal;

const RECORD_MESSAGE: &str = "message";
const RECORD_CHECKPOINT: &str = "checkpoint";
const RECORD_RESUME: &str = "resume";
const RECORD_COMPACT: &str = "compact";
const RECORD_APPROVAL: &str = "approval";

/// Constrains transcript queries.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub role: Option<Role>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Serialize, Deserialize)]
struct ResumeRecord {
    name: String,
    #[serde(default)]
    cursors: Cursors,
}

#[derive(Serialize, Deserialize)]
struct CompactRecord {
    /// JSON-serialized replacement transcript.
    state: String,
    #[serde(default)]
    cursors: Cursors,
}

struct CheckpointState {
    position: Position,
    payload: Checkpoint,
    snapshot: Vec<Message>,
}

struct SessionState {
    messages: Vec<Message>,
    checkpoints: HashMap<String, CheckpointState>,
    approvals: HashMap<String, ApprovalRecord>,
    seq: u64,
    closed: bool,
}

/// A conversation session persisted through the channel-segmented WAL.
/// Messages land on the progress channel, checkpoints and resumes on
/// control, approvals on monitor. Reopening replays all three to restore
/// the exact transcript, checkpoint index, and approval audit.
pub struct FileSession {
    id: String,
    root: PathBuf,
    dir: PathBuf,
    wal: ChannelWal,
    wal_opts: WalOptions,
    state: RwLock<SessionState>,
}

impl FileSession {
    /// Create or re-open the durable session at `root/<id>/wal`.
    pub fn open(id: &str, root: impl AsRef<Path>, opts: WalOptions) -> Result<Self> {
        validate_session_id(id)?;
        let root = root.as_ref().to_path_buf();
        let dir = root.join(sanitize_session_id(id));
        let wal = ChannelWal::open(dir.join("wal"), opts.clone())?;
        let session = Self {
            id: id.to_string(),
            root,
            dir,
            wal,
            wal_opts: opts,
            state: RwLock::new(SessionState {
                messages: Vec::new(),
                checkpoints: HashMap::new(),
                approvals: HashMap::new(),
                seq: 0,
                closed: false,
            }),
        };
        session.reload()?;
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Latest acknowledged WAL cursors.
    pub fn cursors(&self) -> Cursors {
        self.wal.snapshot()
    }

    /// Append a message to the transcript. Assigns id and timestamp when
    /// missing. The WAL write happens first; in-memory state only changes
    /// after the append is durable.
    pub fn append(&self, msg: Message) -> Result<Message> {
        let mut state = self.state.write();
        if state.closed {
            return Err(TetherError::SessionClosed);
        }
        let mut clone = msg;
        let seq = state.seq + 1;
        if clone.id.is_empty() {
            clone.id = format!("{}-{seq:06}", self.id);
        }
        if clone.timestamp.is_none() {
            clone.timestamp = Some(Utc::now());
        }
        clone.session_id = self.id.clone();

        let payload = serde_json::to_vec(&clone)?;
        self.wal.append(Channel::Progress, RECORD_MESSAGE, &payload)?;
        self.wal.sync(Channel::Progress)?;
        state.seq = seq;
        state.messages.push(clone.clone());
        Ok(clone)
    }

    /// Messages matching the filter, in append order.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Message>> {
        let state = self.state.read();
        if state.closed {
            return Err(TetherError::SessionClosed);
        }
        let mut skipped = 0usize;
        let mut out = Vec::new();
        for msg in &state.messages {
            if let Some(role) = filter.role {
                if msg.role != role {
                    continue;
                }
            }
            if let (Some(start), Some(ts)) = (filter.start_time, msg.timestamp) {
                if ts < start {
                    continue;
                }
            }
            if let (Some(end), Some(ts)) = (filter.end_time, msg.timestamp) {
                if ts > end {
                    continue;
                }
            }
            if skipped < filter.offset {
                skipped += 1;
                continue;
            }
            out.push(msg.clone());
            if filter.limit > 0 && out.len() >= filter.limit {
                break;
            }
        }
        Ok(out)
    }

    /// Full transcript snapshot.
    pub fn messages(&self) -> Vec<Message> {
        self.state.read().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().messages.is_empty()
    }

    /// Capture the current transcript under `name` for future resuming.
    pub fn checkpoint(&self, name: &str) -> Result<()> {
        let normalized = normalize_checkpoint_name(name)?;
        let mut state = self.state.write();
        if state.closed {
            return Err(TetherError::SessionClosed);
        }
        let snapshot = state.messages.clone();
        let serialized = serde_json::to_string(&snapshot)?;
        if serialized.len() > MAX_CHECKPOINT_BYTES {
            return Err(TetherError::CheckpointTooLarge {
                size: serialized.len(),
                max: MAX_CHECKPOINT_BYTES,
            });
        }
        let cp = Checkpoint {
            name: normalized.clone(),
            timestamp: Utc::now(),
            state: serialized,
            cursors: self.pending_cursors(Channel::Control),
        };
        let payload = serde_json::to_vec(&cp)?;
        let pos = self.wal.append(Channel::Control, RECORD_CHECKPOINT, &payload)?;
        self.wal.sync(Channel::Control)?;
        state.checkpoints.insert(
            normalized,
            CheckpointState {
                position: pos,
                payload: cp,
                snapshot,
            },
        );
        self.gc_locked(&state);
        Ok(())
    }

    /// Rewind the transcript to a previously created checkpoint.
    pub fn resume(&self, name: &str) -> Result<()> {
        let normalized = normalize_checkpoint_name(name)?;
        let mut state = self.state.write();
        if state.closed {
            return Err(TetherError::SessionClosed);
        }
        let snapshot = match state.checkpoints.get(&normalized) {
            Some(cp) => cp.snapshot.clone(),
            None => return Err(TetherError::CheckpointNotFound(normalized)),
        };
        let record = ResumeRecord {
            name: normalized,
            cursors: self.pending_cursors(Channel::Control),
        };
        let payload = serde_json::to_vec(&record)?;
        self.wal.append(Channel::Control, RECORD_RESUME, &payload)?;
        self.wal.sync(Channel::Control)?;
        state.seq = snapshot.len() as u64;
        state.messages = snapshot;
        self.gc_locked(&state);
        Ok(())
    }

    /// Atomically replace the transcript, e.g. after context compaction.
    /// Durable via a control-channel record carrying the new snapshot;
    /// existing checkpoints stay resumable.
    pub fn replace_transcript(&self, messages: Vec<Message>) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(TetherError::SessionClosed);
        }
        let record = CompactRecord {
            state: serde_json::to_string(&messages)?,
            cursors: self.pending_cursors(Channel::Control),
        };
        let payload = serde_json::to_vec(&record)?;
        self.wal.append(Channel::Control, RECORD_COMPACT, &payload)?;
        self.wal.sync(Channel::Control)?;
        state.seq = messages.len() as u64;
        state.messages = messages;
        Ok(())
    }

    /// Known checkpoint names.
    pub fn checkpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().checkpoints.keys().cloned().collect();
        names.sort();
        names
    }

    /// Clone the transcript into a fresh session rooted at the same parent
    /// directory. Approvals are not forked.
    pub fn fork(&self, new_id: &str) -> Result<FileSession> {
        validate_session_id(new_id)?;
        let snapshot = self.messages();
        let child = FileSession::open(new_id, &self.root, self.wal_opts.clone())?;
        for msg in snapshot {
            if let Err(e) = child.append(msg) {
                child.close().ok();
                return Err(e);
            }
        }
        Ok(child)
    }

    /// Persist an approval decision on the monitor channel.
    pub fn append_approval(&self, rec: ApprovalRecord) -> Result<ApprovalRecord> {
        let mut state = self.state.write();
        if state.closed {
            return Err(TetherError::SessionClosed);
        }
        let mut clone = rec;
        if clone.session_id.is_empty() {
            clone.session_id = self.id.clone();
        }
        if clone.id.is_empty() {
            clone.id = format!("{}-approval-{:06}", self.id, state.approvals.len() + 1);
        }
        let payload = serde_json::to_vec(&clone)?;
        self.wal.append(Channel::Monitor, RECORD_APPROVAL, &payload)?;
        self.wal.sync(Channel::Monitor)?;
        state.approvals.insert(clone.id.clone(), clone.clone());
        Ok(clone)
    }

    /// Approval records persisted in this session, matching the filter.
    pub fn list_approvals(&self, filter: &ApprovalFilter) -> Result<Vec<ApprovalRecord>> {
        let state = self.state.read();
        if state.closed {
            return Err(TetherError::SessionClosed);
        }
        let mut out: Vec<ApprovalRecord> = state
            .approvals
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then_with(|| a.id.cmp(&b.id)));
        if filter.limit > 0 && out.len() > filter.limit {
            out.truncate(filter.limit);
        }
        Ok(out)
    }

    /// Release underlying resources.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        self.wal.close()
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    // Cursor map a control record will carry, including the position the
    // record itself is about to receive.
    fn pending_cursors(&self, kind_channel: Channel) -> Cursors {
        let mut cursors = self.wal.snapshot();
        if let Ok(next) = self.wal.next_position(kind_channel) {
            cursors.insert(kind_channel, next);
        }
        cursors
    }

    // Once a checkpoint exists and no approval audit records are present,
    // progress entries covered by the earliest checkpoint snapshot are
    // redundant and can be truncated.
    fn gc_locked(&self, state: &SessionState) {
        if !state.approvals.is_empty() || state.checkpoints.is_empty() {
            return;
        }
        let Some(earliest) = state.checkpoints.values().min_by_key(|cp| cp.position) else {
            return;
        };
        let progress_cursor = earliest
            .payload
            .cursors
            .get(&Channel::Progress)
            .copied()
            .unwrap_or(-1);
        if progress_cursor >= 0 {
            if let Err(e) = self.wal.truncate(Channel::Progress, progress_cursor + 1) {
                warn!(session = %self.id, error = %e, "progress gc failed");
            }
        }
    }

    fn reload(&self) -> Result<()> {
        #[derive(Clone)]
        enum LastControl {
            Checkpoint(String),
            Resume(String, Cursors),
            Compact(Vec<Message>, Cursors),
        }

        let mut checkpoints: HashMap<String, CheckpointState> = HashMap::new();
        let mut last_control: Option<LastControl> = None;
        self.wal.replay(Channel::Control, |entry| {
            match entry.entry_type.as_str() {
                RECORD_CHECKPOINT => {
                    let cp: Checkpoint = serde_json::from_slice(&entry.data)?;
                    let snapshot: Vec<Message> = serde_json::from_str(&cp.state)?;
                    last_control = Some(LastControl::Checkpoint(cp.name.clone()));
                    checkpoints.insert(
                        cp.name.clone(),
                        CheckpointState {
                            position: entry.position,
                            payload: cp,
                            snapshot,
                        },
                    );
                }
                RECORD_RESUME => {
                    let rec: ResumeRecord = serde_json::from_slice(&entry.data)?;
                    if !checkpoints.contains_key(&rec.name) {
                        return Err(TetherError::Integrity(format!(
                            "resume references unknown checkpoint {}",
                            rec.name
                        )));
                    }
                    last_control = Some(LastControl::Resume(rec.name, rec.cursors));
                }
                RECORD_COMPACT => {
                    let rec: CompactRecord = serde_json::from_slice(&entry.data)?;
                    let snapshot: Vec<Message> = serde_json::from_str(&rec.state)?;
                    last_control = Some(LastControl::Compact(snapshot, rec.cursors));
                }
                other => {
                    return Err(TetherError::Integrity(format!(
                        "unknown control record {other}"
                    )));
                }
            }
            Ok(())
        })?;

        // The transcript is the active snapshot plus every progress entry
        // appended after the last control record was written.
        let (mut messages, progress_floor) = match &last_control {
            None => (Vec::new(), Position::MIN),
            Some(LastControl::Checkpoint(name)) => {
                let cp = &checkpoints[name];
                let cursor = cp
                    .payload
                    .cursors
                    .get(&Channel::Progress)
                    .copied()
                    .unwrap_or(-1);
                (cp.snapshot.clone(), cursor + 1)
            }
            Some(LastControl::Resume(name, cursors)) => {
                let cp = &checkpoints[name];
                let cursor = cursors.get(&Channel::Progress).copied().unwrap_or(-1);
                (cp.snapshot.clone(), cursor + 1)
            }
            Some(LastControl::Compact(snapshot, cursors)) => {
                let cursor = cursors.get(&Channel::Progress).copied().unwrap_or(-1);
                (snapshot.clone(), cursor + 1)
            }
        };

        self.wal.read_since(Channel::Progress, progress_floor, |entry| {
            if entry.entry_type != RECORD_MESSAGE {
                return Err(TetherError::Integrity(format!(
                    "unknown progress record {}",
                    entry.entry_type
                )));
            }
            let msg: Message = serde_json::from_slice(&entry.data)?;
            messages.push(msg);
            Ok(())
        })?;

        let mut approvals = HashMap::new();
        self.wal.replay(Channel::Monitor, |entry| {
            if entry.entry_type != RECORD_APPROVAL {
                return Err(TetherError::Integrity(format!(
                    "unknown monitor record {}",
                    entry.entry_type
                )));
            }
            let rec: ApprovalRecord = serde_json::from_slice(&entry.data)?;
            approvals.insert(rec.id.clone(), rec);
            Ok(())
        })?;

        debug!(
            session = %self.id,
            messages = messages.len(),
            checkpoints = checkpoints.len(),
            approvals = approvals.len(),
            "session reloaded"
        );
        let mut state = self.state.write();
        state.seq = messages.len() as u64;
        state.messages = messages;
        state.checkpoints = checkpoints;
        state.approvals = approvals;
        Ok(())
    }
}
