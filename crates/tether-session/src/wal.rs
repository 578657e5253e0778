use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use tether_core::{Result, TetherError};
use tether_wal::{Entry, Position, Wal, WalOptions};

use crate::channel::{Channel, Cursors};

/// Channel-segmented WAL: three independent logs under one root, isolating
/// progress, control, and monitor traffic with independent position spaces.
pub struct ChannelWal {
    root: PathBuf,
    logs: HashMap<Channel, Wal>,
    latest: RwLock<Cursors>,
}

impl ChannelWal {
    /// Open a channel-separated WAL hierarchy rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, opts: WalOptions) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        if root.as_os_str().is_empty() {
            return Err(TetherError::InvalidRequest("wal root is empty".into()));
        }
        std::fs::create_dir_all(&root)?;
        let mut logs = HashMap::with_capacity(Channel::ALL.len());
        let mut latest = Cursors::new();
        for ch in Channel::ALL {
            let log = Wal::open(root.join(ch.as_str()), opts.clone())?;
            let last = log.next_position() - 1;
            if last >= 0 {
                latest.insert(ch, last);
            }
            logs.insert(ch, log);
        }
        Ok(Self {
            root,
            logs,
            latest: RwLock::new(latest),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append to the channel's log and track its cursor.
    pub fn append(&self, ch: Channel, entry_type: &str, data: &[u8]) -> Result<Position> {
        let pos = self.log(ch)?.append(entry_type, data)?;
        self.latest.write().insert(ch, pos);
        Ok(pos)
    }

    pub fn sync(&self, ch: Channel) -> Result<()> {
        self.log(ch)?.sync()
    }

    pub fn fsync(&self, ch: Channel) -> Result<()> {
        self.log(ch)?.fsync()
    }

    /// Stream channel entries starting at `from` (inclusive).
    pub fn read_since<F>(&self, ch: Channel, from: Position, f: F) -> Result<()>
    where
        F: FnMut(Entry) -> Result<()>,
    {
        self.log(ch)?.read_since(from, f)
    }

    pub fn replay<F>(&self, ch: Channel, f: F) -> Result<()>
    where
        F: FnMut(Entry) -> Result<()>,
    {
        self.log(ch)?.replay(f)
    }

    /// Remove channel entries below `before`.
    pub fn truncate(&self, ch: Channel, before: Position) -> Result<()> {
        self.log(ch)?.truncate(before)
    }

    /// Force a segment rotation on the channel's log.
    pub fn rotate(&self, ch: Channel) -> Result<()> {
        self.log(ch)?.rotate()
    }

    /// First retained position for the channel.
    pub fn first_position(&self, ch: Channel) -> Result<Position> {
        Ok(self.log(ch)?.first_position())
    }

    /// Position the next append to the channel will receive.
    pub fn next_position(&self, ch: Channel) -> Result<Position> {
        Ok(self.log(ch)?.next_position())
    }

    /// Latest known cursors across all channels.
    pub fn snapshot(&self) -> Cursors {
        self.latest.read().clone()
    }

    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        for log in self.logs.values() {
            if let Err(e) = log.close() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn log(&self, ch: Channel) -> Result<&Wal> {
        self.logs
            .get(&ch)
            .ok_or_else(|| TetherError::InvalidRequest(format!("unknown wal channel {ch}")))
    }
}
