//! # tether-session
//!
//! Durable conversation sessions over a channel-segmented write-ahead log.
//! A session's messages land on the progress channel, checkpoints and
//! resumes on control, and approval audit records on monitor; replaying the
//! three channels restores the exact transcript across crashes. Also home to
//! the session manager (LRU-bounded cache + per-session run locks) and the
//! durable event store.

pub mod channel;
pub mod event_store;
pub mod file;
pub mod manager;
pub mod wal;

pub use channel::{
    normalize_checkpoint_name, Channel, Checkpoint, Cursors, MAX_CHECKPOINT_BYTES,
};
pub use event_store::{FileEventStore, LEGACY_ENV};
pub use file::{FileSession, ListFilter};
pub use manager::{SessionManager, MAX_SESSIONS_ENV};
pub use wal::ChannelWal;
