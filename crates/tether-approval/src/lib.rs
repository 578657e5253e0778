//! # tether-approval
//!
//! Human-in-the-loop approval for tool execution: a queue of pending
//! decisions, a per-session whitelist that auto-approves repeated identical
//! requests, and a WAL-backed record log with retention GC.

pub mod gc;
pub mod log;
pub mod queue;
pub mod record;
pub mod whitelist;

pub use gc::{GcCallback, GcConfig, GcStats, GcStatus};
pub use log::RecordLog;
pub use queue::Queue;
pub use record::{new_record_id, ApprovalRecord, Decision, Filter, MemoryStore, Store};
pub use whitelist::{hash_params, Whitelist, WhitelistEntry};
