//! # tether-core
//!
//! Core types, traits, and primitives for the Tether agent runtime kernel.
//! This crate defines the shared vocabulary used by every other crate in the
//! workspace: messages and content blocks, the tool contract, the unified
//! error type, and the event bus.

pub mod bus;
pub mod error;
pub mod event;
pub mod message;
pub mod tool;

pub use bus::{BusConfig, BusStats, EventBus, Subscriber, SubscriptionId};
pub use error::{Result, TetherError, WireError};
pub use event::{Bookmark, Event};
pub use message::{sanitize_session_id, validate_session_id, ContentBlock, Message, Role};
pub use tool::{
    ChunkSink, StreamingTool, Tool, ToolCall, ToolContext, ToolDescriptor, ToolResult,
};
