//! # clawlite-core
//!
//! Core types, traits, and primitives for the ClawLite agent runtime.
//! This crate defines the shared vocabulary used by every other crate in
//! the workspace: the error taxonomy, chat messages, the tool contract,
//! session identifiers, the message bus, and the event bus.

pub mod bus;
pub mod error;
pub mod event;
pub mod message;
pub mod session;
pub mod tool;

pub use bus::{
    BusStats, InboundMessage, InboundReceiver, MessageBus, OutboundKind, OutboundMessage,
    OutboundReceiver, Priority, ReplyHandle,
};
pub use error::{ClawLiteError, Result};
pub use event::{Event, EventBus};
pub use message::{ChatMessage, Role};
pub use session::SessionId;
pub use tool::{Tool, ToolCall, ToolExecutor, ToolResult};
