//! Agent loop and execution components.
//!
//! - `conversation` - message history for one run
//! - `core` - the provider-agnostic tool-resolution loop

pub mod conversation;
pub mod core;

pub use conversation::{Conversation, Message, Role};
pub use self::core::{run_loop, AgentLoopConfig, AgentOutcome, RunStats, StopReason};
