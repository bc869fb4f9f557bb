//! Conversation state machine for inbound replies.

pub mod commands;
pub mod machine;
pub mod state;

pub use commands::{CrisisKeyword, Inbound, SystemCommand, classify};
pub use machine::{ConversationEngine, ReplyOutcome};
pub use state::{clear_awaiting, mark_awaiting};
