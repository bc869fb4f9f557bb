//! Recipient registry types and per-recipient locking.

pub mod locks;
pub mod model;

pub use locks::RecipientLocks;
pub use model::{
    ConversationState, LifecycleStatus, ProgressUpdate, Recipient, RecipientClass,
    parse_timezone,
};
