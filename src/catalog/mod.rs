//! Message catalog: templates, option sets, personalization and seeding.

pub mod personalize;
pub mod seed;
pub mod template;

pub use personalize::personalize;
pub use template::{ALL_PROGRAMS, InteractionType, MessageTemplate, OptionSet, category};
