//! Scheduled delivery: eligibility, rate/time policy, dispatch and the
//! recurring scheduler loop.

pub mod dispatch;
pub mod eligibility;
pub mod policy;
pub mod record;
pub mod scheduler;

pub use dispatch::{DeliveryOutcome, Dispatcher};
pub use eligibility::{Eligibility, Selector, evaluate};
pub use policy::{PolicyViolation, SendPolicy};
pub use record::{DeliveryRecord, DeliveryStatus};
pub use scheduler::{Scheduler, TickSummary, spawn_scheduler};
