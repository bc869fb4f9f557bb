//! Wall-clock source for the scheduler and the injector.
//!
//! Both read the clock once per recipient, after taking the recipient's
//! lock, so a long batch judges every send at the moment it happens.

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system() -> Clock {
    Arc::new(Utc::now)
}

/// A clock that always reads `at`.
pub fn fixed(at: DateTime<Utc>) -> Clock {
    Arc::new(move || at)
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
