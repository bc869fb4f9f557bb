//! Rate/time policy: may a send go out to this recipient right now?

use std::fmt;

use chrono::{DateTime, Datelike, Timelike};
use chrono_tz::Tz;

use crate::config::PolicyConfig;

/// A negative policy result. Not an error: its `Display` is the skip reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyViolation {
    OutsideHours { hour: u32 },
    RestDay,
    DailyCapReached { sent: u32 },
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyViolation::OutsideHours { .. } => write!(f, "outside hours"),
            PolicyViolation::RestDay => write!(f, "rest day"),
            PolicyViolation::DailyCapReached { .. } => write!(f, "daily cap reached"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendPolicy {
    config: PolicyConfig,
}

impl SendPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Check the window, the rest day and the daily cap, in that order.
    ///
    /// `local_now` must already be in the recipient's timezone and
    /// `sent_today` is the counter for that local date. Manual sends ignore
    /// the rest day but nothing else.
    pub fn can_send(
        &self,
        local_now: DateTime<Tz>,
        sent_today: u32,
        manual: bool,
    ) -> Result<(), PolicyViolation> {
        let hour = local_now.hour();
        if hour < self.config.window_start || hour >= self.config.window_end {
            return Err(PolicyViolation::OutsideHours { hour });
        }
        if !manual && local_now.weekday() == self.config.rest_day {
            return Err(PolicyViolation::RestDay);
        }
        if sent_today >= self.config.daily_cap {
            return Err(PolicyViolation::DailyCapReached { sent: sent_today });
        }
        Ok(())
    }
}
