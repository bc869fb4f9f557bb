//! Eligibility evaluator.
//!
//! Pure: given a recipient snapshot and an instant, decide whether a message
//! is due and which one. No store, no clock, no transport.

use chrono::{DateTime, Utc};

use crate::catalog::category;
use crate::recipients::{ProgressUpdate, Recipient, RecipientClass};

/// Trial recipients receive this many daily messages before post-trial.
pub const TRIAL_LENGTH: u32 = 7;

/// Subscribers walk the numbered sequence up to this position.
pub const SEQUENTIAL_LIMIT: u32 = 30;

/// Minimum calendar-day gap between algorithm-mode sends.
pub const ALGORITHM_GAP_DAYS: i64 = 2;

/// Post-trial due days (offsets from the join date) for phases 1 to 3.
const POST_TRIAL_PHASES: [&[u32]; 3] = [&[8, 10, 13, 17], &[25, 33, 41], &[71, 101, 131]];

const PHASE_FOUR_START: u32 = 191;
const PHASE_FOUR_PERIOD: u32 = 60;

/// Which message a due recipient should get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Trial message number `position` (1-based).
    Trial { position: u32 },
    /// A fixed post-trial message. `step` is the 1-based slot within the phase.
    PostTrial { phase: u8, step: u32, day: u32 },
    /// Numbered sequence message at `position`.
    Sequential { position: u32 },
    /// Random pick from the program's unnumbered pool.
    Algorithm,
}

impl Selector {
    /// Catalog category of numbered selectors.
    pub fn category(&self) -> Option<&'static str> {
        match self {
            Selector::Trial { .. } => Some(category::TRIAL),
            Selector::Sequential { .. } => Some(category::SEQUENCE),
            Selector::PostTrial { .. } | Selector::Algorithm => None,
        }
    }

    /// Fixed template id for post-trial slots. Phase 4 reuses one message.
    pub fn fixed_template_id(&self) -> Option<String> {
        match self {
            Selector::PostTrial { phase: 4, .. } => Some("post_trial_4".to_string()),
            Selector::PostTrial { phase, step, .. } => Some(format!("post_trial_{phase}_{step}")),
            _ => None,
        }
    }

    /// Progression columns after a successful send of this selector.
    pub fn progress(&self, r: &Recipient, sent_at: DateTime<Utc>) -> ProgressUpdate {
        let mut update = ProgressUpdate {
            sequence_position: r.sequence_position,
            total_sent: r.total_sent + 1,
            trial_sent: r.trial_sent,
            post_trial_phase: r.post_trial_phase,
            post_trial_day: r.post_trial_day,
            last_sent_at: sent_at,
        };
        match *self {
            Selector::Trial { .. } => update.trial_sent += 1,
            Selector::PostTrial { phase, day, .. } => {
                update.post_trial_phase = phase;
                update.post_trial_day = day;
            }
            Selector::Sequential { .. } => update.sequence_position += 1,
            Selector::Algorithm => {}
        }
        update
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    NotDue { reason: &'static str },
    Due(Selector),
}

impl Eligibility {
    pub fn is_due(&self) -> bool {
        matches!(self, Eligibility::Due(_))
    }
}

/// Map a day offset from the join date to its post-trial slot, if any.
pub fn post_trial_slot(day: i64) -> Option<(u8, u32)> {
    let day = u32::try_from(day).ok()?;
    for (i, days) in POST_TRIAL_PHASES.iter().enumerate() {
        if let Some(step) = days.iter().position(|&d| d == day) {
            return Some((i as u8 + 1, step as u32 + 1));
        }
    }
    if day >= PHASE_FOUR_START && (day - PHASE_FOUR_START) % PHASE_FOUR_PERIOD == 0 {
        return Some((4, (day - PHASE_FOUR_START) / PHASE_FOUR_PERIOD + 1));
    }
    None
}

/// Decide whether `r` is due at `now`. Day arithmetic uses the recipient's
/// own calendar.
pub fn evaluate(r: &Recipient, now: DateTime<Utc>) -> Eligibility {
    if !r.is_active() {
        return Eligibility::NotDue { reason: "inactive" };
    }

    let gap_ok = |min_days: i64| r.days_since_last_send(now).is_none_or(|d| d >= min_days);

    match r.class {
        RecipientClass::Trial if r.trial_sent < TRIAL_LENGTH => {
            if !gap_ok(1) {
                return Eligibility::NotDue {
                    reason: "already sent today",
                };
            }
            Eligibility::Due(Selector::Trial {
                position: r.trial_sent + 1,
            })
        }
        RecipientClass::Trial => {
            let day = r.days_since_join(now);
            let Some((phase, step)) = post_trial_slot(day) else {
                return Eligibility::NotDue {
                    reason: "not a post-trial day",
                };
            };
            let day = day as u32;
            if r.post_trial_phase > 0 && r.post_trial_day == day {
                return Eligibility::NotDue {
                    reason: "post-trial day already sent",
                };
            }
            Eligibility::Due(Selector::PostTrial { phase, step, day })
        }
        RecipientClass::Subscriber if r.sequence_position <= SEQUENTIAL_LIMIT => {
            if !gap_ok(1) {
                return Eligibility::NotDue {
                    reason: "already sent today",
                };
            }
            Eligibility::Due(Selector::Sequential {
                position: r.sequence_position,
            })
        }
        RecipientClass::Subscriber => {
            if !gap_ok(ALGORITHM_GAP_DAYS) {
                return Eligibility::NotDue {
                    reason: "algorithm gap not elapsed",
                };
            }
            Eligibility::Due(Selector::Algorithm)
        }
    }
}
