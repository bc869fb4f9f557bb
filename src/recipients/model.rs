//! Recipient data model.
//!
//! A recipient is an enrolled phone number with its own progression through a
//! program's content and its own conversation state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::phone::PhoneNumber;

/// Recipient class. Trial and subscriber recipients follow different cadences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientClass {
    Trial,
    Subscriber,
}

impl fmt::Display for RecipientClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipientClass::Trial => write!(f, "trial"),
            RecipientClass::Subscriber => write!(f, "subscriber"),
        }
    }
}

impl FromStr for RecipientClass {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(RecipientClass::Trial),
            "subscriber" => Ok(RecipientClass::Subscriber),
            other => Err(format!("unknown recipient class: {other}")),
        }
    }
}

/// Lifecycle status. `Stopped` is reversible via START; `Expired` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Active,
    Stopped,
    Expired,
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleStatus::Active => write!(f, "active"),
            LifecycleStatus::Stopped => write!(f, "stopped"),
            LifecycleStatus::Expired => write!(f, "expired"),
        }
    }
}

impl FromStr for LifecycleStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LifecycleStatus::Active),
            "stopped" => Ok(LifecycleStatus::Stopped),
            "expired" => Ok(LifecycleStatus::Expired),
            other => Err(format!("unknown lifecycle status: {other}")),
        }
    }
}

/// Whether the recipient owes us an answer to an interactive template.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConversationState {
    #[default]
    Idle,
    AwaitingResponse {
        template_id: String,
        since: DateTime<Utc>,
    },
}

impl ConversationState {
    /// Rebuild from the nullable `awaiting_*` columns.
    ///
    /// Both columns must be present; a half-written pair reads as `Idle`.
    pub fn from_columns(template_id: Option<String>, since: Option<DateTime<Utc>>) -> Self {
        match (template_id, since) {
            (Some(template_id), Some(since)) => ConversationState::AwaitingResponse {
                template_id,
                since,
            },
            _ => ConversationState::Idle,
        }
    }

    /// Split into the nullable `(awaiting_template_id, awaiting_since)` columns.
    pub fn to_columns(&self) -> (Option<&str>, Option<DateTime<Utc>>) {
        match self {
            ConversationState::Idle => (None, None),
            ConversationState::AwaitingResponse { template_id, since } => {
                (Some(template_id.as_str()), Some(*since))
            }
        }
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(self, ConversationState::AwaitingResponse { .. })
    }
}

/// An enrolled recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub phone: PhoneNumber,
    pub program: String,
    pub class: RecipientClass,
    /// Index into the program's numbered sequence (1-based).
    pub sequence_position: u32,
    pub total_sent: u32,
    pub trial_sent: u32,
    /// Last post-trial phase delivered (0 = none yet).
    pub post_trial_phase: u8,
    /// Day offset (from join date) of the last post-trial delivery.
    pub post_trial_day: u32,
    pub status: LifecycleStatus,
    pub timezone: Tz,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub conversation: ConversationState,
    pub display_name: Option<String>,
    pub joined_at: DateTime<Utc>,
    /// Sequence position recorded when the recipient texted STOP.
    pub paused_at_position: Option<u32>,
}

impl Recipient {
    /// A freshly enrolled, active recipient at the start of its sequence.
    pub fn enroll(
        phone: PhoneNumber,
        program: impl Into<String>,
        class: RecipientClass,
        timezone: Tz,
        joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            phone,
            program: program.into(),
            class,
            sequence_position: 1,
            total_sent: 0,
            trial_sent: 0,
            post_trial_phase: 0,
            post_trial_day: 0,
            status: LifecycleStatus::Active,
            timezone,
            last_sent_at: None,
            conversation: ConversationState::Idle,
            display_name: None,
            joined_at,
            paused_at_position: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        let trimmed = name.trim();
        self.display_name = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == LifecycleStatus::Active
    }

    /// `now` expressed in the recipient's own timezone.
    pub fn local_time(&self, at: DateTime<Utc>) -> DateTime<Tz> {
        at.with_timezone(&self.timezone)
    }

    /// Calendar date of `at` in the recipient's own timezone.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        self.local_time(at).date_naive()
    }

    /// Whole local calendar days between the join date and `now`.
    pub fn days_since_join(&self, now: DateTime<Utc>) -> i64 {
        (self.local_date(now) - self.local_date(self.joined_at)).num_days()
    }

    /// Whole local calendar days since the last send, or `None` if never sent.
    pub fn days_since_last_send(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_sent_at
            .map(|last| (self.local_date(now) - self.local_date(last)).num_days())
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ValidationError> {
    name.parse::<Tz>()
        .map_err(|_| ValidationError::UnknownTimezone(name.to_string()))
}

/// Progression columns written after a successful scheduled send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub sequence_position: u32,
    pub total_sent: u32,
    pub trial_sent: u32,
    pub post_trial_phase: u8,
    pub post_trial_day: u32,
    pub last_sent_at: DateTime<Utc>,
}
