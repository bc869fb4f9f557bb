//! Pending injection rows and admin request/report types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phone::PhoneNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionStatus {
    Pending,
    Sent,
    Skipped,
    Failed,
}

impl InjectionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InjectionStatus::Pending)
    }
}

impl fmt::Display for InjectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InjectionStatus::Pending => write!(f, "pending"),
            InjectionStatus::Sent => write!(f, "sent"),
            InjectionStatus::Skipped => write!(f, "skipped"),
            InjectionStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for InjectionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InjectionStatus::Pending),
            "sent" => Ok(InjectionStatus::Sent),
            "skipped" => Ok(InjectionStatus::Skipped),
            "failed" => Ok(InjectionStatus::Failed),
            other => Err(format!("unknown injection status: {other}")),
        }
    }
}

/// One queued cohort send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInjection {
    pub id: Uuid,
    pub phone: PhoneNumber,
    pub template_id: String,
    /// Higher drains first.
    pub priority: i32,
    pub status: InjectionStatus,
    /// Skip reason or failure text once terminal.
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingInjection {
    pub fn new(phone: &PhoneNumber, template_id: &str, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            phone: phone.clone(),
            template_id: template_id.to_string(),
            priority,
            status: InjectionStatus::Pending,
            detail: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Admin request to broadcast a priority message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectRequest {
    pub body: String,
    pub template_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub program: Option<String>,
    /// Declared answer letters; makes the template interactive when present.
    #[serde(default)]
    pub options: Option<Vec<char>>,
}

/// A cohort member the injector could not deliver to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedInjection {
    pub phone: String,
    pub error: String,
}

/// Outcome of one inject call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectReport {
    pub recipients_found: usize,
    pub queued: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: Vec<FailedInjection>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_parse() {
        for status in [
            InjectionStatus::Pending,
            InjectionStatus::Sent,
            InjectionStatus::Skipped,
            InjectionStatus::Failed,
        ] {
            let parsed: InjectionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!InjectionStatus::Pending.is_terminal());
        assert!(InjectionStatus::Sent.is_terminal());
        assert!(InjectionStatus::Skipped.is_terminal());
        assert!(InjectionStatus::Failed.is_terminal());
    }

    #[test]
    fn inject_request_defaults() {
        let req: InjectRequest =
            serde_json::from_str(r#"{"body":"Hi {name}","template_id":"storm_1"}"#).unwrap();
        assert_eq!(req.priority, 0);
        assert!(req.program.is_none());
        assert!(req.options.is_none());
    }
}
