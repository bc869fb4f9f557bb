//! Append-only delivery records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phone::PhoneNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Accepted by the transport.
    Sent,
    /// The transport call failed or timed out.
    Failed,
    /// Sent, and the recipient later answered it.
    Responded,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Responded => write!(f, "responded"),
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            "responded" => Ok(DeliveryStatus::Responded),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// One attempted send of a template to a recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub phone: PhoneNumber,
    pub template_id: String,
    pub sent_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    /// Recipient's sequence position at send time.
    pub sequence_position: u32,
    pub manual: bool,
    pub transport_ref: Option<String>,
    pub error: Option<String>,
    pub response: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl DeliveryRecord {
    pub fn sent(
        phone: &PhoneNumber,
        template_id: &str,
        sequence_position: u32,
        manual: bool,
        transport_ref: String,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            phone: phone.clone(),
            template_id: template_id.to_string(),
            sent_at,
            status: DeliveryStatus::Sent,
            sequence_position,
            manual,
            transport_ref: Some(transport_ref),
            error: None,
            response: None,
            responded_at: None,
        }
    }

    pub fn failed(
        phone: &PhoneNumber,
        template_id: &str,
        sequence_position: u32,
        manual: bool,
        error: String,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            phone: phone.clone(),
            template_id: template_id.to_string(),
            sent_at,
            status: DeliveryStatus::Failed,
            sequence_position,
            manual,
            transport_ref: None,
            error: Some(error),
            response: None,
            responded_at: None,
        }
    }
}
