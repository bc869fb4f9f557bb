//! Operational event log.
//!
//! Every event goes to `tracing` and is appended to the `system_logs` table.
//! Logging never fails the caller: a storage error is reported with `warn!`
//! and dropped.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phone::PhoneNumber;
use crate::store::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Send,
    Skip,
    Error,
    Command,
    Crisis,
    Reply,
    Injection,
    Maintenance,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogKind::Send => "send",
            LogKind::Skip => "skip",
            LogKind::Error => "error",
            LogKind::Command => "command",
            LogKind::Crisis => "crisis",
            LogKind::Reply => "reply",
            LogKind::Injection => "injection",
            LogKind::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

impl FromStr for LogKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(LogKind::Send),
            "skip" => Ok(LogKind::Skip),
            "error" => Ok(LogKind::Error),
            "command" => Ok(LogKind::Command),
            "crisis" => Ok(LogKind::Crisis),
            "reply" => Ok(LogKind::Reply),
            "injection" => Ok(LogKind::Injection),
            "maintenance" => Ok(LogKind::Maintenance),
            other => Err(format!("unknown log kind: {other}")),
        }
    }
}

/// A persisted log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub kind: LogKind,
    pub message: String,
    pub phone: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Fire-and-forget event log backed by the store.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn Database>,
}

impl EventLog {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    pub async fn log(
        &self,
        kind: LogKind,
        message: &str,
        phone: Option<&PhoneNumber>,
        detail: Option<serde_json::Value>,
    ) {
        let phone_str = phone.map(|p| p.as_str().to_string());
        match kind {
            LogKind::Error => {
                tracing::error!(kind = %kind, phone = ?phone_str, detail = ?detail, "{message}")
            }
            LogKind::Skip | LogKind::Crisis => {
                tracing::warn!(kind = %kind, phone = ?phone_str, detail = ?detail, "{message}")
            }
            _ => tracing::info!(kind = %kind, phone = ?phone_str, detail = ?detail, "{message}"),
        }

        let entry = LogEntry {
            kind,
            message: message.to_string(),
            phone: phone_str,
            detail,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_log(&entry).await {
            tracing::warn!(kind = %kind, "Failed to persist log entry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    #[tokio::test]
    async fn log_persists_entry() {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let log = EventLog::new(Arc::clone(&store));
        let phone = PhoneNumber::parse("5551234567").unwrap();

        log.log(
            LogKind::Crisis,
            "crisis keyword PANIC",
            Some(&phone),
            Some(serde_json::json!({ "keyword": "PANIC" })),
        )
        .await;

        let entries = store.list_logs(Some(LogKind::Crisis), 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].phone.as_deref(), Some("15551234567"));
        assert_eq!(entries[0].detail.as_ref().unwrap()["keyword"], "PANIC");
    }

    #[test]
    fn kind_display_parse() {
        for kind in [
            LogKind::Send,
            LogKind::Skip,
            LogKind::Error,
            LogKind::Command,
            LogKind::Crisis,
            LogKind::Reply,
            LogKind::Injection,
            LogKind::Maintenance,
        ] {
            let parsed: LogKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
