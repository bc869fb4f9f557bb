//! Policy check, personalize, send, record.
//!
//! Shared by the scheduler and the injector so both send and record exactly
//! the same way. Callers hold the recipient's lock around
//! `check_policy` + `send`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::catalog::{MessageTemplate, personalize};
use crate::conversation::state::mark_awaiting;
use crate::delivery::policy::{PolicyViolation, SendPolicy};
use crate::delivery::record::DeliveryRecord;
use crate::error::DatabaseError;
use crate::event_log::{EventLog, LogKind};
use crate::recipients::{ProgressUpdate, Recipient};
use crate::store::Database;
use crate::transport::{Transport, send_with_timeout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent {
        transport_ref: String,
        daily_count: u32,
    },
    Failed {
        error: String,
    },
}

pub struct Dispatcher {
    store: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
    policy: SendPolicy,
    log: EventLog,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
        policy: SendPolicy,
        log: EventLog,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            policy,
            log,
            send_timeout,
        }
    }

    /// Evaluate the rate/time policy against today's counter in the
    /// recipient's timezone. `Ok(None)` means the send may go ahead.
    pub async fn check_policy(
        &self,
        r: &Recipient,
        now: DateTime<Utc>,
        manual: bool,
    ) -> Result<Option<PolicyViolation>, DatabaseError> {
        let sent_today = self.store.get_daily_count(&r.phone, r.local_date(now)).await?;
        Ok(self
            .policy
            .can_send(r.local_time(now), sent_today, manual)
            .err())
    }

    /// Send `template` to `r` and record the result.
    ///
    /// On success the delivery, the daily counter and `progress` (scheduled
    /// sends only) commit together. A failed transport call leaves a failed
    /// delivery record and does not touch the counter.
    pub async fn send(
        &self,
        r: &Recipient,
        template: &MessageTemplate,
        progress: Option<ProgressUpdate>,
        manual: bool,
        now: DateTime<Utc>,
    ) -> DeliveryOutcome {
        let body = personalize(&template.body, r.display_name.as_deref());

        let receipt = match send_with_timeout(
            self.transport.as_ref(),
            self.send_timeout,
            &r.phone,
            &body,
            &template.id,
        )
        .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                let error = e.to_string();
                let record = DeliveryRecord::failed(
                    &r.phone,
                    &template.id,
                    r.sequence_position,
                    manual,
                    error.clone(),
                    now,
                );
                if let Err(db_err) = self.store.insert_delivery(&record).await {
                    tracing::warn!(phone = %r.phone, "Failed to record failed delivery: {db_err}");
                }
                self.log
                    .log(
                        LogKind::Error,
                        "send failed",
                        Some(&r.phone),
                        Some(json!({
                            "template_id": template.id,
                            "transport": self.transport.name(),
                            "error": error,
                        })),
                    )
                    .await;
                return DeliveryOutcome::Failed { error };
            }
        };

        let record = DeliveryRecord::sent(
            &r.phone,
            &template.id,
            r.sequence_position,
            manual,
            receipt.transport_ref.clone(),
            now,
        );
        let daily_count = match self
            .store
            .record_send(&record, r.local_date(now), progress.as_ref())
            .await
        {
            Ok(count) => count,
            Err(e) => {
                self.log
                    .log(
                        LogKind::Error,
                        "send not recorded",
                        Some(&r.phone),
                        Some(json!({
                            "template_id": template.id,
                            "transport_ref": receipt.transport_ref,
                            "error": e.to_string(),
                        })),
                    )
                    .await;
                return DeliveryOutcome::Failed {
                    error: format!("persistence: {e}"),
                };
            }
        };

        if template.is_interactive() && !template.options.is_empty() {
            if let Err(e) = mark_awaiting(self.store.as_ref(), &r.phone, &template.id, now).await {
                tracing::warn!(phone = %r.phone, template_id = %template.id, "Failed to set awaiting state: {e}");
            }
        }

        self.log
            .log(
                LogKind::Send,
                "message sent",
                Some(&r.phone),
                Some(json!({
                    "template_id": template.id,
                    "manual": manual,
                    "daily_count": daily_count,
                    "transport_ref": receipt.transport_ref,
                })),
            )
            .await;

        DeliveryOutcome::Sent {
            transport_ref: receipt.transport_ref,
            daily_count,
        }
    }
}
