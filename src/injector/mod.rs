//! Priority injector: operator broadcasts under the manual send policy.
//!
//! An injection upserts a manual template, queues one pending row per cohort
//! member, then drains every pending row right away. Rows end `sent`,
//! `skipped` or `failed`; nothing is retried.

pub mod model;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::catalog::{ALL_PROGRAMS, MessageTemplate, OptionSet, category};
use crate::clock::{self, Clock};
use crate::config::InjectorConfig;
use crate::delivery::{DeliveryOutcome, Dispatcher};
use crate::error::{DatabaseError, Error};
use crate::event_log::{EventLog, LogKind};
use crate::phone::PhoneNumber;
use crate::recipients::RecipientLocks;
use crate::store::Database;

pub use model::{FailedInjection, InjectReport, InjectRequest, InjectionStatus, PendingInjection};

/// Final state of one drained row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainedInjection {
    pub id: Uuid,
    pub phone: PhoneNumber,
    pub status: InjectionStatus,
    pub detail: Option<String>,
}

pub struct Injector {
    store: Arc<dyn Database>,
    dispatcher: Arc<Dispatcher>,
    locks: Arc<RecipientLocks>,
    log: EventLog,
    config: InjectorConfig,
    clock: Clock,
}

impl Injector {
    pub fn new(
        store: Arc<dyn Database>,
        dispatcher: Arc<Dispatcher>,
        locks: Arc<RecipientLocks>,
        log: EventLog,
        config: InjectorConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            locks,
            log,
            config,
            clock: clock::system(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Broadcast `req` to its cohort and report what happened.
    pub async fn inject(&self, req: InjectRequest) -> Result<InjectReport, Error> {
        let program = req.program.as_deref().filter(|p| !p.trim().is_empty());

        let mut template = MessageTemplate::new(
            req.template_id.trim(),
            program.unwrap_or(ALL_PROGRAMS),
            category::MANUAL,
            req.body.as_str(),
        );
        if let Some(letters) = req.options {
            let options = OptionSet::new(letters)?;
            if !options.is_empty() {
                template = template.interactive(options);
            }
        }
        template.validate()?;
        self.store.upsert_template(&template).await?;

        let cohort = self.store.list_cohort(program).await?;
        let queued_at = (self.clock)();
        let mut report = InjectReport {
            recipients_found: cohort.len(),
            ..InjectReport::default()
        };

        let mut batch = HashSet::new();
        for r in &cohort {
            let row = PendingInjection::new(&r.phone, &template.id, req.priority, queued_at);
            match self.store.insert_injection(&row).await {
                Ok(()) => {
                    batch.insert(row.id);
                    report.queued += 1;
                }
                Err(e) => report.failed.push(FailedInjection {
                    phone: r.phone.to_string(),
                    error: e.to_string(),
                }),
            }
        }

        for drained in self.drain_pending().await? {
            if !batch.contains(&drained.id) {
                continue;
            }
            match drained.status {
                InjectionStatus::Sent => report.sent += 1,
                InjectionStatus::Skipped => report.skipped += 1,
                InjectionStatus::Failed => report.failed.push(FailedInjection {
                    phone: drained.phone.to_string(),
                    error: drained.detail.unwrap_or_default(),
                }),
                InjectionStatus::Pending => {}
            }
        }

        self.log
            .log(
                LogKind::Injection,
                &format!("injection {} drained", template.id),
                None,
                Some(json!({
                    "template_id": template.id,
                    "program": program,
                    "priority": req.priority,
                    "recipients_found": report.recipients_found,
                    "queued": report.queued,
                    "sent": report.sent,
                    "skipped": report.skipped,
                    "failed": report.failed.len(),
                })),
            )
            .await;
        Ok(report)
    }

    /// Drain every pending row, highest priority first, then oldest first.
    pub async fn drain_pending(&self) -> Result<Vec<DrainedInjection>, DatabaseError> {
        let pending = self.store.list_pending_injections().await?;
        let mut drained = Vec::with_capacity(pending.len());

        for row in pending {
            if let Some(done) = self.drain_one(row).await {
                drained.push(done);
            }
        }
        Ok(drained)
    }

    /// Process one row and persist its final status while the recipient's
    /// lock is held. `None` when another drain already finished the row.
    async fn drain_one(&self, row: PendingInjection) -> Option<DrainedInjection> {
        let _guard = self.locks.lock(&row.phone).await;
        let now = (self.clock)();
        let (status, detail) = match self.try_drain(&row, now).await {
            Ok(result) => result?,
            Err(e) => (InjectionStatus::Failed, Some(e.to_string())),
        };

        if let Err(e) = self
            .store
            .update_injection_status(row.id, status, detail.as_deref(), now)
            .await
        {
            self.log
                .log(
                    LogKind::Error,
                    &format!("injection status not saved: {e}"),
                    Some(&row.phone),
                    Some(json!({ "injection_id": row.id.to_string() })),
                )
                .await;
        }
        Some(DrainedInjection {
            id: row.id,
            phone: row.phone,
            status,
            detail,
        })
    }

    async fn try_drain(
        &self,
        row: &PendingInjection,
        now: DateTime<Utc>,
    ) -> Result<Option<(InjectionStatus, Option<String>)>, DatabaseError> {
        match self.store.get_injection(row.id).await? {
            Some(current) if !current.status.is_terminal() => {}
            _ => return Ok(None),
        }

        let recipient = self
            .store
            .get_recipient(&row.phone)
            .await?
            .filter(|r| r.is_active());
        let Some(r) = recipient else {
            return Ok(Some((
                InjectionStatus::Skipped,
                Some("recipient inactive".to_string()),
            )));
        };

        let Some(template) = self.store.get_template(&row.template_id).await? else {
            return Ok(Some((
                InjectionStatus::Failed,
                Some(format!("template {} missing", row.template_id)),
            )));
        };

        if let Some(violation) = self.dispatcher.check_policy(&r, now, true).await? {
            let reason = violation.to_string();
            self.log
                .log(
                    LogKind::Skip,
                    &reason,
                    Some(&r.phone),
                    Some(json!({ "template_id": template.id, "manual": true })),
                )
                .await;
            return Ok(Some((InjectionStatus::Skipped, Some(reason))));
        }

        Ok(Some(
            match self.dispatcher.send(&r, &template, None, true, now).await {
                DeliveryOutcome::Sent { .. } => (InjectionStatus::Sent, None),
                DeliveryOutcome::Failed { error } => (InjectionStatus::Failed, Some(error)),
            },
        ))
    }

    /// Delete terminal rows older than the retention window.
    pub async fn purge_terminal(&self) -> Result<usize, DatabaseError> {
        let cutoff = (self.clock)() - Duration::days(self.config.retention_days);
        let purged = self.store.purge_injections(cutoff).await?;
        self.log
            .log(
                LogKind::Maintenance,
                &format!("purged {purged} injection rows"),
                None,
                Some(json!({ "cutoff": cutoff.to_rfc3339() })),
            )
            .await;
        Ok(purged)
    }
}

/// Spawn the daily reaper. Runs once at startup, then every 24 hours.
pub fn spawn_reaper(
    injector: Arc<Injector>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = injector.purge_terminal().await {
                tracing::warn!("Injection reaper failed: {e}");
            }
        }
        info!("Injection reaper stopped");
    })
}
