//! Scheduler loop.
//!
//! A cron-driven ticker wakes up, checks the server-local active window, and
//! walks every active recipient in join order: evaluate eligibility, check
//! policy, resolve the template, send, record. Recipients are processed one
//! at a time and a failure on one never stops the batch.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::catalog::MessageTemplate;
use crate::clock::{self, Clock};
use crate::config::SchedulerConfig;
use crate::delivery::dispatch::{DeliveryOutcome, Dispatcher};
use crate::delivery::eligibility::{self, Eligibility, Selector};
use crate::error::{ConfigError, DatabaseError};
use crate::event_log::{EventLog, LogKind};
use crate::phone::PhoneNumber;
use crate::recipients::{Recipient, RecipientLocks};
use crate::store::Database;

/// Counts for one pass over the recipients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub considered: usize,
    pub sent: usize,
    pub not_due: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Step {
    Sent,
    NotDue,
    Skipped,
    Failed,
}

pub struct Scheduler {
    store: Arc<dyn Database>,
    dispatcher: Arc<Dispatcher>,
    locks: Arc<RecipientLocks>,
    log: EventLog,
    config: SchedulerConfig,
    clock: Clock,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Database>,
        dispatcher: Arc<Dispatcher>,
        locks: Arc<RecipientLocks>,
        log: EventLog,
        config: SchedulerConfig,
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

    /// Whether `now` falls inside the server-local active window.
    pub fn in_active_window(&self, now: DateTime<Utc>) -> bool {
        let hour = now.with_timezone(&self.config.server_timezone).hour();
        hour >= self.config.active_start_hour && hour < self.config.active_end_hour
    }

    /// Run one pass over all active recipients.
    ///
    /// Each recipient is judged against the clock as read when its turn
    /// comes, not when the tick started.
    pub async fn run_tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();

        let recipients = match self.store.list_active_recipients().await {
            Ok(r) => r,
            Err(e) => {
                self.log
                    .log(LogKind::Error, &format!("tick aborted: {e}"), None, None)
                    .await;
                return summary;
            }
        };

        for (i, recipient) in recipients.iter().enumerate() {
            if i > 0 && !self.config.recipient_delay.is_zero() {
                tokio::time::sleep(self.config.recipient_delay).await;
            }
            summary.considered += 1;

            match self.process(&recipient.phone).await {
                Ok(Step::Sent) => summary.sent += 1,
                Ok(Step::NotDue) => summary.not_due += 1,
                Ok(Step::Skipped) => summary.skipped += 1,
                Ok(Step::Failed) => summary.failed += 1,
                Err(e) => {
                    summary.failed += 1;
                    self.log
                        .log(
                            LogKind::Error,
                            &format!("recipient processing failed: {e}"),
                            Some(&recipient.phone),
                            None,
                        )
                        .await;
                }
            }
        }

        info!(
            considered = summary.considered,
            sent = summary.sent,
            not_due = summary.not_due,
            skipped = summary.skipped,
            failed = summary.failed,
            "Scheduler tick complete"
        );
        summary
    }

    async fn process(&self, phone: &PhoneNumber) -> Result<Step, DatabaseError> {
        let _guard = self.locks.lock(phone).await;
        let now = (self.clock)();

        // Re-read under the lock: an injector drain or a STOP may have
        // changed the row since the batch was listed.
        let Some(r) = self.store.get_recipient(phone).await? else {
            return Ok(Step::NotDue);
        };

        let selector = match eligibility::evaluate(&r, now) {
            Eligibility::NotDue { reason } => {
                debug!(phone = %phone, reason, "Not due");
                return Ok(Step::NotDue);
            }
            Eligibility::Due(selector) => selector,
        };

        if let Some(violation) = self.dispatcher.check_policy(&r, now, false).await? {
            self.log
                .log(
                    LogKind::Skip,
                    &violation.to_string(),
                    Some(phone),
                    Some(json!({ "selector": format!("{selector:?}") })),
                )
                .await;
            return Ok(Step::Skipped);
        }

        let Some(template) = self.resolve_template(&r, &selector).await? else {
            self.log
                .log(
                    LogKind::Error,
                    "no template for due message",
                    Some(phone),
                    Some(json!({ "program": r.program, "selector": format!("{selector:?}") })),
                )
                .await;
            return Ok(Step::Failed);
        };

        let progress = selector.progress(&r, now);
        match self
            .dispatcher
            .send(&r, &template, Some(progress), false, now)
            .await
        {
            DeliveryOutcome::Sent { .. } => Ok(Step::Sent),
            DeliveryOutcome::Failed { .. } => Ok(Step::Failed),
        }
    }

    async fn resolve_template(
        &self,
        r: &Recipient,
        selector: &Selector,
    ) -> Result<Option<MessageTemplate>, DatabaseError> {
        match selector {
            Selector::Trial { position } | Selector::Sequential { position } => {
                let category = selector.category().unwrap_or_default();
                self.store
                    .find_sequenced_template(&r.program, category, *position)
                    .await
            }
            Selector::PostTrial { .. } => match selector.fixed_template_id() {
                Some(id) => Ok(self.store.get_template(&id).await?.filter(|t| t.active)),
                None => Ok(None),
            },
            Selector::Algorithm => {
                let pool = self.store.list_pool_templates(&r.program).await?;
                Ok(pool.choose(&mut rand::thread_rng()).cloned())
            }
        }
    }
}

/// Spawn the recurring scheduler trigger.
///
/// Ticks follow `config.tick_cron` in the server timezone and only run inside
/// the active window. A shutdown signal stops future ticks; a tick already in
/// progress runs to completion.
pub fn spawn_scheduler(
    scheduler: Arc<Scheduler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<tokio::task::JoinHandle<()>, ConfigError> {
    let schedule = cron::Schedule::from_str(&scheduler.config.tick_cron).map_err(|e| {
        ConfigError::InvalidValue {
            key: "SMS_TICK_CRON".into(),
            message: e.to_string(),
        }
    })?;
    let tz = scheduler.config.server_timezone;

    Ok(tokio::spawn(async move {
        info!(cron = %scheduler.config.tick_cron, timezone = %tz, "Scheduler started");
        loop {
            let now_local = Utc::now().with_timezone(&tz);
            let Some(next) = schedule.after(&now_local).next() else {
                tracing::warn!("Cron schedule has no upcoming ticks; scheduler exiting");
                break;
            };
            let wait = (next.with_timezone(&Utc) - Utc::now())
                .to_std()
                .unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    info!("Scheduler stopping");
                    break;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            if !scheduler.in_active_window((scheduler.clock)()) {
                debug!("Outside active window, tick skipped");
                continue;
            }
            scheduler.run_tick().await;
        }
    }))
}
