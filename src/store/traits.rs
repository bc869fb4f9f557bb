//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::catalog::MessageTemplate;
use crate::delivery::record::DeliveryRecord;
use crate::error::DatabaseError;
use crate::event_log::{LogEntry, LogKind};
use crate::injector::model::{InjectionStatus, PendingInjection};
use crate::phone::PhoneNumber;
use crate::recipients::{ConversationState, LifecycleStatus, ProgressUpdate, Recipient};

/// Backend-agnostic database trait covering recipients, catalog, deliveries,
/// injections and the event log.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Recipients ──────────────────────────────────────────────────

    /// Insert or fully replace a recipient row (enrollment and sync).
    async fn upsert_recipient(&self, recipient: &Recipient) -> Result<(), DatabaseError>;

    async fn get_recipient(&self, phone: &PhoneNumber) -> Result<Option<Recipient>, DatabaseError>;

    /// All `active` recipients, oldest enrollment first.
    async fn list_active_recipients(&self) -> Result<Vec<Recipient>, DatabaseError>;

    /// Active recipients, optionally restricted to one program.
    async fn list_cohort(&self, program: Option<&str>) -> Result<Vec<Recipient>, DatabaseError>;

    /// Set lifecycle status. `paused_at_position` is written as given
    /// (`None` clears it).
    async fn set_lifecycle(
        &self,
        phone: &PhoneNumber,
        status: LifecycleStatus,
        paused_at_position: Option<u32>,
    ) -> Result<(), DatabaseError>;

    /// Restart the sequence: position 1, trial counter 0, status active.
    async fn reset_progress(&self, phone: &PhoneNumber) -> Result<(), DatabaseError>;

    async fn set_conversation_state(
        &self,
        phone: &PhoneNumber,
        state: &ConversationState,
    ) -> Result<(), DatabaseError>;

    // ── Daily counters ──────────────────────────────────────────────

    /// Messages sent to `phone` on the recipient-local `date`.
    async fn get_daily_count(
        &self,
        phone: &PhoneNumber,
        date: NaiveDate,
    ) -> Result<u32, DatabaseError>;

    // ── Deliveries ──────────────────────────────────────────────────

    /// Atomically append a successful delivery, bump the daily counter for
    /// `local_date`, and (for scheduled sends) write the new progression.
    /// Returns the day's new count.
    async fn record_send(
        &self,
        delivery: &DeliveryRecord,
        local_date: NaiveDate,
        progress: Option<&ProgressUpdate>,
    ) -> Result<u32, DatabaseError>;

    /// Append a delivery record without touching counters (failed attempts).
    async fn insert_delivery(&self, delivery: &DeliveryRecord) -> Result<(), DatabaseError>;

    /// Mark the most recent send of `template_id` to `phone` as responded.
    /// Returns `false` if there was nothing to mark.
    async fn mark_delivery_responded(
        &self,
        phone: &PhoneNumber,
        template_id: &str,
        response: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Deliveries for a recipient, most recent first.
    async fn list_deliveries(
        &self,
        phone: &PhoneNumber,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, DatabaseError>;

    // ── Catalog ─────────────────────────────────────────────────────

    /// Insert or update a template. Fails with `Constraint` if the template
    /// has already been delivered and its content would change.
    async fn upsert_template(&self, template: &MessageTemplate) -> Result<(), DatabaseError>;

    async fn get_template(&self, id: &str) -> Result<Option<MessageTemplate>, DatabaseError>;

    /// Active template at position `n` of a program's numbered track.
    async fn find_sequenced_template(
        &self,
        program: &str,
        category: &str,
        n: u32,
    ) -> Result<Option<MessageTemplate>, DatabaseError>;

    /// Active, unnumbered, non-reserved templates of a program.
    async fn list_pool_templates(
        &self,
        program: &str,
    ) -> Result<Vec<MessageTemplate>, DatabaseError>;

    // ── Injections ──────────────────────────────────────────────────

    async fn insert_injection(&self, injection: &PendingInjection) -> Result<(), DatabaseError>;

    async fn get_injection(&self, id: Uuid) -> Result<Option<PendingInjection>, DatabaseError>;

    /// Pending rows, highest priority first, then oldest first.
    async fn list_pending_injections(&self) -> Result<Vec<PendingInjection>, DatabaseError>;

    /// Move a row to `status`, stamping `updated_at` with `at`.
    async fn update_injection_status(
        &self,
        id: Uuid,
        status: InjectionStatus,
        detail: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Delete terminal rows last updated before `cutoff`. Returns rows deleted.
    async fn purge_injections(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError>;

    // ── Event log ───────────────────────────────────────────────────

    async fn insert_log(&self, entry: &LogEntry) -> Result<(), DatabaseError>;

    /// Most recent log entries, optionally of one kind.
    async fn list_logs(
        &self,
        kind: Option<LogKind>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, DatabaseError>;
}
