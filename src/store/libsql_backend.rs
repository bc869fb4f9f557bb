//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All writes go through a
//! single async write lock so a multi-statement transaction never picks up an
//! unrelated statement issued on the shared connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::{MessageTemplate, OptionSet, category};
use crate::delivery::record::{DeliveryRecord, DeliveryStatus};
use crate::error::DatabaseError;
use crate::event_log::{LogEntry, LogKind};
use crate::injector::model::{InjectionStatus, PendingInjection};
use crate::phone::PhoneNumber;
use crate::recipients::{ConversationState, LifecycleStatus, ProgressUpdate, Recipient};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn count(&self, sql: &str, args: impl libsql::params::IntoParams) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<u32>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n as i64),
        None => libsql::Value::Null,
    }
}

fn parse_phone(s: &str) -> Result<PhoneNumber, DatabaseError> {
    PhoneNumber::parse(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const RECIPIENT_COLUMNS: &str = "phone, program, class, sequence_position, total_sent, trial_sent, post_trial_phase, post_trial_day, status, timezone, last_sent_at, awaiting_template_id, awaiting_since, display_name, joined_at, paused_at_position";

const TEMPLATE_COLUMNS: &str =
    "id, sequence_number, program, category, interaction, body, options, active";

const DELIVERY_COLUMNS: &str = "id, phone, template_id, sent_at, status, sequence_position, manual, transport_ref, error, response, responded_at";

const INJECTION_COLUMNS: &str =
    "id, phone, template_id, priority, status, detail, created_at, updated_at";

/// Map a libsql Row to a Recipient. Column order matches RECIPIENT_COLUMNS.
fn row_to_recipient(row: &libsql::Row) -> Result<Recipient, DatabaseError> {
    let get_str = |i: i32| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("recipient column {i}: {e}")))
    };
    let get_int = |i: i32| -> Result<i64, DatabaseError> {
        row.get::<i64>(i)
            .map_err(|e| DatabaseError::Query(format!("recipient column {i}: {e}")))
    };

    let timezone = get_str(9)?;
    let awaiting_id: Option<String> = row.get::<String>(11).ok();
    let awaiting_since: Option<String> = row.get::<String>(12).ok();
    let last_sent: Option<String> = row.get::<String>(10).ok();

    Ok(Recipient {
        phone: parse_phone(&get_str(0)?)?,
        program: get_str(1)?,
        class: get_str(2)?.parse().map_err(DatabaseError::Serialization)?,
        sequence_position: get_int(3)? as u32,
        total_sent: get_int(4)? as u32,
        trial_sent: get_int(5)? as u32,
        post_trial_phase: get_int(6)? as u8,
        post_trial_day: get_int(7)? as u32,
        status: get_str(8)?.parse().map_err(DatabaseError::Serialization)?,
        timezone: timezone
            .parse()
            .map_err(|_| DatabaseError::Serialization(format!("unknown timezone {timezone}")))?,
        last_sent_at: parse_optional_datetime(&last_sent),
        conversation: ConversationState::from_columns(
            awaiting_id,
            parse_optional_datetime(&awaiting_since),
        ),
        display_name: row.get::<String>(13).ok(),
        joined_at: parse_datetime(&get_str(14)?),
        paused_at_position: row.get::<i64>(15).ok().map(|n| n as u32),
    })
}

/// Map a libsql Row to a MessageTemplate. Column order matches TEMPLATE_COLUMNS.
fn row_to_template(row: &libsql::Row) -> Result<MessageTemplate, DatabaseError> {
    let get_str = |i: i32| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("template column {i}: {e}")))
    };
    Ok(MessageTemplate {
        id: get_str(0)?,
        sequence_number: row.get::<i64>(1).ok().map(|n| n as u32),
        program: get_str(2)?,
        category: get_str(3)?,
        interaction: get_str(4)?.parse().map_err(DatabaseError::Serialization)?,
        body: get_str(5)?,
        options: OptionSet::from_db(&get_str(6)?),
        active: row.get::<i64>(7).unwrap_or(1) != 0,
    })
}

/// Map a libsql Row to a DeliveryRecord. Column order matches DELIVERY_COLUMNS.
fn row_to_delivery(row: &libsql::Row) -> Result<DeliveryRecord, DatabaseError> {
    let get_str = |i: i32| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("delivery column {i}: {e}")))
    };
    let responded_at: Option<String> = row.get::<String>(10).ok();
    Ok(DeliveryRecord {
        id: Uuid::parse_str(&get_str(0)?).unwrap_or_else(|_| Uuid::nil()),
        phone: parse_phone(&get_str(1)?)?,
        template_id: get_str(2)?,
        sent_at: parse_datetime(&get_str(3)?),
        status: get_str(4)?
            .parse::<DeliveryStatus>()
            .map_err(DatabaseError::Serialization)?,
        sequence_position: row.get::<i64>(5).unwrap_or(0) as u32,
        manual: row.get::<i64>(6).unwrap_or(0) != 0,
        transport_ref: row.get::<String>(7).ok(),
        error: row.get::<String>(8).ok(),
        response: row.get::<String>(9).ok(),
        responded_at: parse_optional_datetime(&responded_at),
    })
}

/// Map a libsql Row to a PendingInjection. Column order matches INJECTION_COLUMNS.
fn row_to_injection(row: &libsql::Row) -> Result<PendingInjection, DatabaseError> {
    let get_str = |i: i32| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("injection column {i}: {e}")))
    };
    Ok(PendingInjection {
        id: Uuid::parse_str(&get_str(0)?).unwrap_or_else(|_| Uuid::nil()),
        phone: parse_phone(&get_str(1)?)?,
        template_id: get_str(2)?,
        priority: row.get::<i64>(3).unwrap_or(0) as i32,
        status: get_str(4)?
            .parse::<InjectionStatus>()
            .map_err(DatabaseError::Serialization)?,
        detail: row.get::<String>(5).ok(),
        created_at: parse_datetime(&get_str(6)?),
        updated_at: parse_datetime(&get_str(7)?),
    })
}

/// Drain rows through a mapper, skipping (and logging) rows that fail to parse.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
    what: &str,
) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        match map(&row) {
            Ok(item) => out.push(item),
            Err(e) => tracing::warn!("Skipping {what} row: {e}"),
        }
    }
    out
}

async fn insert_delivery_on(conn: &Connection, d: &DeliveryRecord) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO deliveries ({DELIVERY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            d.id.to_string(),
            d.phone.as_str(),
            d.template_id.as_str(),
            d.sent_at.to_rfc3339(),
            d.status.to_string(),
            d.sequence_position as i64,
            d.manual as i64,
            opt_text(d.transport_ref.as_deref()),
            opt_text(d.error.as_deref()),
            opt_text(d.response.as_deref()),
            opt_datetime(d.responded_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_delivery: {e}")))?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Recipients ──────────────────────────────────────────────────

    async fn upsert_recipient(&self, r: &Recipient) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let (awaiting_id, awaiting_since) = r.conversation.to_columns();
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO recipients ({RECIPIENT_COLUMNS}, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                     ON CONFLICT(phone) DO UPDATE SET
                        program = excluded.program,
                        class = excluded.class,
                        sequence_position = excluded.sequence_position,
                        total_sent = excluded.total_sent,
                        trial_sent = excluded.trial_sent,
                        post_trial_phase = excluded.post_trial_phase,
                        post_trial_day = excluded.post_trial_day,
                        status = excluded.status,
                        timezone = excluded.timezone,
                        last_sent_at = excluded.last_sent_at,
                        awaiting_template_id = excluded.awaiting_template_id,
                        awaiting_since = excluded.awaiting_since,
                        display_name = excluded.display_name,
                        joined_at = excluded.joined_at,
                        paused_at_position = excluded.paused_at_position,
                        updated_at = excluded.updated_at"
                ),
                params![
                    r.phone.as_str(),
                    r.program.as_str(),
                    r.class.to_string(),
                    r.sequence_position as i64,
                    r.total_sent as i64,
                    r.trial_sent as i64,
                    r.post_trial_phase as i64,
                    r.post_trial_day as i64,
                    r.status.to_string(),
                    r.timezone.name(),
                    opt_datetime(r.last_sent_at),
                    opt_text(awaiting_id),
                    opt_datetime(awaiting_since),
                    opt_text(r.display_name.as_deref()),
                    r.joined_at.to_rfc3339(),
                    opt_int(r.paused_at_position),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_recipient: {e}")))?;

        debug!(phone = %r.phone, program = %r.program, "Recipient upserted");
        Ok(())
    }

    async fn get_recipient(&self, phone: &PhoneNumber) -> Result<Option<Recipient>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE phone = ?1"),
                params![phone.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_recipient: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_recipient(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_recipient: {e}"))),
        }
    }

    async fn list_active_recipients(&self) -> Result<Vec<Recipient>, DatabaseError> {
        self.list_cohort(None).await
    }

    async fn list_cohort(&self, program: Option<&str>) -> Result<Vec<Recipient>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECIPIENT_COLUMNS} FROM recipients
                     WHERE status = 'active' AND (?1 IS NULL OR program = ?1)
                     ORDER BY joined_at ASC"
                ),
                params![opt_text(program)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_cohort: {e}")))?;
        Ok(collect_rows(rows, row_to_recipient, "recipient").await)
    }

    async fn set_lifecycle(
        &self,
        phone: &PhoneNumber,
        status: LifecycleStatus,
        paused_at_position: Option<u32>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE recipients SET status = ?1, paused_at_position = ?2, updated_at = ?3 WHERE phone = ?4",
                params![
                    status.to_string(),
                    opt_int(paused_at_position),
                    Utc::now().to_rfc3339(),
                    phone.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_lifecycle: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "recipient".into(),
                id: phone.to_string(),
            });
        }
        debug!(phone = %phone, status = %status, "Recipient lifecycle updated");
        Ok(())
    }

    async fn reset_progress(&self, phone: &PhoneNumber) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE recipients SET sequence_position = 1, trial_sent = 0, status = 'active',
                    paused_at_position = NULL, updated_at = ?1
                 WHERE phone = ?2",
                params![Utc::now().to_rfc3339(), phone.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_progress: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "recipient".into(),
                id: phone.to_string(),
            });
        }
        Ok(())
    }

    async fn set_conversation_state(
        &self,
        phone: &PhoneNumber,
        state: &ConversationState,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let (template_id, since) = state.to_columns();
        self.conn()
            .execute(
                "UPDATE recipients SET awaiting_template_id = ?1, awaiting_since = ?2, updated_at = ?3
                 WHERE phone = ?4",
                params![
                    opt_text(template_id),
                    opt_datetime(since),
                    Utc::now().to_rfc3339(),
                    phone.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_conversation_state: {e}")))?;
        Ok(())
    }

    // ── Daily counters ──────────────────────────────────────────────

    async fn get_daily_count(
        &self,
        phone: &PhoneNumber,
        date: NaiveDate,
    ) -> Result<u32, DatabaseError> {
        let count = self
            .count(
                "SELECT COALESCE(SUM(sent_count), 0) FROM daily_counters WHERE phone = ?1 AND local_date = ?2",
                params![phone.as_str(), date.to_string()],
            )
            .await?;
        Ok(count as u32)
    }

    // ── Deliveries ──────────────────────────────────────────────────

    async fn record_send(
        &self,
        delivery: &DeliveryRecord,
        local_date: NaiveDate,
        progress: Option<&ProgressUpdate>,
    ) -> Result<u32, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("record_send begin: {e}")))?;

        let result: Result<u32, DatabaseError> = async {
            insert_delivery_on(&tx, delivery).await?;

            tx.execute(
                "INSERT INTO daily_counters (phone, local_date, sent_count) VALUES (?1, ?2, 1)
                 ON CONFLICT(phone, local_date) DO UPDATE SET sent_count = sent_count + 1",
                params![delivery.phone.as_str(), local_date.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_send counter: {e}")))?;

            if let Some(p) = progress {
                tx.execute(
                    "UPDATE recipients SET sequence_position = ?1, total_sent = ?2, trial_sent = ?3,
                        post_trial_phase = ?4, post_trial_day = ?5, last_sent_at = ?6, updated_at = ?7
                     WHERE phone = ?8",
                    params![
                        p.sequence_position as i64,
                        p.total_sent as i64,
                        p.trial_sent as i64,
                        p.post_trial_phase as i64,
                        p.post_trial_day as i64,
                        p.last_sent_at.to_rfc3339(),
                        Utc::now().to_rfc3339(),
                        delivery.phone.as_str(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("record_send progress: {e}")))?;
            }

            let mut rows = tx
                .query(
                    "SELECT sent_count FROM daily_counters WHERE phone = ?1 AND local_date = ?2",
                    params![delivery.phone.as_str(), local_date.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("record_send count: {e}")))?;
            let count = match rows.next().await {
                Ok(Some(row)) => row.get::<i64>(0).unwrap_or(0),
                _ => 0,
            };
            Ok(count as u32)
        }
        .await;

        match result {
            Ok(count) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("record_send commit: {e}")))?;
                debug!(
                    phone = %delivery.phone,
                    template_id = %delivery.template_id,
                    daily_count = count,
                    "Send recorded"
                );
                Ok(count)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!("record_send rollback failed: {rb}");
                }
                Err(e)
            }
        }
    }

    async fn insert_delivery(&self, delivery: &DeliveryRecord) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        insert_delivery_on(self.conn(), delivery).await
    }

    async fn mark_delivery_responded(
        &self,
        phone: &PhoneNumber,
        template_id: &str,
        response: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE deliveries SET status = 'responded', response = ?1, responded_at = ?2
                 WHERE id = (
                    SELECT id FROM deliveries
                    WHERE phone = ?3 AND template_id = ?4 AND status != 'failed'
                    ORDER BY sent_at DESC LIMIT 1
                 )",
                params![response, at.to_rfc3339(), phone.as_str(), template_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_delivery_responded: {e}")))?;
        Ok(updated > 0)
    }

    async fn list_deliveries(
        &self,
        phone: &PhoneNumber,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE phone = ?1
                     ORDER BY sent_at DESC LIMIT ?2"
                ),
                params![phone.as_str(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_deliveries: {e}")))?;
        Ok(collect_rows(rows, row_to_delivery, "delivery").await)
    }

    // ── Catalog ─────────────────────────────────────────────────────

    async fn upsert_template(&self, t: &MessageTemplate) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;

        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM message_templates WHERE id = ?1"),
                params![t.id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_template: {e}")))?;
        let existing = match rows.next().await {
            Ok(Some(row)) => Some(row_to_template(&row)?),
            Ok(None) => None,
            Err(e) => return Err(DatabaseError::Query(format!("upsert_template: {e}"))),
        };

        if let Some(existing) = existing {
            let content_changed = existing.body != t.body
                || existing.options != t.options
                || existing.interaction != t.interaction;
            if content_changed {
                let delivered = self
                    .count(
                        "SELECT COUNT(*) FROM deliveries WHERE template_id = ?1",
                        params![t.id.as_str()],
                    )
                    .await?;
                if delivered > 0 {
                    return Err(DatabaseError::Constraint(format!(
                        "template {} has {delivered} deliveries and cannot change content",
                        t.id
                    )));
                }
            }
        }

        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO message_templates ({TEMPLATE_COLUMNS}, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                     ON CONFLICT(id) DO UPDATE SET
                        sequence_number = excluded.sequence_number,
                        program = excluded.program,
                        category = excluded.category,
                        interaction = excluded.interaction,
                        body = excluded.body,
                        options = excluded.options,
                        active = excluded.active,
                        updated_at = excluded.updated_at"
                ),
                params![
                    t.id.as_str(),
                    opt_int(t.sequence_number),
                    t.program.as_str(),
                    t.category.as_str(),
                    t.interaction.to_string(),
                    t.body.as_str(),
                    t.options.to_db(),
                    t.active as i64,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_template: {e}")))?;

        debug!(template_id = %t.id, category = %t.category, "Template upserted");
        Ok(())
    }

    async fn get_template(&self, id: &str) -> Result<Option<MessageTemplate>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM message_templates WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_template: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_template(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_template: {e}"))),
        }
    }

    async fn find_sequenced_template(
        &self,
        program: &str,
        category: &str,
        n: u32,
    ) -> Result<Option<MessageTemplate>, DatabaseError> {
        // Program-specific templates win over catalog-wide ones.
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TEMPLATE_COLUMNS} FROM message_templates
                     WHERE (program = ?1 OR program = '*') AND category = ?2
                       AND sequence_number = ?3 AND active = 1
                     ORDER BY (program = '*') ASC LIMIT 1"
                ),
                params![program, category, n as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_sequenced_template: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_template(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_sequenced_template: {e}"))),
        }
    }

    async fn list_pool_templates(
        &self,
        program: &str,
    ) -> Result<Vec<MessageTemplate>, DatabaseError> {
        let reserved = category::RESERVED
            .iter()
            .map(|c| format!("'{c}'"))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TEMPLATE_COLUMNS} FROM message_templates
                     WHERE program = ?1 AND sequence_number IS NULL AND active = 1
                       AND category NOT IN ({reserved})
                     ORDER BY id ASC"
                ),
                params![program],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pool_templates: {e}")))?;
        Ok(collect_rows(rows, row_to_template, "template").await)
    }

    // ── Injections ──────────────────────────────────────────────────

    async fn insert_injection(&self, inj: &PendingInjection) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO pending_injections ({INJECTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    inj.id.to_string(),
                    inj.phone.as_str(),
                    inj.template_id.as_str(),
                    inj.priority as i64,
                    inj.status.to_string(),
                    opt_text(inj.detail.as_deref()),
                    inj.created_at.to_rfc3339(),
                    inj.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_injection: {e}")))?;
        Ok(())
    }

    async fn get_injection(&self, id: Uuid) -> Result<Option<PendingInjection>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {INJECTION_COLUMNS} FROM pending_injections WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_injection: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_injection(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_injection: {e}"))),
        }
    }

    async fn list_pending_injections(&self) -> Result<Vec<PendingInjection>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INJECTION_COLUMNS} FROM pending_injections
                     WHERE status = 'pending'
                     ORDER BY priority DESC, created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pending_injections: {e}")))?;
        Ok(collect_rows(rows, row_to_injection, "injection").await)
    }

    async fn update_injection_status(
        &self,
        id: Uuid,
        status: InjectionStatus,
        detail: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE pending_injections SET status = ?1, detail = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    status.to_string(),
                    opt_text(detail),
                    at.to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_injection_status: {e}")))?;
        Ok(())
    }

    async fn purge_injections(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "DELETE FROM pending_injections WHERE status != 'pending' AND updated_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_injections: {e}")))?;

        if count > 0 {
            info!(count, "Purged terminal injection rows");
        }
        Ok(count as usize)
    }

    // ── Event log ───────────────────────────────────────────────────

    async fn insert_log(&self, entry: &LogEntry) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let detail = match &entry.detail {
            Some(v) => Some(
                serde_json::to_string(v)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        self.conn()
            .execute(
                "INSERT INTO system_logs (kind, message, phone, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.kind.to_string(),
                    entry.message.as_str(),
                    opt_text(entry.phone.as_deref()),
                    opt_text(detail.as_deref()),
                    entry.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_log: {e}")))?;
        Ok(())
    }

    async fn list_logs(
        &self,
        kind: Option<LogKind>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, DatabaseError> {
        let kind_str = kind.map(|k| k.to_string());
        let rows = self
            .conn()
            .query(
                "SELECT kind, message, phone, detail, created_at FROM system_logs
                 WHERE (?1 IS NULL OR kind = ?1)
                 ORDER BY id DESC LIMIT ?2",
                params![opt_text(kind_str.as_deref()), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_logs: {e}")))?;

        let map = |row: &libsql::Row| -> Result<LogEntry, DatabaseError> {
            let kind: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("log kind: {e}")))?;
            let message: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("log message: {e}")))?;
            let detail: Option<String> = row.get::<String>(3).ok();
            let created: String = row
                .get(4)
                .map_err(|e| DatabaseError::Query(format!("log created_at: {e}")))?;
            Ok(LogEntry {
                kind: kind.parse().map_err(DatabaseError::Serialization)?,
                message,
                phone: row.get::<String>(2).ok(),
                detail: detail.and_then(|d| serde_json::from_str(&d).ok()),
                created_at: parse_datetime(&created),
            })
        };
        Ok(collect_rows(rows, map, "log").await)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::recipients::RecipientClass;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn phone(s: &str) -> PhoneNumber {
        PhoneNumber::parse(s).unwrap()
    }

    fn make_recipient(p: &str, program: &str, joined_days_ago: i64) -> Recipient {
        Recipient::enroll(
            phone(p),
            program,
            RecipientClass::Subscriber,
            chrono_tz::America::Chicago,
            Utc::now() - Duration::days(joined_days_ago),
        )
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // ── Recipients ──────────────────────────────────────────────────

    #[tokio::test]
    async fn recipient_roundtrip() {
        let db = test_db().await;
        let mut r = make_recipient("5550000001", "Elevate", 3).with_name("Dana");
        r.conversation = ConversationState::AwaitingResponse {
            template_id: "mood".into(),
            since: Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
        };
        r.last_sent_at = Some(Utc.with_ymd_and_hms(2026, 5, 1, 11, 0, 0).unwrap());
        db.upsert_recipient(&r).await.unwrap();

        let fetched = db.get_recipient(&r.phone).await.unwrap().unwrap();
        assert_eq!(fetched.program, "Elevate");
        assert_eq!(fetched.class, RecipientClass::Subscriber);
        assert_eq!(fetched.timezone, chrono_tz::America::Chicago);
        assert_eq!(fetched.display_name.as_deref(), Some("Dana"));
        assert_eq!(fetched.conversation, r.conversation);
        assert_eq!(fetched.last_sent_at, r.last_sent_at);
        assert!(fetched.paused_at_position.is_none());
    }

    #[tokio::test]
    async fn get_recipient_not_found() {
        let db = test_db().await;
        assert!(db.get_recipient(&phone("5559999999")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn active_recipients_ordered_by_join() {
        let db = test_db().await;
        db.upsert_recipient(&make_recipient("5550000001", "Elevate", 1))
            .await
            .unwrap();
        db.upsert_recipient(&make_recipient("5550000002", "Elevate", 5))
            .await
            .unwrap();
        let mut stopped = make_recipient("5550000003", "Elevate", 9);
        stopped.status = LifecycleStatus::Stopped;
        db.upsert_recipient(&stopped).await.unwrap();

        let active = db.list_active_recipients().await.unwrap();
        let phones: Vec<&str> = active.iter().map(|r| r.phone.as_str()).collect();
        assert_eq!(phones, vec!["15550000002", "15550000001"]);
    }

    #[tokio::test]
    async fn cohort_filters_by_program() {
        let db = test_db().await;
        db.upsert_recipient(&make_recipient("5550000001", "Elevate", 1))
            .await
            .unwrap();
        db.upsert_recipient(&make_recipient("5550000002", "Balance", 2))
            .await
            .unwrap();

        assert_eq!(db.list_cohort(Some("Elevate")).await.unwrap().len(), 1);
        assert_eq!(db.list_cohort(None).await.unwrap().len(), 2);
        assert!(db.list_cohort(Some("Nope")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_and_reset() {
        let db = test_db().await;
        let mut r = make_recipient("5550000001", "Elevate", 40);
        r.sequence_position = 12;
        r.trial_sent = 7;
        db.upsert_recipient(&r).await.unwrap();

        db.set_lifecycle(&r.phone, LifecycleStatus::Stopped, Some(12))
            .await
            .unwrap();
        let fetched = db.get_recipient(&r.phone).await.unwrap().unwrap();
        assert_eq!(fetched.status, LifecycleStatus::Stopped);
        assert_eq!(fetched.paused_at_position, Some(12));

        db.reset_progress(&r.phone).await.unwrap();
        let fetched = db.get_recipient(&r.phone).await.unwrap().unwrap();
        assert_eq!(fetched.status, LifecycleStatus::Active);
        assert_eq!(fetched.sequence_position, 1);
        assert_eq!(fetched.trial_sent, 0);
        assert!(fetched.paused_at_position.is_none());
    }

    #[tokio::test]
    async fn lifecycle_unknown_recipient_is_not_found() {
        let db = test_db().await;
        let err = db
            .set_lifecycle(&phone("5559999999"), LifecycleStatus::Stopped, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn conversation_state_update() {
        let db = test_db().await;
        let r = make_recipient("5550000001", "Elevate", 1);
        db.upsert_recipient(&r).await.unwrap();

        let state = ConversationState::AwaitingResponse {
            template_id: "mood".into(),
            since: Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
        };
        db.set_conversation_state(&r.phone, &state).await.unwrap();
        assert_eq!(
            db.get_recipient(&r.phone).await.unwrap().unwrap().conversation,
            state
        );

        db.set_conversation_state(&r.phone, &ConversationState::Idle)
            .await
            .unwrap();
        assert_eq!(
            db.get_recipient(&r.phone).await.unwrap().unwrap().conversation,
            ConversationState::Idle
        );
    }

    // ── Deliveries & counters ───────────────────────────────────────

    #[tokio::test]
    async fn record_send_bumps_counter_and_progress() {
        let db = test_db().await;
        let r = make_recipient("5550000001", "Elevate", 1);
        db.upsert_recipient(&r).await.unwrap();
        let sent_at = Utc.with_ymd_and_hms(2026, 5, 1, 15, 0, 0).unwrap();
        let day = date(2026, 5, 1);

        let progress = ProgressUpdate {
            sequence_position: 2,
            total_sent: 1,
            trial_sent: 0,
            post_trial_phase: 0,
            post_trial_day: 0,
            last_sent_at: sent_at,
        };
        let d1 = DeliveryRecord::sent(&r.phone, "seq_1", 1, false, "SM1".into(), sent_at);
        assert_eq!(db.record_send(&d1, day, Some(&progress)).await.unwrap(), 1);

        let d2 = DeliveryRecord::sent(&r.phone, "storm", 2, true, "SM2".into(), sent_at);
        assert_eq!(db.record_send(&d2, day, None).await.unwrap(), 2);

        assert_eq!(db.get_daily_count(&r.phone, day).await.unwrap(), 2);
        assert_eq!(db.get_daily_count(&r.phone, date(2026, 5, 2)).await.unwrap(), 0);

        let fetched = db.get_recipient(&r.phone).await.unwrap().unwrap();
        assert_eq!(fetched.sequence_position, 2);
        assert_eq!(fetched.total_sent, 1);
        assert_eq!(fetched.last_sent_at, Some(sent_at));

        let deliveries = db.list_deliveries(&r.phone, 10).await.unwrap();
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries.iter().any(|d| d.manual && d.template_id == "storm"));
    }

    #[tokio::test]
    async fn failed_delivery_does_not_count() {
        let db = test_db().await;
        let p = phone("5550000001");
        let at = Utc.with_ymd_and_hms(2026, 5, 1, 15, 0, 0).unwrap();
        let d = DeliveryRecord::failed(&p, "seq_1", 1, false, "timeout".into(), at);
        db.insert_delivery(&d).await.unwrap();

        assert_eq!(db.get_daily_count(&p, date(2026, 5, 1)).await.unwrap(), 0);
        let deliveries = db.list_deliveries(&p, 10).await.unwrap();
        assert_eq!(deliveries[0].status, DeliveryStatus::Failed);
        assert_eq!(deliveries[0].error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn mark_responded_targets_latest_send() {
        let db = test_db().await;
        let p = phone("5550000001");
        let early = Utc.with_ymd_and_hms(2026, 5, 1, 15, 0, 0).unwrap();
        let late = early + Duration::days(3);
        let old = DeliveryRecord::sent(&p, "mood", 3, false, "SM1".into(), early);
        let new = DeliveryRecord::sent(&p, "mood", 6, false, "SM2".into(), late);
        db.insert_delivery(&old).await.unwrap();
        db.insert_delivery(&new).await.unwrap();

        let marked = db
            .mark_delivery_responded(&p, "mood", "B", late + Duration::hours(1))
            .await
            .unwrap();
        assert!(marked);

        let deliveries = db.list_deliveries(&p, 10).await.unwrap();
        let latest = deliveries.iter().find(|d| d.id == new.id).unwrap();
        let earlier = deliveries.iter().find(|d| d.id == old.id).unwrap();
        assert_eq!(latest.status, DeliveryStatus::Responded);
        assert_eq!(latest.response.as_deref(), Some("B"));
        assert_eq!(earlier.status, DeliveryStatus::Sent);

        let none = db
            .mark_delivery_responded(&p, "other", "A", late)
            .await
            .unwrap();
        assert!(!none);
    }

    // ── Catalog ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn template_roundtrip() {
        let db = test_db().await;
        let t = MessageTemplate::new("mood", "Elevate", "sequence", "How? A) ok B) meh")
            .numbered(4)
            .interactive(OptionSet::new(['A', 'B']).unwrap());
        db.upsert_template(&t).await.unwrap();
        assert_eq!(db.get_template("mood").await.unwrap().unwrap(), t);
        assert!(db.get_template("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delivered_template_content_is_frozen() {
        let db = test_db().await;
        let t = MessageTemplate::new("storm", "*", "manual", "Stay safe");
        db.upsert_template(&t).await.unwrap();

        // Not delivered yet: edits are fine.
        let edited = MessageTemplate::new("storm", "*", "manual", "Stay safe today");
        db.upsert_template(&edited).await.unwrap();

        let p = phone("5550000001");
        let d = DeliveryRecord::sent(&p, "storm", 1, true, "SM1".into(), Utc::now());
        db.insert_delivery(&d).await.unwrap();

        let again = MessageTemplate::new("storm", "*", "manual", "Something else");
        let err = db.upsert_template(&again).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));

        // Same content re-upserted is allowed.
        db.upsert_template(&edited).await.unwrap();
    }

    #[tokio::test]
    async fn sequenced_lookup_prefers_program_specific() {
        let db = test_db().await;
        db.upsert_template(&MessageTemplate::new("any_3", "*", "sequence", "generic").numbered(3))
            .await
            .unwrap();
        db.upsert_template(
            &MessageTemplate::new("elevate_3", "Elevate", "sequence", "specific").numbered(3),
        )
        .await
        .unwrap();

        let found = db
            .find_sequenced_template("Elevate", "sequence", 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "elevate_3");

        let fallback = db
            .find_sequenced_template("Balance", "sequence", 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fallback.id, "any_3");

        assert!(
            db.find_sequenced_template("Elevate", "trial", 3)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn pool_excludes_numbered_reserved_and_inactive() {
        let db = test_db().await;
        db.upsert_template(&MessageTemplate::new("a1", "Elevate", "algorithm", "one"))
            .await
            .unwrap();
        db.upsert_template(&MessageTemplate::new("a2", "Elevate", "insight", "two"))
            .await
            .unwrap();
        db.upsert_template(&MessageTemplate::new("n1", "Elevate", "insight", "n").numbered(40))
            .await
            .unwrap();
        db.upsert_template(&MessageTemplate::new("m1", "Elevate", category::MANUAL, "m"))
            .await
            .unwrap();
        let mut off = MessageTemplate::new("off", "Elevate", "insight", "off");
        off.active = false;
        db.upsert_template(&off).await.unwrap();
        db.upsert_template(&MessageTemplate::new("b1", "Balance", "insight", "b"))
            .await
            .unwrap();

        let pool = db.list_pool_templates("Elevate").await.unwrap();
        let ids: Vec<&str> = pool.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
    }

    // ── Injections ──────────────────────────────────────────────────

    #[tokio::test]
    async fn pending_injections_ordered_by_priority_then_age() {
        let db = test_db().await;
        let base = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let low = PendingInjection::new(&phone("5550000001"), "t", 1, base);
        let high_late = PendingInjection::new(&phone("5550000002"), "t", 5, base + Duration::minutes(2));
        let high_early = PendingInjection::new(&phone("5550000003"), "t", 5, base + Duration::minutes(1));
        for inj in [&low, &high_late, &high_early] {
            db.insert_injection(inj).await.unwrap();
        }

        let pending = db.list_pending_injections().await.unwrap();
        let ids: Vec<Uuid> = pending.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![high_early.id, high_late.id, low.id]);

        db.update_injection_status(low.id, InjectionStatus::Skipped, Some("rest day"), base)
            .await
            .unwrap();
        let fetched = db.get_injection(low.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, InjectionStatus::Skipped);
        assert_eq!(fetched.detail.as_deref(), Some("rest day"));
        assert_eq!(db.list_pending_injections().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn purge_removes_only_old_terminal_rows() {
        let db = test_db().await;
        let now = Utc::now();
        let done = PendingInjection::new(&phone("5550000001"), "t", 0, now);
        let pending = PendingInjection::new(&phone("5550000002"), "t", 0, now);
        db.insert_injection(&done).await.unwrap();
        db.insert_injection(&pending).await.unwrap();
        db.update_injection_status(done.id, InjectionStatus::Sent, None, now)
            .await
            .unwrap();

        // Cutoff in the past keeps the freshly updated row.
        assert_eq!(db.purge_injections(now - Duration::days(30)).await.unwrap(), 0);

        // Cutoff in the future removes the terminal row but never the pending one.
        assert_eq!(db.purge_injections(now + Duration::days(1)).await.unwrap(), 1);
        assert!(db.get_injection(done.id).await.unwrap().is_none());
        assert!(db.get_injection(pending.id).await.unwrap().is_some());
    }

    // ── Logs ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn logs_filter_by_kind() {
        let db = test_db().await;
        for (kind, msg) in [
            (LogKind::Send, "sent"),
            (LogKind::Skip, "outside hours"),
            (LogKind::Skip, "rest day"),
        ] {
            db.insert_log(&LogEntry {
                kind,
                message: msg.into(),
                phone: None,
                detail: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        let skips = db.list_logs(Some(LogKind::Skip), 10).await.unwrap();
        assert_eq!(skips.len(), 2);
        assert_eq!(skips[0].message, "rest day");
        assert_eq!(db.list_logs(None, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("sms.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        assert!(db_path.exists());
        drop(db);
    }
}
