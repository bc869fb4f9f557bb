//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS recipients (
                phone TEXT PRIMARY KEY,
                program TEXT NOT NULL,
                class TEXT NOT NULL,
                sequence_position INTEGER NOT NULL DEFAULT 1,
                total_sent INTEGER NOT NULL DEFAULT 0,
                trial_sent INTEGER NOT NULL DEFAULT 0,
                post_trial_phase INTEGER NOT NULL DEFAULT 0,
                post_trial_day INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                timezone TEXT NOT NULL,
                last_sent_at TEXT,
                awaiting_template_id TEXT,
                awaiting_since TEXT,
                display_name TEXT,
                joined_at TEXT NOT NULL,
                paused_at_position INTEGER,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_recipients_status ON recipients(status);
            CREATE INDEX IF NOT EXISTS idx_recipients_program ON recipients(program);
            CREATE INDEX IF NOT EXISTS idx_recipients_joined_at ON recipients(joined_at);

            CREATE TABLE IF NOT EXISTS daily_counters (
                phone TEXT NOT NULL,
                local_date TEXT NOT NULL,
                sent_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (phone, local_date)
            );

            CREATE TABLE IF NOT EXISTS message_templates (
                id TEXT PRIMARY KEY,
                sequence_number INTEGER,
                program TEXT NOT NULL,
                category TEXT NOT NULL,
                interaction TEXT NOT NULL DEFAULT 'standard',
                body TEXT NOT NULL,
                options TEXT NOT NULL DEFAULT '',
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_templates_track
                ON message_templates(program, category, sequence_number);

            CREATE TABLE IF NOT EXISTS deliveries (
                id TEXT PRIMARY KEY,
                phone TEXT NOT NULL,
                template_id TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                status TEXT NOT NULL,
                sequence_position INTEGER NOT NULL,
                manual INTEGER NOT NULL DEFAULT 0,
                transport_ref TEXT,
                error TEXT,
                response TEXT,
                responded_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_phone_template
                ON deliveries(phone, template_id, sent_at);

            CREATE TABLE IF NOT EXISTS pending_injections (
                id TEXT PRIMARY KEY,
                phone TEXT NOT NULL,
                template_id TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                detail TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_injections_status ON pending_injections(status);

            CREATE TABLE IF NOT EXISTS system_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                phone TEXT,
                detail TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_system_logs_kind ON system_logs(kind);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        "Database migrations complete (at V{})",
        get_current_version(conn).await?
    );

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
