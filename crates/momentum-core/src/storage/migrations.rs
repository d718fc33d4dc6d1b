//! Database schema migrations for momentum.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table tracks the current migration version.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
///
/// Increment this when adding new migrations.
pub const SCHEMA_VERSION: i32 = 2;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Returns 0 if no version is set (fresh database).
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, Option<i32>>(0)
    })
    .map(|v| v.unwrap_or(0))
    .unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to read schema_version");
        0
    })
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Migration v1: events, daily scores, rate-limit counters, intervention log.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            event_type  TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            value       TEXT NOT NULL DEFAULT 'null',
            tombstoned  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS daily_scores (
            user_id     TEXT NOT NULL,
            score_date  TEXT NOT NULL,
            raw_score   REAL NOT NULL,
            zone        TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            breakdown   TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (user_id, score_date)
        );

        CREATE TABLE IF NOT EXISTS rate_limit_counters (
            user_id           TEXT NOT NULL,
            intervention_type TEXT NOT NULL,
            window_start      TEXT NOT NULL,
            request_count     INTEGER NOT NULL DEFAULT 0,
            attempt_count     INTEGER NOT NULL DEFAULT 0,
            last_triggered_at TEXT,
            PRIMARY KEY (user_id, intervention_type, window_start)
        );

        CREATE TABLE IF NOT EXISTS intervention_records (
            id                TEXT PRIMARY KEY,
            user_id           TEXT NOT NULL,
            intervention_type TEXT NOT NULL,
            priority          TEXT NOT NULL,
            reason            TEXT NOT NULL,
            triggered_at      TEXT NOT NULL,
            dispatch_status   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_user_occurred ON events(user_id, occurred_at);
        CREATE INDEX IF NOT EXISTS idx_interventions_user
            ON intervention_records(user_id, triggered_at);",
    )?;

    tx.execute("DELETE FROM schema_version", [])?;
    tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    tx.commit()?;
    Ok(())
}

/// Migration v2: dispatch outbox drained by the delivery side.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS dispatch_outbox (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            correlation_id TEXT NOT NULL,
            user_id        TEXT NOT NULL,
            channel        TEXT NOT NULL,
            template_id    TEXT NOT NULL,
            payload        TEXT NOT NULL,
            enqueued_at    TEXT NOT NULL,
            delivered_at   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_pending ON dispatch_outbox(delivered_at, id);",
    )?;

    set_schema_version(&tx, 2)?;
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_reaches_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        for table in [
            "daily_scores",
            "dispatch_outbox",
            "events",
            "intervention_records",
            "rate_limit_counters",
        ] {
            assert!(tables.iter().any(|t| t == table), "missing table {table}");
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn incremental_migration_from_v1() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema_version_table(&conn).unwrap();
        migrate_v1(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), 1);

        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), 2);
        conn.prepare("SELECT correlation_id, delivered_at FROM dispatch_outbox")
            .unwrap();
    }
}
