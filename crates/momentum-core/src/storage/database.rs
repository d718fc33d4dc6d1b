//! SQLite storage for events, daily scores and the intervention log.
//!
//! Provides persistent storage for:
//! - Behavioral events (read side of the event store, plus ingestion and erasure)
//! - Daily scores, upserted per `(user_id, score_date)`
//! - The append-only intervention log
//! - The dispatch outbox
//!
//! Rate-limit counters share the file but are written only by
//! [`RateLimiter`](crate::rate_limit::RateLimiter).

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{data_dir, format_ts, migrations, parse_date, parse_ts};
use crate::dispatch::{Channel, DispatchRequest, DispatchStatus};
use crate::engine::InterventionRecord;
use crate::error::{DatabaseError, Result};
use crate::events::{Event, EventSource, EventType};
use crate::patterns::Priority;
use crate::rate_limit::InterventionType;
use crate::scoring::{DailyScore, ScoreBreakdown};
use crate::zones::Zone;

/// A queued dispatch request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub enqueued_at: DateTime<Utc>,
    pub request: DispatchRequest,
}

/// Result of a backfill run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackfillSummary {
    pub days: u32,
    pub users: usize,
    /// Missing rows found (dry run) or inserted
    pub missing: usize,
    pub dry_run: bool,
}

fn corrupt(table: &str, message: impl Into<String>) -> DatabaseError {
    DatabaseError::CorruptRow {
        table: table.to_string(),
        message: message.into(),
    }
}

/// SQLite database holding everything the scoring pipeline persists.
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Get a reference to the underlying SQLite connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// File backing this database, `None` when in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Default location, `~/.config/momentum/momentum.db`.
    pub fn default_path() -> Result<PathBuf> {
        Ok(data_dir()?.join("momentum.db"))
    }

    /// Open the database at `~/.config/momentum/momentum.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self> {
        Self::open_at(&Self::default_path()?)
    }

    /// Open (and migrate) the database file at `path`.
    ///
    /// Every connection uses WAL and a busy timeout so separate processes
    /// can share the file.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let open_failed = |source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        };
        let conn = Connection::open(path).map_err(open_failed)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(open_failed)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(open_failed)?;
        let db = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    #[cfg(test)]
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn, path: None };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        migrations::migrate(&self.conn)
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────────────

    /// Append an event, returning its row id.
    pub fn insert_event(&self, event: &Event) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO events (user_id, event_type, occurred_at, value)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.user_id,
                event.event_type.as_str(),
                format_ts(event.occurred_at),
                event.value.to_json().to_string(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Tombstone every event of a user. Rows stay in the table.
    pub fn tombstone_user_events(&self, user_id: &str) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE events SET tombstoned = 1 WHERE user_id = ?1 AND tombstoned = 0",
            params![user_id],
        )?;
        Ok(n)
    }

    /// Users with at least one live event in `[from, to)`.
    pub fn active_user_ids(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT user_id FROM events
             WHERE tombstoned = 0 AND occurred_at >= ?1 AND occurred_at < ?2
             ORDER BY user_id",
        )?;
        let ids = stmt
            .query_map(params![format_ts(from), format_ts(to)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Every user with an event or a score on record.
    pub fn known_user_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id FROM events
             UNION
             SELECT user_id FROM daily_scores
             ORDER BY user_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    // ── Daily scores ─────────────────────────────────────────────────

    /// Insert or overwrite the `(user_id, score_date)` row.
    pub fn upsert_daily_score(&self, score: &DailyScore) -> Result<()> {
        let breakdown = serde_json::to_string(&score.breakdown)?;
        self.conn.execute(
            "INSERT INTO daily_scores (user_id, score_date, raw_score, zone, computed_at, breakdown)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, score_date) DO UPDATE SET
                 raw_score = excluded.raw_score,
                 zone = excluded.zone,
                 computed_at = excluded.computed_at,
                 breakdown = excluded.breakdown",
            params![
                score.user_id,
                score.score_date.to_string(),
                score.raw_score,
                score.zone.as_str(),
                format_ts(score.computed_at),
                breakdown,
            ],
        )?;
        Ok(())
    }

    pub fn daily_score(&self, user_id: &str, score_date: NaiveDate) -> Result<Option<DailyScore>> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, score_date, raw_score, zone, computed_at, breakdown
                 FROM daily_scores WHERE user_id = ?1 AND score_date = ?2",
                params![user_id, score_date.to_string()],
                read_score_row,
            )
            .optional()?;
        row.map(decode_score_row).transpose()
    }

    /// Scores dated in `[from, to]`, oldest first.
    pub fn score_history(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyScore>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, score_date, raw_score, zone, computed_at, breakdown
             FROM daily_scores
             WHERE user_id = ?1 AND score_date >= ?2 AND score_date <= ?3
             ORDER BY score_date",
        )?;
        let rows = stmt
            .query_map(
                params![user_id, from.to_string(), to.to_string()],
                read_score_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(decode_score_row).collect()
    }

    /// Insert a zero NeedsCare score for every known user missing one on
    /// each of the `days` days ending at `today`. Existing rows are never
    /// touched. With `dry_run` nothing is written and the gaps are counted.
    pub fn backfill_missing_scores(
        &self,
        days: u32,
        today: NaiveDate,
        dry_run: bool,
        computed_at: DateTime<Utc>,
    ) -> Result<BackfillSummary> {
        let users = self.known_user_ids()?;
        let mut summary = BackfillSummary {
            days,
            users: users.len(),
            missing: 0,
            dry_run,
        };
        let empty = serde_json::to_string(&ScoreBreakdown::default())?;
        let computed_at = format_ts(computed_at);

        let tx = self.conn.unchecked_transaction()?;
        for user_id in &users {
            for back in 0..i64::from(days) {
                let date = (today - Duration::days(back)).to_string();
                if dry_run {
                    let exists: bool = tx.query_row(
                        "SELECT EXISTS(SELECT 1 FROM daily_scores
                                       WHERE user_id = ?1 AND score_date = ?2)",
                        params![user_id, date],
                        |row| row.get(0),
                    )?;
                    if !exists {
                        summary.missing += 1;
                    }
                } else {
                    summary.missing += tx.execute(
                        "INSERT INTO daily_scores
                             (user_id, score_date, raw_score, zone, computed_at, breakdown)
                         VALUES (?1, ?2, 0.0, ?3, ?4, ?5)
                         ON CONFLICT(user_id, score_date) DO NOTHING",
                        params![user_id, date, Zone::NeedsCare.as_str(), computed_at, empty],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(summary)
    }

    // ── Intervention log ─────────────────────────────────────────────

    pub fn append_intervention_record(&self, record: &InterventionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO intervention_records
                 (id, user_id, intervention_type, priority, reason, triggered_at, dispatch_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.to_string(),
                record.user_id,
                record.intervention_type.as_str(),
                record.priority.as_str(),
                record.reason,
                format_ts(record.triggered_at),
                record.dispatch_status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// A user's interventions, oldest first. All users when `user_id` is `None`.
    pub fn intervention_records(&self, user_id: Option<&str>) -> Result<Vec<InterventionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, intervention_type, priority, reason, triggered_at, dispatch_status
             FROM intervention_records
             WHERE ?1 IS NULL OR user_id = ?1
             ORDER BY triggered_at, id",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        const TABLE: &str = "intervention_records";
        rows.into_iter()
            .map(|row| -> Result<InterventionRecord> {
                let (id, user_id, kind, priority, reason, triggered_at, status) = row;
                Ok(InterventionRecord {
                    id: Uuid::parse_str(&id).map_err(|e| corrupt(TABLE, e.to_string()))?,
                    user_id,
                    intervention_type: InterventionType::parse(&kind).ok_or_else(|| {
                        corrupt(TABLE, format!("unknown intervention type '{kind}'"))
                    })?,
                    priority: Priority::parse(&priority)
                        .ok_or_else(|| corrupt(TABLE, format!("unknown priority '{priority}'")))?,
                    reason,
                    triggered_at: parse_ts(TABLE, &triggered_at)?,
                    dispatch_status: DispatchStatus::parse(&status).ok_or_else(|| {
                        corrupt(TABLE, format!("unknown dispatch status '{status}'"))
                    })?,
                })
            })
            .collect()
    }

    // ── Dispatch outbox ──────────────────────────────────────────────

    pub fn enqueue_dispatch(&self, request: &DispatchRequest, now: DateTime<Utc>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO dispatch_outbox
                 (correlation_id, user_id, channel, template_id, payload, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                request.correlation_id.to_string(),
                request.user_id,
                request.channel.as_str(),
                request.template_id,
                request.payload.to_string(),
                format_ts(now),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Undelivered outbox rows in enqueue order.
    pub fn pending_dispatches(&self) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, correlation_id, user_id, channel, template_id, payload, enqueued_at
             FROM dispatch_outbox WHERE delivered_at IS NULL ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        const TABLE: &str = "dispatch_outbox";
        rows.into_iter()
            .map(|row| -> Result<OutboxEntry> {
                let (id, correlation_id, user_id, channel, template_id, payload, enqueued_at) = row;
                Ok(OutboxEntry {
                    id,
                    enqueued_at: parse_ts(TABLE, &enqueued_at)?,
                    request: DispatchRequest {
                        user_id,
                        channel: Channel::parse(&channel)
                            .ok_or_else(|| corrupt(TABLE, format!("unknown channel '{channel}'")))?,
                        template_id,
                        payload: serde_json::from_str(&payload)?,
                        correlation_id: Uuid::parse_str(&correlation_id)
                            .map_err(|e| corrupt(TABLE, e.to_string()))?,
                    },
                })
            })
            .collect()
    }

    /// Mark an outbox row as handed to the delivery side.
    pub fn mark_dispatch_delivered(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE dispatch_outbox SET delivered_at = ?2 WHERE id = ?1 AND delivered_at IS NULL",
            params![id, format_ts(at)],
        )?;
        Ok(n == 1)
    }
}

type ScoreRow = (String, String, f64, String, String, String);

fn read_score_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScoreRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_score_row(
    (user_id, score_date, raw_score, zone, computed_at, breakdown): ScoreRow,
) -> Result<DailyScore> {
    const TABLE: &str = "daily_scores";
    Ok(DailyScore {
        user_id,
        score_date: parse_date(TABLE, &score_date)?,
        raw_score,
        zone: Zone::parse(&zone).ok_or_else(|| corrupt(TABLE, format!("unknown zone '{zone}'")))?,
        computed_at: parse_ts(TABLE, &computed_at)?,
        breakdown: serde_json::from_str(&breakdown)
            .map_err(|e| corrupt(TABLE, format!("bad breakdown: {e}")))?,
    })
}

impl EventSource for Database {
    fn fetch_events(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, event_type, occurred_at, value
             FROM events
             WHERE user_id = ?1 AND tombstoned = 0
               AND occurred_at >= ?2 AND occurred_at < ?3
             ORDER BY occurred_at, id",
        )?;
        let rows = stmt
            .query_map(params![user_id, format_ts(from), format_ts(to)], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, user_id, event_type, occurred_at, value)| -> Result<Event> {
                let value: serde_json::Value = serde_json::from_str(&value)
                    .map_err(|e| corrupt("events", format!("event {id}: {e}")))?;
                let mut event = Event::new(
                    user_id,
                    EventType::parse(&event_type),
                    parse_ts("events", &occurred_at)?,
                    value,
                );
                event.id = id;
                Ok(event)
            })
            .collect()
    }
}
