//! Per-user, per-intervention-type frequency caps.
//!
//! Counters live in the `rate_limit_counters` table, one row per
//! `(user_id, intervention_type, window_start)`. A check-and-increment runs
//! inside a `BEGIN IMMEDIATE` transaction, so the SQLite write lock
//! serializes concurrent attempts even when the batch and the incremental
//! path run in different processes.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::storage::config::RateLimitConfig;
use crate::storage::{format_ts, parse_ts, Database};

/// Kind of intervention; each type has its own rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionType {
    ConsecutiveNeedsCare,
    ScoreDrop,
    Celebration,
    ConsistencyReminder,
}

impl InterventionType {
    pub const ALL: [InterventionType; 4] = [
        InterventionType::ConsecutiveNeedsCare,
        InterventionType::ScoreDrop,
        InterventionType::Celebration,
        InterventionType::ConsistencyReminder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionType::ConsecutiveNeedsCare => "consecutive_needs_care",
            InterventionType::ScoreDrop => "score_drop",
            InterventionType::Celebration => "celebration",
            InterventionType::ConsistencyReminder => "consistency_reminder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for InterventionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one counter row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitCounter {
    pub user_id: String,
    pub intervention_type: InterventionType,
    pub window_start: DateTime<Utc>,
    /// Granted attempts in this window
    pub request_count: u32,
    /// All attempts in this window, granted or throttled
    pub attempt_count: u32,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

pub struct RateLimiter<'a> {
    db: &'a Database,
    config: &'a RateLimitConfig,
}

impl<'a> RateLimiter<'a> {
    pub fn new(db: &'a Database, config: &'a RateLimitConfig) -> Self {
        Self { db, config }
    }

    /// Start of the counting window containing `now`, aligned to the epoch.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let len = i64::from(self.config.window_hours.max(1)) * 3600;
        let start = now.timestamp().div_euclid(len) * len;
        DateTime::from_timestamp(start, 0).unwrap_or(now)
    }

    /// Record an attempt and report whether it is allowed.
    ///
    /// Allowed when the window holds fewer than `max_per_day` granted
    /// requests and no request of this type was granted within
    /// `min_hours_between`. Throttled attempts are still counted.
    pub fn try_acquire(
        &self,
        user_id: &str,
        intervention_type: InterventionType,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let caps = self.config.caps(intervention_type);
        let window_start = format_ts(self.window_start(now));
        let gap = Duration::milliseconds((caps.min_hours_between * 3_600_000.0) as i64);
        let cutoff = format_ts(now - gap);
        let now_ts = format_ts(now);

        let tx = Transaction::new_unchecked(self.db.conn(), TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO rate_limit_counters
                 (user_id, intervention_type, window_start, request_count, attempt_count)
             VALUES (?1, ?2, ?3, 0, 0)
             ON CONFLICT(user_id, intervention_type, window_start) DO NOTHING",
            params![user_id, intervention_type.as_str(), window_start],
        )?;
        tx.execute(
            "UPDATE rate_limit_counters SET attempt_count = attempt_count + 1
             WHERE user_id = ?1 AND intervention_type = ?2 AND window_start = ?3",
            params![user_id, intervention_type.as_str(), window_start],
        )?;
        let granted = tx.execute(
            "UPDATE rate_limit_counters
             SET request_count = request_count + 1, last_triggered_at = ?4
             WHERE user_id = ?1 AND intervention_type = ?2 AND window_start = ?3
               AND request_count < ?5
               AND NOT EXISTS (
                   SELECT 1 FROM rate_limit_counters
                   WHERE user_id = ?1 AND intervention_type = ?2
                     AND last_triggered_at IS NOT NULL AND last_triggered_at > ?6
               )",
            params![
                user_id,
                intervention_type.as_str(),
                window_start,
                now_ts,
                caps.max_per_day,
                cutoff,
            ],
        )? == 1;
        tx.commit()?;

        if !granted {
            tracing::debug!(
                user_id,
                intervention_type = %intervention_type,
                "rate limited"
            );
        }
        Ok(granted)
    }

    /// Counter row of the window containing `now`, if any attempt was made.
    pub fn counter(
        &self,
        user_id: &str,
        intervention_type: InterventionType,
        now: DateTime<Utc>,
    ) -> Result<Option<RateLimitCounter>> {
        let window_start = self.window_start(now);
        let row = self
            .db
            .conn()
            .query_row(
                "SELECT request_count, attempt_count, last_triggered_at
                 FROM rate_limit_counters
                 WHERE user_id = ?1 AND intervention_type = ?2 AND window_start = ?3",
                params![user_id, intervention_type.as_str(), format_ts(window_start)],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((request_count, attempt_count, last)) = row else {
            return Ok(None);
        };
        let last_triggered_at = match last {
            Some(ts) => Some(parse_ts("rate_limit_counters", &ts)?),
            None => None,
        };
        Ok(Some(RateLimitCounter {
            user_id: user_id.to_string(),
            intervention_type,
            window_start,
            request_count,
            attempt_count,
            last_triggered_at,
        }))
    }
}
