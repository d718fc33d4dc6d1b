//! Per-user evaluation pipeline and the batch runner around it.
//!
//! One user's pipeline is strictly sequential: score, classify, detect,
//! decide. Users are independent, so the batch fans them out over a
//! bounded pool of blocking workers, each with its own SQLite connection.
//! A failing or slow user is reported and skipped; only a batch-level
//! failure (persistence unreachable, wall-clock budget exceeded) aborts
//! the run.
//!
//! Evaluation is forward-only: recomputing a past day upserts its score but
//! never runs detection or the engine for that day.
//!
//! A timed-out user is reported and skipped at once. Its blocking worker
//! cannot be interrupted, so it carries a [`Deadline`] and stops at the next
//! checkpoint: before detection, before each rate-limit acquire and before
//! each dispatch. It keeps its pool permit until it actually returns.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::dispatch::DispatchGateway;
use crate::engine::{EvaluationOutcome, InterventionEngine};
use crate::error::{CoreError, Result};
use crate::events::Event;
use crate::patterns::{InterventionCandidate, PatternDetector};
use crate::rate_limit::InterventionType;
use crate::scoring::{DailyScore, ScoreCalculator};
use crate::storage::config::InterventionConfig;
use crate::storage::Database;
use crate::zones::{ScorePoint, Zone};

/// Point after which a user's pipeline gives up at its next checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: StdDuration,
}

impl Deadline {
    pub fn after(budget: StdDuration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// Never later than `at`.
    pub fn capped(self, at: Instant) -> Self {
        Self {
            at: self.at.min(at),
            ..self
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn check(&self, user_id: &str) -> Result<()> {
        if !self.expired() {
            return Ok(());
        }
        Err(CoreError::UserTimeout {
            user_id: user_id.to_string(),
            budget_ms: u64::try_from(self.budget.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

/// Everything one user's pipeline produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRun {
    pub score: DailyScore,
    pub candidates: Vec<InterventionCandidate>,
    /// `None` when the target date is not today (forward-only evaluation)
    pub outcome: Option<EvaluationOutcome>,
}

impl UserRun {
    pub fn triggered(&self) -> Option<InterventionType> {
        self.outcome
            .as_ref()
            .and_then(EvaluationOutcome::record)
            .map(|r| r.intervention_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserReport {
    pub user_id: String,
    pub status: UserStatus,
    pub raw_score: Option<f64>,
    pub zone: Option<Zone>,
    pub intervention: Option<InterventionType>,
    pub error: Option<String>,
}

impl UserReport {
    fn succeeded(user_id: String, run: &UserRun) -> Self {
        Self {
            user_id,
            status: UserStatus::Succeeded,
            raw_score: Some(run.score.raw_score),
            zone: Some(run.score.zone),
            intervention: run.triggered(),
            error: None,
        }
    }

    fn failed(user_id: String, status: UserStatus, error: &CoreError) -> Self {
        Self {
            user_id,
            status,
            raw_score: None,
            zone: None,
            intervention: None,
            error: Some(error.to_string()),
        }
    }
}

/// Summary of one batch run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub target_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub users: usize,
    pub successful: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub interventions_triggered: usize,
    pub details: Vec<UserReport>,
}

impl BatchReport {
    fn new(target_date: NaiveDate, started_at: DateTime<Utc>) -> Self {
        Self {
            target_date,
            started_at,
            finished_at: started_at,
            users: 0,
            successful: 0,
            failed: 0,
            timed_out: 0,
            interventions_triggered: 0,
            details: Vec::new(),
        }
    }

    fn push(&mut self, detail: UserReport) {
        self.users += 1;
        match detail.status {
            UserStatus::Succeeded => self.successful += 1,
            UserStatus::Failed => self.failed += 1,
            UserStatus::TimedOut => self.timed_out += 1,
        }
        if detail.intervention.is_some() {
            self.interventions_triggered += 1;
        }
        self.details.push(detail);
    }
}

/// Run score → zone → patterns → engine for one user.
///
/// Detection and the engine only run when `target_date` is `now`'s date.
/// Once `deadline` has passed the run stops with [`CoreError::UserTimeout`]
/// at its next checkpoint.
pub fn evaluate_user(
    db: &Database,
    config: &Arc<InterventionConfig>,
    gateway: &dyn DispatchGateway,
    user_id: &str,
    target_date: NaiveDate,
    now: DateTime<Utc>,
    deadline: Option<Deadline>,
) -> Result<UserRun> {
    let calculator = ScoreCalculator::new(Arc::clone(config));
    let score = calculator.compute_and_store(db, user_id, target_date, now)?;

    if target_date != now.date_naive() {
        tracing::debug!(
            user_id,
            score_date = %target_date,
            "past date recomputed, evaluation skipped"
        );
        return Ok(UserRun {
            score,
            candidates: Vec::new(),
            outcome: None,
        });
    }

    if let Some(deadline) = &deadline {
        deadline.check(user_id)?;
    }

    let history_days = i64::from(config.patterns.history_days.max(1));
    let history: Vec<ScorePoint> = db
        .score_history(user_id, target_date - Duration::days(history_days - 1), target_date)?
        .iter()
        .map(DailyScore::point)
        .collect();

    let candidates = PatternDetector::new(config).detect(user_id, &history, target_date);
    let outcome = InterventionEngine::new(db, config, gateway)
        .with_deadline(deadline)
        .evaluate(&candidates, now)?;

    Ok(UserRun {
        score,
        candidates,
        outcome: Some(outcome),
    })
}

/// Batch and incremental entry points sharing one config snapshot.
#[derive(Clone)]
pub struct Pipeline {
    db_path: PathBuf,
    config: Arc<InterventionConfig>,
    gateway: Arc<dyn DispatchGateway>,
}

impl Pipeline {
    pub fn new(
        db_path: impl Into<PathBuf>,
        config: Arc<InterventionConfig>,
        gateway: Arc<dyn DispatchGateway>,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            config,
            gateway,
        }
    }

    pub fn config(&self) -> &Arc<InterventionConfig> {
        &self.config
    }

    /// Evaluate one user synchronously on an open connection.
    pub fn run_user(
        &self,
        db: &Database,
        user_id: &str,
        target_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<UserRun> {
        evaluate_user(
            db,
            &self.config,
            self.gateway.as_ref(),
            user_id,
            target_date,
            now,
            None,
        )
    }

    /// Incremental path: re-evaluate a user right after an event is written.
    ///
    /// Only high-signal event types trigger it. A late event first
    /// recomputes, oldest first, every past day from the one it happened on,
    /// so today's hysteresis and pattern history read fresh rows. Days older
    /// than the scoring horizon (window plus rolling average) feed nothing
    /// today reads and are left alone.
    pub fn on_event_written(
        &self,
        db: &Database,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<Option<UserRun>> {
        if !self.config.scoring.is_high_signal(&event.event_type) {
            return Ok(None);
        }
        let today = now.date_naive();
        let scoring = &self.config.scoring;
        let horizon = today
            - Duration::days(i64::from(scoring.window_days + scoring.rolling_average_days));
        let mut day = event.occurred_at.date_naive().max(horizon);
        let mut recomputed = 0;
        while day < today {
            self.run_user(db, &event.user_id, day, now)?;
            day = day + Duration::days(1);
            recomputed += 1;
        }
        tracing::debug!(
            user_id = %event.user_id,
            event_type = %event.event_type,
            recomputed,
            "incremental evaluation"
        );
        self.run_user(db, &event.user_id, today, now).map(Some)
    }

    /// Evaluate every active user for `target_date` on a bounded worker pool.
    ///
    /// # Errors
    /// Returns an error only for batch-level failures: the user list cannot
    /// be read, a worker cannot be scheduled, or the run exceeds its
    /// wall-clock budget. Per-user failures are reported in the result.
    pub async fn run_batch(
        &self,
        target_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<BatchReport> {
        let budget = self.config.pipeline.batch_budget();
        let batch_deadline = Instant::now() + budget;
        let started_at = Utc::now();
        let workers = self.config.pipeline.worker_count;
        tracing::info!(%target_date, workers, "batch run started");

        let run = self.run_all(target_date, now, started_at, batch_deadline);
        match tokio::time::timeout(budget, run).await {
            Ok(Ok(mut report)) => {
                report.finished_at = Utc::now();
                tracing::info!(
                    %target_date,
                    users = report.users,
                    successful = report.successful,
                    failed = report.failed,
                    timed_out = report.timed_out,
                    interventions = report.interventions_triggered,
                    "batch run finished"
                );
                Ok(report)
            }
            Ok(Err(e)) => {
                tracing::error!(%target_date, error = %e, "batch run aborted");
                Err(e)
            }
            Err(_) => {
                let budget_secs = budget.as_secs();
                tracing::error!(
                    %target_date,
                    budget_secs,
                    "batch run exceeded its budget, aborting"
                );
                Err(CoreError::BatchBudgetExceeded { budget_secs })
            }
        }
    }

    async fn run_all(
        &self,
        target_date: NaiveDate,
        now: DateTime<Utc>,
        started_at: DateTime<Utc>,
        batch_deadline: Instant,
    ) -> Result<BatchReport> {
        let users = {
            let db_path = self.db_path.clone();
            let (from, to) = ScoreCalculator::new(Arc::clone(&self.config)).window(target_date);
            tokio::task::spawn_blocking(move || {
                Database::open_at(&db_path)?.active_user_ids(from, to)
            })
            .await??
        };

        let semaphore = Arc::new(Semaphore::new(self.config.pipeline.worker_count.max(1)));
        let mut tasks = JoinSet::new();
        for user_id in users {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| CoreError::Worker(e.to_string()))?;
            let pipeline = self.clone();
            tasks.spawn(pipeline.run_user_task(permit, user_id, target_date, now, batch_deadline));
        }

        let mut report = BatchReport::new(target_date, started_at);
        while let Some(joined) = tasks.join_next().await {
            report.push(joined?);
        }
        report.details.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(report)
    }

    async fn run_user_task(
        self,
        permit: OwnedSemaphorePermit,
        user_id: String,
        target_date: NaiveDate,
        now: DateTime<Utc>,
        batch_deadline: Instant,
    ) -> UserReport {
        let timeout = self.config.pipeline.user_timeout();
        let deadline = Deadline::after(timeout).capped(batch_deadline);
        let worker_user = user_id.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let db = Database::open_at(&self.db_path)?;
            evaluate_user(
                &db,
                &self.config,
                self.gateway.as_ref(),
                &worker_user,
                target_date,
                now,
                Some(deadline),
            )
        });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(run))) => UserReport::succeeded(user_id, &run),
            Ok(Ok(Err(e @ CoreError::UserTimeout { .. }))) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "user pipeline gave up at its deadline"
                );
                UserReport::failed(user_id, UserStatus::TimedOut, &e)
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(user_id = %user_id, error = %e, "user pipeline failed, skipping");
                UserReport::failed(user_id, UserStatus::Failed, &e)
            }
            Ok(Err(join)) => {
                let e = CoreError::from(join);
                tracing::warn!(user_id = %user_id, error = %e, "user worker crashed, skipping");
                UserReport::failed(user_id, UserStatus::Failed, &e)
            }
            Err(_) => {
                let e = CoreError::UserTimeout {
                    user_id: user_id.clone(),
                    budget_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                };
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "user pipeline timed out, flagged for investigation"
                );
                UserReport::failed(user_id, UserStatus::TimedOut, &e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchError, DispatchRequest};
    use crate::events::EventType;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<DispatchRequest>>);

    impl DispatchGateway for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn dispatch(&self, request: &DispatchRequest) -> std::result::Result<(), DispatchError> {
            self.0.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 15, 3, 0, 0).unwrap()
    }

    fn pipeline() -> (Pipeline, Arc<Recording>) {
        let gateway = Arc::new(Recording::default());
        let pipeline = Pipeline::new(
            "unused.db",
            Arc::new(InterventionConfig::default()),
            gateway.clone(),
        );
        (pipeline, gateway)
    }

    #[test]
    fn past_dates_are_scored_but_not_evaluated() {
        let db = Database::open_memory().unwrap();
        let (pipeline, gateway) = pipeline();
        let yesterday = now().date_naive() - Duration::days(1);
        let run = pipeline.run_user(&db, "u1", yesterday, now()).unwrap();
        assert_eq!(run.score.zone, Zone::NeedsCare);
        assert!(run.outcome.is_none());
        assert!(gateway.0.lock().unwrap().is_empty());
        assert!(db.daily_score("u1", yesterday).unwrap().is_some());
    }

    #[test]
    fn low_signal_events_do_not_trigger_incremental_run() {
        let db = Database::open_memory().unwrap();
        let (pipeline, _) = pipeline();
        let event = Event::new("u1", EventType::AppSession, now(), json!({}));
        db.insert_event(&event).unwrap();
        assert!(pipeline.on_event_written(&db, &event, now()).unwrap().is_none());
        assert!(db.daily_score("u1", now().date_naive()).unwrap().is_none());
    }

    #[test]
    fn late_high_signal_event_recomputes_its_day_and_today() {
        let db = Database::open_memory().unwrap();
        let (pipeline, _) = pipeline();
        let two_days_ago = now() - Duration::days(2);
        let event = Event::new("u1", EventType::GoalCompletion, two_days_ago, json!({}));
        db.insert_event(&event).unwrap();

        let run = pipeline.on_event_written(&db, &event, now()).unwrap().unwrap();
        assert_eq!(run.score.score_date, now().date_naive());
        let past = db.daily_score("u1", two_days_ago.date_naive()).unwrap().unwrap();
        assert!(past.raw_score > 0.0);
        assert!(run.outcome.is_some());
    }

    #[test]
    fn late_event_refreshes_every_day_in_between() {
        let db = Database::open_memory().unwrap();
        let (pipeline, _) = pipeline();
        let today = now().date_naive();
        let (two_days_ago, yesterday) = (today - Duration::days(2), today - Duration::days(1));

        let recent_at = now() - Duration::days(1);
        let recent = Event::new("u1", EventType::JournalEntry, recent_at, json!({}));
        db.insert_event(&recent).unwrap();
        pipeline.run_user(&db, "u1", two_days_ago, now()).unwrap();
        pipeline.run_user(&db, "u1", yesterday, now()).unwrap();
        let stale = db.daily_score("u1", yesterday).unwrap().unwrap();

        let late_at = now() - Duration::days(2);
        let late = Event::new("u1", EventType::GoalCompletion, late_at, json!({}));
        db.insert_event(&late).unwrap();
        pipeline.on_event_written(&db, &late, now()).unwrap();

        let refreshed = db.daily_score("u1", yesterday).unwrap().unwrap();
        assert!(refreshed.raw_score > stale.raw_score);
        let fresh = pipeline.run_user(&db, "u1", yesterday, now()).unwrap();
        assert_eq!(refreshed.raw_score, fresh.score.raw_score);
        assert_eq!(refreshed.zone, fresh.score.zone);
    }

    #[test]
    fn expired_deadline_keeps_the_score_but_skips_evaluation() {
        let db = Database::open_memory().unwrap();
        let (pipeline, gateway) = pipeline();
        let today = now().date_naive();
        let err = evaluate_user(
            &db,
            pipeline.config(),
            gateway.as_ref(),
            "u1",
            today,
            now(),
            Some(Deadline::after(StdDuration::ZERO)),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::UserTimeout { ref user_id, .. } if user_id == "u1"));
        assert!(db.daily_score("u1", today).unwrap().is_some());
        assert!(gateway.0.lock().unwrap().is_empty());
        assert!(db.intervention_records(None).unwrap().is_empty());
    }

    #[test]
    fn deadline_is_capped_by_the_batch() {
        let batch_end = Instant::now();
        let deadline = Deadline::after(StdDuration::from_secs(60)).capped(batch_end);
        assert!(deadline.expired());
        assert!(!Deadline::after(StdDuration::from_secs(60)).expired());
    }
}
