//! Decayed, normalized daily momentum score.
//!
//! For a user and target date the calculator:
//!
//! 1. fetches the trailing event window (tombstoned events excluded),
//! 2. drops repeated identical events inside the dedup window,
//! 3. counts at most `max_events_per_type_per_day` events of a type per day,
//! 4. weights each event by type and decays it by age:
//!    `base * 2^(-age_days / half_life_days)`,
//! 5. totals each of the trailing `rolling_average_days` days as the decayed
//!    sum of that day's window, and averages those totals,
//! 6. maps the smoothed total onto 0-100 with a saturating logistic curve,
//! 7. classifies the zone and upserts the row keyed by `(user_id, score_date)`.
//!
//! Steps 1-6 are a pure function of the event window, so recomputing a day
//! with unchanged events yields the same score.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::Result;
use crate::events::{Event, EventSource};
use crate::retry;
use crate::storage::config::{InterventionConfig, ScoringConfig};
use crate::storage::Database;
use crate::zones::{ScorePoint, Zone, ZoneClassifier};

/// Persisted score of one user for one UTC calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyScore {
    pub user_id: String,
    pub score_date: NaiveDate,
    /// Normalized score, always within 0-100
    pub raw_score: f64,
    pub zone: Zone,
    pub computed_at: DateTime<Utc>,
    pub breakdown: ScoreBreakdown,
}

impl DailyScore {
    pub fn point(&self) -> ScorePoint {
        ScorePoint {
            date: self.score_date,
            raw_score: self.raw_score,
            zone: self.zone,
        }
    }
}

/// Decayed points attributed to one event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityPoints {
    pub event_type: String,
    pub points: f64,
}

/// Parameters the score was computed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CalculationMetadata {
    pub algorithm_version: String,
    pub half_life_days: f64,
    pub window_days: u32,
    pub rolling_average_days: u32,
    pub rising_threshold: f64,
    pub needs_care_threshold: f64,
}

/// Explanation of how a score was reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScoreBreakdown {
    /// Events returned by the store for the window
    pub events_in_window: usize,
    /// Events that contributed weight
    pub events_counted: usize,
    pub duplicates_dropped: usize,
    /// Events beyond the per-type daily cap
    pub capped_events: usize,
    pub unknown_events: usize,
    pub events_by_type: BTreeMap<String, usize>,
    pub points_by_type: BTreeMap<String, f64>,
    /// Highest-contributing event types, at most three
    pub top_activities: Vec<ActivityPoints>,
    /// Decayed window total as of each averaged day
    pub daily_totals: BTreeMap<NaiveDate, f64>,
    /// Rolling average of daily totals ending at the score date
    pub smoothed_total: f64,
    pub metadata: CalculationMetadata,
}

/// `base_weight * 2^(-age_days / half_life_days)`, with age floored at zero.
pub fn decayed_weight(base_weight: f64, age_days: f64, half_life_days: f64) -> f64 {
    let age = age_days.max(0.0);
    base_weight * 2f64.powf(-age / half_life_days)
}

/// Map a non-negative total onto 0-100.
///
/// A logistic curve centred on `midpoint`, shifted and rescaled so that a
/// total of zero maps to exactly zero. Monotonic, saturates at 100.
pub fn normalize(total: f64, midpoint: f64, steepness: f64) -> f64 {
    if total.is_nan() || total <= 0.0 {
        return 0.0;
    }
    let logistic = |x: f64| 1.0 / (1.0 + (-steepness * (x - midpoint)).exp());
    let floor = logistic(0.0);
    let scaled = (logistic(total) - floor) / (1.0 - floor);
    (scaled * 100.0).clamp(0.0, 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Start of a UTC day.
pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

pub struct ScoreCalculator {
    config: Arc<InterventionConfig>,
}

impl ScoreCalculator {
    pub fn new(config: Arc<InterventionConfig>) -> Self {
        Self { config }
    }

    fn scoring(&self) -> &ScoringConfig {
        &self.config.scoring
    }

    /// Half-open event window `[from, to)` covering `window_days` days up to
    /// and including `target_date`.
    pub fn window(&self, target_date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let days = i64::from(self.scoring().window_days.max(1));
        let from = day_start(target_date - Duration::days(days - 1));
        let to = day_start(target_date + Duration::days(1));
        (from, to)
    }

    /// Events needed to score `target_date`: the window of every day in the
    /// rolling average, so the earliest averaged day sees a full window too.
    fn event_range(&self, target_date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let rolling = i64::from(self.scoring().rolling_average_days.max(1));
        let (from, to) = self.window(target_date);
        (from - Duration::days(rolling - 1), to)
    }

    /// Drop repeats of the same action within the dedup window, keeping the
    /// first occurrence. Input must be sorted by `occurred_at`.
    fn dedup<'e>(&self, events: &'e [Event]) -> (Vec<&'e Event>, usize) {
        let window = Duration::minutes(i64::from(self.scoring().dedup_window_minutes));
        let mut kept: Vec<&Event> = Vec::with_capacity(events.len());
        let mut dropped = 0;
        for event in events {
            let duplicate = kept
                .iter()
                .rev()
                .take_while(|k| event.occurred_at - k.occurred_at <= window)
                .any(|k| k.user_id == event.user_id && k.is_same_action(event));
            if duplicate {
                dropped += 1;
            } else {
                kept.push(event);
            }
        }
        (kept, dropped)
    }

    /// Score an event window for `target_date`. Pure.
    pub fn score_events(&self, events: &[Event], target_date: NaiveDate) -> (f64, ScoreBreakdown) {
        let scoring = self.scoring();
        let mut sorted: Vec<Event> = events.to_vec();
        sorted.sort_by_key(|e| (e.occurred_at, e.id));

        let (kept, duplicates_dropped) = self.dedup(&sorted);

        let mut breakdown = ScoreBreakdown {
            events_in_window: events.len(),
            duplicates_dropped,
            metadata: CalculationMetadata {
                algorithm_version: scoring.algorithm_version.clone(),
                half_life_days: scoring.half_life_days,
                window_days: scoring.window_days,
                rolling_average_days: scoring.rolling_average_days,
                rising_threshold: self.config.zones.rising_threshold,
                needs_care_threshold: self.config.zones.needs_care_threshold,
            },
            ..ScoreBreakdown::default()
        };

        let window_days = i64::from(scoring.window_days.max(1));
        let in_window = |event_date: NaiveDate, day: NaiveDate| {
            event_date <= day && (day - event_date).num_days() < window_days
        };

        let mut per_day_type: HashMap<(NaiveDate, String), u32> = HashMap::new();
        let mut counted: Vec<(NaiveDate, f64)> = Vec::new();
        for event in kept {
            let name = event.event_type.as_str().to_string();
            *breakdown.events_by_type.entry(name.clone()).or_insert(0) += 1;

            let event_date = event.occurred_at.date_naive();
            let seen = per_day_type.entry((event_date, name.clone())).or_insert(0);
            if *seen >= scoring.max_events_per_type_per_day {
                breakdown.capped_events += 1;
                continue;
            }
            *seen += 1;

            let base = match scoring.weight_of(&event.event_type) {
                Some(weight) => weight,
                None => {
                    tracing::warn!(
                        user_id = %event.user_id,
                        event_id = event.id,
                        event_type = %event.event_type,
                        "unknown event type, weighted as 0"
                    );
                    breakdown.unknown_events += 1;
                    0.0
                }
            };

            breakdown.events_counted += 1;
            counted.push((event_date, base));
            if in_window(event_date, target_date) {
                let age_days = (target_date - event_date).num_days() as f64;
                let weight = decayed_weight(base, age_days, scoring.half_life_days);
                *breakdown.points_by_type.entry(name).or_insert(0.0) += weight;
            }
        }

        // Each day's total is every window event decayed to that day.
        let rolling = i64::from(scoring.rolling_average_days.max(1));
        for back in 0..rolling {
            let day = target_date - Duration::days(back);
            let total: f64 = counted
                .iter()
                .filter(|(event_date, _)| in_window(*event_date, day))
                .map(|(event_date, base)| {
                    let age_days = (day - *event_date).num_days() as f64;
                    decayed_weight(*base, age_days, scoring.half_life_days)
                })
                .sum();
            breakdown.daily_totals.insert(day, total);
        }
        breakdown.smoothed_total = breakdown.daily_totals.values().sum::<f64>() / rolling as f64;
        let smoothed = breakdown.smoothed_total;

        let mut top: Vec<ActivityPoints> = breakdown
            .points_by_type
            .iter()
            .filter(|(_, points)| **points > 0.0)
            .map(|(event_type, points)| ActivityPoints {
                event_type: event_type.clone(),
                points: *points,
            })
            .collect();
        top.sort_by(|a, b| {
            b.points
                .partial_cmp(&a.points)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.event_type.cmp(&b.event_type))
        });
        top.truncate(3);
        breakdown.top_activities = top;

        let raw_score = round2(normalize(
            smoothed,
            scoring.normalization_midpoint,
            scoring.normalization_steepness,
        ));
        (raw_score, breakdown)
    }

    /// Compute a user's score for `target_date` without persisting it.
    ///
    /// `history` is the user's stored scores; rows on or after the target
    /// date are ignored so a recomputation classifies against the same
    /// prior days as the first computation did.
    pub fn compute(
        &self,
        source: &dyn EventSource,
        user_id: &str,
        target_date: NaiveDate,
        history: &[DailyScore],
        computed_at: DateTime<Utc>,
    ) -> Result<DailyScore> {
        let (from, to) = self.event_range(target_date);
        let policy = self.config.pipeline.retry_policy();
        let events = retry::with_backoff(&policy, "fetch_events", || {
            source.fetch_events(user_id, from, to)
        })?;

        let (raw_score, breakdown) = self.score_events(&events, target_date);

        let zone = if breakdown.events_counted == 0 {
            Zone::NeedsCare
        } else {
            let prior: Vec<ScorePoint> = history
                .iter()
                .filter(|s| s.score_date < target_date)
                .map(DailyScore::point)
                .collect();
            ZoneClassifier::new(&self.config.zones).classify(raw_score, &prior)
        };

        tracing::debug!(
            user_id,
            score_date = %target_date,
            raw_score,
            zone = %zone,
            events = breakdown.events_counted,
            "daily score computed"
        );

        Ok(DailyScore {
            user_id: user_id.to_string(),
            score_date: target_date,
            raw_score,
            zone,
            computed_at,
            breakdown,
        })
    }

    /// Compute and upsert the `(user_id, target_date)` row.
    pub fn compute_and_store(
        &self,
        db: &Database,
        user_id: &str,
        target_date: NaiveDate,
        computed_at: DateTime<Utc>,
    ) -> Result<DailyScore> {
        let lookback = i64::from(self.config.zones.hysteresis_days.max(1));
        let history = db.score_history(
            user_id,
            target_date - Duration::days(lookback),
            target_date - Duration::days(1),
        )?;
        let score = self.compute(db, user_id, target_date, &history, computed_at)?;
        let policy = self.config.pipeline.retry_policy();
        retry::with_backoff(&policy, "upsert_daily_score", || db.upsert_daily_score(&score))?;
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoreError, DatabaseError};
    use crate::events::EventType;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;
    use std::cell::Cell;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, day).unwrap()
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, day, hour, minute, 0).unwrap()
    }

    fn event(id: i64, event_type: EventType, occurred_at: DateTime<Utc>) -> Event {
        let mut e = Event::new("u1", event_type, occurred_at, json!({}));
        e.id = id;
        e
    }

    fn calculator() -> ScoreCalculator {
        ScoreCalculator::new(Arc::new(InterventionConfig::default()))
    }

    struct FixedSource(Vec<Event>);

    impl EventSource for FixedSource {
        fn fetch_events(
            &self,
            _: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<Event>> {
            Ok(self
                .0
                .iter()
                .filter(|e| e.occurred_at >= from && e.occurred_at < to)
                .cloned()
                .collect())
        }
    }

    struct FlakySource {
        failures_left: Cell<u32>,
        inner: FixedSource,
    }

    impl EventSource for FlakySource {
        fn fetch_events(
            &self,
            user: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<Event>> {
            if self.failures_left.get() > 0 {
                self.failures_left.set(self.failures_left.get() - 1);
                return Err(CoreError::Database(DatabaseError::Locked));
            }
            self.inner.fetch_events(user, from, to)
        }
    }

    fn fast_retry_config() -> Arc<InterventionConfig> {
        let mut cfg = InterventionConfig::default();
        cfg.pipeline.retry_base_delay_ms = 1;
        cfg.pipeline.retry_max_delay_ms = 1;
        Arc::new(cfg)
    }

    #[test]
    fn decay_is_identity_at_age_zero_and_halves_at_half_life() {
        assert_eq!(decayed_weight(15.0, 0.0, 10.0), 15.0);
        assert!((decayed_weight(20.0, 10.0, 10.0) - 10.0).abs() < 1e-9);
        assert_eq!(decayed_weight(15.0, -3.0, 10.0), 15.0);
    }

    #[test]
    fn normalize_is_zero_at_zero_and_bounded() {
        assert_eq!(normalize(0.0, 30.0, 0.08), 0.0);
        assert!(normalize(1e12, 30.0, 0.08) <= 100.0);
        assert!(normalize(f64::INFINITY, 30.0, 0.08) <= 100.0);
        assert_eq!(normalize(f64::NAN, 30.0, 0.08), 0.0);
        assert!(normalize(30.0, 30.0, 0.08) > 40.0);
    }

    #[test]
    fn zero_events_scores_zero_in_needs_care() {
        let calc = calculator();
        let source = FixedSource(vec![]);
        let score = calc.compute(&source, "u1", date(15), &[], at(15, 23, 0)).unwrap();
        assert_eq!(score.raw_score, 0.0);
        assert_eq!(score.zone, Zone::NeedsCare);
        assert_eq!(score.breakdown.events_counted, 0);
    }

    #[test]
    fn duplicate_taps_within_window_count_once() {
        let calc = calculator();
        let events = vec![
            event(1, EventType::JournalEntry, at(15, 10, 0)),
            event(2, EventType::JournalEntry, at(15, 10, 3)),
            event(3, EventType::JournalEntry, at(15, 10, 5)),
            event(4, EventType::JournalEntry, at(15, 10, 11)),
        ];
        let (_, breakdown) = calc.score_events(&events, date(15));
        assert_eq!(breakdown.duplicates_dropped, 2);
        assert_eq!(breakdown.events_counted, 2);
        assert_eq!(breakdown.points_by_type["journal_entry"], 20.0);
    }

    #[test]
    fn different_payloads_are_not_duplicates() {
        let calc = calculator();
        let goal = |minute, value| {
            Event::new("u1", EventType::GoalCompletion, at(15, 9, minute), value)
        };
        let a = goal(0, json!({ "goal_id": "a" }));
        let b = goal(1, json!({ "goal_id": "b" }));
        let (_, breakdown) = calc.score_events(&[a, b], date(15));
        assert_eq!(breakdown.duplicates_dropped, 0);
        assert_eq!(breakdown.events_counted, 2);
    }

    #[test]
    fn untyped_payload_fields_still_separate_actions() {
        let calc = calculator();
        let step = |minute, n: u32| {
            let value = json!({ "goal_id": "g1", "step": n });
            Event::new("u1", EventType::GoalSetting, at(15, 9, minute), value)
        };
        let (_, breakdown) = calc.score_events(&[step(0, 1), step(1, 2), step(2, 2)], date(15));
        assert_eq!(breakdown.duplicates_dropped, 1);
        assert_eq!(breakdown.events_counted, 2);
    }

    #[test]
    fn per_type_daily_cap_limits_counted_events() {
        let calc = calculator();
        let events: Vec<Event> = (0..10)
            .map(|i| event(i, EventType::LessonCompletion, at(15, 8 + i as u32, 0)))
            .collect();
        let (_, breakdown) = calc.score_events(&events, date(15));
        assert_eq!(breakdown.events_by_type["lesson_completion"], 10);
        assert_eq!(breakdown.events_counted, 5);
        assert_eq!(breakdown.capped_events, 5);
        assert_eq!(breakdown.points_by_type["lesson_completion"], 75.0);
    }

    #[test]
    fn unknown_types_weigh_zero_but_are_reported() {
        let calc = calculator();
        let events = vec![
            event(1, EventType::Unknown("breathwork".into()), at(15, 9, 0)),
            event(2, EventType::AppSession, at(15, 9, 30)),
        ];
        let (_, breakdown) = calc.score_events(&events, date(15));
        assert_eq!(breakdown.unknown_events, 1);
        assert_eq!(breakdown.events_counted, 2);
        assert_eq!(breakdown.points_by_type["breathwork"], 0.0);
        assert_eq!(breakdown.daily_totals[&date(15)], 3.0);
    }

    #[test]
    fn rolling_average_spreads_single_day() {
        let calc = calculator();
        let events = vec![
            event(1, EventType::LessonCompletion, at(15, 9, 0)),
            event(2, EventType::JournalEntry, at(15, 10, 0)),
            event(3, EventType::CoachInteraction, at(15, 11, 0)),
            event(4, EventType::AppSession, at(15, 12, 0)),
        ];
        let (_, breakdown) = calc.score_events(&events, date(15));
        assert_eq!(breakdown.daily_totals[&date(15)], 48.0);
        assert!((breakdown.smoothed_total - 16.0).abs() < 1e-9);
        assert_eq!(breakdown.top_activities.len(), 3);
        assert_eq!(breakdown.top_activities[0].event_type, "coach_interaction");
    }

    #[test]
    fn older_days_contribute_decayed_weight() {
        let calc = calculator();
        let events = vec![event(1, EventType::CoachInteraction, at(13, 9, 0))];
        let (_, breakdown) = calc.score_events(&events, date(15));
        let decayed = |age: f64| 20.0 * 2f64.powf(-age / 10.0);
        assert!((breakdown.daily_totals[&date(13)] - decayed(0.0)).abs() < 1e-9);
        assert!((breakdown.daily_totals[&date(14)] - decayed(1.0)).abs() < 1e-9);
        assert!((breakdown.daily_totals[&date(15)] - decayed(2.0)).abs() < 1e-9);
        assert!((breakdown.points_by_type["coach_interaction"] - decayed(2.0)).abs() < 1e-9);
    }

    #[test]
    fn events_older_than_the_rolling_days_still_count_decayed() {
        let calc = calculator();
        for age in [5u32, 10] {
            let events = vec![event(1, EventType::CoachInteraction, at(15 - age, 9, 0))];
            let (raw_score, breakdown) = calc.score_events(&events, date(15));
            let as_of = |days: u32| 20.0 * 2f64.powf(-f64::from(days) / 10.0);
            assert!((breakdown.daily_totals[&date(15)] - as_of(age)).abs() < 1e-9);
            let smoothed = (as_of(age) + as_of(age - 1) + as_of(age - 2)) / 3.0;
            assert!((breakdown.smoothed_total - smoothed).abs() < 1e-9);
            assert!(raw_score > 0.0, "{age}-day-old event scored zero");
        }
    }

    #[test]
    fn earliest_averaged_day_sees_a_full_window() {
        let calc = calculator();
        // 29 days before the 13th: inside the 13th's window, outside the 15th's.
        let old = at(13, 9, 0) - Duration::days(29);
        let source = FixedSource(vec![event(1, EventType::StreakMilestone, old)]);
        let score = calc.compute(&source, "u1", date(15), &[], at(15, 23, 0)).unwrap();
        assert_eq!(score.breakdown.events_counted, 1);
        assert!(score.breakdown.daily_totals[&date(13)] > 0.0);
        assert_eq!(score.breakdown.daily_totals[&date(15)], 0.0);
        assert!(!score.breakdown.points_by_type.contains_key("streak_milestone"));
    }

    #[test]
    fn steady_engagement_reaches_rising() {
        let calc = calculator();
        let mut events = Vec::new();
        for day in 13..=15 {
            for (i, t) in [
                EventType::LessonCompletion,
                EventType::CoachInteraction,
                EventType::GoalCompletion,
            ]
            .into_iter()
            .enumerate()
            {
                events.push(event(events.len() as i64, t, at(day, 9 + i as u32, 0)));
            }
        }
        let source = FixedSource(events);
        let score = calc.compute(&source, "u1", date(15), &[], at(15, 23, 0)).unwrap();
        assert_eq!(score.zone, Zone::Rising);
    }

    #[test]
    fn events_outside_window_are_ignored() {
        let calc = calculator();
        let (from, to) = calc.window(date(15));
        assert_eq!(from, at(15, 0, 0) - Duration::days(29));
        assert_eq!(to, at(16, 0, 0));
        let source = FixedSource(vec![event(1, EventType::LessonCompletion, at(16, 0, 0))]);
        let score = calc.compute(&source, "u1", date(15), &[], at(15, 23, 0)).unwrap();
        assert_eq!(score.breakdown.events_in_window, 0);
    }

    #[test]
    fn recomputation_is_idempotent() {
        let calc = calculator();
        let source = FixedSource(vec![
            event(1, EventType::LessonCompletion, at(14, 9, 0)),
            event(2, EventType::JournalEntry, at(15, 9, 0)),
            event(3, EventType::JournalEntry, at(15, 9, 2)),
        ]);
        let computed_at = at(15, 23, 0);
        let first = calc.compute(&source, "u1", date(15), &[], computed_at).unwrap();
        let second = calc
            .compute(&source, "u1", date(15), &[first.clone()], computed_at)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn transient_fetch_failures_are_retried() {
        let calc = ScoreCalculator::new(fast_retry_config());
        let source = FlakySource {
            failures_left: Cell::new(2),
            inner: FixedSource(vec![event(1, EventType::JournalEntry, at(15, 9, 0))]),
        };
        let score = calc.compute(&source, "u1", date(15), &[], at(15, 23, 0)).unwrap();
        assert_eq!(score.breakdown.events_counted, 1);
    }

    #[test]
    fn persistent_fetch_failure_surfaces_transient_error() {
        let calc = ScoreCalculator::new(fast_retry_config());
        let source = FlakySource {
            failures_left: Cell::new(10),
            inner: FixedSource(vec![]),
        };
        let err = calc.compute(&source, "u1", date(15), &[], at(15, 23, 0)).unwrap_err();
        assert!(matches!(err, CoreError::TransientData { attempts: 3, .. }));
    }

    proptest! {
        #[test]
        fn decay_is_monotonic_in_age(
            base in 0.0f64..1000.0,
            age in 0.0f64..365.0,
            step in 0.0f64..30.0,
            half_life in 0.5f64..60.0,
        ) {
            let older = decayed_weight(base, age + step, half_life);
            prop_assert!(older <= decayed_weight(base, age, half_life));
        }

        #[test]
        fn normalized_score_stays_in_range(total in proptest::num::f64::ANY) {
            let score = normalize(total, 30.0, 0.08);
            prop_assert!((0.0..=100.0).contains(&score));
        }

        #[test]
        fn normalize_is_monotonic(a in 0.0f64..1e6, b in 0.0f64..1e6) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(normalize(lo, 30.0, 0.08) <= normalize(hi, 30.0, 0.08));
        }
    }
}
