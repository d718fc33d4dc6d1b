//! Intervention rule engine.
//!
//! Given one user's candidates, acts on at most one per run: the
//! highest-priority candidate whose rate limit admits it. Throttled
//! candidates fall through to the next; if every candidate is throttled
//! the run is a deliberate no-op.
//!
//! A triggered intervention is dispatched first and then written to the
//! append-only log with whatever status the gateway reported. A gateway
//! failure does not give the rate-limit slot back.
//!
//! With a deadline, a run that has passed it stops before acquiring a
//! rate-limit slot. Once a slot is taken the intervention is always
//! recorded: requests not yet handed to the gateway are abandoned and the
//! record is marked failed for reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::dispatch::{Channel, DispatchGateway, DispatchRequest, DispatchStatus};
use crate::error::Result;
use crate::patterns::{InterventionCandidate, PatternType, Priority};
use crate::pipeline::Deadline;
use crate::rate_limit::{InterventionType, RateLimiter};
use crate::retry;
use crate::storage::config::InterventionConfig;
use crate::storage::Database;

/// Immutable audit entry of a triggered intervention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub intervention_type: InterventionType,
    pub priority: Priority,
    pub reason: String,
    pub triggered_at: DateTime<Utc>,
    pub dispatch_status: DispatchStatus,
}

/// What one evaluation run did for a user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    NoCandidates,
    /// Every candidate was rate limited
    AllThrottled { throttled: Vec<PatternType> },
    Triggered {
        record: InterventionRecord,
        /// Requests handed to the gateway, in order
        requests: Vec<DispatchRequest>,
        /// Higher-priority candidates skipped because they were throttled
        throttled: Vec<PatternType>,
    },
}

impl EvaluationOutcome {
    pub fn record(&self) -> Option<&InterventionRecord> {
        match self {
            EvaluationOutcome::Triggered { record, .. } => Some(record),
            _ => None,
        }
    }
}

pub struct InterventionEngine<'a> {
    db: &'a Database,
    config: &'a InterventionConfig,
    gateway: &'a dyn DispatchGateway,
    deadline: Option<Deadline>,
}

impl<'a> InterventionEngine<'a> {
    pub fn new(
        db: &'a Database,
        config: &'a InterventionConfig,
        gateway: &'a dyn DispatchGateway,
    ) -> Self {
        Self {
            db,
            config,
            gateway,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Deadline>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Act on at most one of `candidates`, all of which belong to one user.
    pub fn evaluate(
        &self,
        candidates: &[InterventionCandidate],
        now: DateTime<Utc>,
    ) -> Result<EvaluationOutcome> {
        if candidates.is_empty() {
            return Ok(EvaluationOutcome::NoCandidates);
        }

        let mut ordered: Vec<&InterventionCandidate> = candidates.iter().collect();
        // Stable: equal priorities keep detection order.
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let limiter = RateLimiter::new(self.db, &self.config.rate_limits);
        let mut throttled = Vec::new();
        for candidate in ordered {
            let intervention_type = candidate.pattern_type.intervention_type();
            if let Some(deadline) = &self.deadline {
                deadline.check(&candidate.user_id)?;
            }
            if !limiter.try_acquire(&candidate.user_id, intervention_type, now)? {
                throttled.push(candidate.pattern_type);
                continue;
            }
            let (record, requests) = self.trigger(candidate, now)?;
            return Ok(EvaluationOutcome::Triggered {
                record,
                requests,
                throttled,
            });
        }

        tracing::debug!(
            user_id = %candidates[0].user_id,
            throttled = throttled.len(),
            "all candidates rate limited, nothing dispatched"
        );
        Ok(EvaluationOutcome::AllThrottled { throttled })
    }

    fn trigger(
        &self,
        candidate: &InterventionCandidate,
        now: DateTime<Utc>,
    ) -> Result<(InterventionRecord, Vec<DispatchRequest>)> {
        let intervention_type = candidate.pattern_type.intervention_type();
        let id = Uuid::new_v4();
        let mut dispatch_status = DispatchStatus::Dispatched;
        let mut requests = Vec::new();
        for request in self.requests_for(candidate, id) {
            if self.deadline.as_ref().is_some_and(Deadline::expired) {
                tracing::warn!(
                    user_id = %candidate.user_id,
                    correlation_id = %id,
                    channel = %request.channel,
                    "deadline passed before dispatch, request abandoned"
                );
                dispatch_status = DispatchStatus::Failed;
                break;
            }
            let sent = self.gateway.dispatch(&request);
            requests.push(request);
            if let Err(e) = sent {
                tracing::warn!(
                    user_id = %candidate.user_id,
                    gateway = self.gateway.name(),
                    correlation_id = %id,
                    error = %e,
                    "dispatch failed, intervention still counted"
                );
                dispatch_status = DispatchStatus::Failed;
            }
        }

        let record = InterventionRecord {
            id,
            user_id: candidate.user_id.clone(),
            intervention_type,
            priority: candidate.priority,
            reason: candidate.reason.clone(),
            triggered_at: now,
            dispatch_status,
        };
        let policy = self.config.pipeline.retry_policy();
        let appended = retry::with_backoff(&policy, "append_intervention_record", || {
            self.db.append_intervention_record(&record)
        });
        if let Err(e) = appended {
            tracing::error!(
                user_id = %record.user_id,
                correlation_id = %record.id,
                intervention_type = %intervention_type,
                dispatched = requests.len(),
                error = %e,
                "intervention dispatched but not recorded"
            );
            return Err(e);
        }

        tracing::info!(
            user_id = %record.user_id,
            intervention_type = %intervention_type,
            priority = %record.priority,
            status = record.dispatch_status.as_str(),
            "intervention triggered"
        );
        Ok((record, requests))
    }

    fn requests_for(
        &self,
        candidate: &InterventionCandidate,
        correlation_id: Uuid,
    ) -> Vec<DispatchRequest> {
        let templates = &self.config.templates;
        let template = templates.for_pattern(candidate.pattern_type);
        let latest = candidate.evidence.last();

        let mut requests = vec![DispatchRequest {
            user_id: candidate.user_id.clone(),
            channel: Channel::Push,
            template_id: template.template_id.clone(),
            payload: json!({
                "title": template.title,
                "body": template.body,
                "action_type": template.action_type,
                "pattern": candidate.pattern_type.as_str(),
                "priority": candidate.priority.as_str(),
                "reason": candidate.reason,
                "raw_score": latest.map(|p| p.raw_score),
                "zone": latest.map(|p| p.zone.as_str()),
            }),
            correlation_id,
        }];

        if candidate.pattern_type == PatternType::ConsecutiveNeedsCare
            && candidate.priority == Priority::High
        {
            requests.push(DispatchRequest {
                user_id: candidate.user_id.clone(),
                channel: Channel::CoachCall,
                template_id: templates.coach_intervention_type.clone(),
                payload: json!({
                    "priority": candidate.priority.as_str(),
                    "reason": candidate.reason,
                    "evidence_days": candidate.evidence.len(),
                }),
                correlation_id,
            });
        }
        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchError;
    use crate::zones::{ScorePoint, Zone};
    use crate::error::CoreError;
    use chrono::{Duration, NaiveDate, TimeZone};
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<DispatchRequest>>,
        fail: bool,
        delay: Option<StdDuration>,
    }

    impl DispatchGateway for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn dispatch(&self, request: &DispatchRequest) -> std::result::Result<(), DispatchError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            if self.fail {
                return Err(DispatchError::Unavailable("down".into()));
            }
            self.sent.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 15, 2, 0, 0).unwrap()
    }

    fn candidate(pattern_type: PatternType) -> InterventionCandidate {
        InterventionCandidate {
            user_id: "u1".into(),
            pattern_type,
            priority: pattern_type.priority(),
            evidence: vec![ScorePoint {
                date: NaiveDate::from_ymd_opt(2024, 12, 15).unwrap(),
                raw_score: 30.0,
                zone: Zone::NeedsCare,
            }],
            reason: format!("{pattern_type} matched"),
            suggested_action: String::new(),
        }
    }

    #[test]
    fn no_candidates_is_a_no_op() {
        let db = Database::open_memory().unwrap();
        let cfg = InterventionConfig::default();
        let gateway = Recording::default();
        let engine = InterventionEngine::new(&db, &cfg, &gateway);
        assert_eq!(engine.evaluate(&[], now()).unwrap(), EvaluationOutcome::NoCandidates);
    }

    #[test]
    fn highest_priority_wins_and_needs_care_books_a_coach() {
        let db = Database::open_memory().unwrap();
        let cfg = InterventionConfig::default();
        let gateway = Recording::default();
        let engine = InterventionEngine::new(&db, &cfg, &gateway);

        let candidates = [
            candidate(PatternType::IrregularPattern),
            candidate(PatternType::ScoreDrop),
            candidate(PatternType::ConsecutiveNeedsCare),
        ];
        let outcome = engine.evaluate(&candidates, now()).unwrap();
        let record = outcome.record().unwrap();
        assert_eq!(record.intervention_type, InterventionType::ConsecutiveNeedsCare);
        assert_eq!(record.priority, Priority::High);
        assert_eq!(record.dispatch_status, DispatchStatus::Dispatched);

        let sent = gateway.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].channel, Channel::Push);
        assert_eq!(sent[0].template_id, "consecutive_needs_care");
        assert_eq!(sent[1].channel, Channel::CoachCall);
        assert_eq!(sent[1].template_id, "automated_call_schedule");
        assert!(sent.iter().all(|r| r.correlation_id == record.id));

        assert_eq!(db.intervention_records(Some("u1")).unwrap(), vec![record.clone()]);
    }

    #[test]
    fn throttled_candidate_falls_through() {
        let db = Database::open_memory().unwrap();
        let cfg = InterventionConfig::default();
        let gateway = Recording::default();
        let engine = InterventionEngine::new(&db, &cfg, &gateway);

        let first = engine
            .evaluate(&[candidate(PatternType::ConsecutiveNeedsCare)], now())
            .unwrap();
        assert!(first.record().is_some());

        let later = now() + Duration::hours(3);
        let outcome = engine
            .evaluate(
                &[
                    candidate(PatternType::ConsecutiveNeedsCare),
                    candidate(PatternType::ScoreDrop),
                ],
                later,
            )
            .unwrap();
        match outcome {
            EvaluationOutcome::Triggered { record, throttled, .. } => {
                assert_eq!(record.intervention_type, InterventionType::ScoreDrop);
                assert_eq!(throttled, vec![PatternType::ConsecutiveNeedsCare]);
            }
            other => panic!("expected trigger, got {other:?}"),
        }
        assert_eq!(db.intervention_records(Some("u1")).unwrap().len(), 2);
    }

    #[test]
    fn all_throttled_writes_nothing() {
        let db = Database::open_memory().unwrap();
        let cfg = InterventionConfig::default();
        let gateway = Recording::default();
        let engine = InterventionEngine::new(&db, &cfg, &gateway);

        engine.evaluate(&[candidate(PatternType::SustainedRising)], now()).unwrap();
        let outcome = engine
            .evaluate(&[candidate(PatternType::SustainedRising)], now() + Duration::hours(1))
            .unwrap();
        assert_eq!(
            outcome,
            EvaluationOutcome::AllThrottled {
                throttled: vec![PatternType::SustainedRising]
            }
        );
        assert_eq!(db.intervention_records(None).unwrap().len(), 1);
        assert_eq!(gateway.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn gateway_failure_is_recorded_and_consumes_the_slot() {
        let db = Database::open_memory().unwrap();
        let cfg = InterventionConfig::default();
        let gateway = Recording {
            fail: true,
            ..Recording::default()
        };
        let engine = InterventionEngine::new(&db, &cfg, &gateway);

        let outcome = engine.evaluate(&[candidate(PatternType::ScoreDrop)], now()).unwrap();
        assert_eq!(outcome.record().unwrap().dispatch_status, DispatchStatus::Failed);

        let retry = engine
            .evaluate(&[candidate(PatternType::ScoreDrop)], now() + Duration::minutes(5))
            .unwrap();
        assert!(matches!(retry, EvaluationOutcome::AllThrottled { .. }));
    }

    #[test]
    fn expired_deadline_stops_before_taking_a_slot() {
        let db = Database::open_memory().unwrap();
        let cfg = InterventionConfig::default();
        let gateway = Recording::default();
        let engine = InterventionEngine::new(&db, &cfg, &gateway)
            .with_deadline(Some(Deadline::after(StdDuration::ZERO)));

        let err = engine
            .evaluate(&[candidate(PatternType::ConsecutiveNeedsCare)], now())
            .unwrap_err();
        assert!(matches!(err, CoreError::UserTimeout { .. }));
        assert!(gateway.sent.lock().unwrap().is_empty());
        assert!(db.intervention_records(None).unwrap().is_empty());

        let limiter = RateLimiter::new(&db, &cfg.rate_limits);
        assert!(limiter
            .counter("u1", InterventionType::ConsecutiveNeedsCare, now())
            .unwrap()
            .is_none());
    }

    #[test]
    fn deadline_passing_mid_dispatch_abandons_the_rest_and_records_failure() {
        let db = Database::open_memory().unwrap();
        let cfg = InterventionConfig::default();
        let gateway = Recording {
            delay: Some(StdDuration::from_millis(300)),
            ..Recording::default()
        };
        let engine = InterventionEngine::new(&db, &cfg, &gateway)
            .with_deadline(Some(Deadline::after(StdDuration::from_millis(100))));

        let outcome = engine
            .evaluate(&[candidate(PatternType::ConsecutiveNeedsCare)], now())
            .unwrap();
        match &outcome {
            EvaluationOutcome::Triggered { record, requests, .. } => {
                assert_eq!(record.dispatch_status, DispatchStatus::Failed);
                assert_eq!(requests.len(), 1);
                assert_eq!(requests[0].channel, Channel::Push);
            }
            other => panic!("expected trigger, got {other:?}"),
        }
        let sent = gateway.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, Channel::Push);
        assert_eq!(db.intervention_records(Some("u1")).unwrap().len(), 1);
    }

    #[test]
    fn failed_audit_append_surfaces_after_dispatch() {
        let db = Database::open_memory().unwrap();
        db.conn().execute_batch("DROP TABLE intervention_records").unwrap();
        let mut cfg = InterventionConfig::default();
        cfg.pipeline.retry_base_delay_ms = 1;
        cfg.pipeline.retry_max_delay_ms = 1;
        let gateway = Recording::default();
        let engine = InterventionEngine::new(&db, &cfg, &gateway);

        let result = engine.evaluate(&[candidate(PatternType::ScoreDrop)], now());
        assert!(result.is_err());
        let sent = gateway.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template_id, "score_drop");
    }
}
