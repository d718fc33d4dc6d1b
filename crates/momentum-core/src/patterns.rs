//! Pattern detection over a user's recent score history.
//!
//! Each rule looks at a trailing window of computed days ending today and
//! yields at most one candidate. Rules are independent, so one day may
//! produce several candidates; the engine decides which one to act on.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::rate_limit::InterventionType;
use crate::storage::config::{InterventionConfig, PatternConfig, TemplatesConfig};
use crate::zones::{ScorePoint, Zone};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    ConsecutiveNeedsCare,
    ScoreDrop,
    SustainedRising,
    IrregularPattern,
}

impl PatternType {
    /// Detection order.
    pub const ALL: [PatternType; 4] = [
        PatternType::ConsecutiveNeedsCare,
        PatternType::ScoreDrop,
        PatternType::SustainedRising,
        PatternType::IrregularPattern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::ConsecutiveNeedsCare => "consecutive_needs_care",
            PatternType::ScoreDrop => "score_drop",
            PatternType::SustainedRising => "sustained_rising",
            PatternType::IrregularPattern => "irregular_pattern",
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            PatternType::ConsecutiveNeedsCare => Priority::High,
            PatternType::ScoreDrop => Priority::Medium,
            PatternType::SustainedRising | PatternType::IrregularPattern => Priority::Low,
        }
    }

    /// Intervention type (and rate-limit bucket) a pattern triggers.
    pub fn intervention_type(&self) -> InterventionType {
        match self {
            PatternType::ConsecutiveNeedsCare => InterventionType::ConsecutiveNeedsCare,
            PatternType::ScoreDrop => InterventionType::ScoreDrop,
            PatternType::SustainedRising => InterventionType::Celebration,
            PatternType::IrregularPattern => InterventionType::ConsistencyReminder,
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected pattern worth acting on. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterventionCandidate {
    pub user_id: String,
    pub pattern_type: PatternType,
    pub priority: Priority,
    /// Score history the rule matched on, oldest first
    pub evidence: Vec<ScorePoint>,
    pub reason: String,
    pub suggested_action: String,
}

impl InterventionCandidate {
    /// Score change across the evidence window (last minus first).
    pub fn score_change(&self) -> f64 {
        match (self.evidence.first(), self.evidence.last()) {
            (Some(first), Some(last)) => round2(last.raw_score - first.raw_score),
            _ => 0.0,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct PatternDetector<'a> {
    config: &'a PatternConfig,
    templates: &'a TemplatesConfig,
}

impl<'a> PatternDetector<'a> {
    pub fn new(config: &'a InterventionConfig) -> Self {
        Self {
            config: &config.patterns,
            templates: &config.templates,
        }
    }

    /// Run every rule against `history` for `today`.
    ///
    /// `history` may be in any order; days after `today` are ignored. When
    /// there is no score for `today` there is nothing to evaluate.
    pub fn detect(
        &self,
        user_id: &str,
        history: &[ScorePoint],
        today: NaiveDate,
    ) -> Vec<InterventionCandidate> {
        let mut points: Vec<ScorePoint> = history
            .iter()
            .filter(|p| p.date <= today)
            .copied()
            .collect();
        points.sort_by_key(|p| p.date);
        points.dedup_by_key(|p| p.date);

        if points.last().map(|p| p.date) != Some(today) {
            return Vec::new();
        }

        let rules: [fn(&Self, &[ScorePoint], NaiveDate) -> Option<(Vec<ScorePoint>, String)>; 4] = [
            Self::consecutive_needs_care,
            Self::score_drop,
            Self::sustained_rising,
            Self::irregular_pattern,
        ];

        PatternType::ALL
            .iter()
            .zip(rules)
            .filter_map(|(&pattern_type, rule)| {
                let (evidence, reason) = rule(self, &points, today)?;
                tracing::debug!(user_id, pattern = %pattern_type, %reason, "pattern matched");
                Some(InterventionCandidate {
                    user_id: user_id.to_string(),
                    pattern_type,
                    priority: pattern_type.priority(),
                    evidence,
                    reason,
                    suggested_action: self.templates.for_pattern(pattern_type).action_type.clone(),
                })
            })
            .collect()
    }

    /// Points dated within the `days` days ending at `today`.
    fn trailing(points: &[ScorePoint], today: NaiveDate, days: u32) -> &[ScorePoint] {
        let start = today - Duration::days(i64::from(days.max(1)) - 1);
        let first = points.partition_point(|p| p.date < start);
        &points[first..]
    }

    fn consecutive_needs_care(
        &self,
        points: &[ScorePoint],
        _today: NaiveDate,
    ) -> Option<(Vec<ScorePoint>, String)> {
        let mut run = 0;
        let mut expected = points.last()?.date;
        for point in points.iter().rev() {
            if point.zone != Zone::NeedsCare || point.date != expected {
                break;
            }
            run += 1;
            expected = point.date - Duration::days(1);
        }
        if run < self.config.consecutive_needs_care_days as usize {
            return None;
        }
        let evidence = points[points.len() - run..].to_vec();
        Some((evidence, format!("NeedsCare for {run} consecutive days")))
    }

    fn score_drop(
        &self,
        points: &[ScorePoint],
        today: NaiveDate,
    ) -> Option<(Vec<ScorePoint>, String)> {
        let current = points.last()?;
        let lookback = i64::from(self.config.score_drop_lookback_days);
        let window_start = today - Duration::days(lookback);
        let baseline_idx = points
            .iter()
            .position(|p| p.date >= window_start && p.date < today)?;
        let baseline = points[baseline_idx];
        let drop = round2(baseline.raw_score - current.raw_score);
        if drop < self.config.score_drop_points {
            return None;
        }
        let evidence = points[baseline_idx..].to_vec();
        Some((
            evidence,
            format!(
                "score dropped {drop:.2} points from {:.2} on {} to {:.2}",
                baseline.raw_score, baseline.date, current.raw_score
            ),
        ))
    }

    fn sustained_rising(
        &self,
        points: &[ScorePoint],
        today: NaiveDate,
    ) -> Option<(Vec<ScorePoint>, String)> {
        if self.config.celebration_requires_rising_today && points.last()?.zone != Zone::Rising {
            return None;
        }
        let window = Self::trailing(points, today, self.config.rising_window_days);
        let rising = window.iter().filter(|p| p.zone == Zone::Rising).count();
        if rising < self.config.rising_min_days as usize {
            return None;
        }
        Some((
            window.to_vec(),
            format!(
                "Rising on {rising} of the last {} days",
                self.config.rising_window_days
            ),
        ))
    }

    fn irregular_pattern(
        &self,
        points: &[ScorePoint],
        today: NaiveDate,
    ) -> Option<(Vec<ScorePoint>, String)> {
        let window = Self::trailing(points, today, self.config.irregular_window_days);
        let transitions = window.windows(2).filter(|w| w[0].zone != w[1].zone).count();
        if transitions < self.config.irregular_min_transitions as usize {
            return None;
        }
        Some((
            window.to_vec(),
            format!(
                "{transitions} zone transitions in the last {} days",
                self.config.irregular_window_days
            ),
        ))
    }
}
