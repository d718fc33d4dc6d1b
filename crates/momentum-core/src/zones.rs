//! Zone classification with hysteresis.
//!
//! A raw score maps to one of three zones by fixed thresholds, but a user
//! only leaves their current zone when the new score clears the crossed
//! boundary by `hysteresis_margin`, or stays past that boundary for
//! `hysteresis_days` consecutive computed days. Users without history are
//! classified on thresholds alone.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::config::ZoneConfig;

/// Motivational state of a user. Ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Zone {
    NeedsCare,
    Steady,
    Rising,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::NeedsCare => "NeedsCare",
            Zone::Steady => "Steady",
            Zone::Rising => "Rising",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NeedsCare" => Some(Zone::NeedsCare),
            "Steady" => Some(Zone::Steady),
            "Rising" => Some(Zone::Rising),
            _ => None,
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One computed day of a user's score history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScorePoint {
    pub date: NaiveDate,
    pub raw_score: f64,
    pub zone: Zone,
}

pub struct ZoneClassifier<'a> {
    config: &'a ZoneConfig,
}

impl<'a> ZoneClassifier<'a> {
    pub fn new(config: &'a ZoneConfig) -> Self {
        Self { config }
    }

    /// Zone by thresholds only.
    pub fn threshold_zone(&self, raw_score: f64) -> Zone {
        if raw_score >= self.config.rising_threshold {
            Zone::Rising
        } else if raw_score >= self.config.needs_care_threshold {
            Zone::Steady
        } else {
            Zone::NeedsCare
        }
    }

    /// Classify today's raw score given prior computed days (oldest first).
    pub fn classify(&self, raw_score: f64, prior: &[ScorePoint]) -> Zone {
        let target = self.threshold_zone(raw_score);
        let Some(last) = prior.last() else {
            return target;
        };
        let current = last.zone;
        if target == current {
            return current;
        }

        let upward = target > current;
        let boundary = if upward {
            self.upper_bound(current)
        } else {
            self.lower_bound(current)
        };
        let margin = self.config.hysteresis_margin;

        let cleared = if upward {
            raw_score >= boundary + margin
        } else {
            raw_score < boundary - margin
        };
        if cleared {
            return target;
        }

        let past = |score: f64| if upward { score >= boundary } else { score < boundary };
        let needed = self.config.hysteresis_days.saturating_sub(1) as usize;
        let persisted = prior.len() >= needed
            && prior.iter().rev().take(needed).all(|p| past(p.raw_score));

        if persisted {
            target
        } else {
            current
        }
    }

    fn upper_bound(&self, zone: Zone) -> f64 {
        match zone {
            Zone::NeedsCare => self.config.needs_care_threshold,
            Zone::Steady | Zone::Rising => self.config.rising_threshold,
        }
    }

    fn lower_bound(&self, zone: Zone) -> f64 {
        match zone {
            Zone::Rising => self.config.rising_threshold,
            Zone::Steady | Zone::NeedsCare => self.config.needs_care_threshold,
        }
    }
}
