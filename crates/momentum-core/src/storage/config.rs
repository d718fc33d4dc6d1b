//! TOML-based intervention configuration.
//!
//! Holds every tunable of the scoring and intervention pipeline:
//! - Scoring window, decay half-life, event weights and normalization curve
//! - Zone thresholds and hysteresis
//! - Pattern detection thresholds
//! - Per-intervention-type rate limit caps
//! - Notification templates
//! - Batch pipeline sizing, timeouts and retry policy
//!
//! Configuration is stored at `~/.config/momentum/momentum.toml`.
//!
//! Threshold and rate-limit sections have no serde defaults: a file that
//! omits them fails to load. Loading always validates, and an invalid file
//! is an error, never silently replaced by defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::data_dir;
use crate::error::ConfigError;
use crate::events::EventType;
use crate::patterns::PatternType;
use crate::rate_limit::InterventionType;
use crate::retry::RetryPolicy;

/// Score calculator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Trailing event window, in days, ending at the target date
    pub window_days: u32,
    /// Days after which an event's weight halves
    pub half_life_days: f64,
    /// Days in the trailing rolling average of daily totals
    pub rolling_average_days: u32,
    /// Identical events closer than this are counted once
    pub dedup_window_minutes: u32,
    /// Events of one type counted per calendar day
    pub max_events_per_type_per_day: u32,
    /// Smoothed total that maps to the steepest part of the 0-100 curve
    pub normalization_midpoint: f64,
    pub normalization_steepness: f64,
    #[serde(default = "default_algorithm_version")]
    pub algorithm_version: String,
    /// Event types that trigger the incremental (real-time) path
    #[serde(default = "default_high_signal_events")]
    pub high_signal_events: Vec<String>,
    /// Base weight per event type name
    #[serde(default = "default_event_weights")]
    pub event_weights: BTreeMap<String, f64>,
}

/// Zone thresholds and hysteresis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub rising_threshold: f64,
    pub needs_care_threshold: f64,
    pub hysteresis_margin: f64,
    pub hysteresis_days: u32,
}

/// Pattern detector thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Days of score history handed to the detector
    pub history_days: u32,
    pub consecutive_needs_care_days: u32,
    pub score_drop_points: f64,
    pub score_drop_lookback_days: u32,
    pub rising_window_days: u32,
    pub rising_min_days: u32,
    /// Only celebrate when today's zone is Rising too
    #[serde(default = "default_true")]
    pub celebration_requires_rising_today: bool,
    pub irregular_window_days: u32,
    pub irregular_min_transitions: u32,
}

/// Frequency caps for one intervention type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitCaps {
    pub max_per_day: u32,
    pub min_hours_between: f64,
}

/// Rate limit caps per intervention type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Length of a counting window
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
    pub consecutive_needs_care: RateLimitCaps,
    pub score_drop: RateLimitCaps,
    pub celebration: RateLimitCaps,
    pub consistency_reminder: RateLimitCaps,
}

/// Notification content for one pattern type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub template_id: String,
    pub title: String,
    pub body: String,
    /// Suggested in-app action attached to the notification
    pub action_type: String,
}

/// Notification templates per pattern type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplatesConfig {
    /// Template id of the coach-scheduling request
    pub coach_intervention_type: String,
    pub consecutive_needs_care: NotificationTemplate,
    pub score_drop: NotificationTemplate,
    pub celebration: NotificationTemplate,
    pub consistency_reminder: NotificationTemplate,
}

/// Batch pipeline sizing and failure handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Soft timeout per user pipeline
    #[serde(default = "default_user_timeout_ms")]
    pub user_timeout_ms: u64,
    /// Wall-clock budget of a whole batch run
    #[serde(default = "default_batch_budget_secs")]
    pub batch_budget_secs: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

/// Process-wide intervention configuration.
///
/// Serialized to/from TOML at `~/.config/momentum/momentum.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionConfig {
    pub scoring: ScoringConfig,
    pub zones: ZoneConfig,
    pub patterns: PatternConfig,
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

// Default functions
fn default_algorithm_version() -> String {
    "v1.0".into()
}
fn default_high_signal_events() -> Vec<String> {
    vec![
        "goal_completion".into(),
        "lesson_completion".into(),
        "coach_interaction".into(),
    ]
}
fn default_event_weights() -> BTreeMap<String, f64> {
    [
        (EventType::LessonCompletion, 15.0),
        (EventType::LessonStart, 5.0),
        (EventType::JournalEntry, 10.0),
        (EventType::CoachInteraction, 20.0),
        (EventType::GoalSetting, 12.0),
        (EventType::GoalCompletion, 18.0),
        (EventType::AppSession, 3.0),
        (EventType::StreakMilestone, 25.0),
        (EventType::AssessmentCompletion, 15.0),
        (EventType::ResourceAccess, 5.0),
        (EventType::PeerInteraction, 8.0),
        (EventType::ReminderResponse, 7.0),
    ]
    .into_iter()
    .map(|(event_type, weight)| (event_type.as_str().to_string(), weight))
    .collect()
}
fn default_true() -> bool {
    true
}
fn default_window_hours() -> u32 {
    24
}
fn default_worker_count() -> usize {
    4
}
fn default_user_timeout_ms() -> u64 {
    5_000
}
fn default_batch_budget_secs() -> u64 {
    4 * 60 * 60
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    100
}
fn default_retry_max_delay_ms() -> u64 {
    2_000
}

fn template(template_id: &str, title: &str, body: &str, action_type: &str) -> NotificationTemplate {
    NotificationTemplate {
        template_id: template_id.into(),
        title: title.into(),
        body: body.into(),
        action_type: action_type.into(),
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            half_life_days: 10.0,
            rolling_average_days: 3,
            dedup_window_minutes: 5,
            max_events_per_type_per_day: 5,
            normalization_midpoint: 30.0,
            normalization_steepness: 0.08,
            algorithm_version: default_algorithm_version(),
            high_signal_events: default_high_signal_events(),
            event_weights: default_event_weights(),
        }
    }
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            rising_threshold: 70.0,
            needs_care_threshold: 45.0,
            hysteresis_margin: 2.0,
            hysteresis_days: 2,
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            history_days: 14,
            consecutive_needs_care_days: 2,
            score_drop_points: 15.0,
            score_drop_lookback_days: 3,
            rising_window_days: 5,
            rising_min_days: 4,
            celebration_requires_rising_today: true,
            irregular_window_days: 7,
            irregular_min_transitions: 4,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
            consecutive_needs_care: RateLimitCaps {
                max_per_day: 1,
                min_hours_between: 24.0,
            },
            score_drop: RateLimitCaps {
                max_per_day: 2,
                min_hours_between: 8.0,
            },
            celebration: RateLimitCaps {
                max_per_day: 1,
                min_hours_between: 12.0,
            },
            consistency_reminder: RateLimitCaps {
                max_per_day: 1,
                min_hours_between: 24.0,
            },
        }
    }
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            coach_intervention_type: "automated_call_schedule".into(),
            consecutive_needs_care: template(
                "consecutive_needs_care",
                "Let's grow together!",
                "Your coach would love to check in and help you find your footing again.",
                "schedule_call",
            ),
            score_drop: template(
                "score_drop",
                "You've got this!",
                "A short lesson today is a great way to get back on track.",
                "complete_lesson",
            ),
            celebration: template(
                "celebration",
                "Amazing momentum!",
                "You've been Rising most of this week. Take a look at how far you've come.",
                "view_momentum",
            ),
            consistency_reminder: template(
                "consistency_reminder",
                "Consistency is key",
                "Small daily steps add up. \
                 A quick journal entry can help you settle into a rhythm.",
                "journal_entry",
            ),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            user_timeout_ms: default_user_timeout_ms(),
            batch_budget_secs: default_batch_budget_secs(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            scoring: ScoringConfig::default(),
            zones: ZoneConfig::default(),
            patterns: PatternConfig::default(),
            rate_limits: RateLimitConfig::default(),
            templates: TemplatesConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ScoringConfig {
    /// Base weight of an event type, `None` when the type has no entry.
    pub fn weight_of(&self, event_type: &EventType) -> Option<f64> {
        self.event_weights.get(event_type.as_str()).copied()
    }

    pub fn is_high_signal(&self, event_type: &EventType) -> bool {
        self.high_signal_events
            .iter()
            .any(|name| name == event_type.as_str())
    }
}

impl RateLimitConfig {
    pub fn caps(&self, intervention_type: InterventionType) -> RateLimitCaps {
        match intervention_type {
            InterventionType::ConsecutiveNeedsCare => self.consecutive_needs_care,
            InterventionType::ScoreDrop => self.score_drop,
            InterventionType::Celebration => self.celebration,
            InterventionType::ConsistencyReminder => self.consistency_reminder,
        }
    }
}

impl TemplatesConfig {
    pub fn for_pattern(&self, pattern: PatternType) -> &NotificationTemplate {
        match pattern {
            PatternType::ConsecutiveNeedsCare => &self.consecutive_needs_care,
            PatternType::ScoreDrop => &self.score_drop,
            PatternType::SustainedRising => &self.celebration,
            PatternType::IrregularPattern => &self.consistency_reminder,
        }
    }
}

impl PipelineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn user_timeout(&self) -> Duration {
        Duration::from_millis(self.user_timeout_ms)
    }

    pub fn batch_budget(&self) -> Duration {
        Duration::from_secs(self.batch_budget_secs)
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn require_positive(key: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(key, format!("must be a positive number, got {value}")))
    }
}

fn require_non_negative(key: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(key, format!("must be a non-negative number, got {value}")))
    }
}

fn require_at_least(key: &str, value: u64, min: u64) -> Result<(), ConfigError> {
    if value >= min {
        Ok(())
    } else {
        Err(invalid(key, format!("must be at least {min}, got {value}")))
    }
}

impl InterventionConfig {
    /// Check every value; the first violation is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scoring;
        require_at_least("scoring.window_days", s.window_days.into(), 1)?;
        require_positive("scoring.half_life_days", s.half_life_days)?;
        require_at_least("scoring.rolling_average_days", s.rolling_average_days.into(), 1)?;
        if s.rolling_average_days > s.window_days {
            return Err(invalid(
                "scoring.rolling_average_days",
                "cannot exceed scoring.window_days",
            ));
        }
        require_at_least(
            "scoring.max_events_per_type_per_day",
            s.max_events_per_type_per_day.into(),
            1,
        )?;
        require_positive("scoring.normalization_midpoint", s.normalization_midpoint)?;
        require_positive("scoring.normalization_steepness", s.normalization_steepness)?;
        for (name, weight) in &s.event_weights {
            require_non_negative(&format!("scoring.event_weights.{name}"), *weight)?;
        }

        let z = &self.zones;
        if !(z.needs_care_threshold > 0.0
            && z.needs_care_threshold < z.rising_threshold
            && z.rising_threshold <= 100.0)
        {
            return Err(invalid(
                "zones",
                format!(
                    "thresholds must satisfy 0 < needs_care ({}) < rising ({}) <= 100",
                    z.needs_care_threshold, z.rising_threshold
                ),
            ));
        }
        require_non_negative("zones.hysteresis_margin", z.hysteresis_margin)?;
        require_at_least("zones.hysteresis_days", z.hysteresis_days.into(), 1)?;

        let p = &self.patterns;
        require_at_least(
            "patterns.consecutive_needs_care_days",
            p.consecutive_needs_care_days.into(),
            1,
        )?;
        require_positive("patterns.score_drop_points", p.score_drop_points)?;
        require_at_least(
            "patterns.score_drop_lookback_days",
            p.score_drop_lookback_days.into(),
            1,
        )?;
        require_at_least("patterns.rising_min_days", p.rising_min_days.into(), 1)?;
        if p.rising_min_days > p.rising_window_days {
            return Err(invalid(
                "patterns.rising_min_days",
                "cannot exceed patterns.rising_window_days",
            ));
        }
        require_at_least(
            "patterns.irregular_min_transitions",
            p.irregular_min_transitions.into(),
            1,
        )?;
        let widest = [
            p.consecutive_needs_care_days,
            p.score_drop_lookback_days + 1,
            p.rising_window_days,
            p.irregular_window_days,
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        if p.history_days < widest {
            return Err(invalid(
                "patterns.history_days",
                format!("must cover the widest detection window ({widest} days)"),
            ));
        }

        let r = &self.rate_limits;
        require_at_least("rate_limits.window_hours", r.window_hours.into(), 1)?;
        for intervention_type in InterventionType::ALL {
            let caps = r.caps(intervention_type);
            let key = format!("rate_limits.{}", intervention_type.as_str());
            require_at_least(&format!("{key}.max_per_day"), caps.max_per_day.into(), 1)?;
            require_non_negative(&format!("{key}.min_hours_between"), caps.min_hours_between)?;
        }

        for pattern in PatternType::ALL {
            let t = self.templates.for_pattern(pattern);
            if t.template_id.trim().is_empty() || t.title.trim().is_empty() {
                return Err(ConfigError::MissingKey(format!(
                    "templates.{}.template_id/title",
                    pattern.intervention_type().as_str()
                )));
            }
        }
        if self.templates.coach_intervention_type.trim().is_empty() {
            return Err(ConfigError::MissingKey("templates.coach_intervention_type".into()));
        }

        let pl = &self.pipeline;
        require_at_least("pipeline.worker_count", pl.worker_count as u64, 1)?;
        require_at_least("pipeline.user_timeout_ms", pl.user_timeout_ms, 1)?;
        require_at_least("pipeline.batch_budget_secs", pl.batch_budget_secs, 1)?;
        require_at_least("pipeline.retry_max_attempts", pl.retry_max_attempts.into(), 1)?;
        Ok(())
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let cfg: InterventionConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Default location, `~/.config/momentum/momentum.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        data_dir()
            .map(|dir| dir.join("momentum.toml"))
            .map_err(|e| ConfigError::LoadFailed {
                path: PathBuf::from("~/.config/momentum"),
                message: e.to_string(),
            })
    }

    /// Load and validate from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable, unparseable or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from disk, writing defaults first if the file does not exist.
    ///
    /// An existing but invalid file is still an error.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }
        let cfg = Self::default();
        cfg.save(path)?;
        Ok(cfg)
    }

    /// Persist to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| save_failed(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))?;
        Ok(())
    }

    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::MissingKey(key.to_string());
        let mut parts = key.split('.').peekable();
        if parts.peek().map_or(true, |p| p.is_empty()) {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            let is_leaf = parts.peek().is_none();
            if is_leaf {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value.parse::<bool>().map_err(|e| invalid(key, e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => {
                        if let Ok(n) = value.parse::<u64>() {
                            serde_json::Value::Number(n.into())
                        } else if let Ok(n) = value.parse::<f64>() {
                            serde_json::Number::from_f64(n)
                                .map(serde_json::Value::Number)
                                .ok_or_else(|| {
                                    invalid(key, format!("cannot parse '{value}' as number"))
                                })?
                        } else {
                            return Err(invalid(key, format!("cannot parse '{value}' as number")));
                        }
                    }
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        serde_json::from_str(value).map_err(|e| invalid(key, e.to_string()))?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by key. The result must still validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown, the value cannot be parsed,
    /// or the updated config is invalid. On error `self` is unchanged.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json =
            serde_json::to_value(&*self).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: InterventionConfig =
            serde_json::from_value(json).map_err(|e| invalid(key, e.to_string()))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Shared read-only configuration with explicit hot reload.
///
/// Each pipeline run takes a [`snapshot`](ConfigHandle::snapshot) and keeps
/// it for its whole duration. Only [`reload`](ConfigHandle::reload) swaps the
/// snapshot, and a failed reload leaves the current one in place.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<InterventionConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: InterventionConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<InterventionConfig> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-read the config file and swap it in if it validates.
    pub fn reload(&self, path: &Path) -> Result<Arc<InterventionConfig>, ConfigError> {
        let fresh = Arc::new(InterventionConfig::load(path)?);
        match self.inner.write() {
            Ok(mut guard) => *guard = Arc::clone(&fresh),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&fresh),
        }
        tracing::info!(path = %path.display(), "intervention config reloaded");
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let cfg = InterventionConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed = InterventionConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn default_config_is_valid() {
        InterventionConfig::default().validate().unwrap();
    }

    #[test]
    fn config_default_values() {
        let cfg = InterventionConfig::default();
        assert_eq!(cfg.scoring.half_life_days, 10.0);
        assert_eq!(cfg.scoring.window_days, 30);
        assert_eq!(cfg.zones.rising_threshold, 70.0);
        assert_eq!(cfg.zones.needs_care_threshold, 45.0);
        assert_eq!(cfg.zones.hysteresis_margin, 2.0);
        assert_eq!(cfg.patterns.score_drop_points, 15.0);
        assert_eq!(cfg.rate_limits.score_drop.max_per_day, 2);
        assert_eq!(cfg.rate_limits.score_drop.min_hours_between, 8.0);
        assert_eq!(cfg.scoring.weight_of(&EventType::CoachInteraction), Some(20.0));
        assert_eq!(cfg.scoring.weight_of(&EventType::Unknown("x".into())), None);
    }

    #[test]
    fn missing_threshold_section_fails_to_load() {
        let mut value = toml::Value::try_from(InterventionConfig::default()).unwrap();
        value.as_table_mut().unwrap().remove("zones");
        let text = toml::to_string(&value).unwrap();
        let err = InterventionConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn optional_sections_fall_back_to_defaults() {
        let mut value = toml::Value::try_from(InterventionConfig::default()).unwrap();
        let table = value.as_table_mut().unwrap();
        table.remove("templates");
        table.remove("pipeline");
        let text = toml::to_string(&value).unwrap();
        let cfg = InterventionConfig::from_toml_str(&text).unwrap();
        assert_eq!(cfg.templates, TemplatesConfig::default());
        assert_eq!(cfg.pipeline, PipelineConfig::default());
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut cfg = InterventionConfig::default();
        cfg.zones.needs_care_threshold = 80.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "zones"
        ));
    }

    #[test]
    fn zero_rate_cap_is_rejected() {
        let mut cfg = InterventionConfig::default();
        cfg.rate_limits.celebration.max_per_day = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { ref key, .. })
                if key == "rate_limits.celebration.max_per_day"
        ));
    }

    #[test]
    fn non_positive_half_life_is_rejected() {
        let mut cfg = InterventionConfig::default();
        cfg.scoring.half_life_days = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn get_supports_dot_path_keys() {
        let cfg = InterventionConfig::default();
        assert_eq!(cfg.get("zones.hysteresis_days").as_deref(), Some("2"));
        assert_eq!(cfg.get("templates.score_drop.title").as_deref(), Some("You've got this!"));
        assert!(cfg.get("zones.missing_key").is_none());
    }

    #[test]
    fn set_updates_nested_number() {
        let mut cfg = InterventionConfig::default();
        cfg.set("zones.hysteresis_margin", "3.5").unwrap();
        assert_eq!(cfg.zones.hysteresis_margin, 3.5);
        cfg.set("rate_limits.score_drop.max_per_day", "3").unwrap();
        assert_eq!(cfg.rate_limits.score_drop.max_per_day, 3);
    }

    #[test]
    fn set_rejects_unknown_key() {
        let mut cfg = InterventionConfig::default();
        assert!(matches!(
            cfg.set("zones.nonexistent", "1"),
            Err(ConfigError::MissingKey(_))
        ));
    }

    #[test]
    fn set_rejects_value_that_breaks_validation() {
        let mut cfg = InterventionConfig::default();
        let before = cfg.clone();
        assert!(cfg.set("zones.rising_threshold", "10").is_err());
        assert_eq!(cfg, before);
    }

    #[test]
    fn set_rejects_invalid_type() {
        let mut cfg = InterventionConfig::default();
        assert!(cfg
            .set("patterns.celebration_requires_rising_today", "sometimes")
            .is_err());
    }

    #[test]
    fn load_or_init_writes_defaults_then_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("momentum.toml");
        let cfg = InterventionConfig::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(InterventionConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = InterventionConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::LoadFailed { .. }));
    }

    #[test]
    fn reload_swaps_snapshot_and_keeps_old_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("momentum.toml");
        let handle = ConfigHandle::new(InterventionConfig::default());
        let before = handle.snapshot();

        let mut tuned = InterventionConfig::default();
        tuned.patterns.score_drop_points = 20.0;
        tuned.save(&path).unwrap();
        handle.reload(&path).unwrap();
        assert_eq!(handle.snapshot().patterns.score_drop_points, 20.0);
        // A snapshot taken earlier is unaffected.
        assert_eq!(before.patterns.score_drop_points, 15.0);

        std::fs::write(&path, "not = [valid").unwrap();
        assert!(handle.reload(&path).is_err());
        assert_eq!(handle.snapshot().patterns.score_drop_points, 20.0);
    }
}
