//! Behavioral events consumed from the event store.
//!
//! Events are owned by the ingestion side and are read-only here. Each known
//! event type carries a typed payload; anything the scorer does not recognise
//! keeps its raw JSON in [`EventPayload::Opaque`] so newer producers never
//! break older scorers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Type of a behavioral event.
///
/// Serialized as its snake_case name. Unrecognised names round-trip through
/// [`EventType::Unknown`] instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    LessonCompletion,
    LessonStart,
    JournalEntry,
    CoachInteraction,
    GoalSetting,
    GoalCompletion,
    AppSession,
    StreakMilestone,
    AssessmentCompletion,
    ResourceAccess,
    PeerInteraction,
    ReminderResponse,
    Unknown(String),
}

impl EventType {
    /// Every known event type, in weight-table order.
    pub const KNOWN: [EventType; 12] = [
        EventType::LessonCompletion,
        EventType::LessonStart,
        EventType::JournalEntry,
        EventType::CoachInteraction,
        EventType::GoalSetting,
        EventType::GoalCompletion,
        EventType::AppSession,
        EventType::StreakMilestone,
        EventType::AssessmentCompletion,
        EventType::ResourceAccess,
        EventType::PeerInteraction,
        EventType::ReminderResponse,
    ];

    pub fn parse(name: &str) -> Self {
        match name {
            "lesson_completion" => EventType::LessonCompletion,
            "lesson_start" => EventType::LessonStart,
            "journal_entry" => EventType::JournalEntry,
            "coach_interaction" => EventType::CoachInteraction,
            "goal_setting" => EventType::GoalSetting,
            "goal_completion" => EventType::GoalCompletion,
            "app_session" => EventType::AppSession,
            "streak_milestone" => EventType::StreakMilestone,
            "assessment_completion" => EventType::AssessmentCompletion,
            "resource_access" => EventType::ResourceAccess,
            "peer_interaction" => EventType::PeerInteraction,
            "reminder_response" => EventType::ReminderResponse,
            other => EventType::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventType::LessonCompletion => "lesson_completion",
            EventType::LessonStart => "lesson_start",
            EventType::JournalEntry => "journal_entry",
            EventType::CoachInteraction => "coach_interaction",
            EventType::GoalSetting => "goal_setting",
            EventType::GoalCompletion => "goal_completion",
            EventType::AppSession => "app_session",
            EventType::StreakMilestone => "streak_milestone",
            EventType::AssessmentCompletion => "assessment_completion",
            EventType::ResourceAccess => "resource_access",
            EventType::PeerInteraction => "peer_interaction",
            EventType::ReminderResponse => "reminder_response",
            EventType::Unknown(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventType::Unknown(_))
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        EventType::parse(&name)
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra fields a producer sent beyond the typed shape.
pub type ExtraFields = serde_json::Map<String, serde_json::Value>;

/// Structured event value, one variant per known event type.
///
/// Fields outside the typed shape are kept in `extra`, so [`EventPayload::to_json`]
/// gives back exactly what the producer wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Lesson {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lesson_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_minutes: Option<u32>,
        #[serde(flatten)]
        extra: ExtraFields,
    },
    Journal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        word_count: Option<u32>,
        #[serde(flatten)]
        extra: ExtraFields,
    },
    Coach {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coach_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(flatten)]
        extra: ExtraFields,
    },
    Goal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        goal_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action_step_id: Option<String>,
        #[serde(flatten)]
        extra: ExtraFields,
    },
    Session {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<u64>,
        #[serde(flatten)]
        extra: ExtraFields,
    },
    Milestone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        streak_days: Option<u32>,
        #[serde(flatten)]
        extra: ExtraFields,
    },
    Assessment {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assessment_id: Option<String>,
        #[serde(flatten)]
        extra: ExtraFields,
    },
    Resource {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource_id: Option<String>,
        #[serde(flatten)]
        extra: ExtraFields,
    },
    Peer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        #[serde(flatten)]
        extra: ExtraFields,
    },
    Reminder {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reminder_id: Option<String>,
        #[serde(flatten)]
        extra: ExtraFields,
    },
    /// Raw JSON for unknown event types, non-object values, and payloads
    /// that do not match the typed shape of their event type.
    Opaque { value: serde_json::Value },
}

impl EventPayload {
    /// Decode a raw JSON value for the given event type.
    ///
    /// Known types with an object value are decoded into their typed
    /// variant. Anything else is kept as `Opaque` rather than rejected.
    pub fn from_json(event_type: &EventType, value: serde_json::Value) -> Self {
        let kind = match event_type {
            EventType::LessonCompletion | EventType::LessonStart => "lesson",
            EventType::JournalEntry => "journal",
            EventType::CoachInteraction => "coach",
            EventType::GoalSetting | EventType::GoalCompletion => "goal",
            EventType::AppSession => "session",
            EventType::StreakMilestone => "milestone",
            EventType::AssessmentCompletion => "assessment",
            EventType::ResourceAccess => "resource",
            EventType::PeerInteraction => "peer",
            EventType::ReminderResponse => "reminder",
            EventType::Unknown(_) => return EventPayload::Opaque { value },
        };

        // A producer field named "kind" would collide with the tag.
        let map = match &value {
            serde_json::Value::Object(map) if !map.contains_key("kind") => map,
            _ => return EventPayload::Opaque { value },
        };
        let mut tagged = map.clone();
        tagged.insert("kind".into(), serde_json::Value::String(kind.into()));

        serde_json::from_value(serde_json::Value::Object(tagged))
            .unwrap_or(EventPayload::Opaque { value })
    }

    /// Raw JSON form, as the producer wrote it and as stored in the event table.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            EventPayload::Opaque { value } => value.clone(),
            typed => {
                let mut value = serde_json::to_value(typed).unwrap_or(serde_json::Value::Null);
                if let Some(map) = value.as_object_mut() {
                    map.remove("kind");
                }
                value
            }
        }
    }
}

/// A timestamped behavioral event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Store row id (0 until persisted)
    pub id: i64,
    pub user_id: String,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub value: EventPayload,
}

impl Event {
    pub fn new(
        user_id: impl Into<String>,
        event_type: EventType,
        occurred_at: DateTime<Utc>,
        value: serde_json::Value,
    ) -> Self {
        let value = EventPayload::from_json(&event_type, value);
        Self {
            id: 0,
            user_id: user_id.into(),
            event_type,
            occurred_at,
            value,
        }
    }

    /// Two events are duplicates when type and the full payload, extra
    /// fields included, match exactly.
    pub fn is_same_action(&self, other: &Event) -> bool {
        self.event_type == other.event_type && self.value == other.value
    }
}

/// Query interface of the event store.
///
/// Implementations must exclude tombstoned events and return the rest
/// ordered by `occurred_at` ascending.
pub trait EventSource {
    fn fetch_events(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>>;
}
